//! Per-path deadlines and the deadline/cancellation race.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use foldervision_core::{ScanError, ScanSettings};

use crate::platform::{is_remote_path, VolumeTable};

/// Why a deadline-bounded operation did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeadlineError {
    /// The deadline elapsed first.
    #[error("timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),

    /// The caller cancelled before the operation finished.
    #[error("cancelled")]
    Cancelled,
}

impl From<DeadlineError> for ScanError {
    fn from(err: DeadlineError) -> Self {
        match err {
            DeadlineError::TimedOut(after) => ScanError::Timeout { after },
            DeadlineError::Cancelled => ScanError::Cancelled,
        }
    }
}

/// Deadline for listing the directory at `path`.
///
/// Remote paths get the network budget, everything else the local one.
pub fn deadline_for(path: &Path, settings: &ScanSettings, volumes: &VolumeTable) -> Duration {
    if is_remote_path(path, volumes) {
        settings.network_timeout
    } else {
        settings.directory_timeout
    }
}

/// Run `operation` until it completes, `limit` elapses, or `cancel` fires.
///
/// Cancellation wins over an expiry that happens at the same time, so a
/// caller-initiated cancel is never reported as a timeout. The operation is
/// dropped on either failure; work it already handed to a blocking thread
/// keeps running to completion.
pub async fn run_with_deadline<F, T>(
    operation: F,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<T, DeadlineError>
where
    F: Future<Output = T>,
{
    if cancel.is_cancelled() {
        return Err(DeadlineError::Cancelled);
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DeadlineError::Cancelled),
        result = tokio::time::timeout(limit, operation) => {
            result.map_err(|_| {
                if cancel.is_cancelled() {
                    DeadlineError::Cancelled
                } else {
                    DeadlineError::TimedOut(limit)
                }
            })
        }
    }
}
