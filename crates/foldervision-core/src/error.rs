//! Error types and the shared per-scan error log.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that abort an operation instead of being recorded and skipped.
#[derive(Debug, Error)]
pub enum ScanError {
    /// None of the requested root paths exist.
    #[error("No valid paths to scan")]
    NoValidPaths,

    /// Root path does not exist at scan start.
    #[error("Root path not found: {path}")]
    RootNotFound { path: PathBuf },

    /// Root path is not a directory.
    #[error("Root path is not a directory: {path}")]
    NotADirectory { path: PathBuf },

    /// Permission denied for a path.
    #[error("Permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Deadline elapsed before the operation finished.
    #[error("Operation timed out after {}s", .after.as_secs_f64())]
    Timeout { after: Duration },

    /// Operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Other error.
    #[error("{message}")]
    Other { message: String },
}

impl ScanError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            io::ErrorKind::NotFound => Self::RootNotFound { path },
            _ => Self::Io { path, source },
        }
    }

    /// Classify this error for the error log.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoValidPaths | Self::RootNotFound { .. } => ErrorKind::NotFound,
            Self::NotADirectory { .. } => ErrorKind::PathInvalid,
            Self::PermissionDenied { .. } => ErrorKind::Access,
            Self::Io { source, .. } => ErrorKind::from_io(source),
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled | Self::InvalidConfig { .. } | Self::Other { .. } => {
                ErrorKind::Unexpected
            }
        }
    }
}

/// Category of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Permission denied or a security restriction.
    Access,
    /// Directory vanished between listing and visiting.
    NotFound,
    /// Path too long or malformed.
    PathInvalid,
    /// A per-directory or global deadline elapsed.
    Timeout,
    /// Memory ceiling persistently exceeded.
    Resource,
    /// Any other I/O failure.
    Unexpected,
}

impl ErrorKind {
    /// Classify an I/O error.
    pub fn from_io(err: &io::Error) -> Self {
        if is_name_too_long(err) {
            return Self::PathInvalid;
        }
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::Access,
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Self::PathInvalid,
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::OutOfMemory => Self::Resource,
            _ => Self::Unexpected,
        }
    }
}

#[cfg(target_os = "linux")]
const NAME_TOO_LONG: i32 = 36;
#[cfg(all(unix, not(target_os = "linux")))]
const NAME_TOO_LONG: i32 = 63;
// ERROR_FILENAME_EXCED_RANGE
#[cfg(windows)]
const NAME_TOO_LONG: i32 = 206;

#[cfg(any(unix, windows))]
fn is_name_too_long(err: &io::Error) -> bool {
    err.raw_os_error() == Some(NAME_TOO_LONG)
}

#[cfg(not(any(unix, windows)))]
fn is_name_too_long(_err: &io::Error) -> bool {
    false
}

/// Severity of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One entry in the error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Path where the failure occurred.
    pub path: PathBuf,
    /// Human-readable message.
    pub message: String,
    /// Failure category.
    pub kind: ErrorKind,
    /// Severity.
    pub severity: Severity,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    /// Create a new record stamped with the current time.
    pub fn new(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        kind: ErrorKind,
        severity: Severity,
    ) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            kind,
            severity,
            timestamp: Utc::now(),
        }
    }

    /// Record for a failed I/O call on `path`.
    pub fn from_io(path: impl Into<PathBuf>, err: &io::Error) -> Self {
        let path = path.into();
        let kind = ErrorKind::from_io(err);
        let message = match kind {
            ErrorKind::Access => format!("Access denied: {}", path.display()),
            ErrorKind::NotFound => format!("Directory not found: {}", path.display()),
            ErrorKind::PathInvalid => format!("Path invalid: {}", path.display()),
            _ => format!("I/O error in {}: {err}", path.display()),
        };
        Self::new(path, message, kind, Severity::Error)
    }

    /// Record for a per-directory deadline that elapsed.
    pub fn timeout(path: impl Into<PathBuf>, after: Duration) -> Self {
        let path = path.into();
        Self {
            message: format!("Timeout ({}s) in {}", after.as_secs_f64(), path.display()),
            path,
            kind: ErrorKind::Timeout,
            severity: Severity::Error,
            timestamp: Utc::now(),
        }
    }

    /// Record for a fatal scan error.
    pub fn from_scan_error(path: impl Into<PathBuf>, err: &ScanError) -> Self {
        Self::new(path, err.to_string(), err.kind(), Severity::Error)
    }
}

/// Append-only, thread-safe log of failures shared by every lane of a scan.
///
/// Clones share the same underlying storage.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    records: Arc<Mutex<Vec<ErrorRecord>>>,
}

impl ErrorLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ErrorRecord>> {
        // Appends cannot leave the vector half-written, so a poisoned lock is still usable.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a record.
    pub fn push(&self, record: ErrorRecord) {
        self.lock().push(record);
    }

    /// Append a record for a failed I/O call.
    pub fn push_io(&self, path: &Path, err: &io::Error) {
        self.push(ErrorRecord::from_io(path, err));
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of every record in append order.
    pub fn snapshot(&self) -> Vec<ErrorRecord> {
        self.lock().clone()
    }

    /// Number of records at the given severity.
    pub fn count_by_severity(&self, severity: Severity) -> usize {
        self.lock().iter().filter(|r| r.severity == severity).count()
    }

    /// Whether two handles point at the same log.
    pub fn shares_storage(&self, other: &ErrorLog) -> bool {
        Arc::ptr_eq(&self.records, &other.records)
    }

    /// Release spare capacity held by the log.
    pub fn shrink(&self) {
        self.lock().shrink_to_fit();
    }
}

impl Serialize for ErrorLog {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.lock().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ErrorLog {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let records = Vec::<ErrorRecord>::deserialize(deserializer)?;
        Ok(Self {
            records: Arc::new(Mutex::new(records)),
        })
    }
}
