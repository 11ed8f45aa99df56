//! Multi-root scan coordination.
//!
//! One lane per root path, at most `max_lanes` walking at once. Lane
//! results are merged in input order no matter which lane finishes first.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexSet;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use foldervision_core::{
    ErrorKind, ErrorLog, ErrorRecord, FolderNode, ScanError, ScanResult, ScanSettings, Severity,
};

use crate::engine::{ScanContext, ScanEngine};
use crate::memory::{MemoryGuard, MemoryProbe, SysinfoProbe};
use crate::platform::VolumeTable;
use crate::progress::{LaneId, ProgressTracker};

/// Runs one [`ScanEngine`] per root path and merges their trees.
pub struct ThreadManager {
    settings: ScanSettings,
    probe: Arc<dyn MemoryProbe>,
    volumes: Option<VolumeTable>,
    cancel: CancellationToken,
}

impl ThreadManager {
    /// Create a manager; fails if the settings do not validate.
    pub fn new(settings: ScanSettings) -> Result<Self, ScanError> {
        settings.validate()?;
        Ok(Self {
            settings,
            probe: Arc::new(SysinfoProbe::new()),
            volumes: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Measure memory with a custom probe.
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Use a fixed mount table instead of reading the system's.
    pub fn with_volumes(mut self, volumes: VolumeTable) -> Self {
        self.volumes = Some(volumes);
        self
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Token that stops every scan run by this manager when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every running lane. Partial trees are still returned.
    pub fn cancel(&self) {
        tracing::info!(target: "lanes", "cancellation requested");
        self.cancel.cancel();
    }

    /// Scan every path in `paths` and merge the results in input order.
    ///
    /// Paths that do not exist or are not directories are recorded in the
    /// result's error log and skipped; if none remain the scan fails with
    /// [`ScanError::NoValidPaths`]. Duplicate paths are scanned once.
    pub async fn scan_all(
        &self,
        paths: &[PathBuf],
        tracker: Arc<ProgressTracker>,
    ) -> Result<ScanResult, ScanError> {
        let memory = Arc::new(MemoryGuard::with_probe(&self.settings, Arc::clone(&self.probe)));
        let volumes = self.volumes.clone().unwrap_or_else(VolumeTable::detect);
        let ctx = ScanContext::with_parts(self.settings.clone(), Arc::clone(&tracker), memory, volumes)?;
        let mut result = ScanResult::with_errors(ctx.errors.clone());

        let roots = validate_roots(paths, &ctx.errors);
        if roots.is_empty() {
            return Err(ScanError::NoValidPaths);
        }

        tracker.initialize(roots.len());
        tracing::info!(
            target: "lanes",
            roots = roots.len(),
            max_lanes = self.settings.max_lanes,
            max_threads = self.settings.max_threads,
            "starting scan"
        );

        let scan_cancel = self.cancel.child_token();
        let finished = CancellationToken::new();
        let _stop_watchdog = finished.clone().drop_guard();
        tokio::spawn(watchdog(
            self.settings.global_timeout,
            scan_cancel.clone(),
            finished,
            ctx.errors.clone(),
        ));

        // Slots are taken here, in input order, so lanes start in the order given.
        let gate = Arc::new(Semaphore::new(self.settings.max_lanes));
        let mut handles: Vec<(PathBuf, Option<JoinHandle<Option<FolderNode>>>)> =
            Vec::with_capacity(roots.len());
        for (lane, root) in roots.iter().enumerate() {
            let slot = tokio::select! {
                biased;
                _ = scan_cancel.cancelled() => None,
                slot = Arc::clone(&gate).acquire_owned() => slot.ok(),
            };
            let handle = match slot {
                Some(slot) => Some(tokio::spawn(run_lane(
                    lane,
                    root.clone(),
                    ctx.clone(),
                    slot,
                    scan_cancel.child_token(),
                ))),
                None => {
                    tracker.cancel_lane(lane);
                    None
                }
            };
            handles.push((root.clone(), handle));
        }

        for (lane, (root, handle)) in handles.into_iter().enumerate() {
            let Some(handle) = handle else { continue };
            match handle.await {
                Ok(Some(node)) => {
                    result.add_root(node);
                    result.add_scanned_path(root);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(target: "lanes", lane, root = %root.display(), "lane task failed: {err}");
                    ctx.errors.push(ErrorRecord::new(
                        &root,
                        format!("Lane for {} failed: {err}", root.display()),
                        ErrorKind::Unexpected,
                        Severity::Error,
                    ));
                    tracker.fail_lane(lane, err.to_string());
                }
            }
        }

        result.finish();
        tracing::info!(
            target: "scan",
            folders = result.total_folders(),
            files = result.total_files(),
            errors = result.errors.len(),
            "{}",
            ctx.memory.describe()
        );
        Ok(result)
    }
}

/// Keep existing directories, de-duplicated in input order; log the rest.
fn validate_roots(paths: &[PathBuf], errors: &ErrorLog) -> Vec<PathBuf> {
    let mut roots = IndexSet::new();
    for path in paths {
        match fs::metadata(path) {
            Ok(metadata) if metadata.is_dir() => {
                roots.insert(path.clone());
            }
            Ok(_) => errors.push(ErrorRecord::from_scan_error(
                path,
                &ScanError::NotADirectory { path: path.clone() },
            )),
            Err(err) => {
                tracing::warn!(target: "lanes", path = %path.display(), "skipping root: {err}");
                errors.push(ErrorRecord::from_io(path, &err));
            }
        }
    }
    roots.into_iter().collect()
}

/// Walk one root while holding a lane slot, then settle its final state.
async fn run_lane(
    lane: LaneId,
    root: PathBuf,
    ctx: ScanContext,
    _slot: OwnedSemaphorePermit,
    cancel: CancellationToken,
) -> Option<FolderNode> {
    let engine = ScanEngine::new(lane, ctx.clone(), cancel.clone());
    match engine.walk(&root).await {
        Ok(node) => {
            if engine.resource_exhausted() {
                ctx.tracker.fail_lane(lane, ctx.memory.describe());
            } else if cancel.is_cancelled() {
                ctx.tracker.cancel_lane(lane);
            } else {
                ctx.tracker.complete_lane(lane);
            }
            tracing::debug!(
                target: "lanes",
                lane,
                directories = engine.directories_visited(),
                peak_in_flight = engine.peak_in_flight(),
                "lane done"
            );
            node
        }
        Err(err) => {
            tracing::warn!(target: "lanes", lane, root = %root.display(), "lane failed: {err}");
            ctx.errors.push(ErrorRecord::from_scan_error(&root, &err));
            ctx.tracker.fail_lane(lane, err.to_string());
            None
        }
    }
}

/// Cancel `scan` once `limit` elapses unless `finished` fires first.
async fn watchdog(
    limit: Duration,
    scan: CancellationToken,
    finished: CancellationToken,
    errors: ErrorLog,
) {
    tokio::select! {
        _ = finished.cancelled() => {}
        _ = scan.cancelled() => {}
        _ = tokio::time::sleep(limit) => {
            tracing::warn!(target: "lanes", "global timeout of {}s reached", limit.as_secs_f64());
            errors.push(ErrorRecord::new(
                Path::new(""),
                format!("Global timeout ({}s) reached, scan stopped", limit.as_secs_f64()),
                ErrorKind::Timeout,
                Severity::Error,
            ));
            scan.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::LaneState;
    use tempfile::TempDir;

    fn manager(settings: ScanSettings) -> ThreadManager {
        ThreadManager::new(settings)
            .unwrap()
            .with_volumes(VolumeTable::default())
    }

    #[tokio::test]
    async fn test_invalid_roots_recorded() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("plain.txt");
        fs::write(&file, "x").unwrap();
        let paths = vec![
            temp.path().join("missing"),
            file,
            temp.path().to_path_buf(),
            temp.path().to_path_buf(),
        ];

        let tracker = Arc::new(ProgressTracker::new());
        let result = manager(ScanSettings::default())
            .scan_all(&paths, tracker.clone())
            .await
            .unwrap();

        assert_eq!(result.roots.len(), 1);
        assert_eq!(result.scanned_paths.len(), 1);
        let kinds: Vec<_> = result.error_records().iter().map(|r| r.kind).collect();
        assert_eq!(kinds, [ErrorKind::NotFound, ErrorKind::PathInvalid]);
        assert_eq!(tracker.lane_count(), 1);
    }

    #[tokio::test]
    async fn test_no_valid_paths() {
        let temp = TempDir::new().unwrap();
        let err = manager(ScanSettings::default())
            .scan_all(&[temp.path().join("a")], Arc::new(ProgressTracker::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::NoValidPaths));

        let err = manager(ScanSettings::default())
            .scan_all(&[], Arc::new(ProgressTracker::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::NoValidPaths));
    }

    #[tokio::test]
    async fn test_single_lane_slot_still_finishes() {
        let temp = TempDir::new().unwrap();
        let paths: Vec<_> = ["x", "y", "z"]
            .iter()
            .map(|n| {
                let p = temp.path().join(n);
                fs::create_dir(&p).unwrap();
                p
            })
            .collect();

        let settings = ScanSettings::builder().max_lanes(1usize).build().unwrap();
        let tracker = Arc::new(ProgressTracker::new());
        let result = manager(settings).scan_all(&paths, tracker.clone()).await.unwrap();

        let names: Vec<_> = result.roots.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["x", "y", "z"]);
        assert_eq!(tracker.snapshot().completed_lanes, 3);
        assert_eq!(tracker.overall_percent(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_cancels_on_global_timeout() {
        let scan = CancellationToken::new();
        let errors = ErrorLog::new();
        let task = tokio::spawn(watchdog(
            Duration::from_secs(5),
            scan.clone(),
            CancellationToken::new(),
            errors.clone(),
        ));

        task.await.unwrap();
        assert!(scan.is_cancelled());
        assert_eq!(errors.snapshot()[0].kind, ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_quiet_when_scan_finishes() {
        let scan = CancellationToken::new();
        let finished = CancellationToken::new();
        let errors = ErrorLog::new();
        let task = tokio::spawn(watchdog(
            Duration::from_secs(5),
            scan.clone(),
            finished.clone(),
            errors.clone(),
        ));

        finished.cancel();
        task.await.unwrap();
        assert!(!scan.is_cancelled());
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_scan() {
        let temp = TempDir::new().unwrap();
        let manager = manager(ScanSettings::default());
        manager.cancel();

        let tracker = Arc::new(ProgressTracker::new());
        let result = manager
            .scan_all(&[temp.path().to_path_buf()], tracker.clone())
            .await
            .unwrap();

        assert!(result.roots.is_empty());
        assert_eq!(tracker.lane(0).unwrap().state, LaneState::Cancelled);
    }
}
