//! Concurrent directory scanning engine for foldervision.
//!
//! # Overview
//!
//! `foldervision-scan` walks one or more root directories and builds a
//! [`FolderNode`] tree per root: folder names, modification times and file
//! counts, without file sizes. Key features:
//!
//! - **Lanes**: one walk per root path, up to `max_lanes` at once
//! - **Bounded concurrency** inside a lane (`max_threads` listings at a time)
//! - **Deadlines** per directory, longer on network volumes, plus a global one
//! - **Memory guard** that reclaims and stops a lane past the ceiling
//! - **Progress updates** via broadcast channels
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! use foldervision_scan::{ProgressTracker, ScanSettings, ThreadManager};
//!
//! # async fn run() -> Result<(), foldervision_scan::ScanError> {
//! let manager = ThreadManager::new(ScanSettings::default())?;
//! let tracker = Arc::new(ProgressTracker::new());
//! let result = manager
//!     .scan_all(&[PathBuf::from("/path/to/scan")], tracker)
//!     .await?;
//!
//! println!("{result}");
//! # Ok(())
//! # }
//! ```
//!
//! # Progress Monitoring
//!
//! Subscribe to snapshots before starting the scan:
//!
//! ```rust,no_run
//! use foldervision_scan::ProgressTracker;
//!
//! # async fn run() {
//! let tracker = ProgressTracker::new();
//! let mut progress_rx = tracker.subscribe();
//!
//! tokio::spawn(async move {
//!     while let Ok(snapshot) = progress_rx.recv().await {
//!         println!("{:.1}% ({} lanes active)", snapshot.overall_percent, snapshot.active_lanes);
//!     }
//! });
//! # }
//! ```

mod engine;
mod manager;
mod memory;
mod platform;
mod progress;
mod timeout;

pub use engine::{ScanContext, ScanEngine};
pub use manager::ThreadManager;
pub use memory::{MemoryGuard, MemoryProbe, ReclaimOutcome, ReclaimSeverity, Reclaimer, SysinfoProbe};
pub use platform::{is_network_fs, is_remote_path, is_unc_path, is_volume_root, SkipRules, VolumeTable};
pub use progress::{
    LaneId, LaneState, LaneStatus, ProgressSnapshot, ProgressTracker, RUNNING_PERCENT_CAP,
};
pub use timeout::{deadline_for, run_with_deadline, DeadlineError};

// Re-export core types for convenience
pub use foldervision_core::{
    ErrorKind, ErrorLog, ErrorRecord, FolderNode, ScanError, ScanResult, ScanSettings,
    ScanSettingsBuilder, Severity,
};
