//! Aggregate scan result.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorLog, ErrorRecord};
use crate::node::FolderNode;

/// Outcome of scanning one or more root paths.
///
/// Totals are always recomputed from `roots`, so they cannot drift from the tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    /// One root node per scanned path, in input order.
    pub roots: Vec<FolderNode>,

    /// Paths actually scanned, de-duplicated, in first-seen order.
    pub scanned_paths: IndexSet<PathBuf>,

    /// When the scan started.
    pub started_at: DateTime<Utc>,

    /// How long the scan took.
    pub duration: Duration,

    /// Failures recorded while scanning.
    pub errors: ErrorLog,
}

impl ScanResult {
    /// Create an empty result starting now.
    pub fn new() -> Self {
        Self::with_errors(ErrorLog::new())
    }

    /// Create an empty result that shares an existing error log.
    pub fn with_errors(errors: ErrorLog) -> Self {
        Self {
            roots: Vec::new(),
            scanned_paths: IndexSet::new(),
            started_at: Utc::now(),
            duration: Duration::ZERO,
            errors,
        }
    }

    /// Append a root folder.
    pub fn add_root(&mut self, root: FolderNode) {
        self.roots.push(root);
    }

    /// Record a scanned path, ignoring duplicates.
    pub fn add_scanned_path(&mut self, path: impl Into<PathBuf>) {
        self.scanned_paths.insert(path.into());
    }

    /// Merge another result into this one, keeping this result's start time.
    pub fn merge(&mut self, other: ScanResult) {
        self.roots.extend(other.roots);
        self.scanned_paths.extend(other.scanned_paths);
        if !self.errors.shares_storage(&other.errors) {
            for record in other.errors.snapshot() {
                self.errors.push(record);
            }
        }
    }

    /// Stop the clock.
    pub fn finish(&mut self) {
        let elapsed = Utc::now() - self.started_at;
        self.duration = elapsed.to_std().unwrap_or(Duration::ZERO);
    }

    /// Every folder across all roots, roots included.
    pub fn total_folders(&self) -> u64 {
        self.roots.iter().map(|r| 1 + r.total_subfolder_count()).sum()
    }

    /// Every file across all roots.
    pub fn total_files(&self) -> u64 {
        self.roots.iter().map(FolderNode::total_file_count).sum()
    }

    /// Look up a folder anywhere in the result.
    pub fn find_folder(&self, path: &Path) -> Option<&FolderNode> {
        self.roots.iter().find_map(|r| r.find(path))
    }

    /// Iterate over every folder, each root followed by its descendants.
    pub fn all_folders(&self) -> impl Iterator<Item = &FolderNode> {
        self.roots
            .iter()
            .flat_map(|r| std::iter::once(r).chain(r.descendants()))
    }

    /// Copy of the recorded failures.
    pub fn error_records(&self) -> Vec<ErrorRecord> {
        self.errors.snapshot()
    }

    /// Whether any failure was recorded.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

impl Default for ScanResult {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScanResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Scan Result: {} folders, {} files in {:.1}s",
            self.total_folders(),
            self.total_files(),
            self.duration.as_secs_f64()
        )
    }
}
