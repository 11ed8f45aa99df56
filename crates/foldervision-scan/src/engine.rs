//! Recursive, bounded-concurrency directory walker for one lane.
//!
//! Each directory is listed once on a blocking thread under its deadline.
//! Subdirectories are then visited as separate tasks, at most `max_threads`
//! listings at a time across the whole lane. Very wide directories are cut
//! into sequential batches so a single level cannot flood the runtime.
//!
//! Cancellation is checked before a listing starts and before each child is
//! launched. A listing already running is allowed to finish and its counts
//! stay in the tree.

use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use foldervision_core::{
    ErrorKind, ErrorLog, ErrorRecord, FolderNode, ScanError, ScanSettings, Severity,
};

use crate::memory::{MemoryGuard, ReclaimSeverity, Reclaimer};
use crate::platform::{entry_attributes, SkipRules, VolumeTable};
use crate::progress::{LaneId, ProgressTracker};
use crate::timeout::{deadline_for, run_with_deadline, DeadlineError};

/// Batches between two reclamation checks in a wide directory.
const RECLAIM_EVERY_BATCHES: usize = 4;

/// Spare listing buffers kept for reuse.
const MAX_POOLED_BUFFERS: usize = 64;

/// Buffers above this capacity are dropped by a light reclamation pass.
const LARGE_BUFFER: usize = 1024;

type VisitFuture = Pin<Box<dyn Future<Output = Option<FolderNode>> + Send>>;

/// Everything a walk shares with the rest of the scan.
#[derive(Clone)]
pub struct ScanContext {
    pub settings: Arc<ScanSettings>,
    pub tracker: Arc<ProgressTracker>,
    pub errors: ErrorLog,
    pub memory: Arc<MemoryGuard>,
    pub volumes: Arc<VolumeTable>,
    pub skip: Arc<SkipRules>,
    pool: Arc<ListingPool>,
    lister: Arc<dyn Lister>,
}

impl ScanContext {
    /// Context measuring real process memory and the real mount table.
    pub fn new(settings: ScanSettings, tracker: Arc<ProgressTracker>) -> Result<Self, ScanError> {
        let memory = Arc::new(MemoryGuard::new(&settings));
        Self::with_parts(settings, tracker, memory, VolumeTable::detect())
    }

    /// Context with a caller-supplied memory guard and mount table.
    pub fn with_parts(
        settings: ScanSettings,
        tracker: Arc<ProgressTracker>,
        memory: Arc<MemoryGuard>,
        volumes: VolumeTable,
    ) -> Result<Self, ScanError> {
        settings.validate()?;
        let skip = SkipRules::from_settings(&settings)?;
        let errors = ErrorLog::new();
        let pool = Arc::new(ListingPool::default());

        memory.register(pool.clone());
        memory.register(Arc::new(errors.clone()));

        Ok(Self {
            settings: Arc::new(settings),
            tracker,
            errors,
            memory,
            volumes: Arc::new(volumes),
            skip: Arc::new(skip),
            pool,
            lister: Arc::new(FsLister),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_lister(mut self, lister: Arc<dyn Lister>) -> Self {
        self.lister = lister;
        self
    }
}

/// Reads one directory's direct contents. Runs on a blocking thread.
pub(crate) trait Lister: Send + Sync {
    fn list(&self, path: &Path, skip: &SkipRules, buffer: Vec<PathBuf>) -> io::Result<DirListing>;
}

struct FsLister;

impl Lister for FsLister {
    fn list(&self, path: &Path, skip: &SkipRules, buffer: Vec<PathBuf>) -> io::Result<DirListing> {
        list_directory(path, skip, buffer)
    }
}

/// Walks one lane root into a [`FolderNode`] tree.
pub struct ScanEngine {
    inner: Arc<Walk>,
}

struct Walk {
    lane: LaneId,
    ctx: ScanContext,
    cancel: CancellationToken,
    listing: Arc<Semaphore>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    visited: AtomicU64,
    batches: AtomicU64,
    resource_exhausted: AtomicBool,
}

impl ScanEngine {
    /// Create an engine for `lane`, stopped by `cancel`.
    pub fn new(lane: LaneId, ctx: ScanContext, cancel: CancellationToken) -> Self {
        let listing = Arc::new(Semaphore::new(ctx.settings.max_threads.max(1)));
        Self {
            inner: Arc::new(Walk {
                lane,
                ctx,
                cancel,
                listing,
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                visited: AtomicU64::new(0),
                batches: AtomicU64::new(0),
                resource_exhausted: AtomicBool::new(false),
            }),
        }
    }

    /// Walk `root` and build its folder tree.
    ///
    /// Returns `Ok(None)` if cancelled before the root was listed. Failures
    /// below the root are recorded in the error log and leave a truncated
    /// node behind; only a missing or unlistable root is an error here.
    pub async fn walk(&self, root: &Path) -> Result<Option<FolderNode>, ScanError> {
        let walk = &self.inner;
        if walk.cancel.is_cancelled() {
            return Ok(None);
        }

        let metadata = fs::metadata(root).map_err(|e| ScanError::io(root, e))?;
        if !metadata.is_dir() {
            return Err(ScanError::NotADirectory {
                path: root.to_path_buf(),
            });
        }

        walk.ctx.tracker.start_lane(walk.lane, root);
        tracing::debug!(target: "scan", lane = walk.lane, root = %root.display(), "walking");

        let listing = match walk.list(root).await {
            Ok(listing) => listing,
            Err(ListError::Deadline(DeadlineError::Cancelled)) => return Ok(None),
            Err(ListError::Deadline(DeadlineError::TimedOut(after))) => {
                return Err(ScanError::Timeout { after });
            }
            Err(ListError::Io(err)) => return Err(ScanError::io(root, err)),
            Err(ListError::Join(err)) => {
                return Err(ScanError::Other {
                    message: format!("listing {} failed: {err}", root.display()),
                });
            }
        };

        Ok(Some(walk.expand(root, 0, listing).await))
    }

    /// Highest number of simultaneous directory listings seen so far.
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak_in_flight.load(Ordering::Relaxed)
    }

    /// Directories listed so far.
    pub fn directories_visited(&self) -> u64 {
        self.inner.visited.load(Ordering::Relaxed)
    }

    /// Sequential batches run for wide directories.
    pub fn batches_run(&self) -> u64 {
        self.inner.batches.load(Ordering::Relaxed)
    }

    /// Whether the walk stopped itself because memory stayed over the ceiling.
    pub fn resource_exhausted(&self) -> bool {
        self.inner.resource_exhausted.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Error)]
enum ListError {
    #[error(transparent)]
    Deadline(#[from] DeadlineError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("listing task failed: {0}")]
    Join(#[from] JoinError),
}

impl Walk {
    fn visit(self: Arc<Self>, path: PathBuf, depth: u32) -> VisitFuture {
        Box::pin(async move {
            if self.cancel.is_cancelled() {
                return None;
            }
            match self.list(&path).await {
                Ok(listing) => Some(self.expand(&path, depth, listing).await),
                Err(ListError::Deadline(DeadlineError::Cancelled)) => None,
                Err(err) => {
                    self.record_list_error(&path, &err);
                    self.ctx.tracker.record_directory(self.lane, &path, 0);
                    let mut node = FolderNode::new(path);
                    node.mark_truncated();
                    Some(node)
                }
            }
        })
    }

    async fn list(&self, path: &Path) -> Result<DirListing, ListError> {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DeadlineError::Cancelled.into()),
            permit = self.listing.acquire() => permit.map_err(|_| DeadlineError::Cancelled)?,
        };
        let _in_flight = InFlight::enter(&self.in_flight, &self.peak_in_flight);

        let limit = deadline_for(path, &self.ctx.settings, &self.ctx.volumes);
        let deadline = tokio::time::Instant::now() + limit;
        let skip = Arc::clone(&self.ctx.skip);
        let lister = Arc::clone(&self.ctx.lister);
        let buffer = self.ctx.pool.take();
        let target = path.to_path_buf();
        let mut task = tokio::task::spawn_blocking(move || lister.list(&target, &skip, buffer));

        let joined = match run_with_deadline(&mut task, limit, &self.cancel).await {
            // Already listing: finish within what is left of the deadline so the counts are kept.
            Err(DeadlineError::Cancelled) => tokio::time::timeout_at(deadline, task)
                .await
                .map_err(|_| DeadlineError::TimedOut(limit))?,
            joined => joined?,
        };
        Ok(joined??)
    }

    async fn expand(self: &Arc<Self>, path: &Path, depth: u32, listing: DirListing) -> FolderNode {
        let DirListing {
            modified,
            files,
            mut subdirs,
            entry_errors,
        } = listing;

        let mut node = FolderNode::new(path).with_modified(modified);
        node.file_count = files;
        for err in &entry_errors {
            self.ctx.errors.push(ErrorRecord::new(
                path,
                format!("Unreadable entry in {}: {err}", path.display()),
                ErrorKind::from_io(err),
                Severity::Warning,
            ));
        }

        let at_limit = depth >= self.ctx.settings.max_depth;
        let discovered = if at_limit { 0 } else { subdirs.len() };
        self.ctx.tracker.record_directory(self.lane, path, discovered);
        self.check_memory(path);

        if at_limit || subdirs.is_empty() {
            if !subdirs.is_empty() {
                node.mark_truncated();
            }
            self.ctx.pool.give(subdirs);
            return node;
        }

        subdirs.sort();
        let children = if self.ctx.settings.should_batch(subdirs.len()) {
            self.visit_batched(path, &subdirs, depth + 1).await
        } else {
            self.visit_children(path, &subdirs, depth + 1, self.ctx.settings.max_threads)
                .await
        };
        self.ctx.pool.give(subdirs);

        for child in children {
            match child {
                Some(child) => node.add_child(child),
                None => node.mark_truncated(),
            }
        }
        node.sort_children();
        node
    }

    /// Visit `paths` concurrently, at most `limit` at once. Results keep input order.
    async fn visit_children(
        self: &Arc<Self>,
        parent: &Path,
        paths: &[PathBuf],
        depth: u32,
        limit: usize,
    ) -> Vec<Option<FolderNode>> {
        let gate = Arc::new(Semaphore::new(limit.max(1)));
        let mut tasks = JoinSet::new();

        for (index, path) in paths.iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = Arc::clone(&gate).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let walk = Arc::clone(self);
            let path = path.clone();
            tasks.spawn(async move {
                let _permit = permit;
                (index, walk.visit(path, depth).await)
            });
        }

        let mut children: Vec<Option<FolderNode>> = paths.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, child)) => children[index] = child,
                Err(err) => {
                    tracing::error!(target: "scan", parent = %parent.display(), "visit task failed: {err}");
                    self.ctx.errors.push(ErrorRecord::new(
                        parent,
                        format!("Subdirectory visit failed in {}: {err}", parent.display()),
                        ErrorKind::Unexpected,
                        Severity::Error,
                    ));
                }
            }
        }
        children
    }

    /// Visit a wide directory's children in sequential batches.
    async fn visit_batched(
        self: &Arc<Self>,
        parent: &Path,
        paths: &[PathBuf],
        depth: u32,
    ) -> Vec<Option<FolderNode>> {
        let settings = &self.ctx.settings;
        tracing::debug!(
            target: "scan",
            path = %parent.display(),
            subdirs = paths.len(),
            batch_size = settings.batch_size,
            "batching wide directory"
        );

        let mut children = Vec::with_capacity(paths.len());
        for (index, batch) in paths.chunks(settings.batch_size.max(1)).enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            children.extend(
                self.visit_children(parent, batch, depth, settings.batch_limit())
                    .await,
            );
            self.batches.fetch_add(1, Ordering::Relaxed);
            if (index + 1) % RECLAIM_EVERY_BATCHES == 0 {
                self.ctx.memory.reclaim_if_needed();
            }
        }
        // Batches skipped after a cancel leave their parent truncated.
        children.resize_with(paths.len(), || None);
        children
    }

    fn check_memory(&self, path: &Path) {
        let visited = self.visited.fetch_add(1, Ordering::Relaxed) + 1;
        let interval = self.ctx.settings.memory_check_interval.max(1);
        if visited % interval != 0 || !self.ctx.memory.is_enabled() {
            return;
        }
        self.ctx.memory.refresh();
        if !self.ctx.memory.is_over_limit() {
            return;
        }
        if self.resource_exhausted.swap(true, Ordering::Relaxed) {
            return;
        }

        let usage = self.ctx.memory.describe();
        tracing::warn!(target: "memory", lane = self.lane, "{usage}, stopping lane");
        self.ctx.errors.push(ErrorRecord::new(
            path,
            format!("Memory ceiling exceeded after reclaiming ({usage})"),
            ErrorKind::Resource,
            Severity::Error,
        ));
        self.cancel.cancel();
    }

    fn record_list_error(&self, path: &Path, err: &ListError) {
        let record = match err {
            ListError::Io(err) => ErrorRecord::from_io(path, err),
            ListError::Deadline(DeadlineError::TimedOut(after)) => {
                ErrorRecord::timeout(path, *after)
            }
            ListError::Deadline(DeadlineError::Cancelled) => return,
            ListError::Join(err) => ErrorRecord::new(
                path,
                format!("Listing failed in {}: {err}", path.display()),
                ErrorKind::Unexpected,
                Severity::Error,
            ),
        };
        tracing::debug!(target: "scan", path = %path.display(), kind = ?record.kind, "{}", record.message);
        self.ctx.errors.push(record);
    }
}

/// Counts a listing as in flight while alive.
struct InFlight<'a> {
    current: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One directory's direct contents after skip rules.
#[derive(Debug, Default)]
pub(crate) struct DirListing {
    pub modified: Option<SystemTime>,
    pub files: u64,
    pub subdirs: Vec<PathBuf>,
    pub entry_errors: Vec<io::Error>,
}

/// List `path` in a single pass: count files, collect subdirectories.
///
/// Symbolic links are neither counted nor followed.
pub(crate) fn list_directory(
    path: &Path,
    skip: &SkipRules,
    mut subdirs: Vec<PathBuf>,
) -> io::Result<DirListing> {
    subdirs.clear();
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok();
    let mut files = 0;
    let mut entry_errors = Vec::new();

    for entry in fs::read_dir(path)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                entry_errors.push(err);
                continue;
            }
        };
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(err) => {
                entry_errors.push(err);
                continue;
            }
        };
        if file_type.is_symlink() {
            continue;
        }

        let attributes = if skip.needs_attributes() {
            entry_attributes(&entry)
        } else {
            None
        };
        let entry_path = entry.path();
        if file_type.is_dir() {
            if !skip.skip_dir(&entry_path, attributes) {
                subdirs.push(entry_path);
            }
        } else if !skip.skip_file(&entry_path, attributes) {
            files += 1;
        }
    }

    Ok(DirListing {
        modified,
        files,
        subdirs,
        entry_errors,
    })
}

/// Reusable subdirectory buffers for listings.
#[derive(Debug, Default)]
struct ListingPool {
    buffers: Mutex<Vec<Vec<PathBuf>>>,
}

impl ListingPool {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<PathBuf>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(&self) -> Vec<PathBuf> {
        self.lock().pop().unwrap_or_default()
    }

    fn give(&self, mut buffer: Vec<PathBuf>) {
        buffer.clear();
        let mut buffers = self.lock();
        if buffers.len() < MAX_POOLED_BUFFERS {
            buffers.push(buffer);
        }
    }
}

impl Reclaimer for ListingPool {
    fn reclaim(&self, severity: ReclaimSeverity) {
        let mut buffers = self.lock();
        match severity {
            ReclaimSeverity::Light => buffers.retain(|b| b.capacity() <= LARGE_BUFFER),
            ReclaimSeverity::Full => buffers.clear(),
        }
        buffers.shrink_to_fit();
    }
}
