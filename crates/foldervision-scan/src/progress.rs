//! Cross-lane progress aggregation.
//!
//! Every lane reports into one shared [`ProgressTracker`]. Writes to a lane
//! go through its map entry, so updates to the same lane are serialized
//! while different lanes rarely contend. Aggregate figures are computed on
//! read and published as [`ProgressSnapshot`]s on a broadcast channel.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;

/// Identifier of a lane: its index in the input path list.
pub type LaneId = usize;

/// Highest percent a lane may report before it is marked complete.
pub const RUNNING_PERCENT_CAP: f64 = 95.0;

const PROGRESS_CHANNEL_SIZE: usize = 256;

/// Lifecycle of a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl LaneState {
    /// Completed, failed or cancelled.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Status of one lane.
#[derive(Debug, Clone)]
pub struct LaneStatus {
    pub id: LaneId,
    /// Root path this lane walks.
    pub root: PathBuf,
    /// 0 to 100; capped at [`RUNNING_PERCENT_CAP`] until completed.
    pub percent: f64,
    pub state: LaneState,
    /// Directory visited most recently.
    pub current_path: PathBuf,
    /// Directories listed so far.
    pub processed: u64,
    /// Directories known to exist so far (grows as they are discovered).
    pub estimated: u64,
    pub started_at: Option<Instant>,
    pub ended_at: Option<Instant>,
    /// Failure message, if the lane failed.
    pub error: Option<String>,
}

impl LaneStatus {
    fn pending(id: LaneId) -> Self {
        Self {
            id,
            root: PathBuf::new(),
            percent: 0.0,
            state: LaneState::Pending,
            current_path: PathBuf::new(),
            processed: 0,
            estimated: 1,
            started_at: None,
            ended_at: None,
            error: None,
        }
    }

    /// Time the lane has been running (or ran for).
    pub fn elapsed(&self) -> Duration {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    fn finish(&mut self, state: LaneState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = state;
        self.ended_at = Some(Instant::now());
        if self.started_at.is_none() {
            self.started_at = self.ended_at;
        }
        true
    }

    fn ensure_running(&mut self) -> bool {
        match self.state {
            LaneState::Pending => {
                self.state = LaneState::Running;
                self.started_at = Some(Instant::now());
                true
            }
            LaneState::Running => true,
            _ => false,
        }
    }
}

/// Point-in-time view of a whole scan.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// Unweighted mean of lane percents.
    pub overall_percent: f64,
    pub active_lanes: usize,
    pub pending_lanes: usize,
    pub completed_lanes: usize,
    pub failed_lanes: usize,
    pub cancelled_lanes: usize,
    pub elapsed: Duration,
    /// `None` while nothing has progressed yet.
    pub estimated_remaining: Option<Duration>,
    /// Per-lane detail, ordered by lane id.
    pub lanes: Vec<LaneStatus>,
}

/// Shared aggregator every lane reports into.
///
/// Overall percent is the arithmetic mean of lane percents. Lanes are not
/// weighted by subtree size (unknown up front), so the figure can jump or
/// stall when lanes differ a lot in size. It is an approximation, not an
/// exact fraction of work done.
pub struct ProgressTracker {
    lanes: DashMap<LaneId, LaneStatus>,
    started: Mutex<Instant>,
    tx: broadcast::Sender<ProgressSnapshot>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(PROGRESS_CHANNEL_SIZE);
        Self {
            lanes: DashMap::new(),
            started: Mutex::new(Instant::now()),
            tx,
        }
    }

    /// Subscribe to progress snapshots.
    ///
    /// Slow receivers lag and lose old snapshots; the producer never waits.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    /// Reset to `lane_count` pending lanes and restart the clock.
    pub fn initialize(&self, lane_count: usize) {
        self.lanes.clear();
        for id in 0..lane_count {
            self.lanes.insert(id, LaneStatus::pending(id));
        }
        *self.started.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        self.publish();
    }

    /// Move a lane to running and record its root.
    pub fn start_lane(&self, id: LaneId, root: &Path) {
        let started = {
            let mut lane = self
                .lanes
                .entry(id)
                .or_insert_with(|| LaneStatus::pending(id));
            lane.root = root.to_path_buf();
            lane.current_path = root.to_path_buf();
            lane.ensure_running()
        };
        if started {
            tracing::info!(target: "lanes", lane = id, root = %root.display(), "lane started");
            self.publish();
        }
    }

    /// Set a lane's percent and current path directly.
    ///
    /// Ignored for terminal lanes and for non-finite percents. The percent
    /// is clamped to `0..=RUNNING_PERCENT_CAP`.
    pub fn update_lane(&self, id: LaneId, percent: f64, current_path: &Path) {
        if !percent.is_finite() {
            return;
        }
        let updated = self.with_running_lane(id, |lane| {
            lane.percent = percent.clamp(0.0, RUNNING_PERCENT_CAP);
            lane.current_path = current_path.to_path_buf();
        });
        if updated {
            self.publish();
        }
    }

    /// Progressive estimation: one directory listed, `discovered` new ones found.
    ///
    /// The lane starts assuming one unit of work (its root) and widens its
    /// denominator as subdirectories turn up.
    pub fn record_directory(&self, id: LaneId, path: &Path, discovered: usize) {
        let updated = self.with_running_lane(id, |lane| {
            lane.processed += 1;
            lane.estimated += discovered as u64;
            let percent = lane.processed as f64 * 100.0 / lane.estimated.max(1) as f64;
            lane.percent = percent.min(RUNNING_PERCENT_CAP);
            lane.current_path = path.to_path_buf();
        });
        if updated {
            self.publish();
        }
    }

    /// Mark a lane completed (100%). No-op if already terminal.
    pub fn complete_lane(&self, id: LaneId) -> bool {
        self.finish_lane(id, LaneState::Completed, None)
    }

    /// Mark a lane failed. No-op if already terminal.
    pub fn fail_lane(&self, id: LaneId, error: impl Into<String>) -> bool {
        self.finish_lane(id, LaneState::Failed, Some(error.into()))
    }

    /// Mark a lane cancelled. No-op if already terminal.
    pub fn cancel_lane(&self, id: LaneId) -> bool {
        self.finish_lane(id, LaneState::Cancelled, None)
    }

    /// Status of one lane.
    pub fn lane(&self, id: LaneId) -> Option<LaneStatus> {
        self.lanes.get(&id).map(|l| l.clone())
    }

    /// Number of lanes.
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Unweighted mean of all lane percents; 0 with no lanes.
    pub fn overall_percent(&self) -> f64 {
        let count = self.lanes.len();
        if count == 0 {
            return 0.0;
        }
        let total: f64 = self.lanes.iter().map(|l| l.percent).sum();
        total / count as f64
    }

    /// Time since [`initialize`](Self::initialize).
    pub fn elapsed(&self) -> Duration {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Linear extrapolation from elapsed time and overall percent.
    ///
    /// `None` (unbounded) at 0%, zero at 100%.
    pub fn estimated_remaining(&self) -> Option<Duration> {
        estimate_remaining(self.elapsed(), self.overall_percent())
    }

    /// Build a snapshot of every lane and the aggregate figures.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let mut lanes: Vec<LaneStatus> = self.lanes.iter().map(|l| l.clone()).collect();
        lanes.sort_by_key(|l| l.id);

        let count_state = |state: LaneState| lanes.iter().filter(|l| l.state == state).count();
        let overall_percent = if lanes.is_empty() {
            0.0
        } else {
            lanes.iter().map(|l| l.percent).sum::<f64>() / lanes.len() as f64
        };
        let elapsed = self.elapsed();

        ProgressSnapshot {
            overall_percent,
            active_lanes: count_state(LaneState::Running),
            pending_lanes: count_state(LaneState::Pending),
            completed_lanes: count_state(LaneState::Completed),
            failed_lanes: count_state(LaneState::Failed),
            cancelled_lanes: count_state(LaneState::Cancelled),
            elapsed,
            estimated_remaining: estimate_remaining(elapsed, overall_percent),
            lanes,
        }
    }

    fn with_running_lane(&self, id: LaneId, update: impl FnOnce(&mut LaneStatus)) -> bool {
        let Some(mut lane) = self.lanes.get_mut(&id) else {
            return false;
        };
        if !lane.ensure_running() {
            return false;
        }
        update(&mut lane);
        true
    }

    fn finish_lane(&self, id: LaneId, state: LaneState, error: Option<String>) -> bool {
        let finished = match self.lanes.get_mut(&id) {
            Some(mut lane) => {
                let finished = lane.finish(state);
                if finished {
                    if state == LaneState::Completed {
                        lane.percent = 100.0;
                    }
                    lane.error = error;
                }
                finished
            }
            None => false,
        };
        if finished {
            tracing::info!(target: "lanes", lane = id, state = ?state, "lane finished");
            self.publish();
        }
        finished
    }

    fn publish(&self) {
        if self.tx.receiver_count() > 0 {
            let _ = self.tx.send(self.snapshot());
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn estimate_remaining(elapsed: Duration, percent: f64) -> Option<Duration> {
    if percent <= 0.0 {
        return None;
    }
    if percent >= 100.0 {
        return Some(Duration::ZERO);
    }
    // Too far out to represent counts as unbounded.
    Duration::try_from_secs_f64(elapsed.as_secs_f64() * (100.0 - percent) / percent).ok()
}
