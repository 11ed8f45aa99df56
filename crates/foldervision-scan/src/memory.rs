//! Process memory tracking against a configured ceiling.
//!
//! The guard keeps the last measured resident size in an atomic so the
//! common check is a single load. Only when that cached figure is within
//! 10% of the ceiling does it pay for a reclamation pass and a fresh
//! measurement. Reclamation is rate-limited and escalates from a light
//! pass to a full pass only while usage stays above the ceiling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use foldervision_core::{ErrorLog, ScanSettings};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Fraction of the ceiling at which the expensive check starts.
const NEAR_LIMIT_RATIO: f64 = 0.9;

/// Source of the current process's resident memory.
pub trait MemoryProbe: Send + Sync {
    /// Resident bytes, or `None` if they cannot be read.
    fn resident_bytes(&self) -> Option<u64>;
}

/// [`MemoryProbe`] backed by `sysinfo`.
pub struct SysinfoProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            pid: sysinfo::get_current_pid().ok(),
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(pid).map(|p| p.memory())
    }
}

/// How hard a reclamation pass should try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimSeverity {
    /// Trim obviously oversized spare capacity.
    Light,
    /// Release everything that can be rebuilt on demand.
    Full,
}

/// Something holding memory it can give back on request.
pub trait Reclaimer: Send + Sync {
    fn reclaim(&self, severity: ReclaimSeverity);
}

impl Reclaimer for ErrorLog {
    fn reclaim(&self, _severity: ReclaimSeverity) {
        self.shrink();
    }
}

/// What [`MemoryGuard::reclaim_if_needed`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Memory optimization is turned off.
    Disabled,
    /// Usage is comfortably below the ceiling.
    NotNeeded,
    /// A pass ran too recently.
    RateLimited,
    /// A light pass brought usage back under the ceiling.
    Light,
    /// A full pass was needed after the light pass.
    Full,
}

/// Tracks process memory against a ceiling and reclaims when close to it.
pub struct MemoryGuard {
    enabled: bool,
    ceiling_bytes: u64,
    min_interval: Duration,
    probe: Arc<dyn MemoryProbe>,
    cached_bytes: AtomicU64,
    last_pass: Mutex<Option<Instant>>,
    passes: AtomicU64,
    reclaimers: Mutex<Vec<Arc<dyn Reclaimer>>>,
}

impl MemoryGuard {
    /// Guard measuring the real process with `sysinfo`.
    pub fn new(settings: &ScanSettings) -> Self {
        Self::with_probe(settings, Arc::new(SysinfoProbe::new()))
    }

    /// Guard reading memory from a custom probe.
    pub fn with_probe(settings: &ScanSettings, probe: Arc<dyn MemoryProbe>) -> Self {
        let guard = Self {
            enabled: settings.enable_memory_optimization,
            ceiling_bytes: settings.max_memory_mb.saturating_mul(BYTES_PER_MB),
            min_interval: settings.reclaim_min_interval,
            probe,
            cached_bytes: AtomicU64::new(0),
            last_pass: Mutex::new(None),
            passes: AtomicU64::new(0),
            reclaimers: Mutex::new(Vec::new()),
        };
        if guard.enabled {
            guard.refresh();
        }
        guard
    }

    /// Whether the guard does anything at all.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Register a reclaimer to run on each pass.
    pub fn register(&self, reclaimer: Arc<dyn Reclaimer>) {
        self.reclaimers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(reclaimer);
    }

    /// Measure resident memory and update the cached figure.
    pub fn refresh(&self) -> u64 {
        let bytes = self
            .probe
            .resident_bytes()
            .unwrap_or_else(|| self.cached_bytes.load(Ordering::Relaxed));
        self.cached_bytes.store(bytes, Ordering::Relaxed);
        bytes
    }

    /// Last measured resident size in bytes.
    pub fn cached_bytes(&self) -> u64 {
        self.cached_bytes.load(Ordering::Relaxed)
    }

    /// Last measured usage as a percentage of the ceiling.
    pub fn usage_percent(&self) -> f64 {
        if self.ceiling_bytes == 0 {
            return 0.0;
        }
        self.cached_bytes() as f64 / self.ceiling_bytes as f64 * 100.0
    }

    /// Cheap check on the cached figure: within 10% of the ceiling or above.
    pub fn is_near_limit(&self) -> bool {
        self.enabled && self.cached_bytes() as f64 >= self.ceiling_bytes as f64 * NEAR_LIMIT_RATIO
    }

    /// Whether usage is over the ceiling even after reclaiming.
    ///
    /// Returns straight away from the cached figure unless it is near the
    /// ceiling; only then reclaims (subject to the rate limit) and re-measures.
    pub fn is_over_limit(&self) -> bool {
        if !self.is_near_limit() {
            return false;
        }
        self.reclaim_if_needed();
        self.refresh() > self.ceiling_bytes
    }

    /// Run a reclamation pass if usage is close to the ceiling and the last
    /// pass is at least the configured interval old.
    pub fn reclaim_if_needed(&self) -> ReclaimOutcome {
        if !self.enabled {
            return ReclaimOutcome::Disabled;
        }
        if (self.refresh() as f64) < self.ceiling_bytes as f64 * NEAR_LIMIT_RATIO {
            return ReclaimOutcome::NotNeeded;
        }

        {
            let mut last = self.last_pass.lock().unwrap_or_else(PoisonError::into_inner);
            if last.is_some_and(|at| at.elapsed() < self.min_interval) {
                return ReclaimOutcome::RateLimited;
            }
            *last = Some(Instant::now());
        }
        self.passes.fetch_add(1, Ordering::Relaxed);

        self.run_reclaimers(ReclaimSeverity::Light);
        if self.refresh() <= self.ceiling_bytes {
            tracing::debug!(target: "memory", usage_mb = self.cached_bytes() / BYTES_PER_MB, "light reclaim pass");
            return ReclaimOutcome::Light;
        }

        self.run_reclaimers(ReclaimSeverity::Full);
        let after = self.refresh();
        tracing::warn!(
            target: "memory",
            usage_mb = after / BYTES_PER_MB,
            ceiling_mb = self.ceiling_bytes / BYTES_PER_MB,
            "full reclaim pass"
        );
        ReclaimOutcome::Full
    }

    /// Number of reclamation passes run so far.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// `"Memory: used/ceiling MB (pct%)"`.
    pub fn describe(&self) -> String {
        format!(
            "Memory: {}/{} MB ({:.1}%)",
            self.cached_bytes() / BYTES_PER_MB,
            self.ceiling_bytes / BYTES_PER_MB,
            self.usage_percent()
        )
    }

    fn run_reclaimers(&self, severity: ReclaimSeverity) {
        let reclaimers = self
            .reclaimers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for reclaimer in reclaimers {
            reclaimer.reclaim(severity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Probe returning a value the test controls.
    struct FixedProbe(Arc<AtomicU64>);

    impl MemoryProbe for FixedProbe {
        fn resident_bytes(&self) -> Option<u64> {
            Some(self.0.load(Ordering::Relaxed))
        }
    }

    #[derive(Default)]
    struct CountingReclaimer {
        light: AtomicUsize,
        full: AtomicUsize,
    }

    impl Reclaimer for CountingReclaimer {
        fn reclaim(&self, severity: ReclaimSeverity) {
            match severity {
                ReclaimSeverity::Light => self.light.fetch_add(1, Ordering::Relaxed),
                ReclaimSeverity::Full => self.full.fetch_add(1, Ordering::Relaxed),
            };
        }
    }

    fn guard(ceiling_mb: u64, usage_mb: u64, interval: Duration) -> (MemoryGuard, Arc<AtomicU64>) {
        let usage = Arc::new(AtomicU64::new(usage_mb * BYTES_PER_MB));
        let settings = ScanSettings {
            max_memory_mb: ceiling_mb,
            reclaim_min_interval: interval,
            ..ScanSettings::default()
        };
        let guard = MemoryGuard::with_probe(&settings, Arc::new(FixedProbe(usage.clone())));
        (guard, usage)
    }

    #[test]
    fn test_below_threshold_is_cheap() {
        let (guard, _) = guard(100, 50, Duration::ZERO);
        assert!(!guard.is_near_limit());
        assert!(!guard.is_over_limit());
        assert_eq!(guard.reclaim_if_needed(), ReclaimOutcome::NotNeeded);
        assert_eq!(guard.passes(), 0);
    }

    #[test]
    fn test_rate_limited_under_rapid_calls() {
        let (guard, _) = guard(1, 64, Duration::from_secs(60));
        let outcomes: Vec<_> = (0..100).map(|_| guard.reclaim_if_needed()).collect();

        assert_eq!(guard.passes(), 1);
        assert_eq!(outcomes[0], ReclaimOutcome::Full);
        assert!(outcomes[1..].iter().all(|o| *o == ReclaimOutcome::RateLimited));
    }

    #[test]
    fn test_escalates_only_while_over_ceiling() {
        let (guard, usage) = guard(100, 95, Duration::ZERO);
        let reclaimer = Arc::new(CountingReclaimer::default());
        guard.register(reclaimer.clone());

        // Near but not over: light pass is enough.
        assert_eq!(guard.reclaim_if_needed(), ReclaimOutcome::Light);
        assert_eq!(reclaimer.light.load(Ordering::Relaxed), 1);
        assert_eq!(reclaimer.full.load(Ordering::Relaxed), 0);

        usage.store(150 * BYTES_PER_MB, Ordering::Relaxed);
        assert_eq!(guard.reclaim_if_needed(), ReclaimOutcome::Full);
        assert_eq!(reclaimer.light.load(Ordering::Relaxed), 2);
        assert_eq!(reclaimer.full.load(Ordering::Relaxed), 1);
        assert!(guard.is_over_limit());
    }

    #[test]
    fn test_disabled_guard_never_reports() {
        let usage = Arc::new(AtomicU64::new(u64::MAX));
        let settings = ScanSettings {
            enable_memory_optimization: false,
            ..ScanSettings::default()
        };
        let guard = MemoryGuard::with_probe(&settings, Arc::new(FixedProbe(usage)));
        assert!(!guard.is_over_limit());
        assert_eq!(guard.reclaim_if_needed(), ReclaimOutcome::Disabled);
    }

    #[test]
    fn test_usage_percent_and_describe() {
        let (guard, _) = guard(200, 50, Duration::ZERO);
        assert!((guard.usage_percent() - 25.0).abs() < f64::EPSILON);
        assert_eq!(guard.describe(), "Memory: 50/200 MB (25.0%)");
    }
}
