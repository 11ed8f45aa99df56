//! Scan configuration types.

use std::path::Path;
use std::thread;
use std::time::Duration;

use derive_builder::Builder;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// Immutable configuration for one scan invocation.
///
/// Build it once with [`ScanSettings::builder`] (or take [`ScanSettings::default`]),
/// then share it read-only with every lane.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(private, name = "build_unchecked"))]
#[serde(default)]
pub struct ScanSettings {
    /// Maximum number of root paths scanned at the same time.
    #[builder(default = "default_max_lanes()")]
    pub max_lanes: usize,

    /// Maximum simultaneous directory visits inside one lane.
    #[builder(default = "4")]
    pub max_threads: usize,

    /// Depth below a lane root at which descent stops.
    #[builder(default = "50")]
    pub max_depth: u32,

    /// Memory ceiling in megabytes.
    #[builder(default = "512")]
    pub max_memory_mb: u64,

    /// Whether the memory guard measures and reclaims at all.
    #[builder(default = "true")]
    pub enable_memory_optimization: bool,

    /// Wall-clock budget for the whole scan.
    #[builder(default = "Duration::from_secs(60 * 60)")]
    pub global_timeout: Duration,

    /// Deadline for listing one local directory.
    #[builder(default = "Duration::from_secs(30)")]
    pub directory_timeout: Duration,

    /// Deadline for listing one directory on a network volume.
    #[builder(default = "Duration::from_secs(120)")]
    pub network_timeout: Duration,

    /// Skip hidden directories and do not count hidden files.
    #[builder(default = "true")]
    pub skip_hidden: bool,

    /// Skip directories carrying the system attribute.
    #[builder(default = "true")]
    pub skip_system: bool,

    /// Process very wide directories in sequential batches.
    #[builder(default = "true")]
    pub adaptive_batching: bool,

    /// Number of sibling directories per batch.
    #[builder(default = "50")]
    pub batch_size: usize,

    /// Subdirectory count above which batching kicks in.
    #[builder(default = "100")]
    pub batch_threshold: usize,

    /// Concurrency ceiling inside a batch (further capped by `max_threads`).
    #[builder(default = "8")]
    pub batch_concurrency: usize,

    /// Directories visited between memory checks.
    #[builder(default = "500")]
    pub memory_check_interval: u64,

    /// Minimum time between two forced reclamation passes.
    #[builder(default = "Duration::from_secs(2)")]
    pub reclaim_min_interval: Duration,

    /// Glob patterns for directories to skip, matched against name and full path.
    #[builder(default)]
    pub exclude_patterns: Vec<String>,
}

fn default_max_lanes() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

impl ScanSettingsBuilder {
    /// Build and validate the settings.
    pub fn build(&self) -> Result<ScanSettings, ScanError> {
        let settings = self
            .build_unchecked()
            .map_err(|e| ScanError::InvalidConfig {
                message: e.to_string(),
            })?;
        settings.validate()?;
        Ok(settings)
    }
}

impl ScanSettings {
    /// Create a new settings builder.
    pub fn builder() -> ScanSettingsBuilder {
        ScanSettingsBuilder::default()
    }

    /// Profile for very large trees: more threads, deeper, larger ceiling.
    pub fn for_large_folders() -> Self {
        Self {
            max_threads: 8,
            max_depth: 100,
            max_memory_mb: 1024,
            ..Self::default()
        }
    }

    /// Check the settings for values a scan cannot run with.
    pub fn validate(&self) -> Result<(), ScanError> {
        let invalid = |message: &str| -> Result<(), ScanError> {
            Err(ScanError::InvalidConfig {
                message: message.to_string(),
            })
        };

        if self.max_lanes == 0 {
            return invalid("max_lanes must be at least 1");
        }
        if self.max_threads == 0 {
            return invalid("max_threads must be at least 1");
        }
        if self.batch_size == 0 || self.batch_concurrency == 0 {
            return invalid("batch_size and batch_concurrency must be at least 1");
        }
        if self.enable_memory_optimization && self.max_memory_mb == 0 {
            return invalid("max_memory_mb must be positive when memory optimization is enabled");
        }
        if self.global_timeout.is_zero()
            || self.directory_timeout.is_zero()
            || self.network_timeout.is_zero()
        {
            return invalid("timeouts must be non-zero");
        }
        self.exclude_set()?;
        Ok(())
    }

    /// Concurrency ceiling for one batch of a wide directory.
    pub fn batch_limit(&self) -> usize {
        self.max_threads.min(self.batch_concurrency).max(1)
    }

    /// Whether a directory with `subdirs` children should be processed in batches.
    pub fn should_batch(&self, subdirs: usize) -> bool {
        self.adaptive_batching && subdirs > self.batch_threshold
    }

    /// Compile the exclusion patterns.
    pub fn exclude_set(&self) -> Result<GlobSet, ScanError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.exclude_patterns {
            let glob = Glob::new(pattern).map_err(|e| ScanError::InvalidConfig {
                message: format!("invalid exclude pattern `{pattern}`: {e}"),
            })?;
            builder.add(glob);
        }
        builder.build().map_err(|e| ScanError::InvalidConfig {
            message: e.to_string(),
        })
    }

    /// Check whether a directory matches the compiled exclusion set.
    pub fn is_excluded(set: &GlobSet, path: &Path) -> bool {
        if set.is_empty() {
            return false;
        }
        set.is_match(path) || path.file_name().is_some_and(|name| set.is_match(name))
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            max_lanes: default_max_lanes(),
            max_threads: 4,
            max_depth: 50,
            max_memory_mb: 512,
            enable_memory_optimization: true,
            global_timeout: Duration::from_secs(60 * 60),
            directory_timeout: Duration::from_secs(30),
            network_timeout: Duration::from_secs(120),
            skip_hidden: true,
            skip_system: true,
            adaptive_batching: true,
            batch_size: 50,
            batch_threshold: 100,
            batch_concurrency: 8,
            memory_check_interval: 500,
            reclaim_min_interval: Duration::from_secs(2),
            exclude_patterns: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_builder() {
        let settings = ScanSettings::builder()
            .max_threads(2usize)
            .max_depth(3u32)
            .skip_hidden(false)
            .build()
            .unwrap();

        assert_eq!(settings.max_threads, 2);
        assert_eq!(settings.max_depth, 3);
        assert!(!settings.skip_hidden);
        assert_eq!(settings.batch_size, 50);
    }

    #[test]
    fn test_defaults() {
        let settings = ScanSettings::default();
        assert!(settings.skip_hidden);
        assert!(settings.skip_system);
        assert_eq!(settings.max_threads, 4);
        assert_eq!(settings.max_depth, 50);
        assert_eq!(settings.max_memory_mb, 512);
        assert!(settings.enable_memory_optimization);
        assert!(settings.max_lanes >= 1);
    }

    #[test]
    fn test_large_folder_profile() {
        let settings = ScanSettings::for_large_folders();
        assert_eq!(settings.max_threads, 8);
        assert_eq!(settings.max_depth, 100);
        assert_eq!(settings.max_memory_mb, 1024);
    }

    #[test]
    fn test_validation_rejects_zero_threads() {
        let err = ScanSettings::builder().max_threads(0usize).build().unwrap_err();
        assert!(matches!(err, ScanError::InvalidConfig { .. }));
    }

    #[test]
    fn test_validation_rejects_bad_glob() {
        let err = ScanSettings::builder()
            .exclude_patterns(vec!["[unclosed".to_string()])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("exclude pattern"));
    }

    #[test]
    fn test_batch_limit_capped_by_threads() {
        let mut settings = ScanSettings::default();
        settings.max_threads = 3;
        assert_eq!(settings.batch_limit(), 3);
        settings.max_threads = 16;
        assert_eq!(settings.batch_limit(), 8);
        assert!(settings.should_batch(101));
        assert!(!settings.should_batch(100));
    }

    #[test]
    fn test_is_excluded_matches_name_and_path() {
        let settings = ScanSettings::builder()
            .exclude_patterns(vec!["node_modules".to_string(), "/tmp/**/cache".to_string()])
            .build()
            .unwrap();
        let set = settings.exclude_set().unwrap();

        assert!(ScanSettings::is_excluded(&set, Path::new("/work/app/node_modules")));
        assert!(ScanSettings::is_excluded(&set, Path::new("/tmp/a/b/cache")));
        assert!(!ScanSettings::is_excluded(&set, Path::new("/work/app/src")));
    }
}
