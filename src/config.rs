//! Engine configuration and builder.

use crate::error::{LsmError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default page body size minus the 8-byte overflow header (spec §3: 4096-byte pages).
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Configuration for an [`LsmEngine`](crate::engine::LsmEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LsmConfig {
    pub dir_path: PathBuf,
    /// Unix permission bits applied if `dir_path` must be created.
    pub dir_perms: u32,
    /// Memtable flush threshold, counted in live entries (spec §4.7).
    pub memtable_flush_size: usize,
    pub compaction_interval: Duration,
    /// `None` auto-detects from available parallelism, reserving a few
    /// threads for the caller/WAL/flush threads, mirroring the original
    /// engine's `max(1, available - 3)` rule.
    pub max_compaction_threads: Option<usize>,
    pub page_size: usize,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            dir_path: PathBuf::from("./.lsm_data"),
            dir_perms: 0o755,
            memtable_flush_size: 10_000,
            compaction_interval: Duration::from_secs(60),
            max_compaction_threads: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl LsmConfig {
    pub fn builder() -> LsmConfigBuilder {
        LsmConfigBuilder::default()
    }

    /// Validates every field, matching the teacher's named-error
    /// validation style.
    pub fn validate(&self) -> Result<()> {
        if self.dir_path.as_os_str().is_empty() {
            return Err(LsmError::InvalidArgument(
                "dir_path cannot be empty".to_string(),
            ));
        }
        if self.memtable_flush_size == 0 {
            return Err(LsmError::InvalidArgument(
                "memtable_flush_size must be at least 1".to_string(),
            ));
        }
        if self.page_size < 64 {
            return Err(LsmError::InvalidArgument(
                "page_size must be at least 64 bytes".to_string(),
            ));
        }
        if let Some(threads) = self.max_compaction_threads {
            if threads == 0 {
                return Err(LsmError::InvalidArgument(
                    "max_compaction_threads must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Resolves `max_compaction_threads`, auto-detecting from available
    /// parallelism when unset.
    pub fn resolved_compaction_threads(&self) -> Result<usize> {
        match self.max_compaction_threads {
            Some(n) => Ok(n),
            None => {
                let available = std::thread::available_parallelism()
                    .map_err(|e| LsmError::ResourceExhausted(e.to_string()))?
                    .get();
                Ok(available.saturating_sub(3).max(1))
            }
        }
    }
}

#[derive(Default)]
pub struct LsmConfigBuilder {
    dir_path: Option<PathBuf>,
    dir_perms: Option<u32>,
    memtable_flush_size: Option<usize>,
    compaction_interval: Option<Duration>,
    max_compaction_threads: Option<usize>,
    page_size: Option<usize>,
}

impl LsmConfigBuilder {
    pub fn dir_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.dir_path = Some(path.into());
        self
    }

    pub fn dir_perms(mut self, perms: u32) -> Self {
        self.dir_perms = Some(perms);
        self
    }

    pub fn memtable_flush_size(mut self, size: usize) -> Self {
        self.memtable_flush_size = Some(size);
        self
    }

    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = Some(interval);
        self
    }

    pub fn max_compaction_threads(mut self, threads: usize) -> Self {
        self.max_compaction_threads = Some(threads);
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn build(self) -> Result<LsmConfig> {
        let defaults = LsmConfig::default();
        let config = LsmConfig {
            dir_path: self.dir_path.unwrap_or(defaults.dir_path),
            dir_perms: self.dir_perms.unwrap_or(defaults.dir_perms),
            memtable_flush_size: self
                .memtable_flush_size
                .unwrap_or(defaults.memtable_flush_size),
            compaction_interval: self
                .compaction_interval
                .unwrap_or(defaults.compaction_interval),
            max_compaction_threads: self.max_compaction_threads,
            page_size: self.page_size.unwrap_or(defaults.page_size),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(LsmConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_flush_size() {
        let result = LsmConfig::builder().memtable_flush_size(0).build();
        assert!(matches!(result, Err(LsmError::InvalidArgument(_))));
    }

    #[test]
    fn rejects_empty_dir_path() {
        let result = LsmConfig::builder().dir_path("").build();
        assert!(matches!(result, Err(LsmError::InvalidArgument(_))));
    }

    #[test]
    fn builder_round_trips_values() {
        let config = LsmConfig::builder()
            .dir_path("/tmp/lsm-test")
            .memtable_flush_size(256)
            .page_size(8192)
            .max_compaction_threads(4)
            .build()
            .unwrap();
        assert_eq!(config.dir_path, PathBuf::from("/tmp/lsm-test"));
        assert_eq!(config.memtable_flush_size, 256);
        assert_eq!(config.page_size, 8192);
        assert_eq!(config.max_compaction_threads, Some(4));
    }
}
