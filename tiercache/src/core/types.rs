use super::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Caller-supplied metadata attached to a disk entry
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Validated cache key: non-empty and free of NUL bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Validate and wrap a key
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(CacheError::InvalidKey("key must not be empty".to_string()));
        }
        if key.contains('\0') {
            return Err(CacheError::InvalidKey(format!(
                "key contains a NUL byte: {:?}",
                key
            )));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for CacheKey {
    type Error = CacheError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for CacheKey {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

/// Disk tier configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiskConfig {
    /// Root directory owned by the disk engine
    pub directory: PathBuf,
    /// Hard size limit; a sweep runs only when usage exceeds it
    pub capacity_bytes: u64,
    /// Fraction of capacity a sweep trims down to
    pub trim_ratio: f64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data/cache"),
            capacity_bytes: 100 * 1024 * 1024, // 100MB
            trim_ratio: 0.5,
        }
    }
}

impl DiskConfig {
    /// Config rooted at `directory` with default capacity and trim ratio
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Default::default()
        }
    }

    pub fn with_capacity(mut self, capacity_bytes: u64) -> Self {
        self.capacity_bytes = capacity_bytes;
        self
    }

    pub fn with_trim_ratio(mut self, trim_ratio: f64) -> Self {
        self.trim_ratio = trim_ratio;
        self
    }

    /// Reject settings the engine cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.directory.as_os_str().is_empty() {
            return Err(CacheError::InvalidConfig(
                "disk directory must not be empty".to_string(),
            ));
        }
        if self.capacity_bytes == 0 {
            return Err(CacheError::InvalidConfig(
                "disk capacity must be greater than zero".to_string(),
            ));
        }
        validate_trim_ratio(self.trim_ratio)
    }
}

/// Trim ratios must lie in [0, 1)
pub fn validate_trim_ratio(ratio: f64) -> Result<()> {
    if !(0.0..1.0).contains(&ratio) {
        return Err(CacheError::InvalidConfig(format!(
            "trim ratio must be in [0, 1), got {}",
            ratio
        )));
    }
    Ok(())
}

/// In-memory tier limits (0 means unlimited)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub cost_limit: u64,
    pub count_limit: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cost_limit: 64 * 1024 * 1024,
            count_limit: 10_000,
        }
    }
}

/// Periodic disk sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Disk tier statistics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub capacity_bytes: u64,
    pub utilization: f64,
}

/// Coordinator statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub decode_failures: u64,
    pub writes: u64,
    pub write_failures: u64,
    pub sweeps: u64,
    pub evicted_entries: u64,
    pub evicted_bytes: u64,
}

impl CacheStats {
    /// Fraction of reads served from either tier
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.disk_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Lock-free counters shared between the coordinator and the disk worker
#[derive(Debug, Default)]
pub struct CacheCounters {
    pub memory_hits: AtomicU64,
    pub disk_hits: AtomicU64,
    pub misses: AtomicU64,
    pub decode_failures: AtomicU64,
    pub writes: AtomicU64,
    pub write_failures: AtomicU64,
    pub sweeps: AtomicU64,
    pub evicted_entries: AtomicU64,
    pub evicted_bytes: AtomicU64,
}

impl CacheCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            evicted_entries: self.evicted_entries.load(Ordering::Relaxed),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_rejects_empty() {
        let err = CacheKey::new("").unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey(_)));
    }

    #[test]
    fn test_cache_key_rejects_nul() {
        assert!(CacheKey::new("a\0b").is_err());
        assert_eq!(CacheKey::try_from("avatar:42").unwrap().as_str(), "avatar:42");
    }

    #[test]
    fn test_disk_config_validation() {
        assert!(DiskConfig::default().validate().is_ok());
        assert!(DiskConfig::default().with_capacity(0).validate().is_err());
        assert!(DiskConfig::default().with_trim_ratio(1.0).validate().is_err());
        assert!(DiskConfig::default().with_trim_ratio(-0.1).validate().is_err());
        assert!(DiskConfig::default().with_trim_ratio(0.0).validate().is_ok());
        assert!(DiskConfig::new("").validate().is_err());
    }

    #[test]
    fn test_cleanup_interval_never_zero() {
        let config = CleanupConfig {
            enabled: true,
            interval_secs: 0,
        };
        assert_eq!(config.interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_stats_hit_rate() {
        let mut stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);

        stats.memory_hits = 2;
        stats.disk_hits = 1;
        stats.misses = 1;
        assert_eq!(stats.hit_rate(), 0.75);
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = CacheCounters::default();
        CacheCounters::incr(&counters.writes);
        CacheCounters::incr(&counters.writes);
        CacheCounters::incr(&counters.misses);

        let stats = counters.snapshot();
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.misses, 1);
    }
}
