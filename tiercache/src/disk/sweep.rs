//! LRU sweep planning

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One payload file considered by a sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepCandidate {
    pub path: PathBuf,
    pub size: u64,
    /// Access stamp in nanoseconds since the Unix epoch
    pub accessed_at: i64,
}

/// Outcome of a sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    pub failed: usize,
    pub freed_bytes: u64,
    pub size_before: u64,
    pub size_after: u64,
    pub target_bytes: u64,
}

impl SweepReport {
    /// True when the sweep found nothing to do
    pub fn is_noop(&self) -> bool {
        self.removed == 0 && self.failed == 0
    }
}

/// Size a sweep trims down to
pub fn trim_target(capacity_bytes: u64, trim_ratio: f64) -> u64 {
    (capacity_bytes as f64 * trim_ratio).floor() as u64
}

/// Sort candidates oldest first, ties broken by path
pub fn eviction_order(candidates: &mut [SweepCandidate]) {
    candidates.sort_by(|a, b| {
        a.accessed_at
            .cmp(&b.accessed_at)
            .then_with(|| a.path.cmp(&b.path))
    });
}
