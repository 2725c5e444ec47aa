use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

use crate::core::{CacheCounters, CacheError};

/// Kind of background operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskOperation {
    Read,
    Write,
    Encode,
    Decode,
    Remove,
    RemoveAll,
    Metadata,
    Sweep,
}

/// A failure observed after the issuing call already returned
#[derive(Debug, Clone)]
pub struct DiskFailure {
    pub operation: DiskOperation,
    pub key: Option<String>,
    pub error: Arc<CacheError>,
}

/// Fans background failures out to subscribers and the log
#[derive(Clone)]
pub struct FailureReporter {
    tx: broadcast::Sender<DiskFailure>,
    counters: Arc<CacheCounters>,
}

impl FailureReporter {
    pub fn new(capacity: usize, counters: Arc<CacheCounters>) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, counters }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiskFailure> {
        self.tx.subscribe()
    }

    pub fn report(&self, operation: DiskOperation, key: Option<&str>, error: CacheError) {
        warn!(?operation, key = ?key, error = %error, "Cache operation failed");

        if matches!(operation, DiskOperation::Write | DiskOperation::Encode) {
            CacheCounters::incr(&self.counters.write_failures);
        }

        // No subscribers is fine
        let _ = self.tx.send(DiskFailure {
            operation,
            key: key.map(str::to_string),
            error: Arc::new(error),
        });
    }
}
