//! Cache Module
//!
//! Coordinates the two storage tiers:
//! - `composite`: memory-first reads, write-through to disk
//! - `worker`: serialized executor owning the disk engine
//! - `cleanup`: recurring disk sweeps
//! - `delivery`: where completion callbacks run
//! - `failure`: side channel for background disk failures
//! - `fence`: keeps stale disk reads out of the memory tier

pub mod cleanup;
pub mod composite;
pub mod delivery;
pub mod failure;
mod fence;
pub mod worker;

pub use cleanup::CleanupScheduler;
pub use composite::{DEFAULT_FAILURE_CAPACITY, TierCache, TierCacheBuilder};
pub use delivery::{Completion, CompletionQueue, CompletionTarget, Inline, QueueTarget};
pub use failure::{DiskFailure, DiskOperation, FailureReporter};
pub use worker::DiskWorker;
