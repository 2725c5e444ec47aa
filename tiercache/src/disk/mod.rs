//! Disk tier
//!
//! - `storage`: keyed payload files with size accounting and LRU sweeps
//! - `sweep`: eviction ordering and sweep reports
//! - `attributes`: per-file metadata side channel

pub mod attributes;
pub mod storage;
pub mod sweep;

pub use attributes::{AttributeStore, Attributes, MemoryAttributes, SidecarAttributes};
pub use storage::DiskStorage;
pub use sweep::{SweepCandidate, SweepReport};
