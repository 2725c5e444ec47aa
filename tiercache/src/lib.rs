pub mod cache;
pub mod config;
pub mod core;
pub mod disk;

// Re-export commonly used types
pub use cache::{
    CompletionQueue, CompletionTarget, DiskFailure, DiskOperation, Inline, TierCache,
    TierCacheBuilder,
};
pub use config::{CacheConfig, LogFormat, LoggingConfig};
pub use core::{
    CacheError, CacheKey, CacheStats, CleanupConfig, DiskConfig, DiskStats, ErrorKind,
    MemoryCache, MemoryConfig, MemoryTier, Metadata, Result,
};
pub use disk::{AttributeStore, DiskStorage, MemoryAttributes, SidecarAttributes, SweepReport};
