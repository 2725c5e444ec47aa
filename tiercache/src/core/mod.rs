pub mod error;
pub mod memory;
pub mod types;

pub use error::{CacheError, ErrorKind, Result};
pub use memory::{MemoryCache, MemoryStats, MemoryTier};
pub use types::{
    CacheCounters, CacheKey, CacheStats, CleanupConfig, DiskConfig, DiskStats, MemoryConfig,
    Metadata,
};
