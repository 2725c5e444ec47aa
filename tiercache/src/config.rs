use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::cache::{TierCache, TierCacheBuilder};
use crate::core::{CacheError, CleanupConfig, DiskConfig, MemoryConfig, Result};

/// Top-level cache configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub disk: DiskConfig,
    pub memory: MemoryConfig,
    pub cleanup: CleanupConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl CacheConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: CacheConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.disk.validate()?;
        if self.logging.level.trim().is_empty() {
            return Err(CacheError::InvalidConfig(
                "logging.level must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Builder preloaded with the disk, memory and cleanup sections
    pub fn builder<V: Clone + Send + Sync + 'static>(&self) -> TierCacheBuilder<V> {
        TierCache::<V>::builder(self.disk.clone())
            .memory_config(&self.memory)
            .cleanup(self.cleanup.clone())
    }
}
