use thiserror::Error;

/// Main error type for tiercache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Disk worker is not accepting work")]
    WorkerClosed,

    #[error("Async runtime unavailable: {0}")]
    Runtime(String),
}

/// Coarse error categories reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidKey,
    Io,
    Codec,
    Config,
    Worker,
}

impl CacheError {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidKey(_) => ErrorKind::InvalidKey,
            Self::Io(_) => ErrorKind::Io,
            Self::Codec(_) | Self::Metadata(_) => ErrorKind::Codec,
            Self::InvalidConfig(_) => ErrorKind::Config,
            Self::WorkerClosed | Self::Runtime(_) => ErrorKind::Worker,
        }
    }

    /// True when the underlying storage failed (disk full, permission denied, ...)
    pub fn is_io(&self) -> bool {
        self.kind() == ErrorKind::Io
    }
}

/// Result type alias for tiercache operations
pub type Result<T> = std::result::Result<T, CacheError>;
