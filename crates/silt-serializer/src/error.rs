use std::fmt::Display;

/// A specialized error type for serializer operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The runtime refused an operation (blocking pool gone, bad config).
    #[error("runtime error: {0}")]
    Runtime(#[from] silt_runtime::RuntimeError),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Data corruption detected.
    #[error("data corruption: {0}")]
    Corruption(String),
    /// The on-disk format version is not one this build understands.
    #[error("unsupported format version {0}")]
    UnsupportedFormat(u32),
    /// The metablock manager refuses new work while shutting down.
    #[error("metablock manager is shut down")]
    ShutDown,
}

impl SerializerError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create a corruption error from a displayable value.
    pub fn corruption<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Corruption(msg.to_string())
    }
}

/// A Result type alias for serializer operations.
pub type SerializerResult<T> = Result<T, SerializerError>;
