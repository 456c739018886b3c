use std::fmt::Display;

/// A specialized error type for runtime operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The blocking pool has not been constructed yet (the thread pool is
    /// not running).
    #[error("blocking pool is not available")]
    BlockingPoolUnavailable,
    /// The blocking pool has already been told to shut down.
    #[error("blocking pool is shut down")]
    BlockingPoolShutDown,
    /// Internal error (worker thread panicked, etc.).
    #[error("internal error: {0}")]
    InternalError(String),
}

impl RuntimeError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create an internal error from a displayable value.
    pub fn internal<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InternalError(msg.to_string())
    }
}

/// A Result type alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
