//! Error types for the scheduler runtime.

/// Result type alias for scheduler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while bringing the scheduler up or down.
///
/// Scheduling mistakes (unknown labels, call-order violations, bad ranges)
/// are programming errors and fail an assertion instead of surfacing here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Runtime not started
    #[error("scheduler not started - call sts_rs::startup() first")]
    NotStarted,

    /// Runtime already started
    #[error("scheduler already started")]
    AlreadyStarted,

    /// Worker or runner thread could not be spawned
    #[error("thread spawn failed: {0}")]
    Spawn(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Create a spawn error
    pub fn spawn<S: Into<String>>(msg: S) -> Self {
        Error::Spawn(msg.into())
    }
}
