//! Error types for the engine core

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Error taxonomy for the engine core
#[derive(Error, Debug)]
pub enum EngineError {
    /// Operation attempted while the receiver was not in a state that
    /// accepts it (queue not running, stream shut down, engine stopped)
    #[error("refused: receiver is {state}")]
    Refused {
        /// State the receiver was in
        state: String,
    },

    /// Start called on a component that is already running
    #[error("already running")]
    AlreadyRunning,

    /// A bounded wait elapsed before the operation completed
    #[error("operation timed out")]
    Timeout,

    /// User record lookup failed
    #[error("no such user: {0}")]
    NoSuchUser(String),

    /// User record already exists
    #[error("user already exists: {0}")]
    Conflict(String),

    /// A stream sentinel was removed or missing; the stream is corrupt
    #[error("sentinel filter missing from stream")]
    SentinelRemoval,

    /// An internal channel was closed before the operation completed
    #[error("channel closed")]
    ChannelClosed,

    /// Configuration rejected at validation
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Build a `Refused` error naming the offending state.
    pub fn refused(state: impl std::fmt::Display) -> Self {
        EngineError::Refused {
            state: state.to_string(),
        }
    }
}
