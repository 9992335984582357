//! Error types for the dispatch engine

use thiserror::Error;

/// Errors surfaced by the dispatcher's management and producer APIs
#[derive(Error, Debug)]
pub enum DispatchError {
    /// A channel with the same id is already registered
    #[error("Input channel {0} is already registered")]
    ChannelExists(u64),

    /// The named channel is not registered
    #[error("Input channel {0} is not registered")]
    ChannelNotFound(u64),

    /// The channel's connection is broken and cannot accept work
    #[error("Input channel {0} is broken")]
    ChannelBroken(u64),

    /// An event failed structural validation before queueing
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Configuration validation failure
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;
