//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding boundary types.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization failed.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Malformed message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
