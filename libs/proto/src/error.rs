//! Error types for protocol decoding.

use thiserror::Error;

/// Errors produced while decoding protocol frames and tokens.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// A record length prefix was not a decimal integer.
    #[error("invalid record length prefix: {0:?}")]
    InvalidLengthPrefix(String),

    /// A record length prefix exceeded the configured maximum.
    #[error("record length {length} exceeds maximum {max}")]
    RecordTooLarge { length: usize, max: usize },

    /// A token failed to parse as a ULID.
    #[error("invalid token: {0}")]
    InvalidToken(String),
}
