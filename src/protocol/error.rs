//! Framing errors for the PostgreSQL wire protocol.
//!
//! Shared by `Encoder`, `FrontendMessage`, `MessageParser` and `BackendMessage`.

use thiserror::Error;

use super::parser::ParseState;

/// Errors raised while building or reassembling protocol frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// A string value contains a literal NULL byte (0x00).
    #[error("Value contains NULL byte (0x00) which is invalid in PostgreSQL")]
    NullByte,

    /// Too many parameters for the protocol (limit is i16::MAX = 32767).
    #[error("Too many parameters: {0} (Limit is 32767)")]
    TooManyParameters(usize),

    /// The length field claims fewer than the 4 bytes it occupies itself.
    #[error("Invalid length {length} for message '{}'", *tag as char)]
    InvalidLength { tag: u8, length: i32 },

    /// The claimed body is larger than the configured maximum.
    #[error("Message '{}' claims {length} bytes, maximum is {max}", *tag as char)]
    Oversized { tag: u8, length: usize, max: usize },

    /// End of stream reached with a partial frame buffered.
    #[error("Stream ended mid-frame in state {state:?} with {buffered} bytes buffered")]
    Truncated { state: ParseState, buffered: usize },

    /// A complete frame whose body does not match its message layout.
    #[error("Malformed '{}' message: {reason}", *tag as char)]
    Malformed { tag: u8, reason: String },
}

impl FramingError {
    pub(crate) fn malformed(tag: u8, reason: impl Into<String>) -> Self {
        Self::Malformed {
            tag,
            reason: reason.into(),
        }
    }
}
