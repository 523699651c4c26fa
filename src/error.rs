//! Crate-level error type.

use thiserror::Error;

use crate::driver::{InternalConsistencyError, PoolError};
use crate::protocol::{FramingError, SaslError};
use crate::types::TypeError;

/// Any error raised by this crate.
#[derive(Debug, Error)]
pub enum PgWireError {
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Type error: {0}")]
    Type(#[from] TypeError),

    #[error("Authentication error: {0}")]
    Sasl(#[from] SaslError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Consistency(#[from] InternalConsistencyError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification, stable across variants' payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ProtocolFraming,
    TypeDecode,
    Sasl,
    SocketPool,
    InternalConsistency,
    Config,
    Io,
}

impl PgWireError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Framing(_) => ErrorKind::ProtocolFraming,
            Self::Type(_) => ErrorKind::TypeDecode,
            Self::Sasl(_) => ErrorKind::Sasl,
            Self::Pool(_) => ErrorKind::SocketPool,
            Self::Consistency(_) => ErrorKind::InternalConsistency,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

/// Result type alias for this crate.
pub type PgWireResult<T> = Result<T, PgWireError>;
