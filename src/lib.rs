//! # pgwire-core
//!
//! Client-side building blocks for the PostgreSQL v3 wire protocol.
//!
//! - [`protocol`]: message encoding, a streaming frame parser and the
//!   SCRAM-SHA-256 exchange.
//! - [`types`]: decoders for numeric, array, timestamp, interval, range,
//!   geometric, json, bytea and bool values.
//! - [`driver`]: a socket pool scheduler with jittered connects and telemetry.
//!
//! ## Quick Example
//!
//! ```
//! use pgwire_core::prelude::*;
//!
//! let bytes = FrontendMessage::Query("SELECT 1".into()).to_bytes().unwrap();
//! assert_eq!(bytes[0], b'Q');
//!
//! let mut parser = MessageParser::new();
//! let frames = parser.parse(&[b'Z', 0, 0, 0, 5, b'I']).unwrap();
//! assert_eq!(frames.len(), 1);
//! ```
//!
//! Nothing here does I/O except [`driver`], which runs on tokio.

pub mod config;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod types;

pub mod prelude {
    pub use crate::config::WireConfig;
    pub use crate::driver::{
        Pool, SendStatus, SocketContext, SocketFactory, SocketHandlers, SocketId,
        SocketPoolManager, Verdict,
    };
    pub use crate::error::*;
    pub use crate::protocol::{
        BackendMessage, Encoder, FrontendMessage, MessageParser, SaslSession,
    };
    pub use crate::types::{FromPg, NumericValue, PgInterval, PgRange, PgTimestamp, PgValue, decode_value};
}
