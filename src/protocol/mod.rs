//! PostgreSQL wire protocol: frame encoding, streaming decode and
//! authentication exchanges.

pub mod auth;
pub mod backend;
pub mod encoder;
pub mod error;
pub mod frontend;
pub mod parser;

pub use auth::{SaslError, SaslSession, SaslState, md5_password};
pub use backend::{BackendMessage, ErrorFields, FieldDescription, TransactionStatus};
pub use encoder::{Encoder, EncoderPool};
pub use error::FramingError;
pub use frontend::{FrontendMessage, Target};
pub use parser::{MessageParser, ParseState, RawMessage};
