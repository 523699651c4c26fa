//! Frontend (client → server) messages.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::Bytes;

use super::encoder::Encoder;
use super::error::FramingError;

/// Protocol version 3.0.
pub const PROTOCOL_VERSION: i32 = 196608;
/// Magic code sent in place of a protocol version to request TLS.
pub const SSL_REQUEST_CODE: i32 = 80877103;
/// Magic code for an out-of-band cancel.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Target of a Describe or Close message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn code(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

/// Frontend message types
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendMessage {
    /// Startup message (sent first, no type byte)
    Startup { params: Vec<(String, String)> },
    /// TLS negotiation request (no type byte)
    SslRequest,
    CancelRequest { process_id: i32, secret_key: i32 },
    /// Cleartext or MD5 password response
    Password(String),
    /// SASL initial response (first message in SCRAM)
    SaslInitialResponse { mechanism: String, data: Vec<u8> },
    /// SASL response (subsequent messages in SCRAM)
    SaslResponse(Vec<u8>),
    Query(String),
    /// Parse (prepared statement)
    Parse {
        name: String,
        query: String,
        param_types: Vec<u32>,
    },
    /// Bind parameters to a prepared statement
    Bind {
        portal: String,
        statement: String,
        param_formats: Vec<i16>,
        params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    },
    Describe { target: Target, name: String },
    Close { target: Target, name: String },
    /// Execute portal, `max_rows` 0 means no limit
    Execute { portal: String, max_rows: i32 },
    Flush,
    Sync,
    Terminate,
    CopyData(Vec<u8>),
    CopyDone,
    CopyFail(String),
}

impl FrontendMessage {
    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes, FramingError> {
        self.encode(&mut Encoder::new())
    }

    /// Encode through a caller-owned (possibly pooled) encoder.
    pub fn encode(&self, enc: &mut Encoder) -> Result<Bytes, FramingError> {
        // Validate first so a failure never leaves the encoder mid-message.
        self.validate()?;
        match self {
            FrontendMessage::Startup { params } => {
                enc.init(None).i32(PROTOCOL_VERSION);
                for (key, value) in params {
                    enc.cstr(key).cstr(value);
                }
                enc.u8(0);
            }
            FrontendMessage::SslRequest => {
                enc.init(None).i32(SSL_REQUEST_CODE);
            }
            FrontendMessage::CancelRequest {
                process_id,
                secret_key,
            } => {
                enc.init(None)
                    .i32(CANCEL_REQUEST_CODE)
                    .i32(*process_id)
                    .i32(*secret_key);
            }
            FrontendMessage::Password(password) => {
                enc.init(Some(b'p')).cstr(password);
            }
            FrontendMessage::SaslInitialResponse { mechanism, data } => {
                enc.init(Some(b'p'))
                    .cstr(mechanism)
                    .i32(data.len() as i32)
                    .bin(data);
            }
            FrontendMessage::SaslResponse(data) => {
                enc.init(Some(b'p')).bin(data);
            }
            FrontendMessage::Query(sql) => {
                enc.init(Some(b'Q')).cstr(sql);
            }
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            } => {
                enc.init(Some(b'P'))
                    .cstr(name)
                    .cstr(query)
                    .i16(param_types.len() as i16);
                for &oid in param_types {
                    enc.i32(oid as i32);
                }
            }
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => {
                enc.init(Some(b'B'))
                    .cstr(portal)
                    .cstr(statement)
                    .i16(param_formats.len() as i16);
                for &format in param_formats {
                    enc.i16(format);
                }
                enc.i16(params.len() as i16);
                for param in params {
                    match param {
                        None => {
                            enc.i32(-1);
                        }
                        Some(data) => {
                            enc.i32(data.len() as i32).bin(data);
                        }
                    }
                }
                enc.i16(result_formats.len() as i16);
                for &format in result_formats {
                    enc.i16(format);
                }
            }
            FrontendMessage::Describe { target, name } => {
                enc.init(Some(b'D')).u8(target.code()).cstr(name);
            }
            FrontendMessage::Close { target, name } => {
                enc.init(Some(b'C')).u8(target.code()).cstr(name);
            }
            FrontendMessage::Execute { portal, max_rows } => {
                enc.init(Some(b'E')).cstr(portal).i32(*max_rows);
            }
            FrontendMessage::Flush => {
                enc.init(Some(b'H'));
            }
            FrontendMessage::Sync => {
                enc.init(Some(b'S'));
            }
            FrontendMessage::Terminate => {
                enc.init(Some(b'X'));
            }
            FrontendMessage::CopyData(data) => {
                enc.init(Some(b'd')).bin(data);
            }
            FrontendMessage::CopyDone => {
                enc.init(Some(b'c'));
            }
            FrontendMessage::CopyFail(message) => {
                enc.init(Some(b'f')).cstr(message);
            }
        }
        Ok(enc.flush())
    }

    fn validate(&self) -> Result<(), FramingError> {
        match self {
            FrontendMessage::Startup { params } => {
                for (key, value) in params {
                    no_nul(key)?;
                    no_nul(value)?;
                }
            }
            FrontendMessage::Password(s)
            | FrontendMessage::Query(s)
            | FrontendMessage::CopyFail(s) => no_nul(s)?,
            FrontendMessage::SaslInitialResponse { mechanism, .. } => no_nul(mechanism)?,
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            } => {
                no_nul(name)?;
                no_nul(query)?;
                fits_i16(param_types.len())?;
            }
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => {
                no_nul(portal)?;
                no_nul(statement)?;
                fits_i16(param_formats.len())?;
                fits_i16(params.len())?;
                fits_i16(result_formats.len())?;
            }
            FrontendMessage::Describe { name, .. } | FrontendMessage::Close { name, .. } => {
                no_nul(name)?
            }
            FrontendMessage::Execute { portal, .. } => no_nul(portal)?,
            _ => {}
        }
        Ok(())
    }
}

fn no_nul(s: &str) -> Result<(), FramingError> {
    if s.as_bytes().contains(&0) {
        return Err(FramingError::NullByte);
    }
    Ok(())
}

fn fits_i16(n: usize) -> Result<(), FramingError> {
    if n > i16::MAX as usize {
        return Err(FramingError::TooManyParameters(n));
    }
    Ok(())
}
