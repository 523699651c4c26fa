//! Backend (server → client) messages.
//!
//! Decodes the body of a frame produced by `MessageParser`.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::BTreeMap;

use super::error::FramingError;
use super::parser::RawMessage;

/// Backend message types
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password([u8; 4]),
    /// Mechanisms offered by the server
    AuthenticationSASL(Vec<String>),
    /// server-first-message
    AuthenticationSASLContinue(Vec<u8>),
    /// server-final-message
    AuthenticationSASLFinal(Vec<u8>),
    ParameterStatus {
        name: String,
        value: String,
    },
    /// Backend key data (for cancel)
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },
    ReadyForQuery(TransactionStatus),
    RowDescription(Vec<FieldDescription>),
    DataRow(Vec<Option<Vec<u8>>>),
    CommandComplete(String),
    ErrorResponse(ErrorFields),
    NoticeResponse(ErrorFields),
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    EmptyQueryResponse,
    ParameterDescription(Vec<u32>),
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    NegotiateProtocolVersion {
        newest_minor: i32,
        unrecognized: Vec<String>,
    },
    CopyInResponse(CopyFormat),
    CopyOutResponse(CopyFormat),
    CopyBothResponse(CopyFormat),
    CopyData(Vec<u8>),
    CopyDone,
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,    // 'I'
    InBlock, // 'T'
    Failed,  // 'E'
}

/// Field description in RowDescription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

/// Overall and per-column formats of a COPY response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFormat {
    pub format: u8,
    pub column_formats: Vec<i16>,
}

/// Fields of an ErrorResponse / NoticeResponse, keyed by field code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub fields: BTreeMap<u8, String>,
}

impl ErrorFields {
    pub fn get(&self, code: u8) -> Option<&str> {
        self.fields.get(&code).map(String::as_str)
    }

    pub fn severity(&self) -> &str {
        self.get(b'S').unwrap_or_default()
    }

    /// SQLSTATE
    pub fn code(&self) -> &str {
        self.get(b'C').unwrap_or_default()
    }

    pub fn message(&self) -> &str {
        self.get(b'M').unwrap_or_default()
    }

    pub fn detail(&self) -> Option<&str> {
        self.get(b'D')
    }

    pub fn hint(&self) -> Option<&str> {
        self.get(b'H')
    }
}

impl BackendMessage {
    /// Decode a complete frame.
    pub fn decode(raw: &RawMessage) -> Result<Self, FramingError> {
        let mut r = BodyReader::new(raw.tag, &raw.body);
        let message = match raw.tag {
            b'R' => Self::decode_auth(&mut r)?,
            b'S' => BackendMessage::ParameterStatus {
                name: r.cstr()?,
                value: r.cstr()?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: r.i32()?,
                secret_key: r.i32()?,
            },
            b'Z' => BackendMessage::ReadyForQuery(match r.u8()? {
                b'I' => TransactionStatus::Idle,
                b'T' => TransactionStatus::InBlock,
                b'E' => TransactionStatus::Failed,
                other => {
                    return Err(r.error(format!("unknown transaction status {:?}", other as char)));
                }
            }),
            b'T' => Self::decode_row_description(&mut r)?,
            b'D' => Self::decode_data_row(&mut r)?,
            b'C' => BackendMessage::CommandComplete(r.cstr()?),
            b'E' => BackendMessage::ErrorResponse(Self::decode_error_fields(&mut r)?),
            b'N' => BackendMessage::NoticeResponse(Self::decode_error_fields(&mut r)?),
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b'I' => BackendMessage::EmptyQueryResponse,
            b't' => {
                let count = r.i16()?.max(0) as usize;
                let mut oids = Vec::with_capacity(count);
                for _ in 0..count {
                    oids.push(r.u32()?);
                }
                BackendMessage::ParameterDescription(oids)
            }
            b'A' => BackendMessage::NotificationResponse {
                process_id: r.i32()?,
                channel: r.cstr()?,
                payload: r.cstr()?,
            },
            b'v' => {
                let newest_minor = r.i32()?;
                let count = r.i32()?.max(0) as usize;
                let mut unrecognized = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    unrecognized.push(r.cstr()?);
                }
                BackendMessage::NegotiateProtocolVersion {
                    newest_minor,
                    unrecognized,
                }
            }
            b'G' => BackendMessage::CopyInResponse(Self::decode_copy_format(&mut r)?),
            b'H' => BackendMessage::CopyOutResponse(Self::decode_copy_format(&mut r)?),
            b'W' => BackendMessage::CopyBothResponse(Self::decode_copy_format(&mut r)?),
            b'd' => BackendMessage::CopyData(raw.body.to_vec()),
            b'c' => BackendMessage::CopyDone,
            other => {
                return Err(FramingError::malformed(other, "unknown message type"));
            }
        };
        Ok(message)
    }

    fn decode_auth(r: &mut BodyReader<'_>) -> Result<Self, FramingError> {
        match r.i32()? {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                let salt = r.take(4)?;
                Ok(BackendMessage::AuthenticationMD5Password([
                    salt[0], salt[1], salt[2], salt[3],
                ]))
            }
            10 => {
                // list of mechanisms, terminated by an empty string
                let mut mechanisms = Vec::new();
                loop {
                    let name = r.cstr()?;
                    if name.is_empty() {
                        break;
                    }
                    mechanisms.push(name);
                }
                Ok(BackendMessage::AuthenticationSASL(mechanisms))
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue(r.rest().to_vec())),
            12 => Ok(BackendMessage::AuthenticationSASLFinal(r.rest().to_vec())),
            other => Err(r.error(format!("unsupported authentication type {}", other))),
        }
    }

    fn decode_row_description(r: &mut BodyReader<'_>) -> Result<Self, FramingError> {
        let count = r.i16()?.max(0) as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            fields.push(FieldDescription {
                name: r.cstr()?,
                table_oid: r.u32()?,
                column_attr: r.i16()?,
                type_oid: r.u32()?,
                type_size: r.i16()?,
                type_modifier: r.i32()?,
                format: r.i16()?,
            });
        }
        Ok(BackendMessage::RowDescription(fields))
    }

    fn decode_data_row(r: &mut BodyReader<'_>) -> Result<Self, FramingError> {
        let count = r.i16()?.max(0) as usize;
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let len = r.i32()?;
            if len < 0 {
                columns.push(None);
            } else {
                columns.push(Some(r.take(len as usize)?.to_vec()));
            }
        }
        Ok(BackendMessage::DataRow(columns))
    }

    fn decode_error_fields(r: &mut BodyReader<'_>) -> Result<ErrorFields, FramingError> {
        let mut fields = ErrorFields::default();
        loop {
            let code = r.u8()?;
            if code == 0 {
                break;
            }
            fields.fields.insert(code, r.cstr()?);
        }
        Ok(fields)
    }

    fn decode_copy_format(r: &mut BodyReader<'_>) -> Result<CopyFormat, FramingError> {
        let format = r.u8()?;
        let count = r.i16()?.max(0) as usize;
        let mut column_formats = Vec::with_capacity(count);
        for _ in 0..count {
            column_formats.push(r.i16()?);
        }
        Ok(CopyFormat {
            format,
            column_formats,
        })
    }
}

/// Bounds-checked cursor over a frame body.
struct BodyReader<'a> {
    tag: u8,
    data: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn new(tag: u8, data: &'a [u8]) -> Self {
        Self { tag, data, pos: 0 }
    }

    fn error(&self, reason: String) -> FramingError {
        FramingError::malformed(self.tag, reason)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FramingError> {
        if self.data.len() - self.pos < n {
            return Err(self.error(format!(
                "need {} bytes at offset {}, body has {}",
                n,
                self.pos,
                self.data.len()
            )));
        }
        let data: &'a [u8] = self.data;
        let out = &data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let data: &'a [u8] = self.data;
        let out = &data[self.pos..];
        self.pos = data.len();
        out
    }

    fn u8(&mut self) -> Result<u8, FramingError> {
        Ok(self.take(1)?[0])
    }

    fn i16(&mut self) -> Result<i16, FramingError> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32, FramingError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u32(&mut self) -> Result<u32, FramingError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn cstr(&mut self) -> Result<String, FramingError> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.error("missing NUL terminator".to_string()))?;
        let s = std::str::from_utf8(&rest[..end])
            .map_err(|e| self.error(format!("invalid UTF-8 at offset {}: {e}", self.pos)))?
            .to_string();
        self.pos += end + 1;
        Ok(s)
    }
}
