//! Type conversion for PostgreSQL values.
//!
//! Every codec here is pure and synchronous. Row values arrive either in text
//! (format 0) or binary (format 1) and are dispatched by type OID.

pub mod array;
pub mod bytea;
pub mod geometry;
pub mod interval;
pub mod numeric;
pub mod oid;
pub mod range;
pub mod temporal;

pub use array::{ArrayEntry, decode_binary_array, parse_array, parse_text_array};
pub use bytea::{bool_from_binary, bool_from_text, decode_bytea_text, encode_bytea_hex};
pub use geometry::{PgCircle, PgPoint, parse_circle, parse_point};
pub use interval::{PgInterval, parse_interval};
pub use numeric::{NumericSign, NumericValue};
pub use range::{PgRange, decode_binary_range, parse_range, parse_text_range};
pub use temporal::{PgTimestamp, parse_timestamp};

use serde::Serialize;
use thiserror::Error;

pub const FORMAT_TEXT: i16 = 0;
pub const FORMAT_BINARY: i16 = 1;

/// Error type for type conversion failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("Expected {expected} type, got OID {got}")]
    UnexpectedOid { expected: &'static str, got: u32 },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Unexpected NULL value")]
    UnexpectedNull,

    #[error("Invalid numeric length: {bytes} bytes of data representing {digits} digits")]
    NumericLength { bytes: usize, digits: usize },

    #[error("Invalid numeric sign: 0x{0:x}")]
    NumericSign(u16),

    #[error("Invalid numeric dscale: 0x{0:x}")]
    NumericDscale(u16),

    #[error("Invalid numeric digit: {0}")]
    NumericDigit(u16),

    #[error("Invalid numeric text: {0:?}")]
    InvalidNumericText(String),

    #[error("Unbalanced braces in array literal: {0:?}")]
    UnbalancedArray(String),

    #[error("Invalid array literal at position {position}: {reason}")]
    InvalidArray { position: usize, reason: String },

    #[error("Invalid bytea: {0}")]
    InvalidBytea(String),

    #[error("Invalid timestamp: {0:?}")]
    InvalidTimestamp(String),

    #[error("Invalid interval: {0:?}")]
    InvalidInterval(String),

    #[error("Invalid range literal at position {position}: {reason}")]
    InvalidRange { position: usize, reason: String },

    #[error("Invalid geometric value: {0:?}")]
    InvalidGeometry(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
}

/// Trait for converting PostgreSQL binary/text data to Rust types.
pub trait FromPg: Sized {
    /// Convert from PostgreSQL wire format.
    /// # Arguments
    /// * `bytes` - Raw bytes from PostgreSQL (may be text or binary format)
    /// * `oid` - PostgreSQL type OID
    /// * `format` - 0 = text, 1 = binary
    fn from_pg(bytes: &[u8], oid: u32, format: i16) -> Result<Self, TypeError>;

    /// Like `from_pg` for a column that may be NULL.
    fn from_pg_nullable(bytes: Option<&[u8]>, oid: u32, format: i16) -> Result<Self, TypeError> {
        match bytes {
            Some(bytes) => Self::from_pg(bytes, oid, format),
            None => Err(TypeError::UnexpectedNull),
        }
    }
}

pub(crate) fn text(bytes: &[u8]) -> Result<&str, TypeError> {
    std::str::from_utf8(bytes).map_err(|e| TypeError::InvalidData(format!("Invalid UTF-8: {}", e)))
}

fn fixed<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N], TypeError> {
    bytes.try_into().map_err(|_| {
        TypeError::InvalidData(format!("Expected {} bytes for {}, got {}", N, what, bytes.len()))
    })
}

fn parse_text<T: std::str::FromStr>(bytes: &[u8], what: &str) -> Result<T, TypeError> {
    let s = text(bytes)?;
    s.parse()
        .map_err(|_| TypeError::InvalidData(format!("Invalid {}: {:?}", what, s)))
}

macro_rules! impl_from_pg_number {
    ($ty:ty, $what:literal) => {
        impl FromPg for $ty {
            fn from_pg(bytes: &[u8], _oid: u32, format: i16) -> Result<Self, TypeError> {
                if format == FORMAT_BINARY {
                    Ok(<$ty>::from_be_bytes(fixed(bytes, $what)?))
                } else {
                    parse_text(bytes, $what)
                }
            }
        }
    };
}

impl_from_pg_number!(i16, "i16");
impl_from_pg_number!(i32, "i32");
impl_from_pg_number!(i64, "i64");
impl_from_pg_number!(f32, "f32");
impl_from_pg_number!(f64, "f64");

impl FromPg for bool {
    fn from_pg(bytes: &[u8], _oid: u32, format: i16) -> Result<Self, TypeError> {
        if format == FORMAT_BINARY {
            bool_from_binary(bytes)
        } else {
            Ok(bool_from_text(text(bytes)?))
        }
    }
}

impl FromPg for String {
    fn from_pg(bytes: &[u8], _oid: u32, _format: i16) -> Result<Self, TypeError> {
        text(bytes).map(str::to_string)
    }
}

impl FromPg for Vec<u8> {
    fn from_pg(bytes: &[u8], _oid: u32, format: i16) -> Result<Self, TypeError> {
        if format == FORMAT_BINARY {
            Ok(bytes.to_vec())
        } else {
            decode_bytea_text(bytes)
        }
    }
}

impl<T: FromPg> FromPg for Option<T> {
    fn from_pg(bytes: &[u8], oid: u32, format: i16) -> Result<Self, TypeError> {
        T::from_pg(bytes, oid, format).map(Some)
    }

    fn from_pg_nullable(bytes: Option<&[u8]>, oid: u32, format: i16) -> Result<Self, TypeError> {
        bytes.map(|b| T::from_pg(b, oid, format)).transpose()
    }
}

/// A decoded column value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Numeric(NumericValue),
    Timestamp(PgTimestamp),
    Interval(PgInterval),
    Point(PgPoint),
    Circle(PgCircle),
    Json(serde_json::Value),
    Array(Vec<ArrayEntry<PgValue>>),
    Range(Box<PgRange<PgValue>>),
    /// OID without a codec here; raw bytes kept.
    Unknown { oid: u32, bytes: Vec<u8> },
}

/// Decode one column value by OID and format code.
///
/// ```
/// use pgwire_core::types::{decode_value, oid, PgValue};
///
/// let v = decode_value(oid::INT4, 1, Some(&[0u8, 0, 1, 0][..])).unwrap();
/// assert_eq!(v, PgValue::Int4(256));
/// assert_eq!(decode_value(oid::TEXT, 0, None).unwrap(), PgValue::Null);
/// ```
pub fn decode_value(type_oid: u32, format: i16, bytes: Option<&[u8]>) -> Result<PgValue, TypeError> {
    let Some(bytes) = bytes else {
        return Ok(PgValue::Null);
    };
    let value = match type_oid {
        oid::BOOL => PgValue::Bool(bool::from_pg(bytes, type_oid, format)?),
        oid::INT2 => PgValue::Int2(i16::from_pg(bytes, type_oid, format)?),
        oid::INT4 => PgValue::Int4(i32::from_pg(bytes, type_oid, format)?),
        oid::INT8 => PgValue::Int8(i64::from_pg(bytes, type_oid, format)?),
        oid::FLOAT4 => PgValue::Float4(f32::from_pg(bytes, type_oid, format)?),
        oid::FLOAT8 => PgValue::Float8(f64::from_pg(bytes, type_oid, format)?),
        oid::TEXT | oid::VARCHAR | oid::BPCHAR | oid::NAME | oid::CHAR => {
            PgValue::Text(String::from_pg(bytes, type_oid, format)?)
        }
        oid::BYTEA => PgValue::Bytea(Vec::<u8>::from_pg(bytes, type_oid, format)?),
        oid::NUMERIC => PgValue::Numeric(NumericValue::from_pg(bytes, type_oid, format)?),
        oid::TIMESTAMP | oid::TIMESTAMPTZ => {
            PgValue::Timestamp(PgTimestamp::from_pg(bytes, type_oid, format)?)
        }
        oid::INTERVAL => PgValue::Interval(PgInterval::from_pg(bytes, type_oid, format)?),
        oid::POINT => PgValue::Point(PgPoint::from_pg(bytes, type_oid, format)?),
        oid::CIRCLE => PgValue::Circle(PgCircle::from_pg(bytes, type_oid, format)?),
        oid::JSON | oid::JSONB => PgValue::Json(decode_json(bytes, type_oid, format)?),
        other => {
            if let Some(element) = oid::range_element(other) {
                let range = if format == FORMAT_BINARY {
                    decode_binary_range(bytes, element)?
                } else {
                    parse_range(text(bytes)?, |bound| {
                        decode_value(element, FORMAT_TEXT, Some(bound.as_bytes()))
                    })?
                };
                PgValue::Range(Box::new(range))
            } else if let Some(element) = oid::array_element(other) {
                if format == FORMAT_BINARY {
                    PgValue::Array(decode_binary_array(bytes)?)
                } else {
                    PgValue::Array(parse_array(text(bytes)?, |leaf| {
                        decode_value(element, FORMAT_TEXT, Some(leaf.as_bytes()))
                    })?)
                }
            } else {
                PgValue::Unknown {
                    oid: type_oid,
                    bytes: bytes.to_vec(),
                }
            }
        }
    };
    Ok(value)
}

/// `json` is plain text in both formats; binary `jsonb` leads with a version byte.
fn decode_json(bytes: &[u8], type_oid: u32, format: i16) -> Result<serde_json::Value, TypeError> {
    let body = match (type_oid, format) {
        (oid::JSONB, FORMAT_BINARY) => match bytes.split_first() {
            Some((1, body)) => body,
            Some((version, _)) => {
                return Err(TypeError::InvalidJson(format!("unsupported jsonb version {version}")));
            }
            None => return Err(TypeError::InvalidJson("empty jsonb value".to_string())),
        },
        _ => bytes,
    };
    serde_json::from_slice(body).map_err(|e| TypeError::InvalidJson(e.to_string()))
}
