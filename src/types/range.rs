//! Range type conversions for PostgreSQL.
//!
//! Text form: `empty` or `[lower,upper)` with either bracket style. A missing
//! bound is unbounded. Bounds may be double-quoted; inside quotes `""` is a
//! literal quote, and a backslash escapes the next character anywhere.

use std::fmt;
use std::ops::Bound;

use serde::Serialize;

use super::{PgValue, TypeError, decode_value};

// Flag bits of the binary range form.
const RANGE_EMPTY: u8 = 0x01;
const RANGE_LB_INC: u8 = 0x02;
const RANGE_UB_INC: u8 = 0x04;
const RANGE_LB_INF: u8 = 0x08;
const RANGE_UB_INF: u8 = 0x10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PgRange<T> {
    Empty,
    Bounds { lower: Bound<T>, upper: Bound<T> },
}

impl<T> PgRange<T> {
    pub fn new(lower: Bound<T>, upper: Bound<T>) -> Self {
        PgRange::Bounds { lower, upper }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, PgRange::Empty)
    }

    pub fn lower(&self) -> Bound<&T> {
        match self {
            PgRange::Empty => Bound::Unbounded,
            PgRange::Bounds { lower, .. } => lower.as_ref(),
        }
    }

    pub fn upper(&self) -> Bound<&T> {
        match self {
            PgRange::Empty => Bound::Unbounded,
            PgRange::Bounds { upper, .. } => upper.as_ref(),
        }
    }

    pub fn has_lower_bound(&self) -> bool {
        !self.is_empty() && !matches!(self.lower(), Bound::Unbounded)
    }

    pub fn has_upper_bound(&self) -> bool {
        !self.is_empty() && !matches!(self.upper(), Bound::Unbounded)
    }

    /// Both ends are finite.
    pub fn is_bounded(&self) -> bool {
        self.has_lower_bound() && self.has_upper_bound()
    }

    pub fn is_lower_closed(&self) -> bool {
        matches!(self.lower(), Bound::Included(_))
    }

    pub fn is_upper_closed(&self) -> bool {
        matches!(self.upper(), Bound::Included(_))
    }

    pub fn map<U, F: FnMut(T) -> U>(self, mut f: F) -> PgRange<U> {
        match self {
            PgRange::Empty => PgRange::Empty,
            PgRange::Bounds { lower, upper } => PgRange::Bounds {
                lower: lower.map(&mut f),
                upper: upper.map(&mut f),
            },
        }
    }
}

impl<T: PartialOrd> PgRange<T> {
    pub fn contains(&self, point: &T) -> bool {
        let above = match self.lower() {
            Bound::Included(lo) => lo <= point,
            Bound::Excluded(lo) => lo < point,
            Bound::Unbounded => true,
        };
        let below = match self.upper() {
            Bound::Included(hi) => point <= hi,
            Bound::Excluded(hi) => point < hi,
            Bound::Unbounded => true,
        };
        !self.is_empty() && above && below
    }

    /// The empty range is contained in every range.
    pub fn contains_range(&self, other: &PgRange<T>) -> bool {
        if other.is_empty() {
            return true;
        }
        if self.is_empty() {
            return false;
        }
        let lower_ok = match (self.lower(), other.lower()) {
            (Bound::Unbounded, _) => true,
            (_, Bound::Unbounded) => false,
            (Bound::Excluded(a), Bound::Included(b)) => a < b,
            (Bound::Included(a) | Bound::Excluded(a), Bound::Included(b) | Bound::Excluded(b)) => {
                a <= b
            }
        };
        let upper_ok = match (self.upper(), other.upper()) {
            (Bound::Unbounded, _) => true,
            (_, Bound::Unbounded) => false,
            (Bound::Excluded(a), Bound::Included(b)) => b < a,
            (Bound::Included(a) | Bound::Excluded(a), Bound::Included(b) | Bound::Excluded(b)) => {
                b <= a
            }
        };
        lower_ok && upper_ok
    }
}

impl<T: fmt::Display> fmt::Display for PgRange<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (lower, upper) = match self {
            PgRange::Empty => return f.write_str("empty"),
            PgRange::Bounds { lower, upper } => (lower, upper),
        };
        f.write_str(if matches!(lower, Bound::Included(_)) { "[" } else { "(" })?;
        if let Bound::Included(v) | Bound::Excluded(v) = lower {
            write_bound(f, &v.to_string())?;
        }
        f.write_str(",")?;
        if let Bound::Included(v) | Bound::Excluded(v) = upper {
            write_bound(f, &v.to_string())?;
        }
        f.write_str(if matches!(upper, Bound::Included(_)) { "]" } else { ")" })
    }
}

fn write_bound(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    let quote = value.is_empty()
        || value
            .chars()
            .any(|c| matches!(c, '"' | '\\' | '(' | ')' | '[' | ']' | ',') || c.is_whitespace());
    if !quote {
        return f.write_str(value);
    }
    f.write_str("\"")?;
    for c in value.chars() {
        if c == '"' || c == '\\' {
            write!(f, "{c}")?;
        }
        write!(f, "{c}")?;
    }
    f.write_str("\"")
}

/// Parse range text into string bounds.
///
/// ```
/// use std::ops::Bound;
/// use pgwire_core::types::range::{parse_text_range, PgRange};
///
/// let r = parse_text_range("[1,10)").unwrap();
/// assert_eq!(r, PgRange::new(Bound::Included("1".to_string()), Bound::Excluded("10".to_string())));
/// assert!(parse_text_range("empty").unwrap().is_empty());
/// ```
pub fn parse_text_range(input: &str) -> Result<PgRange<String>, TypeError> {
    parse_range(input, |s| Ok(s.to_string()))
}

/// Parse range text, converting each present bound through `transform`.
pub fn parse_range<T, F>(input: &str, mut transform: F) -> Result<PgRange<T>, TypeError>
where
    F: FnMut(&str) -> Result<T, TypeError>,
{
    let text = input.trim();
    if text.eq_ignore_ascii_case("empty") {
        return Ok(PgRange::Empty);
    }

    let mut cursor = RangeCursor {
        input: text,
        pos: 0,
    };
    let lower_inclusive = match cursor.bump() {
        Some('[') => true,
        Some('(') => false,
        _ => return Err(cursor.invalid(0, "expected '[' or '('")),
    };
    let lower = cursor.bound()?;
    if cursor.bump() != Some(',') {
        return Err(cursor.invalid(cursor.pos.saturating_sub(1), "expected ','"));
    }
    let upper = cursor.bound()?;
    let upper_inclusive = match cursor.bump() {
        Some(']') => true,
        Some(')') => false,
        _ => return Err(cursor.invalid(cursor.pos.saturating_sub(1), "expected ']' or ')'")),
    };
    if cursor.pos != text.len() {
        return Err(cursor.invalid(cursor.pos, "trailing characters after range"));
    }

    let mut convert = |raw: Option<String>, inclusive: bool| -> Result<Bound<T>, TypeError> {
        Ok(match raw {
            None => Bound::Unbounded,
            Some(raw) if inclusive => Bound::Included(transform(&raw)?),
            Some(raw) => Bound::Excluded(transform(&raw)?),
        })
    };
    let lower = convert(lower, lower_inclusive)?;
    let upper = convert(upper, upper_inclusive)?;
    Ok(PgRange::new(lower, upper))
}

struct RangeCursor<'a> {
    input: &'a str,
    pos: usize,
}

impl RangeCursor<'_> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn invalid(&self, position: usize, reason: &str) -> TypeError {
        TypeError::InvalidRange {
            position,
            reason: reason.to_string(),
        }
    }

    /// One bound up to the next unquoted `,`, `)` or `]`. `None` when empty.
    fn bound(&mut self) -> Result<Option<String>, TypeError> {
        if matches!(self.peek(), Some(',' | ')' | ']')) {
            return Ok(None);
        }
        let mut value = String::new();
        let mut quoted = false;
        loop {
            let Some(c) = self.peek() else {
                return Err(self.invalid(self.pos, "unexpected end of input"));
            };
            if !quoted && matches!(c, ',' | ')' | ']') {
                return Ok(Some(value));
            }
            self.pos += c.len_utf8();
            match c {
                '\\' => match self.bump() {
                    Some(escaped) => value.push(escaped),
                    None => return Err(self.invalid(self.pos, "unexpected end of input")),
                },
                '"' if quoted && self.peek() == Some('"') => {
                    self.pos += 1;
                    value.push('"');
                }
                '"' => quoted = !quoted,
                other => value.push(other),
            }
        }
    }
}

/// Decode the binary range form: a flag byte, then each present bound as
/// i32 length plus element bytes.
pub fn decode_binary_range(bytes: &[u8], element_oid: u32) -> Result<PgRange<PgValue>, TypeError> {
    let truncated = || TypeError::InvalidData("range truncated".to_string());
    let (&flags, mut rest) = bytes.split_first().ok_or_else(truncated)?;
    if flags & RANGE_EMPTY != 0 {
        return if rest.is_empty() {
            Ok(PgRange::Empty)
        } else {
            Err(TypeError::InvalidData("empty range carries bound data".to_string()))
        };
    }

    let mut bound = |infinite: u8, inclusive: u8| -> Result<Bound<PgValue>, TypeError> {
        if flags & infinite != 0 {
            return Ok(Bound::Unbounded);
        }
        if rest.len() < 4 {
            return Err(truncated());
        }
        let len = i32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let len = usize::try_from(len)
            .map_err(|_| TypeError::InvalidData(format!("negative range bound length {len}")))?;
        let raw = rest.get(4..4 + len).ok_or_else(truncated)?;
        rest = &rest[4 + len..];
        let value = decode_value(element_oid, 1, Some(raw))?;
        Ok(if flags & inclusive != 0 {
            Bound::Included(value)
        } else {
            Bound::Excluded(value)
        })
    };
    let lower = bound(RANGE_LB_INF, RANGE_LB_INC)?;
    let upper = bound(RANGE_UB_INF, RANGE_UB_INC)?;
    if !rest.is_empty() {
        return Err(TypeError::InvalidData(format!(
            "{} trailing bytes after range bounds",
            rest.len()
        )));
    }
    Ok(PgRange::new(lower, upper))
}
