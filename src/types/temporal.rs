//! Timestamp type conversions for PostgreSQL.
//!
//! Text grammar: `YYYY-MM-DD[ HH:MM:SS[.ffffff]][Z|±HH[:MM[:SS]]][ BC]`.
//! Binary timestamps are microseconds since 2000-01-01 00:00:00.

use std::fmt;

use chrono::{
    DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc,
};
use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while_m_n, take_while1},
    character::complete::{char, one_of},
    combinator::{all_consuming, map, map_res, opt, value},
    sequence::{preceded, tuple},
};
use serde::{Serialize, Serializer};

use super::{FromPg, TypeError, oid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgTimestamp {
    Infinity,
    NegInfinity,
    /// `timestamp` without a zone
    Unzoned(NaiveDateTime),
    /// `timestamptz`, normalized to UTC
    Zoned(DateTime<Utc>),
}

fn pg_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

impl PgTimestamp {
    /// Decode the 8-byte binary form. `zoned` selects `timestamptz` semantics.
    pub fn decode_binary(bytes: &[u8], zoned: bool) -> Result<Self, TypeError> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| {
            TypeError::InvalidData(format!("expected 8 bytes for timestamp, got {}", bytes.len()))
        })?;
        let usec = i64::from_be_bytes(raw);
        match usec {
            i64::MAX => return Ok(PgTimestamp::Infinity),
            i64::MIN => return Ok(PgTimestamp::NegInfinity),
            _ => {}
        }
        let naive = pg_epoch()
            .checked_add_signed(TimeDelta::microseconds(usec))
            .ok_or_else(|| TypeError::InvalidTimestamp(format!("{} usec out of range", usec)))?;
        Ok(if zoned {
            PgTimestamp::Zoned(naive.and_utc())
        } else {
            PgTimestamp::Unzoned(naive)
        })
    }

    /// Microseconds since 2000-01-01, with the infinities at the i64 bounds.
    pub fn to_pg_micros(&self) -> i64 {
        let naive = match self {
            PgTimestamp::Infinity => return i64::MAX,
            PgTimestamp::NegInfinity => return i64::MIN,
            PgTimestamp::Unzoned(n) => *n,
            PgTimestamp::Zoned(z) => z.naive_utc(),
        };
        (naive - pg_epoch()).num_microseconds().unwrap_or(i64::MAX)
    }
}

impl fmt::Display for PgTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgTimestamp::Infinity => f.write_str("infinity"),
            PgTimestamp::NegInfinity => f.write_str("-infinity"),
            PgTimestamp::Unzoned(n) => write!(f, "{}", n.format("%Y-%m-%d %H:%M:%S%.f")),
            PgTimestamp::Zoned(z) => write!(f, "{}", z.format("%Y-%m-%d %H:%M:%S%.f+00")),
        }
    }
}

impl Serialize for PgTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromPg for PgTimestamp {
    fn from_pg(bytes: &[u8], oid_val: u32, format: i16) -> Result<Self, TypeError> {
        if oid_val != oid::TIMESTAMP && oid_val != oid::TIMESTAMPTZ {
            return Err(TypeError::UnexpectedOid {
                expected: "timestamp",
                got: oid_val,
            });
        }
        if format == 1 {
            Self::decode_binary(bytes, oid_val == oid::TIMESTAMPTZ)
        } else {
            let text = super::text(bytes)?;
            parse_timestamp(text).ok_or_else(|| TypeError::InvalidTimestamp(text.to_string()))
        }
    }
}

/// Parse a text timestamp. Returns `None` for anything that is not a valid
/// timestamp, including trailing garbage and out-of-range fields.
///
/// ```
/// use pgwire_core::types::temporal::{parse_timestamp, PgTimestamp};
///
/// let ts = parse_timestamp("2023-01-01 00:00:00Z").unwrap();
/// assert_eq!(ts.to_string(), "2023-01-01 00:00:00+00");
/// assert_eq!(parse_timestamp("infinity"), Some(PgTimestamp::Infinity));
/// assert_eq!(parse_timestamp("yesterday"), None);
/// ```
pub fn parse_timestamp(input: &str) -> Option<PgTimestamp> {
    match input {
        "infinity" => return Some(PgTimestamp::Infinity),
        "-infinity" => return Some(PgTimestamp::NegInfinity),
        _ => {}
    }

    let (_, parts) = all_consuming(timestamp)(input).ok()?;
    let year = if parts.bc { 1 - parts.year } else { parts.year };
    let date = NaiveDate::from_ymd_opt(year, parts.month, parts.day)?;
    let (h, m, s, micros) = parts.time.unwrap_or((0, 0, 0, 0));
    let naive = date.and_time(NaiveTime::from_hms_micro_opt(h, m, s, micros)?);

    match parts.offset {
        None => Some(PgTimestamp::Unzoned(naive)),
        Some(seconds) => {
            let zone = FixedOffset::east_opt(seconds)?;
            let local = zone.from_local_datetime(&naive).single()?;
            Some(PgTimestamp::Zoned(local.with_timezone(&Utc)))
        }
    }
}

struct Parts {
    year: i32,
    month: u32,
    day: u32,
    time: Option<(u32, u32, u32, u32)>,
    offset: Option<i32>,
    bc: bool,
}

fn number<'a>(len: usize) -> impl FnMut(&'a str) -> IResult<&'a str, u32> {
    move |input: &'a str| {
        map_res(take_while_m_n(len, len, |c: char| c.is_ascii_digit()), str::parse)(input)
    }
}

/// Fraction digits beyond microseconds are dropped.
fn fraction(input: &str) -> IResult<&str, u32> {
    map(take_while1(|c: char| c.is_ascii_digit()), |digits: &str| {
        digits
            .bytes()
            .chain(std::iter::repeat(b'0'))
            .take(6)
            .fold(0u32, |acc, b| acc * 10 + (b - b'0') as u32)
    })(input)
}

fn date(input: &str) -> IResult<&str, (i32, u32, u32)> {
    let year = map_res(take_while_m_n(4, 6, |c: char| c.is_ascii_digit()), str::parse::<i32>);
    map(
        tuple((year, char('-'), number(2), char('-'), number(2))),
        |(y, _, m, _, d)| (y, m, d),
    )(input)
}

fn time(input: &str) -> IResult<&str, (u32, u32, u32, u32)> {
    map(
        preceded(
            one_of(" T"),
            tuple((
                number(2),
                char(':'),
                number(2),
                char(':'),
                number(2),
                opt(preceded(char('.'), fraction)),
            )),
        ),
        |(h, _, m, _, s, f)| (h, m, s, f.unwrap_or(0)),
    )(input)
}

/// `Z` or `±HH[:MM[:SS]]`, as seconds east of UTC.
fn offset(input: &str) -> IResult<&str, i32> {
    let numeric = map(
        tuple((
            one_of("+-"),
            number(2),
            opt(preceded(char(':'), number(2))),
            opt(preceded(char(':'), number(2))),
        )),
        |(sign, h, m, s)| {
            let seconds = (h * 3600 + m.unwrap_or(0) * 60 + s.unwrap_or(0)) as i32;
            if sign == '-' { -seconds } else { seconds }
        },
    );
    alt((value(0, char('Z')), numeric))(input)
}

fn timestamp(input: &str) -> IResult<&str, Parts> {
    map(
        tuple((date, opt(time), opt(offset), opt(tag(" BC")))),
        |((year, month, day), time, offset, bc)| Parts {
            year,
            month,
            day,
            time,
            offset,
            bc: bc.is_some(),
        },
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> PgTimestamp {
        PgTimestamp::Zoned(Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap())
    }

    #[test]
    fn test_zoned_utc() {
        assert_eq!(
            parse_timestamp("2023-01-01 00:00:00Z"),
            Some(utc(2023, 1, 1, 0, 0, 0))
        );
        assert_eq!(
            parse_timestamp("2023-01-01 00:00:00+00"),
            Some(utc(2023, 1, 1, 0, 0, 0))
        );
    }

    #[test]
    fn test_offsets_normalize_to_utc() {
        assert_eq!(
            parse_timestamp("2023-06-01 12:00:00+02"),
            Some(utc(2023, 6, 1, 10, 0, 0))
        );
        assert_eq!(
            parse_timestamp("2023-06-01 12:00:00-05:30"),
            Some(utc(2023, 6, 1, 17, 30, 0))
        );
        assert_eq!(
            parse_timestamp("1900-01-01 00:00:00+00:19:32"),
            Some(utc(1899, 12, 31, 23, 40, 28))
        );
    }

    #[test]
    fn test_unzoned() {
        let expected = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_micro_opt(23, 59, 58, 123_456)
            .unwrap();
        assert_eq!(
            parse_timestamp("2024-02-29 23:59:58.1234567"),
            Some(PgTimestamp::Unzoned(expected))
        );
        let short = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_micro_opt(0, 0, 1, 500_000)
            .unwrap();
        assert_eq!(
            parse_timestamp("2024-02-29 00:00:01.5"),
            Some(PgTimestamp::Unzoned(short))
        );
    }

    #[test]
    fn test_date_only() {
        let expected = NaiveDate::from_ymd_opt(1999, 12, 31)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(parse_timestamp("1999-12-31"), Some(PgTimestamp::Unzoned(expected)));
    }

    #[test]
    fn test_bc_years() {
        let Some(PgTimestamp::Unzoned(ts)) = parse_timestamp("0044-03-15 12:00:00 BC") else {
            panic!("expected unzoned timestamp");
        };
        assert_eq!(ts.date(), NaiveDate::from_ymd_opt(-43, 3, 15).unwrap());
    }

    #[test]
    fn test_infinity() {
        assert_eq!(parse_timestamp("infinity"), Some(PgTimestamp::Infinity));
        assert_eq!(parse_timestamp("-infinity"), Some(PgTimestamp::NegInfinity));
    }

    #[test]
    fn test_malformed_is_none() {
        for bad in [
            "",
            "garbage",
            "2023-13-01",
            "2023-02-30 00:00:00",
            "2023-01-01 25:00:00",
            "2023-01-01 00:00:00Zx",
            "2023-01-01 00:00",
            "23-01-01",
        ] {
            assert_eq!(parse_timestamp(bad), None, "{bad:?}");
        }
    }

    #[test]
    fn test_binary() {
        let zero = PgTimestamp::decode_binary(&0i64.to_be_bytes(), false).unwrap();
        assert_eq!(zero, PgTimestamp::Unzoned(pg_epoch()));
        assert_eq!(zero.to_pg_micros(), 0);

        let day = PgTimestamp::decode_binary(&86_400_000_000i64.to_be_bytes(), true).unwrap();
        assert_eq!(day, utc(2000, 1, 2, 0, 0, 0));
        assert_eq!(day.to_pg_micros(), 86_400_000_000);

        assert_eq!(
            PgTimestamp::decode_binary(&i64::MAX.to_be_bytes(), true).unwrap(),
            PgTimestamp::Infinity
        );
        assert_eq!(
            PgTimestamp::decode_binary(&i64::MIN.to_be_bytes(), false).unwrap(),
            PgTimestamp::NegInfinity
        );
        assert!(PgTimestamp::decode_binary(&[0; 4], false).is_err());
    }

    #[test]
    fn test_from_pg_text_error() {
        let err = PgTimestamp::from_pg(b"nope", oid::TIMESTAMP, 0).unwrap_err();
        assert_eq!(err, TypeError::InvalidTimestamp("nope".to_string()));
    }
}
