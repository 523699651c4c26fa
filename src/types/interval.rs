//! Interval type conversions for PostgreSQL.
//!
//! Text grammar (the `postgres` IntervalStyle): space-separated
//! `N year[s] | N mon[s] | N day[s]` items, optionally followed by
//! `[-]H:MM:SS[.ffffff]`. The long unit names PostgreSQL accepts on input
//! (`hours`, `minutes`, `seconds` with a fraction) parse too, so
//! `to_postgres` output reads back.
//!
//! Binary intervals are i64 microseconds, i32 days, i32 months.

use std::fmt;

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, one_of, space1},
    combinator::{all_consuming, map, map_res, opt, recognize},
    multi::separated_list1,
    sequence::{pair, preceded, tuple},
};
use serde::{Serialize, Serializer};

use super::{FromPg, TypeError, oid};

const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_MINUTE: i64 = 60 * MICROS_PER_SECOND;
const MICROS_PER_HOUR: i64 = 60 * MICROS_PER_MINUTE;

/// Every field carries its own sign; the time fields share one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PgInterval {
    pub years: i32,
    pub months: i32,
    pub days: i32,
    pub hours: i64,
    pub minutes: i32,
    pub seconds: i32,
    pub microseconds: i32,
}

impl PgInterval {
    /// Decode the 16-byte binary form.
    pub fn decode_binary(bytes: &[u8]) -> Result<Self, TypeError> {
        let raw: [u8; 16] = bytes.try_into().map_err(|_| {
            TypeError::InvalidData(format!("expected 16 bytes for interval, got {}", bytes.len()))
        })?;
        let micros = i64::from_be_bytes([raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7]]);
        let days = i32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);
        let months = i32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]);

        // truncating division keeps every part on the sign of the total
        Ok(Self {
            years: months / 12,
            months: months % 12,
            days,
            hours: micros / MICROS_PER_HOUR,
            minutes: ((micros % MICROS_PER_HOUR) / MICROS_PER_MINUTE) as i32,
            seconds: ((micros % MICROS_PER_MINUTE) / MICROS_PER_SECOND) as i32,
            microseconds: (micros % MICROS_PER_SECOND) as i32,
        })
    }

    pub fn to_binary(&self) -> Result<[u8; 16], TypeError> {
        let overflow = || TypeError::InvalidInterval(format!("{self} does not fit the wire form"));
        let micros = self
            .hours
            .checked_mul(MICROS_PER_HOUR)
            .and_then(|m| m.checked_add(self.minutes as i64 * MICROS_PER_MINUTE))
            .and_then(|m| m.checked_add(self.seconds as i64 * MICROS_PER_SECOND))
            .and_then(|m| m.checked_add(self.microseconds as i64))
            .ok_or_else(overflow)?;
        let months = self
            .years
            .checked_mul(12)
            .and_then(|m| m.checked_add(self.months))
            .ok_or_else(overflow)?;

        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&micros.to_be_bytes());
        out[8..12].copy_from_slice(&self.days.to_be_bytes());
        out[12..].copy_from_slice(&months.to_be_bytes());
        Ok(out)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Input text PostgreSQL accepts, e.g. `1 year -32 days 3 seconds`.
    /// A zero interval is `0`.
    pub fn to_postgres(&self) -> String {
        let mut parts: Vec<String> = [
            (self.years as i64, "year"),
            (self.months as i64, "month"),
            (self.days as i64, "day"),
            (self.hours, "hour"),
            (self.minutes as i64, "minute"),
        ]
        .into_iter()
        .filter(|(value, _)| *value != 0)
        .map(|(value, name)| plural(value, name))
        .collect();
        if self.microseconds != 0 {
            parts.push(format!("{} seconds", self.seconds_text()));
        } else if self.seconds != 0 {
            parts.push(plural(self.seconds as i64, "second"));
        }

        if parts.is_empty() {
            "0".to_string()
        } else {
            parts.join(" ")
        }
    }

    /// ISO 8601 duration with every field, e.g. `P1Y0M0DT0H0M1.5S`.
    pub fn to_iso_string(&self) -> String {
        self.iso(false)
    }

    /// ISO 8601 duration without zero fields; `PT0S` when all are zero.
    pub fn to_iso_string_short(&self) -> String {
        self.iso(true)
    }

    fn iso(&self, short: bool) -> String {
        let mut date = String::new();
        for (value, designator) in [
            (self.years as i64, 'Y'),
            (self.months as i64, 'M'),
            (self.days as i64, 'D'),
        ] {
            if !short || value != 0 {
                date.push_str(&format!("{value}{designator}"));
            }
        }

        let mut time = String::new();
        for (value, designator) in [(self.hours, 'H'), (self.minutes as i64, 'M')] {
            if !short || value != 0 {
                time.push_str(&format!("{value}{designator}"));
            }
        }
        if !short || self.seconds != 0 || self.microseconds != 0 {
            time.push_str(&format!("{}S", self.seconds_text()));
        }

        match (date.is_empty(), time.is_empty()) {
            (true, true) => "PT0S".to_string(),
            (false, true) => format!("P{date}"),
            _ => format!("P{date}T{time}"),
        }
    }

    /// Seconds with the fraction trimmed, e.g. `1.1` or `-0.123456`.
    fn seconds_text(&self) -> String {
        let total = self.seconds as i64 * MICROS_PER_SECOND + self.microseconds as i64;
        let sign = if total < 0 { "-" } else { "" };
        let whole = total.unsigned_abs() / MICROS_PER_SECOND as u64;
        let fraction = total.unsigned_abs() % MICROS_PER_SECOND as u64;
        if fraction == 0 {
            return format!("{sign}{whole}");
        }
        let digits = format!("{fraction:06}");
        format!("{sign}{whole}.{}", digits.trim_end_matches('0'))
    }
}

fn plural(value: i64, name: &str) -> String {
    if value == 1 {
        format!("{value} {name}")
    } else {
        format!("{value} {name}s")
    }
}

impl fmt::Display for PgInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_postgres())
    }
}

impl Serialize for PgInterval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromPg for PgInterval {
    fn from_pg(bytes: &[u8], oid_val: u32, format: i16) -> Result<Self, TypeError> {
        if oid_val != oid::INTERVAL {
            return Err(TypeError::UnexpectedOid {
                expected: "interval",
                got: oid_val,
            });
        }
        if format == super::FORMAT_BINARY {
            Self::decode_binary(bytes)
        } else {
            parse_interval(super::text(bytes)?)
        }
    }
}

/// Parse interval text.
///
/// ```
/// use pgwire_core::types::interval::parse_interval;
///
/// let iv = parse_interval("1 year 2 mons -3 days 04:05:06.5").unwrap();
/// assert_eq!((iv.years, iv.months, iv.days), (1, 2, -3));
/// assert_eq!(iv.to_postgres(), "1 year 2 months -3 days 4 hours 5 minutes 6.5 seconds");
/// assert!(parse_interval("soon").is_err());
/// ```
pub fn parse_interval(input: &str) -> Result<PgInterval, TypeError> {
    let invalid = || TypeError::InvalidInterval(input.to_string());
    let text = input.trim();
    if text == "0" {
        return Ok(PgInterval::default());
    }

    let (_, items) = all_consuming(separated_list1(space1, item))(text).map_err(|_| invalid())?;
    let mut out = PgInterval::default();
    for item in items {
        apply(&mut out, item).ok_or_else(invalid)?;
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

#[derive(Debug, Clone, Copy)]
enum Item {
    /// Quantity in whole units; seconds carry a microsecond part.
    Field(Unit, i64, i64),
    /// `[-]H:MM:SS[.ffffff]` as signed microseconds split into parts.
    Clock {
        negative: bool,
        hours: i64,
        minutes: i64,
        seconds: i64,
        micros: i64,
    },
}

fn apply(out: &mut PgInterval, item: Item) -> Option<()> {
    fn add32(field: &mut i32, value: i64) -> Option<()> {
        *field = field.checked_add(i32::try_from(value).ok()?)?;
        Some(())
    }

    match item {
        Item::Field(Unit::Year, n, _) => add32(&mut out.years, n),
        Item::Field(Unit::Month, n, _) => add32(&mut out.months, n),
        Item::Field(Unit::Day, n, _) => add32(&mut out.days, n),
        Item::Field(Unit::Hour, n, _) => {
            out.hours = out.hours.checked_add(n)?;
            Some(())
        }
        Item::Field(Unit::Minute, n, _) => add32(&mut out.minutes, n),
        Item::Field(Unit::Second, n, micros) => {
            add32(&mut out.seconds, n)?;
            add32(&mut out.microseconds, micros)
        }
        Item::Clock {
            negative,
            hours,
            minutes,
            seconds,
            micros,
        } => {
            let sign = if negative { -1 } else { 1 };
            out.hours = out.hours.checked_add(sign * hours)?;
            add32(&mut out.minutes, sign * minutes)?;
            add32(&mut out.seconds, sign * seconds)?;
            add32(&mut out.microseconds, sign * micros)
        }
    }
}

fn item(input: &str) -> IResult<&str, Item> {
    alt((clock, field))(input)
}

fn digits(input: &str) -> IResult<&str, i64> {
    map_res(take_while1(|c: char| c.is_ascii_digit()), str::parse::<i64>)(input)
}

/// Fraction digits beyond microseconds are dropped.
fn fraction(input: &str) -> IResult<&str, i64> {
    map(take_while1(|c: char| c.is_ascii_digit()), |digits: &str| {
        digits
            .bytes()
            .chain(std::iter::repeat(b'0'))
            .take(6)
            .fold(0i64, |acc, b| acc * 10 + (b - b'0') as i64)
    })(input)
}

fn clock(input: &str) -> IResult<&str, Item> {
    map(
        tuple((
            opt(one_of("+-")),
            digits,
            char(':'),
            digits,
            char(':'),
            digits,
            opt(preceded(char('.'), fraction)),
        )),
        |(sign, hours, _, minutes, _, seconds, micros)| Item::Clock {
            negative: sign == Some('-'),
            hours,
            minutes,
            seconds,
            micros: micros.unwrap_or(0),
        },
    )(input)
}

fn unit(input: &str) -> IResult<&str, Unit> {
    alt((
        map(alt((tag("years"), tag("year"))), |_| Unit::Year),
        map(alt((tag("months"), tag("month"), tag("mons"), tag("mon"))), |_| Unit::Month),
        map(alt((tag("days"), tag("day"))), |_| Unit::Day),
        map(alt((tag("hours"), tag("hour"))), |_| Unit::Hour),
        map(alt((tag("minutes"), tag("minute"), tag("mins"), tag("min"))), |_| Unit::Minute),
        map(alt((tag("seconds"), tag("second"), tag("secs"), tag("sec"))), |_| Unit::Second),
    ))(input)
}

fn field(input: &str) -> IResult<&str, Item> {
    let quantity = recognize(pair(opt(one_of("+-")), take_while1(|c: char| c.is_ascii_digit())));
    let (rest, (whole, fraction, _, unit)) = tuple((
        map_res(quantity, str::parse::<i64>),
        opt(preceded(char('.'), fraction)),
        space1,
        unit,
    ))(input)?;

    let negative = input.starts_with('-');
    match (unit, fraction) {
        (_, None) => Ok((rest, Item::Field(unit, whole, 0))),
        (Unit::Second, Some(micros)) => {
            let micros = if negative { -micros } else { micros };
            Ok((rest, Item::Field(unit, whole, micros)))
        }
        _ => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        ))),
    }
}
