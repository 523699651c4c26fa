//! NUMERIC/DECIMAL type support for PostgreSQL.
//!
//! Binary layout:
//! - 2 bytes: ndigits (number of base-10000 digit groups)
//! - 2 bytes: weight (position of the first group relative to the decimal point)
//! - 2 bytes: sign (0x0000 positive, 0x4000 negative, 0xC000 NaN)
//! - 2 bytes: dscale (decimal digits after the point)
//! - ndigits * 2 bytes: digit groups, each 0..=9999

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use super::{FromPg, TypeError, oid};

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const MAX_DSCALE: u16 = 0x3FFF;
const NBASE: u16 = 10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericSign {
    Positive,
    Negative,
    NaN,
}

impl NumericSign {
    fn code(self) -> u16 {
        match self {
            NumericSign::Positive => NUMERIC_POS,
            NumericSign::Negative => NUMERIC_NEG,
            NumericSign::NaN => NUMERIC_NAN,
        }
    }
}

/// Arbitrary precision decimal in PostgreSQL's base-10000 representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericValue {
    sign: NumericSign,
    weight: i16,
    dscale: u16,
    digits: Vec<u16>,
}

impl NumericValue {
    pub fn nan() -> Self {
        Self {
            sign: NumericSign::NaN,
            weight: 0,
            dscale: 0,
            digits: Vec::new(),
        }
    }

    pub fn sign(&self) -> NumericSign {
        self.sign
    }

    pub fn weight(&self) -> i16 {
        self.weight
    }

    pub fn dscale(&self) -> u16 {
        self.dscale
    }

    pub fn digits(&self) -> &[u16] {
        &self.digits
    }

    pub fn is_nan(&self) -> bool {
        self.sign == NumericSign::NaN
    }

    /// Decode the binary wire form.
    ///
    /// Checks run in a fixed order: length, NaN, sign, dscale, then each digit.
    pub fn decode_binary(bytes: &[u8]) -> Result<Self, TypeError> {
        let ndigits = match bytes {
            [a, b, ..] => u16::from_be_bytes([*a, *b]) as usize,
            _ => 0,
        };
        if bytes.len() != 8 + ndigits * 2 {
            return Err(TypeError::NumericLength {
                bytes: bytes.len(),
                digits: ndigits,
            });
        }

        let weight = i16::from_be_bytes([bytes[2], bytes[3]]);
        let sign = u16::from_be_bytes([bytes[4], bytes[5]]);
        let dscale = u16::from_be_bytes([bytes[6], bytes[7]]);

        let sign = match sign {
            NUMERIC_NAN => return Ok(Self::nan()),
            NUMERIC_POS => NumericSign::Positive,
            NUMERIC_NEG => NumericSign::Negative,
            other => return Err(TypeError::NumericSign(other)),
        };
        if dscale > MAX_DSCALE {
            return Err(TypeError::NumericDscale(dscale));
        }

        let digits = bytes[8..]
            .chunks_exact(2)
            .map(|pair| {
                let digit = u16::from_be_bytes([pair[0], pair[1]]);
                if digit >= NBASE {
                    Err(TypeError::NumericDigit(digit))
                } else {
                    Ok(digit)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            sign,
            weight,
            dscale,
            digits,
        })
    }

    /// Encode to the binary wire form.
    pub fn to_binary(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.digits.len() * 2);
        out.extend_from_slice(&(self.digits.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.weight.to_be_bytes());
        out.extend_from_slice(&self.sign.code().to_be_bytes());
        out.extend_from_slice(&self.dscale.to_be_bytes());
        for digit in &self.digits {
            out.extend_from_slice(&digit.to_be_bytes());
        }
        out
    }

    /// Group at position `index` counted from the first stored group.
    /// Positions outside the stored range are implicit zeros.
    fn group(&self, index: i32) -> u16 {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.digits.get(i).copied())
            .unwrap_or(0)
    }
}

impl fmt::Display for NumericValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nan() {
            return f.write_str("NaN");
        }

        let mut out = String::new();
        if self.sign == NumericSign::Negative {
            out.push('-');
        }

        let weight = self.weight as i32;
        let mut int_part = String::new();
        for d in 0..=weight {
            int_part.push_str(&format!("{:04}", self.group(d)));
        }
        // non-canonical input may lead with zero groups
        match int_part.trim_start_matches('0') {
            "" => out.push('0'),
            digits => out.push_str(digits),
        }

        if self.dscale > 0 {
            let scale = self.dscale as usize;
            let mut frac = String::with_capacity(scale + 4);
            // groups after the point start at weight + 1
            let mut d = weight + 1;
            while frac.len() < scale {
                frac.push_str(&format!("{:04}", self.group(d)));
                d += 1;
            }
            frac.truncate(scale);
            out.push('.');
            out.push_str(&frac);
        }

        f.write_str(&out)
    }
}

impl FromStr for NumericValue {
    type Err = TypeError;

    /// Parse decimal text into canonical form: no leading or trailing zero
    /// groups, zero is positive, dscale counts the fraction digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TypeError::InvalidNumericText(s.to_string());
        let text = s.trim();
        if text.eq_ignore_ascii_case("nan") {
            return Ok(Self::nan());
        }

        let (negative, body) = match text.as_bytes().first() {
            Some(b'-') => (true, &text[1..]),
            Some(b'+') => (false, &text[1..]),
            _ => (false, text),
        };
        let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
        let all_digits = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
        if (int_part.is_empty() && frac_part.is_empty())
            || !all_digits(int_part)
            || !all_digits(frac_part)
        {
            return Err(invalid());
        }
        let dscale = u16::try_from(frac_part.len())
            .ok()
            .filter(|d| *d <= MAX_DSCALE)
            .ok_or_else(invalid)?;

        let int_part = int_part.trim_start_matches('0');
        let int_pad = (4 - int_part.len() % 4) % 4;
        let int_digits = format!("{}{}", "0".repeat(int_pad), int_part);
        let frac_pad = (4 - frac_part.len() % 4) % 4;
        let frac_digits = format!("{}{}", frac_part, "0".repeat(frac_pad));

        let int_groups = int_digits.len() / 4;
        let mut digits: Vec<u16> = int_digits
            .as_bytes()
            .chunks(4)
            .chain(frac_digits.as_bytes().chunks(4))
            .map(|chunk| {
                chunk
                    .iter()
                    .fold(0u16, |acc, b| acc * 10 + (b - b'0') as u16)
            })
            .collect();

        let mut weight = int_groups as i32 - 1;
        let leading = digits.iter().take_while(|d| **d == 0).count();
        digits.drain(..leading);
        weight -= leading as i32;
        while digits.last() == Some(&0) {
            digits.pop();
        }

        if digits.is_empty() {
            return Ok(Self {
                sign: NumericSign::Positive,
                weight: 0,
                dscale,
                digits,
            });
        }

        let weight = i16::try_from(weight).map_err(|_| invalid())?;
        Ok(Self {
            sign: if negative {
                NumericSign::Negative
            } else {
                NumericSign::Positive
            },
            weight,
            dscale,
            digits,
        })
    }
}

impl Serialize for NumericValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromPg for NumericValue {
    fn from_pg(bytes: &[u8], oid_val: u32, format: i16) -> Result<Self, TypeError> {
        if oid_val != oid::NUMERIC {
            return Err(TypeError::UnexpectedOid {
                expected: "numeric",
                got: oid_val,
            });
        }
        if format == 1 {
            Self::decode_binary(bytes)
        } else {
            super::text(bytes)?.parse()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn decode(s: &str) -> Result<String, String> {
        NumericValue::decode_binary(&hex(s))
            .map(|n| n.to_string())
            .map_err(|e| e.to_string())
    }

    #[test]
    fn test_decode_fixtures() {
        // 12345.678 -> weight 1, groups [1, 2345, 6780], dscale 3
        assert_eq!(decode("0003000100000003000109291a7c").unwrap(), "12345.678");
        // -0.0001 -> weight -1, groups [1], dscale 4
        assert_eq!(decode("0001ffff400000040001").unwrap(), "-0.0001");
        // zero with scale 2
        assert_eq!(decode("0000000000000002").unwrap(), "0.00");
        // 20000 -> weight 1, groups [2], trailing zero group implicit
        assert_eq!(decode("00010001000000000002").unwrap(), "20000");
        assert_eq!(decode("00000000c0000000").unwrap(), "NaN");
    }

    #[test]
    fn test_leading_zero_groups_are_trimmed() {
        // weight 1, groups [0, 5]
        assert_eq!(decode("000200010000000000000005").unwrap(), "5");
        // weight 2, groups [0, 12, 3456]
        assert_eq!(decode("00030002000000000000000c0d80").unwrap(), "123456");
        // weight 0, groups [0, 5000], dscale 1
        assert_eq!(decode("000200000000000100001388").unwrap(), "0.5");
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            decode("00010000000000000001ff").unwrap_err(),
            "Invalid numeric length: 11 bytes of data representing 1 digits"
        );
        assert_eq!(
            decode("0001000000000000ffff").unwrap_err(),
            "Invalid numeric digit: 65535"
        );
        assert_eq!(
            decode("00010000f00000000001").unwrap_err(),
            "Invalid numeric sign: 0xf000"
        );
        assert_eq!(
            decode("00010000000040000001").unwrap_err(),
            "Invalid numeric dscale: 0x4000"
        );
        assert_eq!(
            decode("00").unwrap_err(),
            "Invalid numeric length: 1 bytes of data representing 0 digits"
        );
    }

    #[test]
    fn test_length_checked_before_nan() {
        assert!(matches!(
            NumericValue::decode_binary(&hex("00010000c0000000")),
            Err(TypeError::NumericLength { .. })
        ));
    }

    #[test]
    fn test_parse_canonical() {
        let n: NumericValue = "0012345.6780".parse().unwrap();
        assert_eq!(n.weight(), 1);
        assert_eq!(n.digits(), &[1, 2345, 6780]);
        assert_eq!(n.dscale(), 4);
        assert_eq!(n.to_string(), "12345.6780");

        let zero: NumericValue = "-0.000".parse().unwrap();
        assert_eq!(zero.sign(), NumericSign::Positive);
        assert!(zero.digits().is_empty());
        assert_eq!(zero.to_string(), "0.000");

        let small: NumericValue = "-0.00012".parse().unwrap();
        assert_eq!(small.weight(), -1);
        assert_eq!(small.digits(), &[1, 2000]);
        assert_eq!(small.to_string(), "-0.00012");

        let big: NumericValue = "100000000".parse().unwrap();
        assert_eq!(big.weight(), 2);
        assert_eq!(big.digits(), &[1]);
        assert_eq!(big.to_string(), "100000000");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "-", ".", "1.2.3", "12a", "1e5"] {
            assert!(bad.parse::<NumericValue>().is_err(), "{bad:?}");
        }
        assert!("NaN".parse::<NumericValue>().unwrap().is_nan());
    }

    #[test]
    fn test_to_binary_matches_wire() {
        let n: NumericValue = "12345.678".parse().unwrap();
        assert_eq!(n.to_binary(), hex("0003000100000003000109291a7c"));
        assert_eq!(NumericValue::nan().to_binary(), hex("00000000c0000000"));
    }

    #[test]
    fn test_from_pg() {
        let n = NumericValue::from_pg(b"-1.5", oid::NUMERIC, 0).unwrap();
        assert_eq!(n.to_string(), "-1.5");
        assert!(NumericValue::from_pg(b"1", oid::INT4, 0).is_err());
    }

    fn canonical_text() -> impl Strategy<Value = String> {
        ("(0|[1-9][0-9]{0,24})", "([0-9]{1,20})?", any::<bool>()).prop_map(|(int, frac, neg)| {
            let sign = if neg && int != "0" { "-" } else { "" };
            if frac.is_empty() {
                format!("{sign}{int}")
            } else {
                format!("{sign}{int}.{frac}")
            }
        })
    }

    proptest! {
        #[test]
        fn prop_text_round_trip(text in canonical_text()) {
            let value: NumericValue = text.parse().unwrap();
            let decoded = NumericValue::decode_binary(&value.to_binary()).unwrap();
            prop_assert_eq!(&decoded, &value);
            prop_assert_eq!(decoded.to_string(), text);
        }
    }
}
