//! `point` and `circle`.
//!
//! Text: `(x,y)` and `<(x,y),r>`. Binary: big-endian f64s in the same order.

use nom::{
    IResult,
    character::complete::{char, multispace0},
    combinator::{all_consuming, map},
    number::complete::double,
    sequence::{delimited, separated_pair, tuple},
};
use serde::Serialize;

use super::{FromPg, TypeError, oid};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PgPoint {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PgCircle {
    pub center: PgPoint,
    pub radius: f64,
}

fn f64s<const N: usize>(bytes: &[u8], what: &str) -> Result<[f64; N], TypeError> {
    if bytes.len() != N * 8 {
        return Err(TypeError::InvalidGeometry(format!(
            "expected {} bytes for {}, got {}",
            N * 8,
            what,
            bytes.len()
        )));
    }
    let mut out = [0f64; N];
    for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(8)) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        *slot = f64::from_be_bytes(raw);
    }
    Ok(out)
}

fn coordinate(input: &str) -> IResult<&str, f64> {
    delimited(multispace0, double, multispace0)(input)
}

fn point(input: &str) -> IResult<&str, PgPoint> {
    map(
        delimited(char('('), separated_pair(coordinate, char(','), coordinate), char(')')),
        |(x, y)| PgPoint { x, y },
    )(input)
}

fn circle(input: &str) -> IResult<&str, PgCircle> {
    map(
        delimited(char('<'), tuple((point, char(','), coordinate)), char('>')),
        |(center, _, radius)| PgCircle { center, radius },
    )(input)
}

/// ```
/// use pgwire_core::types::geometry::parse_point;
///
/// let p = parse_point("(1.5,-2)").unwrap();
/// assert_eq!((p.x, p.y), (1.5, -2.0));
/// ```
pub fn parse_point(input: &str) -> Result<PgPoint, TypeError> {
    all_consuming(point)(input.trim())
        .map(|(_, p)| p)
        .map_err(|_| TypeError::InvalidGeometry(input.to_string()))
}

pub fn parse_circle(input: &str) -> Result<PgCircle, TypeError> {
    all_consuming(circle)(input.trim())
        .map(|(_, c)| c)
        .map_err(|_| TypeError::InvalidGeometry(input.to_string()))
}

impl FromPg for PgPoint {
    fn from_pg(bytes: &[u8], oid_val: u32, format: i16) -> Result<Self, TypeError> {
        if oid_val != oid::POINT {
            return Err(TypeError::UnexpectedOid {
                expected: "point",
                got: oid_val,
            });
        }
        if format == super::FORMAT_BINARY {
            let [x, y] = f64s(bytes, "point")?;
            Ok(PgPoint { x, y })
        } else {
            parse_point(super::text(bytes)?)
        }
    }
}

impl FromPg for PgCircle {
    fn from_pg(bytes: &[u8], oid_val: u32, format: i16) -> Result<Self, TypeError> {
        if oid_val != oid::CIRCLE {
            return Err(TypeError::UnexpectedOid {
                expected: "circle",
                got: oid_val,
            });
        }
        if format == super::FORMAT_BINARY {
            let [x, y, radius] = f64s(bytes, "circle")?;
            Ok(PgCircle {
                center: PgPoint { x, y },
                radius,
            })
        } else {
            parse_circle(super::text(bytes)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_point_text() {
        assert_eq!(parse_point("(1,2)").unwrap(), PgPoint { x: 1.0, y: 2.0 });
        assert_eq!(
            parse_point("( -0.5 , 1e3 )").unwrap(),
            PgPoint { x: -0.5, y: 1000.0 }
        );
        for bad in ["", "1,2", "(1,2", "(1;2)", "(1,2)x", "(a,b)"] {
            assert!(matches!(parse_point(bad), Err(TypeError::InvalidGeometry(_))), "{bad:?}");
        }
    }

    #[test]
    fn test_circle_text() {
        assert_eq!(
            parse_circle("<(1,2),3.5>").unwrap(),
            PgCircle {
                center: PgPoint { x: 1.0, y: 2.0 },
                radius: 3.5
            }
        );
        assert!(parse_circle("<(1,2)>").is_err());
        assert!(parse_circle("(1,2),3").is_err());
    }

    #[test]
    fn test_binary() {
        let mut bytes = 1.5f64.to_be_bytes().to_vec();
        bytes.extend_from_slice(&(-2f64).to_be_bytes());
        assert_eq!(
            PgPoint::from_pg(&bytes, oid::POINT, 1).unwrap(),
            PgPoint { x: 1.5, y: -2.0 }
        );
        assert!(PgCircle::from_pg(&bytes, oid::CIRCLE, 1).is_err());

        bytes.extend_from_slice(&4f64.to_be_bytes());
        assert_eq!(PgCircle::from_pg(&bytes, oid::CIRCLE, 1).unwrap().radius, 4.0);
        assert!(matches!(
            PgPoint::from_pg(&bytes, oid::CIRCLE, 1),
            Err(TypeError::UnexpectedOid { .. })
        ));
    }
}
