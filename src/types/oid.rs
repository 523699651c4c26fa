//! PostgreSQL Type OID Constants
//!
//! Reference: https://github.com/postgres/postgres/blob/master/src/include/catalog/pg_type.dat

pub const BOOL: u32 = 16;
pub const BYTEA: u32 = 17;
pub const CHAR: u32 = 18;
pub const NAME: u32 = 19;
pub const INT8: u32 = 20;
pub const INT2: u32 = 21;
pub const INT4: u32 = 23;
pub const TEXT: u32 = 25;
pub const OID: u32 = 26;
pub const JSON: u32 = 114;
pub const POINT: u32 = 600;
pub const CIRCLE: u32 = 718;
pub const FLOAT4: u32 = 700;
pub const FLOAT8: u32 = 701;
pub const BPCHAR: u32 = 1042;
pub const VARCHAR: u32 = 1043;
pub const TIMESTAMP: u32 = 1114;
pub const TIMESTAMPTZ: u32 = 1184;
pub const INTERVAL: u32 = 1186;
pub const NUMERIC: u32 = 1700;
pub const JSONB: u32 = 3802;

pub const INT4RANGE: u32 = 3904;
pub const NUMRANGE: u32 = 3906;
pub const TSRANGE: u32 = 3908;
pub const TSTZRANGE: u32 = 3910;
pub const INT8RANGE: u32 = 3926;

pub const JSON_ARRAY: u32 = 199;
pub const CIRCLE_ARRAY: u32 = 719;
pub const BOOL_ARRAY: u32 = 1000;
pub const BYTEA_ARRAY: u32 = 1001;
pub const INT2_ARRAY: u32 = 1005;
pub const INT4_ARRAY: u32 = 1007;
pub const TEXT_ARRAY: u32 = 1009;
pub const VARCHAR_ARRAY: u32 = 1015;
pub const INT8_ARRAY: u32 = 1016;
pub const POINT_ARRAY: u32 = 1017;
pub const FLOAT4_ARRAY: u32 = 1021;
pub const FLOAT8_ARRAY: u32 = 1022;
pub const TIMESTAMP_ARRAY: u32 = 1115;
pub const TIMESTAMPTZ_ARRAY: u32 = 1185;
pub const INTERVAL_ARRAY: u32 = 1187;
pub const NUMERIC_ARRAY: u32 = 1231;
pub const JSONB_ARRAY: u32 = 3807;

/// Human-readable type name, `"unknown"` for anything not listed here.
pub fn name(oid: u32) -> &'static str {
    match oid {
        BOOL => "bool",
        BYTEA => "bytea",
        CHAR => "char",
        NAME => "name",
        INT8 => "int8",
        INT2 => "int2",
        INT4 => "int4",
        TEXT => "text",
        OID => "oid",
        JSON => "json",
        POINT => "point",
        CIRCLE => "circle",
        FLOAT4 => "float4",
        FLOAT8 => "float8",
        BPCHAR => "bpchar",
        VARCHAR => "varchar",
        TIMESTAMP => "timestamp",
        TIMESTAMPTZ => "timestamptz",
        INTERVAL => "interval",
        NUMERIC => "numeric",
        JSONB => "jsonb",
        INT4RANGE => "int4range",
        NUMRANGE => "numrange",
        TSRANGE => "tsrange",
        TSTZRANGE => "tstzrange",
        INT8RANGE => "int8range",
        JSON_ARRAY => "json[]",
        CIRCLE_ARRAY => "circle[]",
        POINT_ARRAY => "point[]",
        INTERVAL_ARRAY => "interval[]",
        JSONB_ARRAY => "jsonb[]",
        BOOL_ARRAY => "bool[]",
        BYTEA_ARRAY => "bytea[]",
        INT2_ARRAY => "int2[]",
        INT4_ARRAY => "int4[]",
        TEXT_ARRAY => "text[]",
        VARCHAR_ARRAY => "varchar[]",
        INT8_ARRAY => "int8[]",
        FLOAT4_ARRAY => "float4[]",
        FLOAT8_ARRAY => "float8[]",
        TIMESTAMP_ARRAY => "timestamp[]",
        TIMESTAMPTZ_ARRAY => "timestamptz[]",
        NUMERIC_ARRAY => "numeric[]",
        _ => "unknown",
    }
}

/// Element type of an array OID.
pub fn array_element(oid: u32) -> Option<u32> {
    Some(match oid {
        BOOL_ARRAY => BOOL,
        BYTEA_ARRAY => BYTEA,
        INT2_ARRAY => INT2,
        INT4_ARRAY => INT4,
        TEXT_ARRAY => TEXT,
        VARCHAR_ARRAY => VARCHAR,
        INT8_ARRAY => INT8,
        FLOAT4_ARRAY => FLOAT4,
        FLOAT8_ARRAY => FLOAT8,
        TIMESTAMP_ARRAY => TIMESTAMP,
        TIMESTAMPTZ_ARRAY => TIMESTAMPTZ,
        NUMERIC_ARRAY => NUMERIC,
        JSON_ARRAY => JSON,
        CIRCLE_ARRAY => CIRCLE,
        POINT_ARRAY => POINT,
        INTERVAL_ARRAY => INTERVAL,
        JSONB_ARRAY => JSONB,
        _ => return None,
    })
}

/// Element (subtype) of a built-in range OID.
pub fn range_element(oid: u32) -> Option<u32> {
    Some(match oid {
        INT4RANGE => INT4,
        NUMRANGE => NUMERIC,
        TSRANGE => TIMESTAMP,
        TSTZRANGE => TIMESTAMPTZ,
        INT8RANGE => INT8,
        _ => return None,
    })
}

pub fn is_array(oid: u32) -> bool {
    array_element(oid).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(name(NUMERIC), "numeric");
        assert_eq!(name(INT4_ARRAY), "int4[]");
        assert_eq!(name(999_999), "unknown");
    }

    #[test]
    fn test_array_element() {
        assert_eq!(array_element(TEXT_ARRAY), Some(TEXT));
        assert_eq!(array_element(TEXT), None);
        assert!(is_array(FLOAT8_ARRAY));
        assert_eq!(array_element(JSONB_ARRAY), Some(JSONB));
    }

    #[test]
    fn test_range_element() {
        assert_eq!(range_element(INT8RANGE), Some(INT8));
        assert_eq!(range_element(TSTZRANGE), Some(TIMESTAMPTZ));
        assert_eq!(range_element(INT8), None);
        assert_eq!(name(NUMRANGE), "numrange");
    }
}
