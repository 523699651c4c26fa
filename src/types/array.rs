//! PostgreSQL array codecs.
//!
//! Text arrays are parsed by a single-cursor recursive descent: one position
//! is shared across all nesting levels. Binary arrays are decoded by element
//! OID through `decode_value`.

use serde::Serialize;

use super::{PgValue, TypeError, decode_value, oid};

/// One array slot: NULL, a leaf value, or a nested dimension.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ArrayEntry<T> {
    Null,
    Value(T),
    Nested(Vec<ArrayEntry<T>>),
}

impl<T> ArrayEntry<T> {
    /// Leaf values in order, skipping NULLs.
    pub fn flatten(entries: &[ArrayEntry<T>]) -> Vec<&T> {
        let mut out = Vec::new();
        for entry in entries {
            match entry {
                ArrayEntry::Null => {}
                ArrayEntry::Value(v) => out.push(v),
                ArrayEntry::Nested(inner) => out.extend(Self::flatten(inner)),
            }
        }
        out
    }
}

/// Parse a text array literal, keeping leaves as strings.
///
/// ```
/// use pgwire_core::types::array::{parse_text_array, ArrayEntry};
///
/// let parsed = parse_text_array(r#"{a,"b,c",NULL}"#).unwrap();
/// assert_eq!(parsed, vec![
///     ArrayEntry::Value("a".to_string()),
///     ArrayEntry::Value("b,c".to_string()),
///     ArrayEntry::Null,
/// ]);
/// ```
pub fn parse_text_array(input: &str) -> Result<Vec<ArrayEntry<String>>, TypeError> {
    parse_array(input, |s| Ok(s.to_string()))
}

/// Deepest nesting PostgreSQL accepts (MAXDIM).
pub const MAX_DIMENSIONS: usize = 6;

/// Parse a text array literal, converting every leaf through `transform`.
pub fn parse_array<T, F>(input: &str, transform: F) -> Result<Vec<ArrayEntry<T>>, TypeError>
where
    F: FnMut(&str) -> Result<T, TypeError>,
{
    let mut parser = ArrayParser {
        input,
        pos: 0,
        transform,
    };
    parser.skip_dimensions()?;
    parser.skip_whitespace();
    if parser.peek() != Some(b'{') {
        return Err(parser.invalid("expected '{'"));
    }
    parser.pos += 1;
    let entries = parser.level(1)?;
    parser.skip_whitespace();
    match parser.peek() {
        None => Ok(entries),
        Some(b'}') => Err(TypeError::UnbalancedArray(input.to_string())),
        Some(_) => Err(parser.invalid("trailing characters after array")),
    }
}

struct ArrayParser<'a, F> {
    input: &'a str,
    pos: usize,
    transform: F,
}

impl<'a, T, F> ArrayParser<'a, F>
where
    F: FnMut(&str) -> Result<T, TypeError>,
{
    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn invalid(&self, reason: &str) -> TypeError {
        TypeError::InvalidArray {
            position: self.pos,
            reason: reason.to_string(),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    /// Skip an optional `[lo:hi][lo:hi]=` prefix.
    fn skip_dimensions(&mut self) -> Result<(), TypeError> {
        if self.peek() != Some(b'[') {
            return Ok(());
        }
        match self.input.find('=') {
            Some(eq) => {
                self.pos = eq + 1;
                Ok(())
            }
            None => Err(self.invalid("dimension prefix without '='")),
        }
    }

    /// Entries up to and including the closing brace of the current level.
    fn level(&mut self, depth: usize) -> Result<Vec<ArrayEntry<T>>, TypeError> {
        if depth > MAX_DIMENSIONS {
            return Err(self.invalid("array nests deeper than 6 dimensions"));
        }
        let mut entries = Vec::new();
        loop {
            match self.peek() {
                None => return Err(TypeError::UnbalancedArray(self.input.to_string())),
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(entries);
                }
                Some(b'{') => {
                    self.pos += 1;
                    entries.push(ArrayEntry::Nested(self.level(depth + 1)?));
                }
                Some(b',') => self.pos += 1,
                Some(b) if b.is_ascii_whitespace() => self.pos += 1,
                Some(b'"') => {
                    let text = self.quoted()?;
                    entries.push(ArrayEntry::Value((self.transform)(&text)?));
                }
                Some(_) => {
                    let token = self.unquoted();
                    if token.is_empty() {
                        continue;
                    }
                    if token.eq_ignore_ascii_case("NULL") {
                        entries.push(ArrayEntry::Null);
                    } else {
                        entries.push(ArrayEntry::Value((self.transform)(token)?));
                    }
                }
            }
        }
    }

    /// Quoted entry with backslash escapes. Cursor starts on the opening quote.
    fn quoted(&mut self) -> Result<String, TypeError> {
        let start = self.pos;
        self.pos += 1;
        let mut out = Vec::new();
        let input: &'a str = self.input;
        let bytes = input.as_bytes();
        loop {
            match bytes.get(self.pos) {
                None => {
                    self.pos = start;
                    return Err(self.invalid("unterminated quoted entry"));
                }
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    let Some(&escaped) = bytes.get(self.pos + 1) else {
                        self.pos = start;
                        return Err(self.invalid("unterminated quoted entry"));
                    };
                    out.push(escaped);
                    self.pos += 2;
                }
                Some(&b) => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }
        String::from_utf8(out).map_err(|e| TypeError::InvalidData(e.to_string()))
    }

    /// Raw token up to the next separator, trimmed.
    fn unquoted(&mut self) -> &'a str {
        let input: &'a str = self.input;
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| !matches!(b, b',' | b'{' | b'}'))
        {
            self.pos += 1;
        }
        input[start..self.pos].trim()
    }
}

/// Decode the binary array form.
///
/// Layout: ndim i32, has-null i32, element oid u32, ndim × (length i32,
/// lower bound i32), then each element as i32 length (-1 for NULL) + bytes.
pub fn decode_binary_array(bytes: &[u8]) -> Result<Vec<ArrayEntry<PgValue>>, TypeError> {
    let mut reader = Reader { data: bytes, pos: 0 };
    let ndim = reader.i32()?;
    let _has_null = reader.i32()?;
    let element_oid = reader.i32()? as u32;
    if ndim < 0 {
        return Err(TypeError::InvalidData(format!("negative array dimension count {}", ndim)));
    }
    if ndim as usize > MAX_DIMENSIONS {
        return Err(TypeError::InvalidData(format!("array has {} dimensions, at most 6 allowed", ndim)));
    }
    if oid::is_array(element_oid) {
        return Err(TypeError::InvalidData(format!("array element type {} is itself an array", element_oid)));
    }
    if ndim == 0 {
        return Ok(Vec::new());
    }

    let mut dims = Vec::with_capacity(ndim as usize);
    for _ in 0..ndim {
        let len = reader.i32()?;
        let _lower_bound = reader.i32()?;
        if len < 0 {
            return Err(TypeError::InvalidData(format!("negative array dimension {}", len)));
        }
        dims.push(len as usize);
    }
    let total = dims
        .iter()
        .try_fold(1usize, |acc, d| acc.checked_mul(*d))
        .filter(|n| *n <= bytes.len() / 4)
        .ok_or_else(|| TypeError::InvalidData("array dimensions exceed payload".to_string()))?;

    let mut flat = Vec::with_capacity(total);
    for _ in 0..total {
        let len = reader.i32()?;
        let entry = if len < 0 {
            ArrayEntry::Null
        } else {
            let raw = reader.take(len as usize)?;
            ArrayEntry::Value(decode_value(element_oid, 1, Some(raw))?)
        };
        flat.push(entry);
    }
    if reader.pos != bytes.len() {
        return Err(TypeError::InvalidData(format!(
            "{} trailing bytes after array elements",
            bytes.len() - reader.pos
        )));
    }

    Ok(reshape(&dims, &mut flat.into_iter()))
}

fn reshape<T>(dims: &[usize], flat: &mut impl Iterator<Item = ArrayEntry<T>>) -> Vec<ArrayEntry<T>> {
    match dims {
        [] => Vec::new(),
        [len] => flat.take(*len).collect(),
        [len, rest @ ..] => (0..*len)
            .map(|_| ArrayEntry::Nested(reshape(rest, flat)))
            .collect(),
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], TypeError> {
        let data: &'a [u8] = self.data;
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| {
                TypeError::InvalidData(format!("array truncated at offset {}", self.pos))
            })?;
        let out = &data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn i32(&mut self) -> Result<i32, TypeError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::oid;
    use pretty_assertions::assert_eq;

    fn v(s: &str) -> ArrayEntry<String> {
        ArrayEntry::Value(s.to_string())
    }

    fn int(s: &str) -> Result<i32, TypeError> {
        s.parse()
            .map_err(|_| TypeError::InvalidData(format!("not an int: {}", s)))
    }

    #[test]
    fn test_empty() {
        assert_eq!(parse_text_array("{}").unwrap(), vec![]);
    }

    #[test]
    fn test_quoted_empty_string() {
        assert_eq!(parse_text_array(r#"{""}"#).unwrap(), vec![v("")]);
    }

    #[test]
    fn test_nulls() {
        assert_eq!(
            parse_text_array("{NULL,NULL}").unwrap(),
            vec![ArrayEntry::Null, ArrayEntry::Null]
        );
        assert_eq!(parse_text_array(r#"{"NULL"}"#).unwrap(), vec![v("NULL")]);
    }

    #[test]
    fn test_int_transform() {
        assert_eq!(
            parse_array("{1,2,3}", int).unwrap(),
            vec![ArrayEntry::Value(1), ArrayEntry::Value(2), ArrayEntry::Value(3)]
        );
        assert!(parse_array("{1,x}", int).is_err());
    }

    #[test]
    fn test_nested() {
        assert_eq!(
            parse_array("{{1,2},{3,4}}", int).unwrap(),
            vec![
                ArrayEntry::Nested(vec![ArrayEntry::Value(1), ArrayEntry::Value(2)]),
                ArrayEntry::Nested(vec![ArrayEntry::Value(3), ArrayEntry::Value(4)]),
            ]
        );
    }

    #[test]
    fn test_quoted_escapes() {
        assert_eq!(
            parse_text_array(r#"{"a \"b\"","c\\d","{,}"}"#).unwrap(),
            vec![v(r#"a "b""#), v(r"c\d"), v("{,}")]
        );
    }

    #[test]
    fn test_unquoted_whitespace_and_empty_tokens() {
        assert_eq!(
            parse_text_array("{ a , b c ,,}").unwrap(),
            vec![v("a"), v("b c")]
        );
    }

    #[test]
    fn test_dimension_prefix() {
        assert_eq!(
            parse_array("[0:1]={7,8}", int).unwrap(),
            vec![ArrayEntry::Value(7), ArrayEntry::Value(8)]
        );
    }

    #[test]
    fn test_unbalanced() {
        assert!(matches!(
            parse_text_array("{{1,2}"),
            Err(TypeError::UnbalancedArray(_))
        ));
        assert!(matches!(
            parse_text_array("{1}}"),
            Err(TypeError::UnbalancedArray(_))
        ));
        assert!(matches!(
            parse_text_array(r#"{"abc}"#),
            Err(TypeError::InvalidArray { .. })
        ));
        assert!(parse_text_array("1,2").is_err());
    }

    #[test]
    fn test_nesting_depth_is_capped() {
        let six = "{{{{{{1}}}}}}";
        assert!(parse_text_array(six).is_ok());

        let seven = "{{{{{{{1}}}}}}}";
        assert!(matches!(
            parse_text_array(seven),
            Err(TypeError::InvalidArray { position: 7, .. })
        ));

        let hostile = "{".repeat(100_000);
        assert!(matches!(
            parse_text_array(&hostile),
            Err(TypeError::InvalidArray { .. })
        ));
    }

    #[test]
    fn test_flatten() {
        let parsed = parse_array("{{1,NULL},{3}}", int).unwrap();
        assert_eq!(ArrayEntry::flatten(&parsed), vec![&1, &3]);
    }

    fn binary_array(element_oid: u32, dims: &[i32], elements: &[Option<&[u8]>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(dims.len() as i32).to_be_bytes());
        out.extend_from_slice(&(elements.iter().any(|e| e.is_none()) as i32).to_be_bytes());
        out.extend_from_slice(&element_oid.to_be_bytes());
        for d in dims {
            out.extend_from_slice(&d.to_be_bytes());
            out.extend_from_slice(&1i32.to_be_bytes());
        }
        for e in elements {
            match e {
                None => out.extend_from_slice(&(-1i32).to_be_bytes()),
                Some(b) => {
                    out.extend_from_slice(&(b.len() as i32).to_be_bytes());
                    out.extend_from_slice(b);
                }
            }
        }
        out
    }

    #[test]
    fn test_binary_one_dimension() {
        let one = 1i32.to_be_bytes();
        let two = 2i32.to_be_bytes();
        let bytes = binary_array(oid::INT4, &[3], &[Some(&one[..]), None, Some(&two[..])]);
        assert_eq!(
            decode_binary_array(&bytes).unwrap(),
            vec![
                ArrayEntry::Value(PgValue::Int4(1)),
                ArrayEntry::Null,
                ArrayEntry::Value(PgValue::Int4(2)),
            ]
        );
    }

    #[test]
    fn test_binary_dimension_limits() {
        let mut deep = 7i32.to_be_bytes().to_vec();
        deep.extend_from_slice(&0i32.to_be_bytes());
        deep.extend_from_slice(&oid::INT4.to_be_bytes());
        assert!(matches!(decode_binary_array(&deep), Err(TypeError::InvalidData(_))));

        let nested = binary_array(oid::INT4_ARRAY, &[1], &[Some(&[0u8; 12][..])]);
        assert!(matches!(decode_binary_array(&nested), Err(TypeError::InvalidData(_))));
    }

    #[test]
    fn test_binary_two_dimensions() {
        let bytes = binary_array(
            oid::TEXT,
            &[2, 2],
            &[Some(&b"a"[..]), Some(&b"b"[..]), Some(&b"c"[..]), Some(&b"d"[..])],
        );
        let text = |s: &str| ArrayEntry::Value(PgValue::Text(s.to_string()));
        assert_eq!(
            decode_binary_array(&bytes).unwrap(),
            vec![
                ArrayEntry::Nested(vec![text("a"), text("b")]),
                ArrayEntry::Nested(vec![text("c"), text("d")]),
            ]
        );
    }

    #[test]
    fn test_binary_empty_and_truncated() {
        let empty = binary_array(oid::INT4, &[], &[]);
        assert_eq!(decode_binary_array(&empty).unwrap(), vec![]);

        let mut bytes = binary_array(oid::INT4, &[2], &[Some(&[0u8, 0, 0, 1][..])]);
        bytes.truncate(bytes.len() - 1);
        assert!(decode_binary_array(&bytes).is_err());
    }
}
