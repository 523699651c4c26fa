//! bytea and bool codecs.

use super::TypeError;

/// Decode the text form of a bytea value.
///
/// Accepts the hex form (`\x0a0b`) and the legacy escape form, where
/// `\nnn` is an octal byte and `\\` a literal backslash.
pub fn decode_bytea_text(text: &[u8]) -> Result<Vec<u8>, TypeError> {
    match text {
        [b'\\', b'x', hex @ ..] => decode_hex(hex),
        _ => decode_escape(text),
    }
}

fn decode_hex(hex: &[u8]) -> Result<Vec<u8>, TypeError> {
    if hex.len() % 2 != 0 {
        return Err(TypeError::InvalidBytea(format!(
            "odd number of hex digits ({})",
            hex.len()
        )));
    }
    hex.chunks_exact(2)
        .map(|pair| Ok(nibble(pair[0])? << 4 | nibble(pair[1])?))
        .collect()
}

fn nibble(c: u8) -> Result<u8, TypeError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(TypeError::InvalidBytea(format!(
            "invalid hex digit {:?}",
            c as char
        ))),
    }
}

fn decode_escape(text: &[u8]) -> Result<Vec<u8>, TypeError> {
    let mut out = Vec::with_capacity(text.len());
    let mut i = 0;
    while i < text.len() {
        if text[i] != b'\\' {
            out.push(text[i]);
            i += 1;
            continue;
        }
        match &text[i + 1..] {
            [b'\\', ..] => {
                out.push(b'\\');
                i += 2;
            }
            [a @ b'0'..=b'3', b @ b'0'..=b'7', c @ b'0'..=b'7', ..] => {
                out.push((a - b'0') << 6 | (b - b'0') << 3 | (c - b'0'));
                i += 4;
            }
            _ => {
                return Err(TypeError::InvalidBytea(format!(
                    "invalid escape sequence at offset {}",
                    i
                )));
            }
        }
    }
    Ok(out)
}

/// Hex text form, as PostgreSQL prints bytea by default.
pub fn encode_bytea_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Text bool. Anything outside the truthy set is false.
pub fn bool_from_text(text: &str) -> bool {
    matches!(text, "TRUE" | "t" | "true" | "y" | "yes" | "on" | "1")
}

/// Binary bool: one byte, non-zero is true.
pub fn bool_from_binary(bytes: &[u8]) -> Result<bool, TypeError> {
    bytes
        .first()
        .map(|b| *b != 0)
        .ok_or_else(|| TypeError::InvalidData("empty bool value".to_string()))
}
