//! Decoding of fixed-width header fields

/// A header field failed to decode
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("field '{field}' is not valid {radix}: {text:?}")]
pub struct FieldError {
    pub field: &'static str,
    pub radix: &'static str,
    pub text: String,
}

const NUL: u8 = 0;
const SPACE: u8 = b' ';

/// Parse an ASCII octal number, ignoring trailing NUL/space terminators and
/// leading spaces (tar pads both ways)
pub fn parse_octal(field: &'static str, raw: &[u8]) -> Result<u64, FieldError> {
    let err = || FieldError {
        field,
        radix: "octal",
        text: String::from_utf8_lossy(raw).into_owned(),
    };

    let end = raw
        .iter()
        .rposition(|&b| b != NUL && b != SPACE)
        .map_or(0, |p| p + 1);
    let start = raw[..end].iter().position(|&b| b != SPACE).unwrap_or(end);
    let digits = &raw[start..end];

    let mut value: u64 = 0;
    for &b in digits {
        if !(b'0'..=b'7').contains(&b) {
            return Err(err());
        }
        value = value
            .checked_mul(8)
            .and_then(|v| v.checked_add(u64::from(b - b'0')))
            .ok_or_else(err)?;
    }
    Ok(value)
}

/// Parse a fixed-width ASCII hexadecimal number (every byte must be a digit)
pub fn parse_hex(field: &'static str, raw: &[u8]) -> Result<u64, FieldError> {
    let err = || FieldError {
        field,
        radix: "hexadecimal",
        text: String::from_utf8_lossy(raw).into_owned(),
    };
    if raw.is_empty() || raw.len() > 16 {
        return Err(err());
    }
    let mut value: u64 = 0;
    for &b in raw {
        let digit = (b as char).to_digit(16).ok_or_else(err)?;
        value = (value << 4) | u64::from(digit);
    }
    Ok(value)
}

/// Text up to the first NUL, decoded lossily
pub fn nul_terminated(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == NUL).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

pub fn is_all_zero(raw: &[u8]) -> bool {
    raw.iter().all(|&b| b == NUL)
}

/// Bytes needed to advance `offset` to the next multiple of `alignment`
pub fn padding_needed(offset: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return 0;
    }
    let rem = offset % alignment;
    if rem == 0 {
        0
    } else {
        alignment - rem
    }
}

pub fn le_u16(raw: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([raw[at], raw[at + 1]])
}

pub fn le_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

pub fn be_u16(raw: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([raw[at], raw[at + 1]])
}
