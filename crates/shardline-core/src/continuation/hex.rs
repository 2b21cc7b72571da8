//! Hex framing of continuation tokens. Only byte <-> text conversion lives
//! here; nothing in this file knows what the bytes mean.

// Upper bound for untrusted token input. Tokens carry buffered rows per
// partition, so this is far above a single cursor.
pub(crate) const MAX_TOKEN_HEX_LEN: usize = 8 * 1024 * 1024;

///
/// HexDecodeError
///

#[derive(Clone, Debug, Eq, thiserror::Error, PartialEq)]
pub enum HexDecodeError {
    #[error("continuation token is empty")]
    Empty,

    #[error("continuation token exceeds max length: {len} hex chars (max {max})")]
    TooLong { len: usize, max: usize },

    #[error("continuation token must have an even number of hex characters")]
    OddLength,

    #[error("invalid hex character at position {position}")]
    InvalidHex { position: usize },
}

/// Encode raw bytes as lower-case hex.
#[must_use]
pub fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Decode a hex token of either case; surrounding whitespace is trimmed.
pub fn decode_hex(token: &str) -> Result<Vec<u8>, HexDecodeError> {
    decode_hex_bounded(token, MAX_TOKEN_HEX_LEN)
}

fn decode_hex_bounded(token: &str, max: usize) -> Result<Vec<u8>, HexDecodeError> {
    let token = token.trim();

    if token.is_empty() {
        return Err(HexDecodeError::Empty);
    }
    if token.len() > max {
        return Err(HexDecodeError::TooLong {
            len: token.len(),
            max,
        });
    }
    if !token.len().is_multiple_of(2) {
        return Err(HexDecodeError::OddLength);
    }

    token
        .as_bytes()
        .chunks_exact(2)
        .enumerate()
        .map(|(pair, digits)| {
            let position = pair * 2;
            let hi = nibble(digits[0]).ok_or(HexDecodeError::InvalidHex {
                position: position + 1,
            })?;
            let lo = nibble(digits[1]).ok_or(HexDecodeError::InvalidHex {
                position: position + 2,
            })?;

            Ok((hi << 4) | lo)
        })
        .collect()
}

const fn nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

///
/// TESTS
///
