//! Fixed-width message header codec
//!
//! The header holds exactly [`TEXT_CAPACITY`] Unicode code points, each
//! stored as a 4-byte little-endian integer, right-padded with spaces.

use crate::error::{CodecError, Result};
use crate::packet::HEADER_LEN;

/// Number of code points carried by a header
pub const TEXT_CAPACITY: usize = HEADER_LEN / 4;

const PADDING: char = ' ';

/// Encode `text` into a header buffer.
///
/// Fails if `text` has more than [`TEXT_CAPACITY`] characters.
pub fn encode(text: &str) -> Result<Vec<u8>> {
    let len = text.chars().count();
    if len > TEXT_CAPACITY {
        return Err(CodecError::TextTooLong {
            len,
            max: TEXT_CAPACITY,
        }
        .into());
    }

    let mut header = Vec::with_capacity(HEADER_LEN);
    for c in text.chars().chain(std::iter::repeat(PADDING)).take(TEXT_CAPACITY) {
        header.extend_from_slice(&u32::from(c).to_le_bytes());
    }
    Ok(header)
}

/// Decode a header into its full, padded text.
///
/// Values that are not valid code points decode to U+FFFD.
pub fn decode(header: &[u8]) -> Result<String> {
    if header.len() != HEADER_LEN {
        return Err(CodecError::InvalidHeaderLength {
            expected: HEADER_LEN,
            actual: header.len(),
        }
        .into());
    }

    Ok(header
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .map(|v| char::from_u32(v).unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect())
}

/// Decode a header and trim the padding for display
pub fn display_text(header: &[u8]) -> Result<String> {
    Ok(decode(header)?.trim().to_string())
}
