//! Hex codec for object ids: fixed-width decode into a caller-provided
//! buffer, lowercase encode to a `String`. Decoding accepts either case;
//! the canonical output form is lowercase.

use crate::HashError;

const LOWER: &[u8; 16] = b"0123456789abcdef";

/// Value of a single ASCII hex digit, either case.
fn nibble(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

/// Encode `bytes` as a lowercase hex `String`.
pub fn hex_to_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(LOWER[usize::from(b >> 4)] as char);
        out.push(LOWER[usize::from(b & 0xf)] as char);
    }
    out
}

/// Decode hex digits into `buf`. The input must be exactly twice the output
/// length; errors report the position of the first bad digit.
pub fn hex_decode(hex: &[u8], buf: &mut [u8]) -> Result<(), HashError> {
    if hex.len() != buf.len() * 2 {
        return Err(HashError::InvalidHexLength {
            expected: buf.len() * 2,
            actual: hex.len(),
        });
    }
    for (i, pair) in hex.chunks_exact(2).enumerate() {
        let hi = digit(pair[0], i * 2)?;
        let lo = digit(pair[1], i * 2 + 1)?;
        buf[i] = (hi << 4) | lo;
    }
    Ok(())
}

fn digit(byte: u8, position: usize) -> Result<u8, HashError> {
    nibble(byte).ok_or(HashError::InvalidHex {
        position,
        character: byte as char,
    })
}
