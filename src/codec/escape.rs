//! Percent-escaping of control, space and `%` bytes
//!
//! Used for keys when `urlencode` is enabled, and to reverse payloads that
//! older writers stored with the ESCAPED flag.

use crate::CodecError;

const HEX: &[u8; 16] = b"0123456789ABCDEF";

#[inline]
fn needs_escape(b: u8) -> bool {
    b <= b' ' || b == b'%' || b == 127
}

/// Escape bytes that cannot travel in a memcached key
pub fn escape(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    for &b in input {
        if needs_escape(b) {
            out.push(b'%');
            out.push(HEX[usize::from(b >> 4)]);
            out.push(HEX[usize::from(b & 0x0f)]);
        } else {
            out.push(b);
        }
    }
    out
}

/// Reverse `%XX` sequences
pub fn unescape(input: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'%' {
            let hi = input.get(i + 1).and_then(|&c| hex_val(c));
            let lo = input.get(i + 2).and_then(|&c| hex_val(c));
            match (hi, lo) {
                (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
                _ => return Err(CodecError::Escape(i)),
            }
            i += 3;
        } else {
            out.push(input[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}
