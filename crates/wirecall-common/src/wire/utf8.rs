//! Length-prefixed modified UTF-8 strings.
//!
//! Strings are written as a 16-bit byte count followed by the UTF-16 code
//! units of the string, each packed into one to three bytes. NUL is written
//! in its two-byte form and surrogate pairs are written as two three-byte
//! sequences, so any Rust string fits in at most three bytes per unit.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::warn;

use crate::protocol::error::{Result, RpcError};

/// Largest number of UTF-16 units written for one string.
///
/// Three bytes per unit in the worst case must still fit the 16-bit length.
pub const MAX_STRING_CHARS: usize = 0xffff / 3;

/// Writes `s`, truncating it to [`MAX_STRING_CHARS`] units first.
///
/// Returns the number of payload bytes written (excluding the length prefix).
pub fn write_string<W: Write + ?Sized>(out: &mut W, s: &str) -> Result<usize> {
    let mut units: Vec<u16> = s.encode_utf16().collect();
    if units.len() > MAX_STRING_CHARS {
        let prefix: String = s.chars().take(20).collect();
        warn!(chars = units.len(), prefix = %prefix, "truncating long string");
        units.truncate(MAX_STRING_CHARS);
        // never leave half of a surrogate pair behind
        if units.last().is_some_and(|u| (0xD800..0xDC00).contains(u)) {
            units.pop();
        }
    }

    let len = encoded_length(&units);
    if len > 0xffff {
        return Err(RpcError::InvalidArgument("string too long!".to_string()));
    }

    let mut buf = Vec::with_capacity(len);
    for code in units {
        match code {
            0x0001..=0x007F => buf.push(code as u8),
            0x0000 | 0x0080..=0x07FF => {
                buf.push(0xC0 | ((code >> 6) & 0x1F) as u8);
                buf.push(0x80 | (code & 0x3F) as u8);
            }
            _ => {
                buf.push(0xE0 | ((code >> 12) & 0x0F) as u8);
                buf.push(0x80 | ((code >> 6) & 0x3F) as u8);
                buf.push(0x80 | (code & 0x3F) as u8);
            }
        }
    }

    out.write_u16::<BigEndian>(len as u16)?;
    out.write_all(&buf)?;
    Ok(len)
}

/// Reads a string written by [`write_string`].
pub fn read_string<R: Read + ?Sized>(input: &mut R) -> Result<String> {
    let len = input.read_u16::<BigEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    input.read_exact(&mut bytes)?;
    decode(&bytes)
}

/// Number of bytes `units` occupy once encoded.
fn encoded_length(units: &[u16]) -> usize {
    units
        .iter()
        .map(|&c| match c {
            0x0001..=0x007F => 1,
            0x0000 | 0x0080..=0x07FF => 2,
            _ => 3,
        })
        .sum()
}

fn decode(bytes: &[u8]) -> Result<String> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        i += 1;
        let unit = match b {
            0x00..=0x7F => u16::from(b),
            0xC0..=0xDF => {
                let b2 = continuation(bytes, i)?;
                i += 1;
                (u16::from(b & 0x1F) << 6) | u16::from(b2 & 0x3F)
            }
            0xE0..=0xEF => {
                let b2 = continuation(bytes, i)?;
                let b3 = continuation(bytes, i + 1)?;
                i += 2;
                (u16::from(b & 0x0F) << 12) | (u16::from(b2 & 0x3F) << 6) | u16::from(b3 & 0x3F)
            }
            0x80..=0xBF => {
                return Err(RpcError::protocol(format!(
                    "malformed string: stray continuation byte {b:#04x}"
                )))
            }
            0xF0..=0xFF => {
                return Err(RpcError::protocol(format!(
                    "malformed string: invalid lead byte {b:#04x}"
                )))
            }
        };
        units.push(unit);
    }

    String::from_utf16(&units)
        .map_err(|_| RpcError::protocol("malformed string: unpaired surrogate"))
}

fn continuation(bytes: &[u8], at: usize) -> Result<u8> {
    match bytes.get(at) {
        Some(&b) if b & 0xC0 == 0x80 => Ok(b),
        Some(&b) => Err(RpcError::protocol(format!(
            "malformed string: expected continuation byte, found {b:#04x}"
        ))),
        None => Err(RpcError::protocol("malformed string: truncated multi-byte sequence")),
    }
}
