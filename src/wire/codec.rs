//! Encoding primitives: big-endian fixed-width integers, unsigned varints,
//! and length-prefixed strings.
//!
//! Fixed fields are written big-endian. Varints use the protobuf layout:
//! little-endian groups of 7 bits, high bit set on every byte except the
//! last. A u64 never needs more than 10 bytes.

use crate::error::{Error, Result};
use std::io::{Read, Seek, Write};

/// Maximum encoded length of a u64 varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Append `value` as a varint at `buf[at..]` and return the offset past it.
/// The caller guarantees capacity; at most [`MAX_VARINT_LEN`] bytes are
/// written.
#[inline]
pub fn put_varint(buf: &mut [u8], mut at: usize, mut value: u64) -> usize {
    while value >= 0x80 {
        buf[at] = (value as u8) | 0x80;
        value >>= 7;
        at += 1;
    }
    buf[at] = value as u8;
    at + 1
}

/// Append `value` big-endian at `buf[at..]` and return the offset past it.
#[inline]
pub fn put_fixed32(buf: &mut [u8], at: usize, value: u32) -> usize {
    buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
    at + 4
}

pub fn write_varint<W: Write>(w: &mut W, value: u64) -> std::io::Result<()> {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let len = put_varint(&mut buf, 0, value);
    w.write_all(&buf[..len])
}

pub fn write_fixed32<W: Write>(w: &mut W, value: u32) -> std::io::Result<()> {
    w.write_all(&value.to_be_bytes())
}

pub fn write_fixed64<W: Write>(w: &mut W, value: u64) -> std::io::Result<()> {
    w.write_all(&value.to_be_bytes())
}

/// Write a string as varint length followed by its UTF-8 bytes.
pub fn write_string<W: Write>(w: &mut W, value: &str) -> std::io::Result<()> {
    write_varint(w, value.len() as u64)?;
    w.write_all(value.as_bytes())
}

pub fn read_fixed32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Like [`read_fixed32`] but returns `None` when the stream is already
/// exhausted, so callers can tell a clean end from a truncated record.
pub fn try_read_fixed32<R: Read>(r: &mut R) -> Result<Option<u32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        filled += n;
    }
    Ok(Some(u32::from_be_bytes(buf)))
}

pub fn read_fixed64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

/// Decode a varint. Performs one opportunistic read of up to
/// [`MAX_VARINT_LEN`] bytes and rewinds the stream past the bytes it did
/// not consume, so the stream position always lands exactly after the
/// terminating byte.
pub fn read_varint<R: Read + Seek>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let mut filled = 0;
    loop {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
        if buf[..filled].iter().any(|b| b & 0x80 == 0) || filled == MAX_VARINT_LEN {
            break;
        }
    }

    let mut value = 0u64;
    let mut pos = 0;
    while pos < filled {
        value |= ((buf[pos] & 0x7f) as u64) << (7 * pos);
        if buf[pos] & 0x80 == 0 {
            let unused = (filled - pos - 1) as i64;
            r.seek_relative(-unused)?;
            return Ok(value);
        }
        pos += 1;
    }

    if filled == MAX_VARINT_LEN {
        Err(Error::MalformedStream(
            "varint does not terminate within 10 bytes".into(),
        ))
    } else {
        Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()))
    }
}

/// Read a varint-length-prefixed UTF-8 string.
pub fn read_string<R: Read + Seek>(r: &mut R) -> Result<String> {
    let len = read_varint(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| Error::MalformedStream("string is not valid UTF-8".into()))
}
