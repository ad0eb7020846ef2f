//! Canonical, consensus-critical binary serialization.
//!
//! Fixed-width integers are big-endian. Variable-length integers use a
//! VLQ: MSB-first, 7 bits of value per byte, the high bit marks
//! continuation. Lists are `VLQ(len) || concat(serialize(item))`.
//! Every wire type implements both halves of the trait below; round
//! trip is required to be the identity on valid input.

use std::io::{self, Read, Write};

#[derive(Debug)]
pub enum SerializeError {
    /// Fewer bytes were available than the format requires.
    Truncated { wanted: usize, got: usize },
    /// The bytes were well-formed-length but violated a structural rule
    /// (bad type tag, out-of-range field, wrong version byte, ...).
    Invalid(String),
    Io(io::Error),
}

impl std::fmt::Display for SerializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerializeError::Truncated { wanted, got } => {
                write!(f, "truncated: wanted {wanted} bytes, got {got}")
            }
            SerializeError::Invalid(msg) => write!(f, "invalid encoding: {msg}"),
            SerializeError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for SerializeError {}

impl From<io::Error> for SerializeError {
    fn from(e: io::Error) -> Self {
        SerializeError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, SerializeError>;

/// Read exactly `n` bytes or fail with a truncation error.
pub fn safe_read<R: Read>(r: &mut R, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    let mut got = 0;
    while got < n {
        let read = r.read(&mut buf[got..])?;
        if read == 0 {
            return Err(SerializeError::Truncated { wanted: n, got });
        }
        got += read;
    }
    Ok(buf)
}

fn safe_read_array<R: Read, const N: usize>(r: &mut R) -> Result<[u8; N]> {
    let v = safe_read(r, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(&v);
    Ok(out)
}

pub fn read_u32_be<R: Read>(r: &mut R) -> Result<u32> {
    Ok(u32::from_be_bytes(safe_read_array(r)?))
}

pub fn write_u32_be<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}

pub fn read_u64_be<R: Read>(r: &mut R) -> Result<u64> {
    Ok(u64::from_be_bytes(safe_read_array(r)?))
}

pub fn write_u64_be<W: Write>(w: &mut W, v: u64) -> Result<()> {
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}

pub fn read_hash32<R: Read>(r: &mut R) -> Result<[u8; 32]> {
    safe_read_array(r)
}

pub fn write_hash32<W: Write>(w: &mut W, v: &[u8; 32]) -> Result<()> {
    w.write_all(v)?;
    Ok(())
}

/// Write a non-negative integer as a VLQ: MSB-first 7 bits per byte,
/// high bit set on every byte but the last.
pub fn write_vlq<W: Write>(w: &mut W, value: u64) -> Result<()> {
    // number of 7-bit groups needed, at least 1 (mirrors the source's
    // `(bit_length // 7) + 1`, which always rounds up for value == 0 too)
    let bits = 64 - value.leading_zeros() as usize;
    let groups = bits / 7 + 1;

    for j in (0..groups).rev() {
        let shift = j * 7;
        let chunk = ((value >> shift) & 0x7f) as u8;
        let byte = if j > 0 { chunk | 0x80 } else { chunk };
        w.write_all(&[byte])?;
    }
    Ok(())
}

pub fn read_vlq<R: Read>(r: &mut R) -> Result<u64> {
    let mut result: u64 = 0;
    loop {
        let b = safe_read(r, 1)?[0];
        result = result
            .checked_mul(128)
            .and_then(|v| v.checked_add((b & 0x7f) as u64))
            .ok_or_else(|| SerializeError::Invalid("VLQ overflow".into()))?;
        if b < 0x80 {
            return Ok(result);
        }
    }
}

/// A type with a canonical, consensus-critical byte encoding.
pub trait Wire: Sized {
    fn stream_serialize<W: Write>(&self, w: &mut W) -> Result<()>;
    fn stream_deserialize<R: Read>(r: &mut R) -> Result<Self>;

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.stream_serialize(&mut buf).expect("writing to Vec never fails");
        buf
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;
        Self::stream_deserialize(&mut cursor)
    }
}

pub fn stream_serialize_list<W: Write, T: Wire>(w: &mut W, items: &[T]) -> Result<()> {
    write_vlq(w, items.len() as u64)?;
    for item in items {
        item.stream_serialize(w)?;
    }
    Ok(())
}

pub fn stream_deserialize_list<R: Read, T: Wire>(r: &mut R) -> Result<Vec<T>> {
    let len = read_vlq(r)?;
    let mut out = Vec::with_capacity(len.min(1 << 20) as usize);
    for _ in 0..len {
        out.push(T::stream_deserialize(r)?);
    }
    Ok(out)
}

pub fn serialize_list<T: Wire>(items: &[T]) -> Vec<u8> {
    let mut buf = Vec::new();
    stream_serialize_list(&mut buf, items).expect("writing to Vec never fails");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_vlq(v: u64) {
        let mut buf = Vec::new();
        write_vlq(&mut buf, v).unwrap();
        let mut cursor = &buf[..];
        assert_eq!(read_vlq(&mut cursor).unwrap(), v);
    }

    #[test]
    fn vlq_roundtrip_small_and_large() {
        for v in [0u64, 1, 127, 128, 129, 16383, 16384, u32::MAX as u64, u64::MAX / 2] {
            roundtrip_vlq(v);
        }
    }

    #[test]
    fn vlq_zero_is_single_byte() {
        let mut buf = Vec::new();
        write_vlq(&mut buf, 0).unwrap();
        assert_eq!(buf, vec![0x00]);
    }

    #[test]
    fn safe_read_truncation_error() {
        let mut cursor: &[u8] = &[1, 2, 3];
        let err = safe_read(&mut cursor, 10).unwrap_err();
        assert!(matches!(err, SerializeError::Truncated { wanted: 10, got: 3 }));
    }

    #[test]
    fn fixed_width_ints_are_big_endian() {
        let mut buf = Vec::new();
        write_u32_be(&mut buf, 1).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 1]);
    }
}
