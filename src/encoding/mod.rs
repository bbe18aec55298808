//! Hand-written binary codec shared by rows and SSTable blocks.
//!
//! Every on-disk structure implements [`Encode`] and [`Decode`] itself, so
//! the byte layout is owned by this crate and stays stable across
//! dependency upgrades. Compaction relies on that: an echoed row is copied
//! between tables byte for byte and must decode identically afterwards.
//!
//! # Layout
//!
//! Fixed-width integers (`u8`, `u32`, `u64`, `i64`) are little-endian.
//! `[u8; N]` is written raw. Byte strings and `String` carry a `u32`
//! length prefix, `Option<T>` a one-byte presence tag (`0` or `1`), and
//! sequences of structs a `u32` element count (see [`encode_vec`]).
//! Enums pick their own tag byte.
//!
//! # Limits
//!
//! A damaged length prefix must fail as an error, never as a huge
//! allocation: byte strings longer than [`MAX_BYTE_LEN`] and sequences
//! longer than [`MAX_VEC_ELEMENTS`] are rejected while decoding.

#[cfg(test)]
mod tests;

use thiserror::Error;

/// Longest byte string or `String` a decoder accepts (256 MiB).
pub const MAX_BYTE_LEN: u32 = 256 * 1024 * 1024;

/// Longest sequence [`decode_vec`] accepts.
pub const MAX_VEC_ELEMENTS: u32 = 16 * 1024 * 1024;

/// Decoding and encoding failures.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// Input ended in the middle of a value.
    #[error("truncated input: wanted {needed} bytes, {available} left")]
    UnexpectedEof {
        /// Bytes the current value needs.
        needed: usize,
        /// Bytes left in the input.
        available: usize,
    },

    /// Unknown discriminant byte.
    #[error("unknown tag {tag} while decoding {type_name}")]
    InvalidTag {
        /// Tag read from the input.
        tag: u32,
        /// Type being decoded.
        type_name: &'static str,
    },

    /// Bytes decoded as a `String` were not UTF-8.
    #[error("string is not UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A length or count is out of range.
    #[error("length out of range: {0}")]
    LengthOverflow(String),

    /// Well-formed bytes describing an impossible value.
    #[error("invalid value: {0}")]
    Invalid(String),
}

/// Appends a value's encoding to a buffer. Equal values encode to equal
/// bytes.
pub trait Encode {
    /// Writes `self` at the end of `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Reads a value from the front of a slice.
pub trait Decode: Sized {
    /// Returns the value and how many bytes of `buf` it took.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

/// Encodes `value` into a new buffer.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decodes a `T` from the front of `buf`.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode_from(buf)
}

/// Decodes a `T` at `*offset` and moves the offset past it.
#[inline]
pub fn decode_at<T: Decode>(buf: &[u8], offset: &mut usize) -> Result<T, EncodingError> {
    let rest = buf.get(*offset..).ok_or(EncodingError::UnexpectedEof {
        needed: *offset,
        available: buf.len(),
    })?;
    let (value, n) = T::decode_from(rest)?;
    *offset += n;
    Ok(value)
}

/// The first `n` bytes of `buf`.
#[inline]
fn take(buf: &[u8], n: usize) -> Result<&[u8], EncodingError> {
    buf.get(..n).ok_or(EncodingError::UnexpectedEof {
        needed: n,
        available: buf.len(),
    })
}

#[inline]
pub(crate) fn len_to_u32(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len).map_err(|_| EncodingError::LengthOverflow(format!("{len} does not fit in 32 bits")))
}

// ------------------------------------------------------------------------------------------------
// Fixed-width values
// ------------------------------------------------------------------------------------------------

macro_rules! fixed_width {
    ($($ty:ty),* $(,)?) => {$(
        impl Encode for $ty {
            #[inline]
            fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
                buf.extend_from_slice(&self.to_le_bytes());
                Ok(())
            }
        }

        impl Decode for $ty {
            #[inline]
            fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
                const WIDTH: usize = std::mem::size_of::<$ty>();
                let (bytes, _) = <[u8; WIDTH]>::decode_from(buf)?;
                Ok((<$ty>::from_le_bytes(bytes), WIDTH))
            }
        }
    )*};
}

fixed_width!(u8, u32, u64, i64);

impl<const N: usize> Encode for [u8; N] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut out = [0u8; N];
        out.copy_from_slice(take(buf, N)?);
        Ok((out, N))
    }
}

// ------------------------------------------------------------------------------------------------
// Length-prefixed values
// ------------------------------------------------------------------------------------------------

impl Encode for &[u8] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        len_to_u32(self.len())?.encode_to(buf)?;
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Encode for Vec<u8> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_slice().encode_to(buf)
    }
}

impl Decode for Vec<u8> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (len, prefix) = u32::decode_from(buf)?;
        if len > MAX_BYTE_LEN {
            return Err(EncodingError::LengthOverflow(format!(
                "byte string of {len} bytes, limit is {MAX_BYTE_LEN}"
            )));
        }
        let body = take(&buf[prefix..], len as usize)?;
        Ok((body.to_vec(), prefix + body.len()))
    }
}

impl Encode for String {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_bytes().encode_to(buf)
    }
}

impl Decode for String {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (bytes, n) = Vec::<u8>::decode_from(buf)?;
        Ok((String::from_utf8(bytes)?, n))
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Some(value) => {
                1u8.encode_to(buf)?;
                value.encode_to(buf)
            }
            None => 0u8.encode_to(buf),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let value = match decode_at::<u8>(buf, &mut off)? {
            0 => None,
            1 => Some(decode_at::<T>(buf, &mut off)?),
            tag => {
                return Err(EncodingError::InvalidTag {
                    tag: u32::from(tag),
                    type_name: "Option",
                });
            }
        };
        Ok((value, off))
    }
}

// ------------------------------------------------------------------------------------------------
// Sequences
//
// `Vec<u8>` is a byte string, so a blanket `Vec<T>` impl would overlap it;
// sequences of structs use these functions instead.
// ------------------------------------------------------------------------------------------------

/// Writes `items` as a `u32` count followed by each item.
pub fn encode_vec<T: Encode>(items: &[T], buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    len_to_u32(items.len())?.encode_to(buf)?;
    items.iter().try_for_each(|item| item.encode_to(buf))
}

/// Reads a sequence written by [`encode_vec`].
pub fn decode_vec<T: Decode>(buf: &[u8]) -> Result<(Vec<T>, usize), EncodingError> {
    let mut off = 0;
    let count = decode_at::<u32>(buf, &mut off)?;
    if count > MAX_VEC_ELEMENTS {
        return Err(EncodingError::LengthOverflow(format!(
            "sequence of {count} elements, limit is {MAX_VEC_ELEMENTS}"
        )));
    }
    // Never reserve more than the input could possibly describe.
    let mut items = Vec::with_capacity((count as usize).min(buf.len()));
    for _ in 0..count {
        items.push(decode_at::<T>(buf, &mut off)?);
    }
    Ok((items, off))
}
