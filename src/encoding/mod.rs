//! Byte-stable binary encoding for everything the engine persists.
//!
//! Log record payloads, node images and checkpoint metadata are serialized
//! with the [`Encode`] / [`Decode`] traits below instead of an external
//! serialization crate, so the on-disk format can never drift under a
//! dependency upgrade.
//!
//! # Wire format
//!
//! | Type              | Encoding                                     |
//! |-------------------|----------------------------------------------|
//! | `u8`              | 1 byte                                       |
//! | `u32`             | 4 bytes, little-endian                       |
//! | `u64`             | 8 bytes, little-endian                       |
//! | `i64`             | 8 bytes, little-endian                       |
//! | `bool`            | 1 byte (`0x00` / `0x01`)                     |
//! | `[u8; N]`         | `N` raw bytes, no length prefix              |
//! | `Vec<u8>` / bytes | `[u32 len][bytes]`                           |
//! | `String`          | `[u32 len][utf-8 bytes]`                     |
//! | `Option<T>`       | `[u8 tag: 0=None, 1=Some][T if Some]`        |
//! | sequences         | `[u32 count][T₁][T₂]…` via [`encode_seq`]    |
//! | enums             | `[u8 tag][fields…]` (hand-written per type)  |
//!
//! One deliberate exception: *keys that must sort bytewise* (the file-number
//! key of a file-summary record) are written big-endian by their owning
//! module, so byte order equals numeric order.
//!
//! # Safety limits
//!
//! Decoders bound every length they read ([`MAX_BYTES`], [`MAX_ITEMS`]) so a
//! corrupt or truncated record can never trigger an allocation bomb. No code
//! in this module panics; all failures are [`EncodingError`].

#[cfg(test)]
mod tests;

use thiserror::Error;

/// Upper bound for a single decoded byte string (64 MiB).
///
/// Record payloads are far smaller in practice; anything above this is
/// treated as corruption rather than an allocation request.
pub const MAX_BYTES: u32 = 64 * 1024 * 1024;

/// Upper bound for a decoded sequence's element count (1 M).
pub const MAX_ITEMS: u32 = 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced while encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ended before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEnd {
        /// Bytes required to continue.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// An enum or `Option` tag was not recognised.
    #[error("invalid tag {tag} for {type_name}")]
    InvalidTag {
        /// The tag byte that was read.
        tag: u8,
        /// The type being decoded.
        type_name: &'static str,
    },

    /// A bool field held a byte other than `0x00` or `0x01`.
    #[error("invalid bool byte 0x{0:02X}")]
    InvalidBool(u8),

    /// A decoded string was not valid UTF-8.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A length or count exceeded its safety limit (or `u32::MAX`).
    #[error("length out of range: {0}")]
    LengthOutOfRange(String),
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// Serialize `self` by appending to a byte buffer.
///
/// Implementations must be deterministic: the same logical value always
/// produces the same bytes.
pub trait Encode {
    /// Append the encoded representation of `self` to `out`.
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from the front of a byte slice.
///
/// Returns `(value, bytes_consumed)` so callers can walk a buffer holding
/// several encoded items.
pub trait Decode: Sized {
    /// Decode one value starting at `buf[0]`.
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

// ------------------------------------------------------------------------------------------------
// Convenience helpers
// ------------------------------------------------------------------------------------------------

/// Encode a value into a fresh `Vec<u8>`.
pub fn to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut out = Vec::new();
    value.encode(&mut out)?;
    Ok(out)
}

/// Decode a value from the beginning of `buf`; returns `(value, consumed)`.
pub fn from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode(buf)
}

#[inline]
fn need(buf: &[u8], n: usize) -> Result<(), EncodingError> {
    if buf.len() < n {
        Err(EncodingError::UnexpectedEnd {
            needed: n,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

#[inline]
fn len_u32(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len)
        .map_err(|_| EncodingError::LengthOutOfRange(format!("length {len} exceeds u32::MAX")))
}

// ------------------------------------------------------------------------------------------------
// Integers and bool
// ------------------------------------------------------------------------------------------------

impl Encode for u8 {
    #[inline]
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        out.push(*self);
        Ok(())
    }
}

impl Decode for u8 {
    #[inline]
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        need(buf, 1)?;
        Ok((buf[0], 1))
    }
}

impl Encode for u32 {
    #[inline]
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        out.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u32 {
    #[inline]
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        need(buf, 4)?;
        let mut b = [0u8; 4];
        b.copy_from_slice(&buf[..4]);
        Ok((u32::from_le_bytes(b), 4))
    }
}

impl Encode for u64 {
    #[inline]
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        out.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u64 {
    #[inline]
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        need(buf, 8)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(&buf[..8]);
        Ok((u64::from_le_bytes(b), 8))
    }
}

impl Encode for i64 {
    #[inline]
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        out.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for i64 {
    #[inline]
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        need(buf, 8)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(&buf[..8]);
        Ok((i64::from_le_bytes(b), 8))
    }
}

impl Encode for bool {
    #[inline]
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        out.push(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    #[inline]
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        need(buf, 1)?;
        match buf[0] {
            0 => Ok((false, 1)),
            1 => Ok((true, 1)),
            other => Err(EncodingError::InvalidBool(other)),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Fixed-size byte arrays
// ------------------------------------------------------------------------------------------------

impl<const N: usize> Encode for [u8; N] {
    #[inline]
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        out.extend_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    #[inline]
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        need(buf, N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(&buf[..N]);
        Ok((arr, N))
    }
}

// ------------------------------------------------------------------------------------------------
// Length-prefixed byte strings
// ------------------------------------------------------------------------------------------------

impl Encode for Vec<u8> {
    #[inline]
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        len_u32(self.len())?.encode(out)?;
        out.extend_from_slice(self);
        Ok(())
    }
}

impl Decode for Vec<u8> {
    #[inline]
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (len, mut at) = u32::decode(buf)?;
        if len > MAX_BYTES {
            return Err(EncodingError::LengthOutOfRange(format!(
                "byte string length {len} exceeds MAX_BYTES ({MAX_BYTES})"
            )));
        }
        let len = len as usize;
        need(&buf[at..], len)?;
        let data = buf[at..at + len].to_vec();
        at += len;
        Ok((data, at))
    }
}

impl Encode for &[u8] {
    #[inline]
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        len_u32(self.len())?.encode(out)?;
        out.extend_from_slice(self);
        Ok(())
    }
}

impl Encode for String {
    #[inline]
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_bytes().encode(out)
    }
}

impl Decode for String {
    #[inline]
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (raw, consumed) = Vec::<u8>::decode(buf)?;
        Ok((String::from_utf8(raw)?, consumed))
    }
}

impl Encode for &str {
    #[inline]
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_bytes().encode(out)
    }
}

// ------------------------------------------------------------------------------------------------
// Option<T>
// ------------------------------------------------------------------------------------------------

impl<T: Encode> Encode for Option<T> {
    #[inline]
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            None => out.push(0),
            Some(v) => {
                out.push(1);
                v.encode(out)?;
            }
        }
        Ok(())
    }
}

impl<T: Decode> Decode for Option<T> {
    #[inline]
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        need(buf, 1)?;
        match buf[0] {
            0 => Ok((None, 1)),
            1 => {
                let (v, consumed) = T::decode(&buf[1..])?;
                Ok((Some(v), 1 + consumed))
            }
            tag => Err(EncodingError::InvalidTag {
                tag,
                type_name: "Option<T>",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Sequences: [u32 count][T₁][T₂]…
//
// `Vec<u8>` has the raw-bytes impl above; coherence prevents a blanket
// `Vec<T>` impl from coexisting with it, so sequences of structs go through
// these free functions.
// ------------------------------------------------------------------------------------------------

/// Encode a slice of `T` as `[u32 count][T₁][T₂]…`.
pub fn encode_seq<T: Encode>(items: &[T], out: &mut Vec<u8>) -> Result<(), EncodingError> {
    len_u32(items.len())?.encode(out)?;
    for item in items {
        item.encode(out)?;
    }
    Ok(())
}

/// Decode a `Vec<T>` written by [`encode_seq`]; element count capped at
/// [`MAX_ITEMS`].
pub fn decode_seq<T: Decode>(buf: &[u8]) -> Result<(Vec<T>, usize), EncodingError> {
    let (count, mut at) = u32::decode(buf)?;
    if count > MAX_ITEMS {
        return Err(EncodingError::LengthOutOfRange(format!(
            "sequence count {count} exceeds MAX_ITEMS ({MAX_ITEMS})"
        )));
    }
    let count = count as usize;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let (item, n) = T::decode(&buf[at..])?;
        at += n;
        items.push(item);
    }
    Ok((items, at))
}
