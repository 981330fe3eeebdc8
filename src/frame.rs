//! Frame codec for named maps
//!
//! Every map holds a single frame:
//!
//! ```text
//! offset 0 : u32 little-endian payload length
//! offset 4 : payload bytes; anything past the length is stale
//! ```
//!
//! The frame carries no type tag. Writer and reader agree out of band on how
//! a map's payload is interpreted; the decoders here reject byte counts that
//! cannot belong to the requested type so a mismatch surfaces as
//! [`MapError::CorruptFrame`] rather than garbage.
//!
//! Numeric elements are fixed-width little-endian. Text is UTF-8 followed by
//! one NUL byte, and that terminator is counted in the payload length.

use crate::error::{MapError, Result};

/// Size of the length prefix
pub const LEN_PREFIX: usize = 4;

/// Trailing byte of every text payload
pub const TEXT_TERMINATOR: u8 = 0;

/// Fixed-width element that can be packed into a payload
pub trait Scalar: Copy + Sized {
    /// Encoded width in bytes
    const WIDTH: usize;

    /// Append the little-endian encoding of `self`
    fn put(self, out: &mut Vec<u8>);

    /// Decode from exactly `WIDTH` bytes
    fn get(bytes: &[u8]) -> Self;
}

macro_rules! impl_scalar {
    ($($t:ty),*) => {$(
        impl Scalar for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();

            #[inline]
            fn put(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn get(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(&bytes[..Self::WIDTH]);
                <$t>::from_le_bytes(raw)
            }
        }
    )*};
}

impl_scalar!(u8, i32, f32, f64);

/// Pack a slice of scalars back to back
pub fn encode_scalars<T: Scalar>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::WIDTH);
    for &v in values {
        v.put(&mut out);
    }
    out
}

/// Unpack scalars; the byte count must be a whole number of elements
pub fn decode_scalars<T: Scalar>(bytes: &[u8]) -> Result<Vec<T>> {
    if bytes.len() % T::WIDTH != 0 {
        return Err(MapError::corrupt(format!(
            "{} bytes is not a multiple of the {}-byte element width",
            bytes.len(),
            T::WIDTH
        )));
    }
    Ok(bytes.chunks_exact(T::WIDTH).map(T::get).collect())
}

/// Text payload: the UTF-8 bytes plus the terminator
pub fn encode_text(text: &str) -> Result<Vec<u8>> {
    if text.as_bytes().contains(&TEXT_TERMINATOR) {
        return Err(MapError::Encode {
            reason: "text contains an interior NUL byte",
        });
    }
    let mut out = Vec::with_capacity(text.len() + 1);
    out.extend_from_slice(text.as_bytes());
    out.push(TEXT_TERMINATOR);
    Ok(out)
}

/// Decode a text payload; an empty payload is empty text
pub fn decode_text(bytes: &[u8]) -> Result<String> {
    let Some((&last, body)) = bytes.split_last() else {
        return Ok(String::new());
    };
    if last != TEXT_TERMINATOR {
        return Err(MapError::corrupt("text payload is not NUL-terminated"));
    }
    if body.contains(&TEXT_TERMINATOR) {
        return Err(MapError::corrupt("text payload has an interior NUL byte"));
    }
    String::from_utf8(body.to_vec()).map_err(|_| MapError::corrupt("text payload is not valid UTF-8"))
}

/// Length prefix followed by `payload`
pub fn encode_length_prefixed(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| MapError::Encode {
        reason: "payload length does not fit in the u32 prefix",
    })?;
    let mut out = Vec::with_capacity(LEN_PREFIX + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Read the payload length from a frame prefix
#[inline]
pub fn decode_prefix(prefix: [u8; LEN_PREFIX]) -> usize {
    u32::from_le_bytes(prefix) as usize
}

/// Split a frame buffer into its payload
///
/// Bytes after the payload are ignored.
pub fn decode(buffer: &[u8]) -> Result<&[u8]> {
    let Some((prefix, rest)) = buffer.split_first_chunk::<LEN_PREFIX>() else {
        return Err(MapError::corrupt(format!(
            "buffer of {} bytes is shorter than the length prefix",
            buffer.len()
        )));
    };
    let len = decode_prefix(*prefix);
    rest.get(..len).ok_or_else(|| {
        MapError::corrupt(format!(
            "payload length {} exceeds the {} bytes available",
            len,
            rest.len()
        ))
    })
}

/// Interpretation a caller applies to a map's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Bytes,
    Ints,
    Floats,
    Doubles,
    Text,
}

impl PayloadKind {
    /// Width of one element in bytes
    pub fn element_width(self) -> usize {
        match self {
            PayloadKind::Bytes | PayloadKind::Text => 1,
            PayloadKind::Ints => i32::WIDTH,
            PayloadKind::Floats => f32::WIDTH,
            PayloadKind::Doubles => f64::WIDTH,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PayloadKind::Bytes => "bytes",
            PayloadKind::Ints => "ints",
            PayloadKind::Floats => "floats",
            PayloadKind::Doubles => "doubles",
            PayloadKind::Text => "text",
        }
    }
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payload together with the type it is read or written as
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Ints(Vec<i32>),
    Floats(Vec<f32>),
    Doubles(Vec<f64>),
    Text(String),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Bytes(_) => PayloadKind::Bytes,
            Payload::Ints(_) => PayloadKind::Ints,
            Payload::Floats(_) => PayloadKind::Floats,
            Payload::Doubles(_) => PayloadKind::Doubles,
            Payload::Text(_) => PayloadKind::Text,
        }
    }

    /// Payload bytes as stored after the length prefix
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Payload::Bytes(v) => v.clone(),
            Payload::Ints(v) => encode_scalars(v),
            Payload::Floats(v) => encode_scalars(v),
            Payload::Doubles(v) => encode_scalars(v),
            Payload::Text(s) => encode_text(s)?,
        })
    }

    /// Interpret payload bytes as `kind`
    pub fn decode(kind: PayloadKind, bytes: &[u8]) -> Result<Self> {
        Ok(match kind {
            PayloadKind::Bytes => Payload::Bytes(bytes.to_vec()),
            PayloadKind::Ints => Payload::Ints(decode_scalars(bytes)?),
            PayloadKind::Floats => Payload::Floats(decode_scalars(bytes)?),
            PayloadKind::Doubles => Payload::Doubles(decode_scalars(bytes)?),
            PayloadKind::Text => Payload::Text(decode_text(bytes)?),
        })
    }

    /// Number of elements (characters' bytes for text, excluding the terminator)
    pub fn len(&self) -> usize {
        match self {
            Payload::Bytes(v) => v.len(),
            Payload::Ints(v) => v.len(),
            Payload::Floats(v) => v.len(),
            Payload::Doubles(v) => v.len(),
            Payload::Text(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Payload::Bytes(v)
    }
}

impl From<Vec<i32>> for Payload {
    fn from(v: Vec<i32>) -> Self {
        Payload::Ints(v)
    }
}

impl From<Vec<f32>> for Payload {
    fn from(v: Vec<f32>) -> Self {
        Payload::Floats(v)
    }
}

impl From<Vec<f64>> for Payload {
    fn from(v: Vec<f64>) -> Self {
        Payload::Doubles(v)
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}
