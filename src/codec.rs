//! Byte-level helpers shared by the peer wire and tracker codecs.

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

pub const HASH_LEN: usize = 20;

/// Outcome of decoding one frame from the front of a buffer.
///
/// `Incomplete` is not a failure: the caller keeps its bytes and retries once
/// more data has arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    Complete { value: T, consumed: usize },
    Incomplete,
    Invalid(String),
}

impl<T> Decoded<T> {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Decoded::Invalid(reason.into())
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Decoded<U> {
        match self {
            Decoded::Complete { value, consumed } => Decoded::Complete {
                value: f(value),
                consumed,
            },
            Decoded::Incomplete => Decoded::Incomplete,
            Decoded::Invalid(reason) => Decoded::Invalid(reason),
        }
    }

    /// The decoded value, if a full frame was present.
    pub fn complete(self) -> Option<T> {
        match self {
            Decoded::Complete { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, Decoded::Incomplete)
    }
}

pub fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    let bytes = buf.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

pub fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    let bytes = buf.get(at..at + 8)?;
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}

pub fn sha1(data: &[u8]) -> [u8; HASH_LEN] {
    Sha1::digest(data).into()
}

pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(sha1(data))
}

pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Parses a 40 character hex string into a 20 byte hash.
pub fn hash_from_hex(hex_str: &str) -> Result<[u8; HASH_LEN]> {
    if hex_str.len() != HASH_LEN * 2 {
        return Err(Error::invalid_argument(format!(
            "expected {} hex chars, got {}",
            HASH_LEN * 2,
            hex_str.len()
        )));
    }
    let mut hash = [0u8; HASH_LEN];
    hex::decode_to_slice(hex_str, &mut hash)
        .map_err(|e| Error::invalid_argument(format!("bad hex hash {hex_str:?}: {e}")))?;
    Ok(hash)
}
