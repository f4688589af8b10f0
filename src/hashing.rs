//! # Hashing and Digests
//!
//! All content addressing uses 32-byte digests. Blake2b-256 (plain and
//! keyed) covers content positions and request stamps; Blake3 is reserved
//! for metadata routing so inbox indices live in a keyspace disjoint from
//! stored content.
//!
//! A [`Digest`] crosses the wire as a tagged string: the literal prefix
//! `base64,` followed by the standard Base64 encoding of the 32 bytes.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use blake2::digest::consts::U32;
use blake2::digest::{Digest as _, Mac};
use blake2::{Blake2b, Blake2bMac};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

type Blake2b256 = Blake2b<U32>;
type Blake2bMac256 = Blake2bMac<U32>;

/// Length of every digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Tag prefixing every textual digest.
pub const DIGEST_PREFIX: &str = "base64,";

/// Errors produced when parsing a textual digest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DigestError {
    #[error("digest missing `base64,` prefix")]
    MissingPrefix,
    #[error("digest body is not valid Base64")]
    InvalidBody,
    #[error("digest decodes to {0} bytes, expected 32")]
    WrongLength(usize),
}

/// A 32-byte hash value with a tagged textual form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Full tagged form, e.g. `base64,3q2+7w...`.
    pub fn tagged(&self) -> String {
        format!("{}{}", DIGEST_PREFIX, BASE64.encode(self.0))
    }

    /// Parse and validate a tagged textual digest.
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        let body = s.strip_prefix(DIGEST_PREFIX).ok_or(DigestError::MissingPrefix)?;
        let decoded = BASE64.decode(body).map_err(|_| DigestError::InvalidBody)?;
        if decoded.len() != DIGEST_LEN {
            return Err(DigestError::WrongLength(decoded.len()));
        }
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&decoded);
        Ok(Self(out))
    }

    /// Abbreviated hex form for log lines.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.tagged())
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", self.short_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.tagged())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Blake2b-256 of `data`.
pub fn blake2b(data: &[u8]) -> Digest {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    Digest(hasher.finalize().into())
}

/// Keyed Blake2b-256 of `data` under `key` (at most 64 key bytes).
pub fn blake2b_keyed(key: &[u8], data: &[u8]) -> Digest {
    let mut mac =
        Blake2bMac256::new_from_slice(key).expect("blake2b key must be at most 64 bytes");
    Mac::update(&mut mac, data);
    Digest(mac.finalize().into_bytes().into())
}

/// Blake3 of `data`. Used for metadata routing only.
pub fn blake3(data: &[u8]) -> Digest {
    Digest(*::blake3::hash(data).as_bytes())
}
