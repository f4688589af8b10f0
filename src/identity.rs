//! # Identity and Addressing
//!
//! A node's durable identity is an Ed25519 keypair. The public key is
//! rendered as a self-describing textual [`Address`]: the literal prefix
//! `base58,` followed by the Base58Btc encoding of the 32 key bytes.
//!
//! Addresses compare by exact string equality and are the only peer
//! identifier that crosses the wire; routing positions are derived from the
//! address *text*, never from the raw key bytes.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Tag prefixing every textual address.
pub const ADDRESS_PREFIX: &str = "base58,";

/// Errors produced when parsing a textual address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address missing `base58,` prefix")]
    MissingPrefix,
    #[error("address body is not valid Base58Btc")]
    InvalidBody,
    #[error("address decodes to {0} bytes, expected 32")]
    WrongLength(usize),
}

/// Long-term Ed25519 signing keypair backing a node's identity.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The textual address derived from this keypair's public key.
    pub fn address(&self) -> Address {
        Address::from_public_key_bytes(&self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key
            .verifying_key()
            .verify(message, signature)
            .is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Self-describing textual peer identifier: `base58,` + Base58Btc(key bytes).
///
/// Stored in its full tagged form so equality, hashing, and position
/// derivation all operate on the exact wire representation.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    /// Build an address from raw 32-byte public key material.
    pub fn from_public_key_bytes(bytes: &[u8; 32]) -> Self {
        Self(format!("{}{}", ADDRESS_PREFIX, bs58::encode(bytes).into_string()))
    }

    /// Parse and validate a tagged textual address.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let body = s.strip_prefix(ADDRESS_PREFIX).ok_or(AddressError::MissingPrefix)?;
        let decoded = bs58::decode(body)
            .into_vec()
            .map_err(|_| AddressError::InvalidBody)?;
        if decoded.len() != 32 {
            return Err(AddressError::WrongLength(decoded.len()));
        }
        Ok(Self(s.to_string()))
    }

    /// Full tagged form, e.g. `base58,7Np2...`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The textual bytes hashed to derive this peer's routing position.
    pub fn position_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// The 32 public key bytes encoded in this address.
    pub fn key_bytes(&self) -> [u8; 32] {
        let body = &self.0[ADDRESS_PREFIX.len()..];
        // Construction and parsing both enforce a 32-byte body.
        let decoded = bs58::decode(body).into_vec().unwrap_or_default();
        let mut out = [0u8; 32];
        if decoded.len() == 32 {
            out.copy_from_slice(&decoded);
        }
        out
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        let end = (ADDRESS_PREFIX.len() + 8).min(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", self.short())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::parse(&s).map_err(serde::de::Error::custom)
    }
}
