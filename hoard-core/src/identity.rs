//! Node identity and key material: generated node namespace, symmetric
//! encryption key, network key hashing.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Length of the symmetric encryption key (AES-256).
pub const KEY_SIZE: usize = 32;

/// Per-node identifier. Used as the storage namespace so co-located nodes
/// sharing one storage root never see each other's files.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct NodeId(String);

impl NodeId {
    /// Generate a fresh random ID (uuid v4, 32 hex chars, no dashes).
    pub fn generate() -> Self {
        NodeId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Symmetric key consumed by the stream cipher. Read-only once built.
#[derive(Clone, Eq, PartialEq)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Generate a new random key from the OS RNG.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        EncryptionKey(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        EncryptionKey(bytes)
    }

    /// Parse a hex-encoded key (64 hex chars).
    pub fn from_hex(s: &str) -> Result<Self, KeyParseError> {
        let raw = hex::decode(s.trim())?;
        let bytes: [u8; KEY_SIZE] = raw
            .try_into()
            .map_err(|v: Vec<u8>| KeyParseError::Length(v.len()))?;
        Ok(EncryptionKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

// Never print key material.
impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyParseError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected 32 key bytes, got {0}")]
    Length(usize),
}

/// Hash a logical key into the name announced to peers (SHA-256, hex).
/// Replicas are stored under this name, never under the logical key.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_node_ids_differ() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn key_hex_roundtrip() {
        let key = EncryptionKey::generate();
        let parsed = EncryptionKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn key_rejects_wrong_length() {
        let err = EncryptionKey::from_hex("abcd").unwrap_err();
        assert!(matches!(err, KeyParseError::Length(2)));
        assert!(matches!(
            EncryptionKey::from_hex("zz").unwrap_err(),
            KeyParseError::Hex(_)
        ));
    }

    #[test]
    fn key_debug_is_redacted() {
        let key = EncryptionKey::from_bytes([7u8; KEY_SIZE]);
        assert_eq!(format!("{key:?}"), "EncryptionKey(..)");
    }

    #[test]
    fn hash_key_is_stable() {
        assert_eq!(hash_key("f"), hash_key("f"));
        assert_ne!(hash_key("f"), hash_key("g"));
        assert_eq!(hash_key("f").len(), 64);
    }
}
