//! SHA-256 digest newtypes used throughout the upload core.
//!
//! Every hash is tagged SHA-256: the hasher is seeded with an ASCII role tag
//! before any content bytes, so a ciphertext-leaf hash can never collide with
//! a share-hash-chain entry even if the underlying bytes happened to
//! coincide.

use data_encoding::{BASE32, HEXLOWER};
use sha2::{Digest as _, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Length in bytes of a full SHA-256 digest.
pub const SHA256_LEN: usize = 32;

/// Length in bytes of the storage index and of the AES-128 content key.
pub const SI_LEN: usize = 16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid digest length: expected {expected}, got {actual}")]
    InvalidLen { expected: usize, actual: usize },
}

/// A full 32-byte tagged SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha256Digest([u8; SHA256_LEN]);

impl Sha256Digest {
    pub fn as_bytes(&self) -> &[u8; SHA256_LEN] {
        &self.0
    }

    /// Hash `tag || data` with SHA-256. The tag provides domain separation
    /// between hash roles (plaintext leaves, ciphertext leaves, share hash
    /// chain entries, UEB hash, secrets).
    pub fn tagged(tag: &[u8], data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(tag);
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Hash the concatenation of two already-tagged digests, itself tagged.
    /// Used to build the interior nodes of a Merkle tree.
    pub fn tagged_pair(tag: &[u8], left: &Self, right: &Self) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(tag);
        hasher.update(left.as_bytes());
        hasher.update(right.as_bytes());
        Self(hasher.finalize().into())
    }
}

impl std::fmt::Debug for Sha256Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sha256Digest({})", HEXLOWER.encode(&self.0))
    }
}

impl From<[u8; SHA256_LEN]> for Sha256Digest {
    fn from(value: [u8; SHA256_LEN]) -> Self {
        Self(value)
    }
}

impl From<Sha256Digest> for [u8; SHA256_LEN] {
    fn from(value: Sha256Digest) -> Self {
        value.0
    }
}

impl TryFrom<&[u8]> for Sha256Digest {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != SHA256_LEN {
            return Err(Error::InvalidLen {
                expected: SHA256_LEN,
                actual: value.len(),
            });
        }
        let mut buf = [0u8; SHA256_LEN];
        buf.copy_from_slice(value);
        Ok(Self(buf))
    }
}

/// A 128-bit content-addressed storage index: `SHA-256(AES key)` truncated
/// to its first 16 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageIndex([u8; SI_LEN]);

impl StorageIndex {
    /// Derive the storage index from the content key.
    pub fn from_key(key: &AesKey) -> Self {
        let full = Sha256Digest::tagged(b"tahoe-grid-si\x00", key.as_bytes());
        let mut buf = [0u8; SI_LEN];
        buf.copy_from_slice(&full.as_bytes()[..SI_LEN]);
        Self(buf)
    }

    pub fn as_bytes(&self) -> &[u8; SI_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for StorageIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SI({})", BASE32.encode(&self.0))
    }
}

impl TryFrom<&[u8]> for StorageIndex {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != SI_LEN {
            return Err(Error::InvalidLen {
                expected: SI_LEN,
                actual: value.len(),
            });
        }
        let mut buf = [0u8; SI_LEN];
        buf.copy_from_slice(value);
        Ok(Self(buf))
    }
}

/// A 128-bit AES content key, either random or convergently derived from
/// the plaintext and file parameters. Compared in constant time so that
/// key-matching logic can't leak key material through timing.
#[derive(Clone)]
pub struct AesKey([u8; SI_LEN]);

impl AesKey {
    pub fn from_bytes(bytes: [u8; SI_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SI_LEN] {
        &self.0
    }
}

impl PartialEq for AesKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for AesKey {}

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "AesKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_hash_is_domain_separated() {
        let a = Sha256Digest::tagged(b"tag-a", b"data");
        let b = Sha256Digest::tagged(b"tag-b", b"data");
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn storage_index_is_deterministic() {
        let key = AesKey::from_bytes([7u8; SI_LEN]);
        let si1 = StorageIndex::from_key(&key);
        let si2 = StorageIndex::from_key(&key);
        assert_eq!(si1.as_bytes(), si2.as_bytes());
    }
}
