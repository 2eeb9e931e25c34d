//! Read capabilities and the URI extension block (UEB).
//!
//! The capability is the thing an uploader gets back: everything needed to
//! find and decrypt the file, packed into one base32 string. The UEB is
//! the small, append-once metadata block every share carries a copy of —
//! its hash is baked into the capability so the downloader can tell a
//! tampered UEB from the real one before trusting anything else in it.

use data_encoding::BASE32;
use thiserror::Error;

use crate::digests::{AesKey, Sha256Digest, StorageIndex, SI_LEN};

const TAG_UEB: &[u8] = b"tahoe-grid-ueb\x00";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("malformed capability string")]
    Malformed,
    #[error("unsupported capability kind {0:?}")]
    UnsupportedKind(String),
    #[error(transparent)]
    Digest(#[from] crate::digests::Error),
}

/// The canonical, order-independent metadata every share carries a copy
/// of. Serialized as `key:value` lines sorted by key before hashing or
/// writing to a bucket, so two encoders never disagree on its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriExtensionBlock {
    pub size: u64,
    pub segment_size: u64,
    pub num_segments: u64,
    pub k: u16,
    pub n: u16,
    pub tail_segment_size: u64,
    /// Shard shape (`k-n-segment_len-shard_len`) shared by every
    /// full-sized segment.
    pub codec_params: String,
    /// Shard shape for the final, possibly shorter, segment.
    pub tail_codec_params: String,
    pub crypttext_hash: Sha256Digest,
    pub crypttext_root_hash: Sha256Digest,
    pub share_root_hash: Sha256Digest,
}

impl UriExtensionBlock {
    /// Canonical serialization: one `key:value\n` line per field, keys in
    /// lexicographic order, hex for hashes, decimal for integers.
    pub fn serialize(&self) -> Vec<u8> {
        let mut fields = vec![
            ("codec_name".to_string(), "crs".to_string()),
            ("codec_params".to_string(), self.codec_params.clone()),
            ("tail_codec_params".to_string(), self.tail_codec_params.clone()),
            ("crypttext_hash".to_string(), hex(self.crypttext_hash.as_bytes())),
            (
                "crypttext_root_hash".to_string(),
                hex(self.crypttext_root_hash.as_bytes()),
            ),
            ("k".to_string(), self.k.to_string()),
            ("n".to_string(), self.n.to_string()),
            ("num_segments".to_string(), self.num_segments.to_string()),
            ("segment_size".to_string(), self.segment_size.to_string()),
            (
                "share_root_hash".to_string(),
                hex(self.share_root_hash.as_bytes()),
            ),
            ("size".to_string(), self.size.to_string()),
            (
                "tail_segment_size".to_string(),
                self.tail_segment_size.to_string(),
            ),
        ];
        fields.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Vec::new();
        for (k, v) in fields {
            out.extend_from_slice(k.as_bytes());
            out.push(b':');
            out.extend_from_slice(v.as_bytes());
            out.push(b'\n');
        }
        out
    }

    pub fn hash(&self) -> Sha256Digest {
        Sha256Digest::tagged(TAG_UEB, &self.serialize())
    }
}

fn hex(bytes: &[u8]) -> String {
    data_encoding::HEXLOWER.encode(bytes)
}

/// Everything needed to locate, reconstruct, and decrypt an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCapability {
    pub storage_index: StorageIndex,
    pub read_key: AesKey,
    pub ueb_hash: Sha256Digest,
    pub k: u16,
    pub n: u16,
    pub size: u64,
}

/// Everything needed to verify an upload's integrity, but not decrypt it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyCapability {
    pub storage_index: StorageIndex,
    pub ueb_hash: Sha256Digest,
    pub k: u16,
    pub n: u16,
    pub size: u64,
}

impl ReadCapability {
    pub fn to_verify_capability(&self) -> VerifyCapability {
        VerifyCapability {
            storage_index: self.storage_index,
            ueb_hash: self.ueb_hash,
            k: self.k,
            n: self.n,
            size: self.size,
        }
    }
}

impl std::fmt::Display for ReadCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "URI:CHK:{}:{}:{}:{}:{}",
            BASE32.encode(self.read_key.as_bytes()),
            BASE32.encode(self.ueb_hash.as_bytes()),
            self.k,
            self.n,
            self.size,
        )
    }
}

impl std::str::FromStr for ReadCapability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        if parts.next() != Some("URI") {
            return Err(Error::Malformed);
        }
        let kind = parts.next().ok_or(Error::Malformed)?;
        if kind != "CHK" {
            return Err(Error::UnsupportedKind(kind.to_string()));
        }
        let key_b32 = parts.next().ok_or(Error::Malformed)?;
        let ueb_hash_b32 = parts.next().ok_or(Error::Malformed)?;
        let k: u16 = parts.next().ok_or(Error::Malformed)?.parse().map_err(|_| Error::Malformed)?;
        let n: u16 = parts.next().ok_or(Error::Malformed)?.parse().map_err(|_| Error::Malformed)?;
        let size: u64 = parts.next().ok_or(Error::Malformed)?.parse().map_err(|_| Error::Malformed)?;
        if parts.next().is_some() {
            return Err(Error::Malformed);
        }

        let key_bytes = BASE32.decode(key_b32.as_bytes()).map_err(|_| Error::Malformed)?;
        if key_bytes.len() != SI_LEN {
            return Err(Error::Malformed);
        }
        let mut key = [0u8; SI_LEN];
        key.copy_from_slice(&key_bytes);
        let read_key = AesKey::from_bytes(key);
        let storage_index = StorageIndex::from_key(&read_key);

        let ueb_hash_bytes = BASE32.decode(ueb_hash_b32.as_bytes()).map_err(|_| Error::Malformed)?;
        let ueb_hash = Sha256Digest::try_from(ueb_hash_bytes.as_slice())?;

        Ok(ReadCapability {
            storage_index,
            read_key,
            ueb_hash,
            k,
            n,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ueb() -> UriExtensionBlock {
        UriExtensionBlock {
            size: 1000,
            segment_size: 128 * 1024,
            num_segments: 1,
            k: 3,
            n: 10,
            tail_segment_size: 1000,
            codec_params: "3-10-131072-43691".to_string(),
            tail_codec_params: "3-10-1000-334".to_string(),
            crypttext_hash: Sha256Digest::tagged(b"t1", b"a"),
            crypttext_root_hash: Sha256Digest::tagged(b"t2", b"b"),
            share_root_hash: Sha256Digest::tagged(b"t3", b"c"),
        }
    }

    #[test]
    fn ueb_hash_is_deterministic() {
        assert_eq!(ueb().hash(), ueb().hash());
    }

    #[test]
    fn ueb_serialization_is_field_order_independent() {
        // Constructing the struct with fields listed in a different order
        // in source doesn't change serialize() — it's sorted internally.
        let a = ueb();
        let b = UriExtensionBlock { k: 3, n: 10, ..ueb() };
        assert_eq!(a.serialize(), b.serialize());
    }

    #[test]
    fn capability_roundtrips_through_display_and_parse() {
        let read_key = AesKey::from_bytes([5u8; SI_LEN]);
        let cap = ReadCapability {
            storage_index: StorageIndex::from_key(&read_key),
            read_key,
            ueb_hash: Sha256Digest::tagged(b"t", b"x"),
            k: 3,
            n: 10,
            size: 12345,
        };
        let s = cap.to_string();
        let parsed: ReadCapability = s.parse().unwrap();
        assert_eq!(cap, parsed);
    }

    #[test]
    fn rejects_malformed_capability() {
        assert!("not-a-capability".parse::<ReadCapability>().is_err());
        assert!("URI:SSK:abc".parse::<ReadCapability>().is_err());
    }
}
