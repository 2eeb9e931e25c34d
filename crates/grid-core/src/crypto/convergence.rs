//! Deterministic content-key derivation.
//!
//! Two uploads of identical plaintext with the same file parameters and the
//! same convergence secret land on the same key, and therefore the same
//! storage index and ciphertext — the grid deduplicates them for free.
//! Uploaders who don't want that (or whose source can't be read twice) use
//! [super::Error::NotRestartable] to fall back to a random key instead.

use sha2::{Digest, Sha256};

use crate::config::FileParams;
use crate::digests::{AesKey, SI_LEN};

const TAG_PARAMS: &[u8] = b"tahoe-grid-convergence-params\x00";
const TAG_KEY: &[u8] = b"tahoe-grid-convergence-key\x00";

/// `trunc128(SHA-256(tag || convergence_secret || SHA-256(K||N||SegSize) || SHA-256(plaintext)))`.
pub fn derive_convergent_key(
    params: &FileParams,
    convergence_secret: &[u8; 16],
    plaintext_hash: &[u8; 32],
) -> AesKey {
    let mut params_hasher = Sha256::new();
    params_hasher.update(TAG_PARAMS);
    params_hasher.update(params.k.to_be_bytes());
    params_hasher.update(params.n.to_be_bytes());
    params_hasher.update(params.max_segment_size.to_be_bytes());
    let params_hash = params_hasher.finalize();

    let mut key_hasher = Sha256::new();
    key_hasher.update(TAG_KEY);
    key_hasher.update(convergence_secret);
    key_hasher.update(params_hash);
    key_hasher.update(plaintext_hash);
    let full = key_hasher.finalize();

    let mut key = [0u8; SI_LEN];
    key.copy_from_slice(&full[..SI_LEN]);
    AesKey::from_bytes(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> FileParams {
        FileParams {
            k: 3,
            h: 7,
            n: 10,
            max_segment_size: 131_070,
        }
    }

    #[test]
    fn deterministic_for_same_inputs() {
        let secret = [1u8; 16];
        let hash = [2u8; 32];
        let a = derive_convergent_key(&params(), &secret, &hash);
        let b = derive_convergent_key(&params(), &secret, &hash);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn differs_with_different_secret() {
        let hash = [2u8; 32];
        let a = derive_convergent_key(&params(), &[1u8; 16], &hash);
        let b = derive_convergent_key(&params(), &[9u8; 16], &hash);
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn differs_with_different_plaintext_hash() {
        let secret = [1u8; 16];
        let a = derive_convergent_key(&params(), &secret, &[2u8; 32]);
        let b = derive_convergent_key(&params(), &secret, &[3u8; 32]);
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn differs_with_different_params() {
        let secret = [1u8; 16];
        let hash = [2u8; 32];
        let mut other = params();
        other.k = 5;
        let a = derive_convergent_key(&params(), &secret, &hash);
        let b = derive_convergent_key(&other, &secret, &hash);
        assert_ne!(a.as_bytes(), b.as_bytes());
    }
}
