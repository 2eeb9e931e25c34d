//! AES-128-CTR streaming cipher and the leaf-hash accumulator that rides
//! alongside it.
//!
//! The counter starts at zero for every upload. That's only safe because
//! the key is single-use: either it's random, or it's convergent and
//! therefore a deterministic function of a plaintext hash that is itself
//! part of the key derivation input — the same key never encrypts two
//! different plaintexts.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use sha2::{Digest, Sha256};

use crate::digests::AesKey;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

const ZERO_IV: [u8; 16] = [0u8; 16];

/// Encrypts (or decrypts — CTR mode is its own inverse) a byte stream with
/// a fixed key starting at counter zero.
pub struct CipherStream {
    cipher: Aes128Ctr,
}

impl CipherStream {
    pub fn new(key: &AesKey) -> Self {
        Self {
            cipher: Aes128Ctr::new(key.as_bytes().into(), &ZERO_IV.into()),
        }
    }

    /// XOR `buf` in place with the keystream, advancing the counter by
    /// `buf.len()` bytes.
    pub fn apply_keystream(&mut self, buf: &mut [u8]) {
        self.cipher.apply_keystream(buf);
    }
}

/// Accumulates fixed-size leaf hashes over a byte stream as it passes
/// through, for later use as the leaves of a block hash tree.
pub struct SegmentDigests {
    block_size: usize,
    pending: Vec<u8>,
    leaves: Vec<[u8; 32]>,
    tag: &'static [u8],
}

impl SegmentDigests {
    pub fn new(block_size: usize, tag: &'static [u8]) -> Self {
        assert!(block_size > 0);
        Self {
            block_size,
            pending: Vec::with_capacity(block_size),
            leaves: Vec::new(),
            tag,
        }
    }

    /// Feed more bytes through the accumulator, emitting a leaf hash for
    /// every full block boundary crossed.
    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let need = self.block_size - self.pending.len();
            let take = need.min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() == self.block_size {
                self.flush_block();
            }
        }
    }

    fn flush_block(&mut self) {
        let mut hasher = Sha256::new();
        hasher.update(self.tag);
        hasher.update(&self.pending);
        self.leaves.push(hasher.finalize().into());
        self.pending.clear();
    }

    /// Finalize, flushing a trailing partial block (the tail block) as its
    /// own leaf, and return the full leaf list.
    pub fn finish(mut self) -> Vec<[u8; 32]> {
        if !self.pending.is_empty() {
            self.flush_block();
        }
        self.leaves
    }
}
