//! Systematic (K,N) Reed-Solomon erasure coding over GF(2^8).
//!
//! One segment of plaintext produces exactly `n` shares; the first `k`
//! carry the (padded) plaintext directly, the remaining `n - k` are parity.
//! Any `k` of the `n` shares reconstruct the segment.

use reed_solomon_erasure::galois_8::ReedSolomon;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("k must be between 1 and n")]
    InvalidShape,
    #[error("reed-solomon-erasure error: {0}")]
    Rs(#[from] reed_solomon_erasure::Error),
    #[error("need at least k={k} shares to reconstruct, got {got}")]
    NotEnoughShares { k: usize, got: usize },
}

/// How a segment's trailing bytes were padded before splitting into `k`
/// equal-sized shards, so the padding can be stripped back off on
/// reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailCodecParams {
    pub k: u16,
    pub n: u16,
    /// Length of the original (unpadded) segment.
    pub segment_len: usize,
    /// Length of each of the `k` shards after padding.
    pub shard_len: usize,
}

impl TailCodecParams {
    /// Canonical wire form stored in the URI extension block's
    /// `codec_params`/`tail_codec_params` fields.
    pub fn to_wire_string(self) -> String {
        format!("{}-{}-{}-{}", self.k, self.n, self.segment_len, self.shard_len)
    }
}

pub struct Encoder {
    k: usize,
    n: usize,
    rs: ReedSolomon,
}

impl Encoder {
    pub fn new(k: u16, n: u16) -> Result<Self, Error> {
        let (k, n) = (k as usize, n as usize);
        if k == 0 || k > n {
            return Err(Error::InvalidShape);
        }
        let rs = ReedSolomon::new(k, n - k)?;
        Ok(Self { k, n, rs })
    }

    /// Split `segment` into `k` equal shards (zero-padding the last one if
    /// needed) and produce `n - k` parity shards, returning all `n` shards
    /// in share-number order and the params needed to strip padding later.
    pub fn encode_segment(&self, segment: &[u8]) -> Result<(Vec<Vec<u8>>, TailCodecParams), Error> {
        let shard_len = segment.len().div_ceil(self.k).max(1);
        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.n);

        for i in 0..self.k {
            let start = i * shard_len;
            let mut shard = vec![0u8; shard_len];
            if start < segment.len() {
                let end = (start + shard_len).min(segment.len());
                shard[..end - start].copy_from_slice(&segment[start..end]);
            }
            shards.push(shard);
        }
        for _ in self.k..self.n {
            shards.push(vec![0u8; shard_len]);
        }

        self.rs.encode(&mut shards)?;

        let params = TailCodecParams {
            k: self.k as u16,
            n: self.n as u16,
            segment_len: segment.len(),
            shard_len,
        };
        Ok((shards, params))
    }

    /// Reconstruct the original segment from a set of shares, identified
    /// by share number. Any `k` distinct share numbers suffice.
    pub fn decode_segment(
        &self,
        shares: Vec<(usize, Vec<u8>)>,
        params: &TailCodecParams,
    ) -> Result<Vec<u8>, Error> {
        if shares.len() < self.k {
            return Err(Error::NotEnoughShares {
                k: self.k,
                got: shares.len(),
            });
        }

        let mut slots: Vec<Option<Vec<u8>>> = vec![None; self.n];
        for (share_number, data) in shares {
            if share_number < self.n {
                slots[share_number] = Some(data);
            }
        }

        self.rs.reconstruct(&mut slots)?;

        let mut out = Vec::with_capacity(params.shard_len * self.k);
        for slot in slots.into_iter().take(self.k) {
            out.extend(slot.expect("reconstruct fills every data shard"));
        }
        out.truncate(params.segment_len);
        Ok(out)
    }
}
