//! Explicit, non-parsed configuration surface.
//!
//! There is no CLI or config-file reader in this crate: an embedding
//! application builds an [UploadContext] however it likes (flags, a config
//! struct of its own, hardcoded defaults for tests) and hands it to the
//! coordinator. `validate()` is the one piece of defensive boundary
//! checking this module owns.

use thiserror::Error;
use url::Url;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("k must be >= 1, got {0}")]
    KTooSmall(u16),
    #[error("h must be >= k, got h={h} k={k}")]
    HLessThanK { h: u16, k: u16 },
    #[error("n must be >= h, got n={n} h={h}")]
    NLessThanH { n: u16, h: u16 },
    #[error("n must be <= 256, got {0}")]
    NTooLarge(u16),
    #[error("max_segment_size must be > 0")]
    ZeroSegmentSize,
    #[error("max_segment_size must be a multiple of k, got max_segment_size={max_segment_size} k={k}")]
    SegmentSizeNotMultipleOfK { max_segment_size: u64, k: u16 },
    #[error("at least one server is required")]
    NoServers,
}

/// Erasure-coding shape and segmentation parameters for one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileParams {
    /// Number of shares needed to reconstruct the file.
    pub k: u16,
    /// Servers-of-happiness threshold.
    pub h: u16,
    /// Total number of shares produced.
    pub n: u16,
    /// Maximum plaintext bytes per segment.
    pub max_segment_size: u64,
}

impl FileParams {
    pub fn validate(&self) -> Result<(), Error> {
        if self.k < 1 {
            return Err(Error::KTooSmall(self.k));
        }
        if self.h < self.k {
            return Err(Error::HLessThanK {
                h: self.h,
                k: self.k,
            });
        }
        if self.n < self.h {
            return Err(Error::NLessThanH {
                n: self.n,
                h: self.h,
            });
        }
        if self.n > 256 {
            return Err(Error::NTooLarge(self.n));
        }
        if self.max_segment_size == 0 {
            return Err(Error::ZeroSegmentSize);
        }
        if self.max_segment_size % self.k as u64 != 0 {
            return Err(Error::SegmentSizeNotMultipleOfK {
                max_segment_size: self.max_segment_size,
                k: self.k,
            });
        }
        Ok(())
    }
}

impl Default for FileParams {
    fn default() -> Self {
        Self {
            k: 3,
            h: 7,
            n: 10,
            // 128 KiB rounded down to the nearest multiple of k=3.
            max_segment_size: 131_070,
        }
    }
}

/// Lease secrets for one upload. These are never logged or displayed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secrets {
    pub renewal: [u8; 32],
    pub cancel: [u8; 32],
    /// Per-client secret mixed into convergent key derivation so that two
    /// clients uploading identical plaintext do not produce identical
    /// storage indices unless they also share this secret.
    pub convergence: [u8; 16],
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets").finish_non_exhaustive()
    }
}

/// A reachable storage server, identified and ordered by `server_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub server_id: Vec<u8>,
    pub endpoint: Url,
}

/// Everything the upload coordinator needs to place one file.
#[derive(Debug, Clone)]
pub struct UploadContext {
    pub params: FileParams,
    pub secrets: Secrets,
    pub servers: Vec<ServerDescriptor>,
    /// Seed used to permute the server ring into a per-storage-index order.
    pub permutation_seed: [u8; 32],
}

impl UploadContext {
    pub fn validate(&self) -> Result<(), Error> {
        self.params.validate()?;
        if self.servers.is_empty() {
            return Err(Error::NoServers);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(FileParams { k: 0, h: 7, n: 10, max_segment_size: 1 })]
    #[case(FileParams { k: 3, h: 1, n: 10, max_segment_size: 1 })]
    #[case(FileParams { k: 3, h: 7, n: 2, max_segment_size: 1 })]
    #[case(FileParams { k: 3, h: 7, n: 300, max_segment_size: 1 })]
    #[case(FileParams { k: 3, h: 7, n: 10, max_segment_size: 0 })]
    #[case(FileParams { k: 3, h: 7, n: 10, max_segment_size: 100 })]
    fn rejects_invalid_params(#[case] params: FileParams) {
        assert!(params.validate().is_err());
    }

    #[test]
    fn accepts_segment_size_that_is_a_multiple_of_k() {
        let params = FileParams {
            k: 3,
            h: 7,
            n: 10,
            max_segment_size: 99,
        };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn accepts_default_params() {
        assert!(FileParams::default().validate().is_ok());
    }
}
