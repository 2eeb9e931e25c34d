//! Content encryption: convergent key derivation and AES-128-CTR streaming.

mod convergence;
mod encryptor;

pub use convergence::derive_convergent_key;
pub use encryptor::{CipherStream, SegmentDigests};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("plaintext could not be re-read from the beginning for convergent key derivation")]
    NotRestartable,
}
