pub mod bucket;
pub mod capability;
pub mod config;
pub mod coordinator;
pub mod crypto;
mod digests;
pub mod encode;
mod errors;
pub mod happiness;
pub mod merkle;
pub mod proto;
pub mod selection;
pub mod tonic;
pub mod uploadable;

pub use coordinator::{upload, ProgressPhase, UploadResults, LITERAL_CAP_MAX_BYTES};
pub use digests::{AesKey, Sha256Digest, StorageIndex, SHA256_LEN, SI_LEN};
pub use errors::Error;

#[cfg(test)]
mod tests;
