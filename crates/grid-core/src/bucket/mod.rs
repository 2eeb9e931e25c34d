//! The storage-server RPC surface, from the uploader's point of view.
//!
//! A [StorageServer] answers `GetVersion`/`GetBuckets`/`AllocateBuckets` and
//! hands back one [BucketWriter] per accepted share number. Only the
//! client side of this protocol is implemented; serving it is out of
//! scope for this crate.

mod grpc;
mod memory;

pub use self::grpc::GrpcStorageServer;
pub use self::memory::InMemoryStorageServer;

use async_trait::async_trait;
use thiserror::Error;

use crate::digests::StorageIndex;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("server reported it has no space left")]
    Full,
    #[error("server rejected the request: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server violated the wire protocol: {0}")]
    ProtocolViolation(String),
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::ResourceExhausted => Error::Full,
            tonic::Code::InvalidArgument | tonic::Code::FailedPrecondition => {
                Error::Rejected(status.message().to_string())
            }
            tonic::Code::Unavailable | tonic::Code::DeadlineExceeded => {
                Error::Transport(status.message().to_string())
            }
            _ => Error::ProtocolViolation(status.message().to_string()),
        }
    }
}

/// The server's advertised capabilities, from `GetVersion`.
#[derive(Debug, Clone)]
pub struct ServerVersion {
    pub max_immutable_share_size: u64,
    pub application_version: String,
}

/// The outcome of `AllocateBuckets`: some share numbers may already be
/// present (no write needed), others are freshly accepted and return a
/// writer each.
pub struct AllocateResult {
    pub already_have: Vec<u16>,
    pub writers: Vec<(u16, Box<dyn BucketWriter>)>,
}

#[async_trait]
pub trait StorageServer: Send + Sync {
    /// A stable identifier for this server, used for ring ordering and
    /// diagnostics. Not necessarily its network address.
    fn server_id(&self) -> &[u8];

    async fn get_version(&self) -> Result<ServerVersion, Error>;

    /// Which share numbers this server already holds for `storage_index`.
    async fn get_buckets(&self, storage_index: &StorageIndex) -> Result<Vec<u16>, Error>;

    /// Ask the server to reserve space for `share_numbers`, each
    /// `allocated_size` bytes. Shares it already has are reported in
    /// [AllocateResult::already_have] without needing a writer; shares it
    /// accepts get a writer each.
    async fn allocate_buckets(
        &self,
        storage_index: &StorageIndex,
        renew_secret: &[u8; 32],
        cancel_secret: &[u8; 32],
        share_numbers: &[u16],
        allocated_size: u64,
    ) -> Result<AllocateResult, Error>;

    /// Abort a previously allocated (not yet closed) share.
    async fn abort_bucket(&self, storage_index: &StorageIndex, share_number: u16) -> Result<(), Error>;
}

/// An append-only, write-then-close extent for one share.
#[async_trait]
pub trait BucketWriter: Send + Sync {
    async fn put_block(&mut self, offset: u64, data: &[u8]) -> Result<(), Error>;
    async fn put_crypttext_hashes(&mut self, data: &[u8]) -> Result<(), Error>;
    async fn put_block_hashes(&mut self, data: &[u8]) -> Result<(), Error>;
    async fn put_share_hashes(&mut self, data: &[u8]) -> Result<(), Error>;
    async fn put_uri_extension(&mut self, data: &[u8]) -> Result<(), Error>;
    async fn close(&mut self) -> Result<(), Error>;
    async fn abort(&mut self) -> Result<(), Error>;
}
