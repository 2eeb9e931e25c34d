use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::instrument;

use super::{AllocateResult, BucketWriter, Error, ServerVersion, StorageServer};
use crate::digests::StorageIndex;

#[derive(Default, Clone)]
struct Bucket {
    block_data: Vec<u8>,
    crypttext_hashes: Vec<u8>,
    block_hashes: Vec<u8>,
    share_hashes: Vec<u8>,
    uri_extension: Vec<u8>,
    closed: bool,
}

/// An in-process [StorageServer] used in tests: no network, no disk, just
/// a map guarded by a lock. Useful for exercising the selection and
/// coordinator logic without standing up a gRPC server.
pub struct InMemoryStorageServer {
    server_id: Vec<u8>,
    max_share_size: u64,
    buckets: Arc<RwLock<HashMap<StorageIndex, HashMap<u16, Bucket>>>>,
}

impl InMemoryStorageServer {
    pub fn new(server_id: impl Into<Vec<u8>>, max_share_size: u64) -> Self {
        Self {
            server_id: server_id.into(),
            max_share_size,
            buckets: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Whether `share_number` under `storage_index` was closed (test hook).
    pub fn has_closed_share(&self, storage_index: &StorageIndex, share_number: u16) -> bool {
        self.buckets
            .read()
            .get(storage_index)
            .and_then(|shares| shares.get(&share_number))
            .map(|b| b.closed)
            .unwrap_or(false)
    }
}

#[async_trait]
impl StorageServer for InMemoryStorageServer {
    fn server_id(&self) -> &[u8] {
        &self.server_id
    }

    #[instrument(skip_all)]
    async fn get_version(&self) -> Result<ServerVersion, Error> {
        Ok(ServerVersion {
            max_immutable_share_size: self.max_share_size,
            application_version: "in-memory-test-server/0".to_string(),
        })
    }

    #[instrument(skip_all, fields(storage_index = ?storage_index))]
    async fn get_buckets(&self, storage_index: &StorageIndex) -> Result<Vec<u16>, Error> {
        let buckets = self.buckets.read();
        Ok(buckets
            .get(storage_index)
            .map(|shares| shares.keys().copied().collect())
            .unwrap_or_default())
    }

    #[instrument(skip_all, fields(storage_index = ?storage_index, n = share_numbers.len()))]
    async fn allocate_buckets(
        &self,
        storage_index: &StorageIndex,
        _renew_secret: &[u8; 32],
        _cancel_secret: &[u8; 32],
        share_numbers: &[u16],
        allocated_size: u64,
    ) -> Result<AllocateResult, Error> {
        if allocated_size > self.max_share_size {
            return Err(Error::Full);
        }

        let mut buckets = self.buckets.write();
        let shares = buckets.entry(*storage_index).or_default();

        let mut already_have = Vec::new();
        let mut writers: Vec<(u16, Box<dyn BucketWriter>)> = Vec::new();

        for &share_number in share_numbers {
            if shares.contains_key(&share_number) {
                already_have.push(share_number);
                continue;
            }
            shares.insert(share_number, Bucket::default());
            writers.push((
                share_number,
                Box::new(InMemoryBucketWriter {
                    storage_index: *storage_index,
                    share_number,
                    buckets: self.buckets.clone(),
                }),
            ));
        }

        Ok(AllocateResult {
            already_have,
            writers,
        })
    }

    #[instrument(skip_all, fields(storage_index = ?storage_index, share_number))]
    async fn abort_bucket(&self, storage_index: &StorageIndex, share_number: u16) -> Result<(), Error> {
        let mut buckets = self.buckets.write();
        if let Some(shares) = buckets.get_mut(storage_index) {
            shares.remove(&share_number);
        }
        Ok(())
    }
}

struct InMemoryBucketWriter {
    storage_index: StorageIndex,
    share_number: u16,
    buckets: Arc<RwLock<HashMap<StorageIndex, HashMap<u16, Bucket>>>>,
}

impl InMemoryBucketWriter {
    fn with_bucket_mut<R>(&mut self, f: impl FnOnce(&mut Bucket) -> R) -> Result<R, Error> {
        let mut buckets = self.buckets.write();
        let bucket = buckets
            .get_mut(&self.storage_index)
            .and_then(|shares| shares.get_mut(&self.share_number))
            .ok_or_else(|| Error::ProtocolViolation("bucket not allocated".to_string()))?;
        if bucket.closed {
            return Err(Error::ProtocolViolation("bucket already closed".to_string()));
        }
        Ok(f(bucket))
    }
}

#[async_trait]
impl BucketWriter for InMemoryBucketWriter {
    async fn put_block(&mut self, offset: u64, data: &[u8]) -> Result<(), Error> {
        self.with_bucket_mut(|b| {
            let end = offset as usize + data.len();
            if b.block_data.len() < end {
                b.block_data.resize(end, 0);
            }
            b.block_data[offset as usize..end].copy_from_slice(data);
        })
    }

    async fn put_crypttext_hashes(&mut self, data: &[u8]) -> Result<(), Error> {
        self.with_bucket_mut(|b| b.crypttext_hashes.extend_from_slice(data))
    }

    async fn put_block_hashes(&mut self, data: &[u8]) -> Result<(), Error> {
        self.with_bucket_mut(|b| b.block_hashes.extend_from_slice(data))
    }

    async fn put_share_hashes(&mut self, data: &[u8]) -> Result<(), Error> {
        self.with_bucket_mut(|b| b.share_hashes.extend_from_slice(data))
    }

    async fn put_uri_extension(&mut self, data: &[u8]) -> Result<(), Error> {
        self.with_bucket_mut(|b| b.uri_extension.extend_from_slice(data))
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.with_bucket_mut(|b| b.closed = true)
    }

    async fn abort(&mut self) -> Result<(), Error> {
        let mut buckets = self.buckets.write();
        if let Some(shares) = buckets.get_mut(&self.storage_index) {
            shares.remove(&self.share_number);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocate_then_write_then_close() {
        let server = InMemoryStorageServer::new(b"server-a".to_vec(), 1 << 20);
        let si = StorageIndex::try_from([1u8; 16].as_slice()).unwrap();

        let result = server
            .allocate_buckets(&si, &[0u8; 32], &[0u8; 32], &[0, 1, 2], 1024)
            .await
            .unwrap();
        assert!(result.already_have.is_empty());
        assert_eq!(result.writers.len(), 3);

        for (_, mut writer) in result.writers {
            writer.put_block(0, b"hello").await.unwrap();
            writer.close().await.unwrap();
        }

        assert!(server.has_closed_share(&si, 0));
        let held = server.get_buckets(&si).await.unwrap();
        assert_eq!(held.len(), 3);
    }

    #[tokio::test]
    async fn already_have_is_reported_without_a_writer() {
        let server = InMemoryStorageServer::new(b"server-a".to_vec(), 1 << 20);
        let si = StorageIndex::try_from([2u8; 16].as_slice()).unwrap();

        let first = server
            .allocate_buckets(&si, &[0u8; 32], &[0u8; 32], &[0], 10)
            .await
            .unwrap();
        assert_eq!(first.writers.len(), 1);

        let second = server
            .allocate_buckets(&si, &[0u8; 32], &[0u8; 32], &[0], 10)
            .await
            .unwrap();
        assert_eq!(second.already_have, vec![0]);
        assert!(second.writers.is_empty());
    }

    #[tokio::test]
    async fn full_server_rejects_allocation() {
        let server = InMemoryStorageServer::new(b"server-a".to_vec(), 10);
        let si = StorageIndex::try_from([3u8; 16].as_slice()).unwrap();
        let result = server
            .allocate_buckets(&si, &[0u8; 32], &[0u8; 32], &[0], 1024)
            .await;
        assert!(matches!(result, Err(Error::Full)));
    }
}
