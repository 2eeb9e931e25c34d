use std::sync::Arc;

use async_trait::async_trait;
use sha2::Digest as _;
use tokio_util::sync::CancellationToken;

use crate::bucket::{AllocateResult, BucketWriter, Error as BucketError, InMemoryStorageServer, ServerVersion, StorageServer};
use crate::config::{FileParams, Secrets, ServerDescriptor, UploadContext};
use crate::digests::StorageIndex;
use crate::errors::Error;
use crate::selection::SelectionError;
use crate::uploadable::BytesUploadable;

fn descriptor(id: &[u8]) -> ServerDescriptor {
    ServerDescriptor {
        server_id: id.to_vec(),
        endpoint: url::Url::parse("grpc+unix:///tmp/nonexistent").unwrap(),
    }
}

fn secrets() -> Secrets {
    Secrets {
        renewal: [9u8; 32],
        cancel: [8u8; 32],
        convergence: [7u8; 16],
    }
}

fn in_memory_ring(n: u8) -> (Vec<ServerDescriptor>, Vec<Arc<dyn StorageServer>>) {
    let descriptors: Vec<ServerDescriptor> = (0..n).map(|i| descriptor(&[i])).collect();
    let backends: Vec<Arc<dyn StorageServer>> = (0..n)
        .map(|i| Arc::new(InMemoryStorageServer::new(vec![i], 1 << 24)) as Arc<dyn StorageServer>)
        .collect();
    (descriptors, backends)
}

/// S1: one server, K=H=N=1, random key, 200 bytes. A single share lands on
/// the sole server and happiness is exactly 1.
#[tokio::test]
async fn s1_single_server_single_share() {
    let (descriptors, backends) = in_memory_ring(1);
    let ctx = UploadContext {
        params: FileParams {
            k: 1,
            h: 1,
            n: 1,
            max_segment_size: 1024,
        },
        secrets: secrets(),
        servers: descriptors,
        permutation_seed: [1u8; 32],
    };
    let mut uploadable = BytesUploadable::new(vec![5u8; 200]);

    let result = crate::upload(&ctx, &mut uploadable, &backends, &CancellationToken::new()).await.unwrap();
    assert_eq!(result.pushed_shares, 1);
    assert_eq!(result.preexisting_shares, 0);
    assert_eq!(result.capability.k, 1);
    assert_eq!(result.capability.n, 1);
}

/// S2: ten servers, K=3/H=7/N=10, a multi-segment file. Every server ends
/// up holding exactly one share and happiness reaches the full N.
#[tokio::test]
async fn s2_ten_servers_one_share_each() {
    let (descriptors, backends) = in_memory_ring(10);
    let ctx = UploadContext {
        params: FileParams {
            k: 3,
            h: 7,
            n: 10,
            max_segment_size: 4095,
        },
        secrets: secrets(),
        servers: descriptors,
        permutation_seed: [2u8; 32],
    };
    let mut uploadable = BytesUploadable::new(vec![0xAB; 4096 * 3 + 17]);

    let result = crate::upload(&ctx, &mut uploadable, &backends, &CancellationToken::new()).await.unwrap();
    assert_eq!(result.pushed_shares, 10);
    assert_eq!(result.preexisting_shares, 0);
    assert_eq!(result.sharemap.len(), 10);
}

/// S3: five servers already hold share 0 of a convergent re-upload. The
/// second upload reuses the same storage index and only pushes the shares
/// that were missing.
#[tokio::test]
async fn s3_convergent_reupload_skips_preexisting_share() {
    let plaintext = vec![0x42u8; 2048];
    let ctx = UploadContext {
        params: FileParams {
            k: 3,
            h: 7,
            n: 10,
            max_segment_size: 4095,
        },
        secrets: secrets(),
        servers: Vec::new(),
        permutation_seed: [3u8; 32],
    };

    // Learn the storage index this plaintext converges to.
    let (descriptors, backends) = in_memory_ring(10);
    let mut discovery_ctx = ctx.clone();
    discovery_ctx.servers = descriptors.clone();
    let mut discovery_uploadable = BytesUploadable::new(plaintext.clone());
    let discovered = crate::upload(&discovery_ctx, &mut discovery_uploadable, &backends, &CancellationToken::new())
        .await
        .unwrap();
    let si = discovered.capability.storage_index;

    // Pre-seed share 0 on five fresh servers for that storage index.
    let (reupload_descriptors, reupload_backends) = in_memory_ring(10);
    for server in reupload_backends.iter().take(5) {
        let result = server
            .allocate_buckets(&si, &[0u8; 32], &[0u8; 32], &[0], 4096)
            .await
            .unwrap();
        for (_, mut writer) in result.writers {
            writer.put_block(0, b"preexisting").await.unwrap();
            writer.close().await.unwrap();
        }
    }

    let mut reupload_ctx = ctx.clone();
    reupload_ctx.servers = reupload_descriptors;
    let mut uploadable = BytesUploadable::new(plaintext);
    let result = crate::upload(&reupload_ctx, &mut uploadable, &reupload_backends, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.capability.storage_index.as_bytes(), si.as_bytes());
    assert!(result.preexisting_shares >= 1);
    assert_eq!(result.pushed_shares, 10 - result.preexisting_shares);
}

/// S4: only four of the ten required servers are reachable. Selection
/// fails with `NotHappy`, reporting the achieved and required happiness.
#[tokio::test]
async fn s4_too_few_servers_fails_happiness() {
    let (descriptors, backends) = in_memory_ring(4);
    let ctx = UploadContext {
        params: FileParams {
            k: 3,
            h: 7,
            n: 10,
            max_segment_size: 4095,
        },
        secrets: secrets(),
        servers: descriptors,
        permutation_seed: [4u8; 32],
    };
    let mut uploadable = BytesUploadable::new(vec![1u8; 1 << 16]);

    let err = crate::upload(&ctx, &mut uploadable, &backends, &CancellationToken::new()).await.unwrap_err();
    match err {
        Error::Selection(SelectionError::NotHappy {
            achieved, required, ..
        }) => {
            assert_eq!(achieved, 4);
            assert_eq!(required, 7);
        }
        other => panic!("expected NotHappy, got {other:?}"),
    }
}

/// A server whose `allocate_buckets` response lies about which shares it
/// accepted, reporting one outside the valid 0..N range.
struct MalformedServer {
    inner: InMemoryStorageServer,
}

#[async_trait]
impl StorageServer for MalformedServer {
    fn server_id(&self) -> &[u8] {
        self.inner.server_id()
    }

    async fn get_version(&self) -> Result<ServerVersion, BucketError> {
        self.inner.get_version().await
    }

    async fn get_buckets(&self, storage_index: &StorageIndex) -> Result<Vec<u16>, BucketError> {
        self.inner.get_buckets(storage_index).await
    }

    async fn allocate_buckets(
        &self,
        storage_index: &StorageIndex,
        renew_secret: &[u8; 32],
        cancel_secret: &[u8; 32],
        share_numbers: &[u16],
        allocated_size: u64,
    ) -> Result<AllocateResult, BucketError> {
        let mut result = self
            .inner
            .allocate_buckets(storage_index, renew_secret, cancel_secret, share_numbers, allocated_size)
            .await?;
        result.already_have.push(99);
        Ok(result)
    }

    async fn abort_bucket(&self, storage_index: &StorageIndex, share_number: u16) -> Result<(), BucketError> {
        self.inner.abort_bucket(storage_index, share_number).await
    }
}

/// S5: one server out of ten reports a malformed `already_have` set.
/// Selection fails with a protocol violation and every writer it opened
/// elsewhere is aborted.
#[tokio::test]
async fn s5_malformed_already_have_aborts_everything() {
    let descriptors: Vec<ServerDescriptor> = (0..10u8).map(|i| descriptor(&[i])).collect();
    let mut backends: Vec<Arc<dyn StorageServer>> = (0..10u8)
        .map(|i| Arc::new(InMemoryStorageServer::new(vec![i], 1 << 24)) as Arc<dyn StorageServer>)
        .collect();
    backends[3] = Arc::new(MalformedServer {
        inner: InMemoryStorageServer::new(vec![3u8], 1 << 24),
    }) as Arc<dyn StorageServer>;

    let ctx = UploadContext {
        params: FileParams {
            k: 3,
            h: 7,
            n: 10,
            max_segment_size: 4095,
        },
        secrets: secrets(),
        servers: descriptors,
        permutation_seed: [5u8; 32],
    };
    let plaintext = vec![2u8; 1 << 15];
    let mut uploadable = BytesUploadable::new(plaintext.clone());

    let err = crate::upload(&ctx, &mut uploadable, &backends, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Selection(SelectionError::Protocol { .. })
    ));

    // Every writer opened before the malformed response must have been
    // aborted, including on servers the malformed one's ring neighbours
    // had nothing to do with.
    let plaintext_hash: [u8; 32] = sha2::Sha256::digest(&plaintext).into();
    let key = crate::crypto::derive_convergent_key(&ctx.params, &ctx.secrets.convergence, &plaintext_hash);
    let si = StorageIndex::from_key(&key);
    for (i, backend) in backends.iter().enumerate() {
        if i == 3 {
            continue;
        }
        let held = backend.get_buckets(&si).await.unwrap();
        assert!(held.is_empty(), "server {i} should have had its writer aborted, holds {held:?}");
    }
}

/// A server that reports a fixed set of already-held shares but refuses
/// every allocation, modelling a grid member with no write capacity.
struct ReadOnlyServer {
    id: Vec<u8>,
    shares: Vec<u16>,
    allocate_calls: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl StorageServer for ReadOnlyServer {
    fn server_id(&self) -> &[u8] {
        &self.id
    }

    async fn get_version(&self) -> Result<ServerVersion, BucketError> {
        Ok(ServerVersion {
            max_immutable_share_size: 0,
            application_version: "readonly-test-server/0".to_string(),
        })
    }

    async fn get_buckets(&self, _storage_index: &StorageIndex) -> Result<Vec<u16>, BucketError> {
        Ok(self.shares.clone())
    }

    async fn allocate_buckets(
        &self,
        _storage_index: &StorageIndex,
        _renew_secret: &[u8; 32],
        _cancel_secret: &[u8; 32],
        _share_numbers: &[u16],
        _allocated_size: u64,
    ) -> Result<AllocateResult, BucketError> {
        self.allocate_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Err(BucketError::Rejected("read-only server accepts no new shares".to_string()))
    }

    async fn abort_bucket(&self, _storage_index: &StorageIndex, _share_number: u16) -> Result<(), BucketError> {
        Ok(())
    }
}

/// S6: three read-only servers already hold shares {0..4} between them,
/// but two of them each hold more than one share so they can only
/// contribute as many matched pairs as there are servers. The remaining
/// shares land on writable servers one each, and happiness reflects the
/// server-count cap rather than the raw count of distinct shares found.
#[tokio::test]
async fn s6_readonly_servers_cap_happiness_below_n() {
    let mut descriptors = Vec::new();
    let mut backends: Vec<Arc<dyn StorageServer>> = Vec::new();
    let mut readonly_handles: Vec<Arc<ReadOnlyServer>> = Vec::new();

    let readonly_shares: [&[u16]; 3] = [&[0, 1], &[2, 3], &[4]];
    for (i, shares) in readonly_shares.iter().enumerate() {
        let id = vec![b'r', i as u8];
        descriptors.push(descriptor(&id));
        let server = Arc::new(ReadOnlyServer {
            id,
            shares: shares.to_vec(),
            allocate_calls: std::sync::atomic::AtomicUsize::new(0),
        });
        readonly_handles.push(server.clone());
        backends.push(server as Arc<dyn StorageServer>);
    }
    for i in 0..7u8 {
        let id = vec![b'w', i];
        descriptors.push(descriptor(&id));
        backends.push(Arc::new(InMemoryStorageServer::new(id, 1 << 24)) as Arc<dyn StorageServer>);
    }

    let ctx = UploadContext {
        params: FileParams {
            k: 3,
            h: 3,
            n: 10,
            max_segment_size: 4095,
        },
        secrets: secrets(),
        servers: descriptors,
        permutation_seed: [6u8; 32],
    };
    let mut uploadable = BytesUploadable::new(vec![3u8; 1 << 15]);

    let result = crate::upload(&ctx, &mut uploadable, &backends, &CancellationToken::new()).await.unwrap();

    // Shares 5..9 were homeless and must have been placed on writable
    // servers; shares 0..4 were already reported by the read-only ring.
    assert_eq!(result.pushed_shares, 5);
    assert_eq!(result.preexisting_shares, 5);
    for share in 5..10u16 {
        assert!(result.sharemap.contains_key(&share));
    }
    for server in &readonly_handles {
        assert_eq!(
            server.allocate_calls.load(std::sync::atomic::Ordering::SeqCst),
            0,
            "read-only server {:?} should never have been asked to allocate a bucket",
            server.id,
        );
    }
}

/// S7: a file at the literal-cap threshold never contacts a server; its
/// bytes are embedded directly in the capability.
#[tokio::test]
async fn s7_literal_threshold_file_skips_servers() {
    let ctx = UploadContext {
        params: FileParams::default(),
        secrets: secrets(),
        servers: Vec::new(),
        permutation_seed: [7u8; 32],
    };
    let mut uploadable = BytesUploadable::new(vec![0x11u8; 55]);
    let backends: Vec<Arc<dyn StorageServer>> = Vec::new();

    let result = crate::upload(&ctx, &mut uploadable, &backends, &CancellationToken::new()).await.unwrap();
    assert_eq!(result.pushed_shares, 0);
    assert_eq!(result.preexisting_shares, 0);
    assert_eq!(result.file_size, 55);
}

/// S8: cancelling before an upload starts fails it immediately with
/// `Error::Cancelled`, without placing any shares or contacting a server.
#[tokio::test]
async fn s8_cancelled_before_start_places_nothing() {
    let (descriptors, backends) = in_memory_ring(4);
    let ctx = UploadContext {
        params: FileParams {
            k: 2,
            h: 3,
            n: 4,
            max_segment_size: 4096,
        },
        secrets: secrets(),
        servers: descriptors,
        permutation_seed: [8u8; 32],
    };
    let mut uploadable = BytesUploadable::new(vec![1u8; 500]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = crate::upload(&ctx, &mut uploadable, &backends, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    for backend in &backends {
        let si = StorageIndex::try_from([0u8; 16].as_slice()).unwrap();
        let held = backend.get_buckets(&si).await.unwrap();
        assert!(held.is_empty());
    }
}
