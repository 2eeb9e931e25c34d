//! Upload orchestration: the literal-cap fast path, and the full
//! hash/encrypt/encode/push pipeline for everything larger.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sha2::{Digest as _, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::bucket::{BucketWriter, StorageServer};
use crate::capability::{ReadCapability, UriExtensionBlock};
use crate::config::UploadContext;
use crate::crypto::{derive_convergent_key, CipherStream, SegmentDigests};
use crate::digests::{AesKey, Sha256Digest, StorageIndex};
use crate::encode::Encoder;
use crate::errors::Error;
use crate::merkle::MerkleTree;
use crate::selection::select_servers;
use crate::uploadable::Uploadable;

const TAG_PLAINTEXT_LEAF: &[u8] = b"tahoe-grid-plaintext-leaf\x00";
const TAG_CIPHERTEXT_LEAF: &[u8] = b"tahoe-grid-ciphertext-leaf\x00";

/// Files at or under this size skip erasure coding, server contact, and
/// the hash trees entirely: their bytes are embedded directly in the
/// capability string.
pub const LITERAL_CAP_MAX_BYTES: u64 = 55;

static UPLOAD_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Wall-clock breakdown and outcome of one upload.
#[derive(Debug, Clone)]
pub struct UploadResults {
    pub serial: u64,
    pub file_size: u64,
    pub pushed_shares: usize,
    pub preexisting_shares: usize,
    pub sharemap: HashMap<u16, Vec<u8>>,
    /// Time to read the source, hash it, and derive the storage index.
    pub storage_index_time: std::time::Duration,
    /// Time spent inside `select_servers`.
    pub peer_selection_time: std::time::Duration,
    /// Time spent encrypting, erasure-coding, building hash trees, and
    /// pushing shares — everything but storage-index derivation and
    /// server selection.
    pub encode_time: std::time::Duration,
    pub total_time: std::time::Duration,
    pub capability: ReadCapability,
}

/// The three phases an upload's progress can be in, each reported as a
/// fraction in `[0.0, 1.0]` by the caller's progress sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressPhase {
    Hash,
    Ciphertext,
    EncodeAndPush,
}

/// Upload `uploadable`'s contents according to `ctx`, returning either the
/// literal-cap fast path result or the result of the full pipeline.
#[instrument(skip_all)]
pub async fn upload(
    ctx: &UploadContext,
    uploadable: &mut dyn Uploadable,
    servers: &[Arc<dyn StorageServer>],
    cancel: &CancellationToken,
) -> Result<UploadResults, Error> {
    ctx.params.validate()?;
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let serial = UPLOAD_SERIAL.fetch_add(1, Ordering::Relaxed);
    let size = uploadable.size();

    if size <= LITERAL_CAP_MAX_BYTES {
        let data = read_all(uploadable, size).await?;
        return Ok(literal_results(serial, size, data));
    }

    ctx.validate()?;
    upload_chk(serial, ctx, uploadable, servers, cancel).await
}

async fn read_all(uploadable: &mut dyn Uploadable, size: u64) -> Result<Vec<u8>, Error> {
    let mut buf = vec![0u8; size as usize];
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = uploadable.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

fn literal_results(serial: u64, size: u64, data: Vec<u8>) -> UploadResults {
    let mut key = [0u8; 16];
    let n = data.len().min(16);
    key[..n].copy_from_slice(&data[..n]);
    let read_key = AesKey::from_bytes(key);
    let storage_index = StorageIndex::from_key(&read_key);

    let capability = ReadCapability {
        storage_index,
        read_key,
        ueb_hash: Sha256Digest::tagged(b"tahoe-grid-literal\x00", &data),
        k: 1,
        n: 1,
        size,
    };

    UploadResults {
        serial,
        file_size: size,
        pushed_shares: 0,
        preexisting_shares: 0,
        sharemap: HashMap::new(),
        storage_index_time: std::time::Duration::ZERO,
        peer_selection_time: std::time::Duration::ZERO,
        encode_time: std::time::Duration::ZERO,
        total_time: std::time::Duration::ZERO,
        capability,
    }
}

async fn upload_chk(
    serial: u64,
    ctx: &UploadContext,
    uploadable: &mut dyn Uploadable,
    servers: &[Arc<dyn StorageServer>],
    cancel: &CancellationToken,
) -> Result<UploadResults, Error> {
    let total_start = std::time::Instant::now();
    let size = uploadable.size();
    let params = &ctx.params;

    let storage_index_start = std::time::Instant::now();
    let plaintext = read_all(uploadable, size).await?;
    let plaintext_hash: [u8; 32] = Sha256::digest(&plaintext).into();

    // A source that can't be rewound to position 0 can't be hashed twice,
    // so it can't take part in convergent deduplication: fall back to a
    // one-off random key instead of failing the upload outright.
    let restartable = uploadable.restart().await.unwrap_or(false);
    let key = if restartable {
        derive_convergent_key(params, &ctx.secrets.convergence, &plaintext_hash)
    } else {
        random_key()
    };
    let storage_index = StorageIndex::from_key(&key);
    let storage_index_time = storage_index_start.elapsed();

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let encode_start = std::time::Instant::now();
    let mut ciphertext = plaintext;
    CipherStream::new(&key).apply_keystream(&mut ciphertext);

    let segment_size = (params.max_segment_size as usize).min(ciphertext.len().max(1));
    let num_segments = ciphertext.len().div_ceil(segment_size).max(1);

    let encoder = Encoder::new(params.k, params.n)?;

    let mut ciphertext_digests = SegmentDigests::new(segment_size, TAG_CIPHERTEXT_LEAF);
    let mut per_share_blocks: Vec<Vec<Vec<u8>>> =
        vec![Vec::with_capacity(num_segments); params.n as usize];
    let mut codec_params = String::new();
    let mut tail_codec_params = String::new();

    for seg_idx in 0..num_segments {
        let start = seg_idx * segment_size;
        let end = (start + segment_size).min(ciphertext.len());
        let segment = &ciphertext[start..end];
        ciphertext_digests.update(segment);

        let (shares, tail_params) = encoder.encode_segment(segment)?;
        if seg_idx + 1 == num_segments {
            tail_codec_params = tail_params.to_wire_string();
        } else {
            codec_params = tail_params.to_wire_string();
        }
        for (share_number, shard) in shares.into_iter().enumerate() {
            per_share_blocks[share_number].push(shard);
        }
    }
    // A one-segment file has no distinct "full" segment shape; its only
    // segment is also the tail.
    if codec_params.is_empty() {
        codec_params = tail_codec_params.clone();
    }

    // The ciphertext hash tree is keyed on segment boundaries, so it is
    // identical for every share and built exactly once.
    let ciphertext_leaves: Vec<Sha256Digest> = ciphertext_digests
        .finish()
        .into_iter()
        .map(Sha256Digest::from)
        .collect();
    let crypttext_hash_tree = MerkleTree::new(ciphertext_leaves);
    let crypttext_hash_bytes = serialize_nodes(&crypttext_hash_tree);

    let block_hash_trees: Vec<MerkleTree> = per_share_blocks
        .iter()
        .map(|blocks| {
            let leaves: Vec<Sha256Digest> = blocks
                .iter()
                .map(|b| Sha256Digest::tagged(TAG_PLAINTEXT_LEAF, b))
                .collect();
            MerkleTree::new(leaves)
        })
        .collect();
    let share_roots: Vec<Sha256Digest> = block_hash_trees.iter().map(|t| t.root()).collect();
    let share_hash_tree = MerkleTree::new(share_roots);

    let tail_segment_size = ciphertext.len() - (num_segments - 1) * segment_size;
    let ueb = UriExtensionBlock {
        size,
        segment_size: segment_size as u64,
        num_segments: num_segments as u64,
        k: params.k,
        n: params.n,
        tail_segment_size: tail_segment_size as u64,
        codec_params,
        tail_codec_params,
        crypttext_hash: Sha256Digest::tagged(b"tahoe-grid-crypttext\x00", &ciphertext),
        crypttext_root_hash: crypttext_hash_tree.root(),
        share_root_hash: share_hash_tree.root(),
    };
    let ueb_bytes = ueb.serialize();

    let share_size = per_share_blocks
        .first()
        .map(|blocks| blocks.iter().map(|b| b.len() as u64).sum())
        .unwrap_or(0);

    let peer_selection_start = std::time::Instant::now();
    let placement = select_servers(
        servers,
        &storage_index,
        params,
        &ctx.servers,
        &ctx.permutation_seed,
        &ctx.secrets.renewal,
        &ctx.secrets.cancel,
        share_size,
        cancel,
    )
    .await?;
    let peer_selection_time = peer_selection_start.elapsed();

    let preexisting_shares = params.n as usize - placement.writers.len();
    let mut sharemap = HashMap::new();
    let mut pending: std::collections::VecDeque<(u16, Vec<u8>, Box<dyn BucketWriter>)> =
        placement
            .writers
            .into_iter()
            .map(|(share_number, (server_id, writer))| (share_number, server_id, writer))
            .collect();

    while let Some((share_number, server_id, mut writer)) = pending.pop_front() {
        let result = write_one_share(
            writer.as_mut(),
            share_number,
            &per_share_blocks[share_number as usize],
            &crypttext_hash_bytes,
            &block_hash_trees[share_number as usize],
            &share_hash_tree,
            &ueb_bytes,
        )
        .await;

        if let Err(err) = result {
            let _ = writer.abort().await;
            while let Some((_, _, mut other)) = pending.pop_front() {
                let _ = other.abort().await;
            }
            return Err(err);
        }

        sharemap.insert(share_number, server_id);
    }

    let encode_time = encode_start.elapsed().saturating_sub(peer_selection_time);
    let total_time = total_start.elapsed();

    let capability = ReadCapability {
        storage_index,
        read_key: key,
        ueb_hash: ueb.hash(),
        k: params.k,
        n: params.n,
        size,
    };

    info!(
        storage_index = ?storage_index,
        pushed = sharemap.len(),
        preexisting = preexisting_shares,
        happiness = placement.happiness.value,
        "upload complete"
    );

    Ok(UploadResults {
        serial,
        file_size: size,
        pushed_shares: sharemap.len(),
        preexisting_shares,
        sharemap,
        storage_index_time,
        peer_selection_time,
        encode_time,
        total_time,
        capability,
    })
}

/// Push one share's blocks and hash chains to its writer, in order, leaving
/// the writer open on any failure so the caller can decide whether to abort
/// it (and the rest of the in-flight placement) itself.
#[allow(clippy::too_many_arguments)]
async fn write_one_share(
    writer: &mut dyn BucketWriter,
    share_number: u16,
    blocks: &[Vec<u8>],
    crypttext_hash_bytes: &[u8],
    block_hash_tree: &MerkleTree,
    share_hash_tree: &MerkleTree,
    ueb_bytes: &[u8],
) -> Result<(), Error> {
    let mut offset = 0u64;
    for block in blocks {
        writer.put_block(offset, block).await?;
        offset += block.len() as u64;
    }

    writer.put_crypttext_hashes(crypttext_hash_bytes).await?;

    let block_hash_bytes = serialize_nodes(block_hash_tree);
    writer.put_block_hashes(&block_hash_bytes).await?;

    let mut share_chain_bytes = Vec::new();
    for (sibling_idx, sibling_hash) in share_hash_tree.sibling_chain(share_number as usize) {
        share_chain_bytes.extend_from_slice(&(sibling_idx as u16).to_be_bytes());
        share_chain_bytes.extend_from_slice(sibling_hash.as_bytes());
    }
    writer.put_share_hashes(&share_chain_bytes).await?;

    writer.put_uri_extension(ueb_bytes).await?;
    writer.close().await?;
    Ok(())
}

fn serialize_nodes(tree: &MerkleTree) -> Vec<u8> {
    let mut out = Vec::new();
    for node in tree.all_nodes() {
        out.extend_from_slice(node.as_bytes());
    }
    out
}

fn random_key() -> AesKey {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    AesKey::from_bytes(bytes)
}
