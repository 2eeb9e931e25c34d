//! Placement of shares onto servers.
//!
//! Servers are visited in a permuted ring order unique to each storage
//! index, so repeated uploads of the same file spread load evenly while
//! a single upload's view of the ring is deterministic and repeatable.
//! Placement proceeds in passes — first pass tries one share per server
//! in ring order, second and later passes mop up whatever is left — and
//! finishes with a redistribution step that, if happiness allows, takes
//! shares away from servers holding more than their fair share and hands
//! them to otherwise-empty servers, improving the final happiness score.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::bucket::{self, BucketWriter, StorageServer};
use crate::config::{FileParams, ServerDescriptor};
use crate::digests::StorageIndex;
use crate::happiness::{self, Happiness};

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("no servers were reachable")]
    NoServers,
    #[error("could only reach happiness {achieved} of {required} required: {stats}")]
    NotHappy {
        achieved: usize,
        required: usize,
        happiness: Happiness,
        stats: SelectionStats,
    },
    #[error("server {server:?} violated the wire protocol: {reason}")]
    Protocol { server: Vec<u8>, reason: String },
    #[error("selection was cancelled")]
    Cancelled,
}

/// Per-server outcome counters, surfaced on failure so an operator can
/// tell "everyone said no" apart from "everyone was full" apart from
/// "half the grid didn't answer".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionStats {
    pub query_count: usize,
    pub good_query_count: usize,
    pub bad_query_count: usize,
    pub full_count: usize,
}

impl std::fmt::Display for SelectionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} servers contacted, {} accepted, {} rejected, {} full",
            self.query_count, self.good_query_count, self.bad_query_count, self.full_count
        )
    }
}

/// Permute `servers` into ring order for `storage_index`: ascending by
/// `HMAC-SHA256(permutation_seed, storage_index || server_id)`.
pub fn permute_servers(
    servers: &[ServerDescriptor],
    storage_index: &StorageIndex,
    permutation_seed: &[u8; 32],
) -> Vec<ServerDescriptor> {
    let mut keyed: Vec<(Vec<u8>, ServerDescriptor)> = servers
        .iter()
        .map(|s| {
            let mut mac =
                HmacSha256::new_from_slice(permutation_seed).expect("HMAC accepts any key length");
            mac.update(storage_index.as_bytes());
            mac.update(&s.server_id);
            (mac.finalize().into_bytes().to_vec(), s.clone())
        })
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.into_iter().map(|(_, s)| s).collect()
}

/// How many transport failures a server gets before it is dropped from the
/// rotation. A server that explicitly says `Full` or rejects a share is
/// dropped immediately; one that merely timed out or saw a connection error
/// is assumed to be transiently unreachable and gets retried across passes.
const MAX_TRANSPORT_RETRIES: u32 = 2;

struct ServerTracker {
    server: Arc<dyn StorageServer>,
    id: Vec<u8>,
    in_rotation: bool,
    transport_failures: u32,
    /// Whether this server's advertised `max_immutable_share_size` covers
    /// this upload's share size. Only writeable servers are ever asked to
    /// `allocate_buckets`; a server whose capacity is unknown (its
    /// `get_version` call failed) is treated as not writeable.
    writeable: bool,
}

/// The final outcome of a successful placement: for every accepted share,
/// which server holds it and an open writer ready to receive its bytes.
pub struct Placement {
    pub happiness: Happiness,
    pub writers: HashMap<u16, (Vec<u8>, Box<dyn BucketWriter>)>,
}

/// Run server selection for one upload: discover existing shares (phase
/// 0), then allocate homeless shares across the ring in passes until
/// every share has a home or the ring is exhausted, then redistribute to
/// improve happiness where doing so doesn't reduce it.
#[instrument(skip_all, fields(storage_index = ?storage_index, k = params.k, h = params.h, n = params.n))]
pub async fn select_servers(
    servers: &[Arc<dyn StorageServer>],
    storage_index: &StorageIndex,
    params: &FileParams,
    descriptors: &[ServerDescriptor],
    permutation_seed: &[u8; 32],
    renew_secret: &[u8; 32],
    cancel_secret: &[u8; 32],
    share_size: u64,
    cancel: &CancellationToken,
) -> Result<Placement, SelectionError> {
    if servers.is_empty() {
        return Err(SelectionError::NoServers);
    }
    if cancel.is_cancelled() {
        return Err(SelectionError::Cancelled);
    }

    let order = permute_servers(descriptors, storage_index, permutation_seed);
    let by_id: HashMap<Vec<u8>, Arc<dyn StorageServer>> = servers
        .iter()
        .map(|s| (s.server_id().to_vec(), s.clone()))
        .collect();

    let mut trackers: Vec<ServerTracker> = Vec::new();
    for desc in &order {
        if let Some(server) = by_id.get(&desc.server_id) {
            trackers.push(ServerTracker {
                server: server.clone(),
                id: desc.server_id.clone(),
                in_rotation: true,
                transport_failures: 0,
                writeable: false,
            });
        }
    }

    let mut stats = SelectionStats::default();

    // Partitioning: learn each server's advertised capacity, concurrently,
    // and split the ring into `writeable` (can take a share this size) and
    // `readonly_probed` (the first 2N ring members that can't — asked only
    // for existing shares, never for a new allocation).
    let version_results = futures::future::join_all(
        trackers
            .iter()
            .map(|tracker| async move { tracker.server.get_version().await }),
    )
    .await;
    for (tracker, result) in trackers.iter_mut().zip(version_results) {
        stats.query_count += 1;
        match result {
            Ok(version) => {
                stats.good_query_count += 1;
                tracker.writeable = version.max_immutable_share_size >= share_size;
            }
            Err(e) => {
                stats.bad_query_count += 1;
                debug!(server = ?tracker.id, error = %e, "get_version failed, treating as read-only");
            }
        }
    }

    let readonly_probe_window = params.n as usize * 2;
    let readonly_probed: Vec<usize> = trackers
        .iter()
        .enumerate()
        .take(readonly_probe_window)
        .filter(|(_, t)| !t.writeable)
        .map(|(idx, _)| idx)
        .collect();

    let mut holders: HashMap<u16, Vec<usize>> = (0..params.n).map(|s| (s, Vec::new())).collect();
    let mut homeless: VecDeque<u16> = (0..params.n).collect();

    // Phase 0: find shares that already exist on the read-only-probed part
    // of the ring. Writeable servers report what they already hold as part
    // of their `allocate_buckets` response in phase 1+ instead, so they are
    // not probed here. All probes run concurrently since these are
    // independent reads with no ordering dependency between them.
    let phase0_results = futures::future::join_all(
        readonly_probed
            .iter()
            .map(|&idx| &trackers[idx])
            .map(|tracker| async move { tracker.server.get_buckets(storage_index).await }),
    )
    .await;

    for (i, result) in phase0_results.into_iter().enumerate() {
        let idx = readonly_probed[i];
        stats.query_count += 1;
        match result {
            Ok(existing) => {
                stats.good_query_count += 1;
                for share in existing {
                    if share >= params.n {
                        return Err(SelectionError::Protocol {
                            server: trackers[idx].id.clone(),
                            reason: format!("get_buckets reported out-of-range share {share}"),
                        });
                    }
                    if let Some(slot) = holders.get_mut(&share) {
                        slot.push(idx);
                        homeless.retain(|&s| s != share);
                    }
                }
            }
            Err(e) => {
                stats.bad_query_count += 1;
                debug!(server = ?trackers[idx].id, error = %e, "get_buckets failed in phase 0");
            }
        }
    }

    let mut open_writers: HashMap<u16, (usize, Box<dyn BucketWriter>)> = HashMap::new();

    // Phase 1+ allocation, then redistribution if the ring is exhausted
    // without reaching the required happiness. Redistribution can only
    // ever run a bounded number of times: each round either places the
    // freed shares somewhere better or proves no further round can help.
    let mut happiness;
    let mut redistribution_rounds = 0;
    loop {
        // Phase 1+: allocation passes over servers still in rotation.
        let mut pass = 1;
        while !homeless.is_empty() && trackers.iter().any(|t| t.writeable && t.in_rotation) {
            if cancel.is_cancelled() {
                for (_, (_, mut writer)) in open_writers {
                    let _ = writer.abort().await;
                }
                return Err(SelectionError::Cancelled);
            }
            debug!(pass, homeless = homeless.len(), "starting allocation pass");
            let wanted: Vec<u16> = homeless.iter().copied().collect();
            let mut still_homeless: VecDeque<u16> = VecDeque::new();

            for (idx, tracker) in trackers.iter_mut().enumerate() {
                if !tracker.writeable || !tracker.in_rotation || wanted.is_empty() {
                    continue;
                }
                // Only ask for one share per server per pass.
                let ask = match wanted.iter().find(|s| !open_writers.contains_key(s)) {
                    Some(&s) => vec![s],
                    None => continue,
                };

                stats.query_count += 1;
                match tracker
                    .server
                    .allocate_buckets(
                        storage_index,
                        renew_secret,
                        cancel_secret,
                        &ask,
                        share_size,
                    )
                    .await
                {
                    Ok(result) => {
                        let out_of_range = result
                            .already_have
                            .iter()
                            .any(|s| *s >= params.n)
                            || result.writers.iter().any(|(s, _)| *s >= params.n);
                        if out_of_range {
                            for (_, mut writer) in result.writers {
                                let _ = writer.abort().await;
                            }
                            for (_, (_, mut writer)) in open_writers {
                                let _ = writer.abort().await;
                            }
                            return Err(SelectionError::Protocol {
                                server: tracker.id.clone(),
                                reason: "allocate_buckets reported an out-of-range share number"
                                    .to_string(),
                            });
                        }

                        stats.good_query_count += 1;
                        for share in &result.already_have {
                            holders.entry(*share).or_default().push(idx);
                            homeless.retain(|&s| s != *share);
                        }
                        for (share, writer) in result.writers {
                            holders.entry(share).or_default().push(idx);
                            open_writers.insert(share, (idx, writer));
                            homeless.retain(|&s| s != share);
                        }
                        let accepted_all = ask.iter().all(|s| {
                            result.already_have.contains(s) || open_writers.contains_key(s)
                        });
                        if !accepted_all {
                            still_homeless.extend(ask.iter().filter(|s| homeless.contains(s)));
                        }
                    }
                    Err(bucket::Error::Full) => {
                        stats.full_count += 1;
                        stats.bad_query_count += 1;
                        tracker.in_rotation = false;
                        still_homeless.extend(ask);
                    }
                    Err(e @ bucket::Error::Rejected(_)) => {
                        stats.bad_query_count += 1;
                        debug!(server = ?tracker.id, error = %e, "allocate_buckets rejected");
                        tracker.in_rotation = false;
                        still_homeless.extend(ask);
                    }
                    Err(e @ bucket::Error::Transport(_)) => {
                        stats.bad_query_count += 1;
                        tracker.transport_failures += 1;
                        if tracker.transport_failures > MAX_TRANSPORT_RETRIES {
                            debug!(server = ?tracker.id, error = %e, "dropping server after repeated transport failures");
                            tracker.in_rotation = false;
                        } else {
                            debug!(server = ?tracker.id, error = %e, failures = tracker.transport_failures, "transport error, will retry");
                        }
                        still_homeless.extend(ask);
                    }
                    Err(e) => {
                        stats.bad_query_count += 1;
                        debug!(server = ?tracker.id, error = %e, "allocate_buckets failed, dropping server");
                        tracker.in_rotation = false;
                        still_homeless.extend(ask);
                    }
                }
            }

            for share in still_homeless {
                if !homeless.contains(&share) {
                    homeless.push_back(share);
                }
            }
            pass += 1;
            if pass > trackers.len() + 2 {
                warn!("giving up after exhausting the ring without placing every share");
                break;
            }
        }

        happiness = happiness::evaluate(&holders);
        if happiness.value >= params.h as usize {
            break;
        }

        let delta = params.h as usize - happiness.value;
        let movable = shares_to_redistribute(&holders, happiness.value, params.h as usize);
        let unused_in_rotation = trackers
            .iter()
            .filter(|t| t.writeable && t.in_rotation)
            .count();
        if delta > unused_in_rotation || movable.len() < delta {
            break;
        }

        redistribution_rounds += 1;
        debug!(
            round = redistribution_rounds,
            delta,
            movable = movable.len(),
            "attempting redistribution"
        );

        // Free one share per overcrowded server, keeping at least one
        // holder each, and send those shares back to the ring.
        let mut freed = 0;
        for share in movable {
            if freed >= delta {
                break;
            }
            let Some(servers) = holders.get(&share) else {
                continue;
            };
            if servers.len() <= 1 {
                continue;
            }
            let victim_idx = *servers.last().unwrap();
            if let Some((writer_idx, mut writer)) = open_writers.remove(&share) {
                if writer_idx == victim_idx {
                    let _ = writer.abort().await;
                    holders.get_mut(&share).unwrap().retain(|&s| s != victim_idx);
                    homeless.push_back(share);
                    freed += 1;
                    continue;
                }
                // Writer lives elsewhere; put it back untouched.
                open_writers.insert(share, (writer_idx, writer));
            }
            holders.get_mut(&share).unwrap().retain(|&s| s != victim_idx);
            homeless.push_back(share);
            freed += 1;
        }

        if freed == 0 {
            break;
        }
    }

    if happiness.value < params.h as usize {
        for (_, (_, mut writer)) in open_writers {
            let _ = writer.abort().await;
        }
        return Err(SelectionError::NotHappy {
            achieved: happiness.value,
            required: params.h as usize,
            happiness,
            stats,
        });
    }

    let writers = open_writers
        .into_iter()
        .map(|(share, (idx, writer))| (share, (trackers[idx].id.clone(), writer)))
        .collect();

    Ok(Placement { happiness, writers })
}

/// Given the current happiness matching, decide which shares could be
/// moved off overcrowded servers onto idle ones without lowering
/// happiness, per the `delta = H - H_eff` rule: redistribution is only
/// attempted when doing so cannot make things worse.
pub fn shares_to_redistribute(
    holders: &HashMap<u16, Vec<usize>>,
    happiness_value: usize,
    h: usize,
) -> Vec<u16> {
    if happiness_value < h {
        return Vec::new();
    }
    let mut per_server_count: HashMap<usize, usize> = HashMap::new();
    for servers in holders.values() {
        for &s in servers {
            *per_server_count.entry(s).or_default() += 1;
        }
    }
    let mut movable = Vec::new();
    for (share, servers) in holders {
        if servers.len() > 1 && servers.iter().any(|s| per_server_count[s] > 1) {
            movable.push(*share);
        }
    }
    movable.sort_unstable();
    movable
}
