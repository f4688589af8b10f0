//! # Swarm Protocol
//!
//! Content-addressed storage over an XOR-popcount proximity metric. A
//! *swarm of size r for key k* is the r peers (self included) whose
//! positions are closest to the position of `k`. Storing replicates a value
//! across its swarm; fetching asks the locally-visible swarm and verifies
//! every returned fragment against its hash before accepting it.
//!
//! A background storage audit keeps replication healthy without any global
//! view: each cycle re-checks all stale items plus the fresh items this node
//! is most responsible for by locality, and re-pushes the data to any swarm
//! member that cannot produce a valid copy.
//!
//! ## Positions
//!
//! Every candidate is ranked by the Blake2b hash of its textual form: a
//! peer by its address text, a query by its query bytes. Content keys are
//! passed through lookups in their tagged textual form, so every node ranks
//! a given key identically.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use lru::LruCache;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::base::{Outcome, RequestHandler};
use crate::distance;
use crate::handshake::{HandshakeProto, PeerView, Stamper};
use crate::hashing::{self, Digest};
use crate::identity::Address;
use crate::wire::{Request, RequestKind, Response};

/// Maximum locally stored items.
const STORAGE_CAPACITY: usize = 2048;

/// Upper bound on `n` honored for a single nearest-peers request.
const MAX_NEAREST_RESULTS: usize = 100;

/// Command channel capacity for the storage actor.
const COMMAND_CHANNEL_SIZE: usize = 256;

/// Point-in-time view of local storage, for telemetry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Items currently held.
    pub items: usize,
    /// Of those, items older than the storage freshness threshold.
    pub stale: usize,
    /// Total payload bytes held.
    pub bytes: usize,
}

struct StorageItem {
    data: String,
    created_at: Instant,
}

enum StorageCommand {
    Save {
        hash: Digest,
        data: String,
        reply: oneshot::Sender<bool>,
    },
    Get {
        hash: Digest,
        reply: oneshot::Sender<Option<String>>,
    },
    AuditSet {
        self_position: Digest,
        freshness: Duration,
        margin: usize,
        reply: oneshot::Sender<Vec<(Digest, String)>>,
    },
    MarkAudited {
        hash: Digest,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
    Stats {
        freshness: Duration,
        reply: oneshot::Sender<StorageStats>,
    },
    Clear,
    Quit,
}

struct StorageActor {
    items: LruCache<Digest, StorageItem>,
}

impl StorageActor {
    fn new() -> Self {
        let cap = NonZeroUsize::new(STORAGE_CAPACITY).expect("storage capacity must be non-zero");
        Self {
            items: LruCache::new(cap),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<StorageCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                StorageCommand::Save { hash, data, reply } => {
                    let _ = reply.send(self.save(hash, data));
                }
                StorageCommand::Get { hash, reply } => {
                    let value = self.items.get(&hash).map(|item| item.data.clone());
                    let _ = reply.send(value);
                }
                StorageCommand::AuditSet {
                    self_position,
                    freshness,
                    margin,
                    reply,
                } => {
                    let _ = reply.send(self.audit_set(&self_position, freshness, margin));
                }
                StorageCommand::MarkAudited { hash } => {
                    if let Some(item) = self.items.get_mut(&hash) {
                        item.created_at = Instant::now();
                    }
                }
                StorageCommand::Len { reply } => {
                    let _ = reply.send(self.items.len());
                }
                StorageCommand::Stats { freshness, reply } => {
                    let mut stats = StorageStats {
                        items: self.items.len(),
                        ..StorageStats::default()
                    };
                    for (_, item) in self.items.iter() {
                        stats.bytes += item.data.len();
                        if item.created_at.elapsed() > freshness {
                            stats.stale += 1;
                        }
                    }
                    let _ = reply.send(stats);
                }
                StorageCommand::Clear => {
                    self.items.clear();
                }
                StorageCommand::Quit => {
                    self.items.clear();
                    debug!("storage actor shutting down");
                    break;
                }
            }
        }
    }

    fn save(&mut self, hash: Digest, data: String) -> bool {
        // The storage invariant: hash(data) == hash, always.
        if hashing::blake2b(data.as_bytes()) != hash {
            warn!(
                hash = %hash.short_hex(),
                "rejecting save: data does not hash to the declared key"
            );
            return false;
        }
        self.items.put(
            hash,
            StorageItem {
                data,
                created_at: Instant::now(),
            },
        );
        true
    }

    /// All stale items, plus up to `margin` fresh items nearest to this
    /// node's own position.
    fn audit_set(
        &self,
        self_position: &Digest,
        freshness: Duration,
        margin: usize,
    ) -> Vec<(Digest, String)> {
        let mut stale = Vec::new();
        let mut fresh = Vec::new();
        for (hash, item) in self.items.iter() {
            if item.created_at.elapsed() > freshness {
                stale.push((*hash, item.data.clone()));
            } else {
                let position = distance::query_position(hash.tagged().as_bytes());
                let dist = distance::xor_popcount(self_position, &position);
                fresh.push((dist, *hash, item.data.clone()));
            }
        }
        fresh.sort_by_key(|(dist, _, _)| *dist);
        stale.extend(fresh.into_iter().take(margin).map(|(_, h, d)| (h, d)));
        stale
    }
}

/// Proximity lookup, replicated store/fetch, and the storage audit.
pub struct SwarmProto {
    handshake: Arc<HandshakeProto>,
    peers: PeerView,
    cmd_tx: mpsc::Sender<StorageCommand>,
    swarm_size: usize,
    max_depth: usize,
    audit_interval: Duration,
    storage_freshness: Duration,
    redundancy_margin: usize,
}

impl SwarmProto {
    pub fn new(
        handshake: Arc<HandshakeProto>,
        swarm_size: usize,
        max_depth: usize,
        audit_interval: Duration,
        storage_freshness: Duration,
        redundancy_margin: usize,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        tokio::spawn(StorageActor::new().run(cmd_rx));
        let peers = handshake.peer_view();
        Self {
            handshake,
            peers,
            cmd_tx,
            swarm_size,
            max_depth,
            audit_interval,
            storage_freshness,
            redundancy_margin,
        }
    }

    pub fn local_address(&self) -> &Address {
        self.handshake.local_address()
    }

    pub fn swarm_size(&self) -> usize {
        self.swarm_size
    }

    /// Register the three swarm handlers on the base layer.
    pub fn register_handlers(&self) {
        let stamper = self.handshake.stamper().clone();
        let nearest = Arc::new(NearestPeersHandler {
            stamper: stamper.clone(),
            peers: self.peers.clone(),
            local: self.local_address().clone(),
        });
        let store = Arc::new(StoreHandler {
            stamper: stamper.clone(),
            storage: self.cmd_tx.clone(),
        });
        let fetch = Arc::new(FetchHandler {
            stamper,
            storage: self.cmd_tx.clone(),
        });
        let base = self.handshake.base();
        base.register_request_handler(RequestKind::NearestPeers, nearest);
        base.register_request_handler(RequestKind::Store, store);
        base.register_request_handler(RequestKind::Fetch, fetch);
    }

    /// Iteratively find the `n` addresses nearest to the position of
    /// `query`, converging in at most `max_depth` rounds.
    pub async fn nearest_peers(&self, query: &[u8], n: usize) -> Result<Vec<Address>> {
        let target = distance::query_position(query);
        self.nearest_to_target(target, n).await
    }

    async fn nearest_to_target(&self, target: Digest, n: usize) -> Result<Vec<Address>> {
        let local = self.local_address().clone();
        let mut candidates: HashSet<Address> = self.peers.known_peers().await.into_iter().collect();
        candidates.insert(local.clone());

        let mut shortlist =
            distance::nearest_addresses(&target, candidates.iter().cloned().collect(), n);
        let mut best = shortlist
            .first()
            .map(|addr| distance::address_distance(&target, addr))
            .unwrap_or(u32::MAX);

        for round in 0..self.max_depth {
            let mut join_set = JoinSet::new();
            for peer in shortlist.iter().cloned() {
                if peer == local {
                    // Self answers locally: its nearest set is the seed set
                    // already merged into the candidates.
                    continue;
                }
                let handshake = self.handshake.clone();
                let request = Request::NearestPeers {
                    n,
                    hash: target,
                    stamp: String::new(),
                };
                join_set.spawn(async move {
                    match handshake.send_request(&peer, request).await {
                        Ok(Response::NearestPeers { peers }) => peers,
                        Ok(other) => {
                            debug!(peer = peer.short(), response = ?other, "unexpected nearest-peers response");
                            Vec::new()
                        }
                        Err(e) => {
                            debug!(peer = peer.short(), error = %e, "nearest-peers query failed");
                            Vec::new()
                        }
                    }
                });
            }

            let mut merged = Vec::new();
            while let Some(joined) = join_set.join_next().await {
                if let Ok(peers) = joined {
                    merged.extend(peers);
                }
            }

            if merged.is_empty() {
                break;
            }
            for addr in merged {
                candidates.insert(addr);
            }

            shortlist =
                distance::nearest_addresses(&target, candidates.iter().cloned().collect(), n);
            let improved = shortlist
                .first()
                .map(|addr| distance::address_distance(&target, addr))
                .unwrap_or(u32::MAX);

            trace!(
                target = %target.short_hex(),
                round,
                best,
                improved,
                candidates = candidates.len(),
                "lookup round complete"
            );

            if improved >= best {
                break;
            }
            best = improved;
        }

        Ok(shortlist)
    }

    /// Store `data` on its swarm. Returns the content hash.
    pub async fn store(&self, data: &str) -> Result<Digest> {
        let hash = hashing::blake2b(data.as_bytes());
        let swarm = self
            .nearest_peers(hash.tagged().as_bytes(), self.swarm_size)
            .await?;

        debug!(hash = %hash.short_hex(), swarm = swarm.len(), "storing data");
        let local = self.local_address().clone();
        let mut join_set = JoinSet::new();
        for peer in swarm {
            if peer == local {
                let storage = self.cmd_tx.clone();
                let data = data.to_string();
                join_set.spawn(async move {
                    save_local(&storage, hash, data).await;
                });
            } else {
                let handshake = self.handshake.clone();
                let request = Request::Store {
                    data: data.to_string(),
                    stamp: String::new(),
                };
                join_set.spawn(async move {
                    if let Err(e) = handshake.send_request(&peer, request).await {
                        debug!(peer = peer.short(), error = %e, "store request failed");
                    }
                });
            }
        }
        while join_set.join_next().await.is_some() {}

        Ok(hash)
    }

    /// Fetch the value stored under `hash` from its locally-visible swarm.
    /// Returns `None` when no peer can produce a valid copy.
    pub async fn fetch(&self, hash: &Digest) -> Result<Option<String>> {
        let target = distance::query_position(hash.tagged().as_bytes());
        let local = self.local_address().clone();
        let mut candidates = self.peers.known_peers().await;
        candidates.push(local.clone());
        let swarm = distance::nearest_addresses(&target, candidates, self.swarm_size);

        let mut join_set = JoinSet::new();
        for peer in swarm {
            let hash = *hash;
            if peer == local {
                let storage = self.cmd_tx.clone();
                join_set.spawn(async move { get_local(&storage, hash).await });
            } else {
                let handshake = self.handshake.clone();
                join_set.spawn(async move {
                    fetch_from(&handshake, &peer, hash).await.unwrap_or(None)
                });
            }
        }

        while let Some(joined) = join_set.join_next().await {
            if let Ok(Some(fragment)) = joined {
                if hashing::blake2b(fragment.as_bytes()) == *hash {
                    join_set.abort_all();
                    return Ok(Some(fragment));
                }
                warn!(
                    hash = %hash.short_hex(),
                    "discarding fragment whose hash does not match"
                );
            }
        }

        Ok(None)
    }

    /// Store a value into local storage only, bypassing the network.
    pub async fn save_local(&self, data: &str) -> Digest {
        let hash = hashing::blake2b(data.as_bytes());
        save_local(&self.cmd_tx, hash, data.to_string()).await;
        hash
    }

    /// Whether this node holds a valid local copy of `hash`.
    pub async fn has_local(&self, hash: &Digest) -> bool {
        get_local(&self.cmd_tx, *hash).await.is_some()
    }

    /// Number of locally held items.
    pub async fn stored_items(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(StorageCommand::Len { reply: tx }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Storage counters for telemetry, judged against this swarm's
    /// freshness threshold.
    pub async fn storage_stats(&self) -> StorageStats {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(StorageCommand::Stats {
                freshness: self.storage_freshness,
                reply: tx,
            })
            .await
            .is_err()
        {
            return StorageStats::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn clear(&self) {
        let _ = self.cmd_tx.send(StorageCommand::Clear).await;
    }

    /// Clear storage and stop its actor. Subsequent queries return empty
    /// defaults.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(StorageCommand::Quit).await;
    }

    /// Periodically re-replicate audited items to their current swarms.
    pub fn start_storage_audit(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let jitter = this
                    .audit_interval
                    .mul_f64(rand::thread_rng().gen_range(0.0..0.25));
                tokio::time::sleep(this.audit_interval + jitter).await;
                this.run_audit_cycle().await;
            }
        })
    }

    pub(crate) async fn run_audit_cycle(&self) {
        let self_position = distance::address_position(self.local_address());
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(StorageCommand::AuditSet {
                self_position,
                freshness: self.storage_freshness,
                margin: self.redundancy_margin,
                reply: tx,
            })
            .await
            .is_err()
        {
            return;
        }
        let audit_set = rx.await.unwrap_or_default();
        if audit_set.is_empty() {
            return;
        }

        debug!(items = audit_set.len(), "running storage audit");
        for (hash, data) in audit_set {
            self.audit_item(hash, data).await;
            let _ = self.cmd_tx.send(StorageCommand::MarkAudited { hash }).await;
        }
    }

    /// Verify every swarm member of one item and repair the ones that
    /// cannot produce a valid copy.
    async fn audit_item(&self, hash: Digest, data: String) {
        let target = distance::query_position(hash.tagged().as_bytes());
        let local = self.local_address().clone();
        let mut candidates = self.peers.known_peers().await;
        candidates.push(local.clone());
        let swarm = distance::nearest_addresses(&target, candidates, self.swarm_size);

        let mut join_set = JoinSet::new();
        for peer in swarm {
            if peer == local {
                continue;
            }
            let handshake = self.handshake.clone();
            let data = data.clone();
            join_set.spawn(async move {
                let holds_valid = match fetch_from(&handshake, &peer, hash).await {
                    Ok(Some(fragment)) => hashing::blake2b(fragment.as_bytes()) == hash,
                    Ok(None) | Err(_) => false,
                };
                if holds_valid {
                    return;
                }
                trace!(peer = peer.short(), hash = %hash.short_hex(), "repairing replica");
                let request = Request::Store {
                    data,
                    stamp: String::new(),
                };
                if let Err(e) = handshake.send_request(&peer, request).await {
                    debug!(peer = peer.short(), error = %e, "replica repair failed");
                }
            });
        }
        while join_set.join_next().await.is_some() {}
    }
}

async fn save_local(storage: &mpsc::Sender<StorageCommand>, hash: Digest, data: String) -> bool {
    let (tx, rx) = oneshot::channel();
    if storage
        .send(StorageCommand::Save { hash, data, reply: tx })
        .await
        .is_err()
    {
        return false;
    }
    rx.await.unwrap_or(false)
}

async fn get_local(storage: &mpsc::Sender<StorageCommand>, hash: Digest) -> Option<String> {
    let (tx, rx) = oneshot::channel();
    if storage
        .send(StorageCommand::Get { hash, reply: tx })
        .await
        .is_err()
    {
        return None;
    }
    rx.await.unwrap_or(None)
}

async fn fetch_from(
    handshake: &HandshakeProto,
    peer: &Address,
    hash: Digest,
) -> Result<Option<String>> {
    let request = Request::Fetch {
        hash,
        stamp: String::new(),
    };
    match handshake.send_request(peer, request).await? {
        Response::Fetch { fragment } => Ok(fragment),
        other => Err(anyhow!("unexpected response to fetch: {:?}", other)),
    }
}

/// Handles `swarm:nearest-peers-request`.
struct NearestPeersHandler {
    stamper: Arc<Stamper>,
    peers: PeerView,
    local: Address,
}

#[async_trait]
impl RequestHandler for NearestPeersHandler {
    async fn handle(&self, from: Address, request: Request) -> Result<Outcome> {
        if !self.stamper.verify(&request) {
            warn!(from = from.short(), "invalid stamp on nearest-peers request");
            return Ok(Outcome::Drop);
        }
        let Request::NearestPeers { n, hash, .. } = request else {
            return Ok(Outcome::Drop);
        };
        let n = if n > MAX_NEAREST_RESULTS {
            warn!(
                from = from.short(),
                requested = n,
                max = MAX_NEAREST_RESULTS,
                "clamping nearest-peers result count"
            );
            MAX_NEAREST_RESULTS
        } else {
            n
        };
        let mut candidates = self.peers.known_peers().await;
        candidates.push(self.local.clone());
        let peers = distance::nearest_addresses(&hash, candidates, n);
        Ok(Outcome::Reply(Response::NearestPeers { peers }))
    }
}

/// Handles `swarm:store-request`.
struct StoreHandler {
    stamper: Arc<Stamper>,
    storage: mpsc::Sender<StorageCommand>,
}

#[async_trait]
impl RequestHandler for StoreHandler {
    async fn handle(&self, from: Address, request: Request) -> Result<Outcome> {
        if !self.stamper.verify(&request) {
            warn!(from = from.short(), "invalid stamp on store request");
            return Ok(Outcome::Drop);
        }
        let Request::Store { data, .. } = request else {
            return Ok(Outcome::Drop);
        };
        let hash = hashing::blake2b(data.as_bytes());
        trace!(from = from.short(), hash = %hash.short_hex(), "storing on behalf of peer");
        save_local(&self.storage, hash, data).await;
        Ok(Outcome::Reply(Response::Empty))
    }
}

/// Handles `swarm:fetch-request`.
struct FetchHandler {
    stamper: Arc<Stamper>,
    storage: mpsc::Sender<StorageCommand>,
}

#[async_trait]
impl RequestHandler for FetchHandler {
    async fn handle(&self, from: Address, request: Request) -> Result<Outcome> {
        if !self.stamper.verify(&request) {
            warn!(from = from.short(), "invalid stamp on fetch request");
            return Ok(Outcome::Drop);
        }
        let Request::Fetch { hash, .. } = request else {
            return Ok(Outcome::Drop);
        };
        let fragment = get_local(&self.storage, hash).await;
        Ok(Outcome::Reply(Response::Fetch { fragment }))
    }
}
