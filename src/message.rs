//! # Message Protocol
//!
//! Recipient-anonymized asynchronous messaging on top of the swarm. Each
//! message envelope is Shamir-split into five shares with a reconstruction
//! threshold of three; every share is stored as an ordinary swarm object,
//! indistinguishable from any other fragment. The share hashes are indexed
//! in a *metadata bucket* replicated around the Blake3 hash of the
//! recipient's address, so content placement and inbox placement live in
//! disjoint keyspaces.
//!
//! Retrieval unions the buckets of the metadata swarm, fetches every listed
//! fragment, groups shares by their message group id, and reconstructs only
//! the groups that still have a threshold of shares. Short groups are
//! dropped silently.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::base::{Outcome, RequestHandler};
use crate::handshake::{HandshakeProto, Stamper};
use crate::hashing::{self, Digest};
use crate::identity::Address;
use crate::shamir::{self, Share};
use crate::swarm::SwarmProto;
use crate::wire::{Request, RequestKind, Response, WireUuid};

/// Maximum owners tracked per metadata holder.
const METADATA_OWNER_CAPACITY: usize = 2048;

/// Command channel capacity for the metadata actor.
const COMMAND_CHANNEL_SIZE: usize = 256;

/// Tag prefixing a Base64 share body inside a fragment.
const SHARE_PREFIX: &str = "base64,";

/// A reconstructed message as handed back from the inbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
    pub timestamp: u64,
}

/// One Shamir share of a message envelope, stored as a swarm object.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Fragment {
    id: WireUuid,
    content: String,
}

/// Point-in-time view of the metadata buckets, for telemetry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetadataStats {
    /// Owners with a live bucket.
    pub owners: usize,
    /// Content hashes indexed across all buckets.
    pub hashes: usize,
}

enum MetadataCommand {
    Union {
        owner: Address,
        hashes: Vec<Digest>,
    },
    Get {
        owner: Address,
        reply: oneshot::Sender<Vec<Digest>>,
    },
    Stats {
        reply: oneshot::Sender<MetadataStats>,
    },
    Clear,
    Quit,
}

struct MetadataActor {
    buckets: LruCache<Address, HashSet<Digest>>,
}

impl MetadataActor {
    fn new() -> Self {
        let cap =
            NonZeroUsize::new(METADATA_OWNER_CAPACITY).expect("metadata capacity must be non-zero");
        Self {
            buckets: LruCache::new(cap),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<MetadataCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                MetadataCommand::Union { owner, hashes } => {
                    let bucket = self.buckets.get_or_insert_mut(owner, HashSet::new);
                    bucket.extend(hashes);
                }
                MetadataCommand::Get { owner, reply } => {
                    let hashes = self
                        .buckets
                        .get(&owner)
                        .map(|bucket| {
                            let mut sorted: Vec<Digest> = bucket.iter().copied().collect();
                            sorted.sort();
                            sorted
                        })
                        .unwrap_or_default();
                    let _ = reply.send(hashes);
                }
                MetadataCommand::Stats { reply } => {
                    let hashes = self.buckets.iter().map(|(_, bucket)| bucket.len()).sum();
                    let _ = reply.send(MetadataStats {
                        owners: self.buckets.len(),
                        hashes,
                    });
                }
                MetadataCommand::Clear => {
                    self.buckets.clear();
                }
                MetadataCommand::Quit => {
                    self.buckets.clear();
                    debug!("metadata actor shutting down");
                    break;
                }
            }
        }
    }
}

/// Shamir-split messaging and metadata indexing on top of the swarm.
pub struct MessageProto {
    swarm: Arc<SwarmProto>,
    handshake: Arc<HandshakeProto>,
    cmd_tx: mpsc::Sender<MetadataCommand>,
    shares: u8,
    threshold: u8,
    metadata_swarm_size: usize,
}

impl MessageProto {
    pub fn new(
        swarm: Arc<SwarmProto>,
        handshake: Arc<HandshakeProto>,
        shares: u8,
        threshold: u8,
        metadata_swarm_size: usize,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        tokio::spawn(MetadataActor::new().run(cmd_rx));
        Self {
            swarm,
            handshake,
            cmd_tx,
            shares,
            threshold,
            metadata_swarm_size,
        }
    }

    pub fn local_address(&self) -> &Address {
        self.handshake.local_address()
    }

    /// Register the metadata handlers on the base layer.
    pub fn register_handlers(&self) {
        let stamper = self.handshake.stamper().clone();
        let set = Arc::new(SetMetadataHandler {
            stamper: stamper.clone(),
            metadata: self.cmd_tx.clone(),
        });
        let get = Arc::new(GetMetadataHandler {
            stamper,
            metadata: self.cmd_tx.clone(),
        });
        let base = self.handshake.base();
        base.register_request_handler(RequestKind::SetMetadata, set);
        base.register_request_handler(RequestKind::GetMetadata, get);
    }

    /// Send one message to `recipient`.
    pub async fn send_message(&self, recipient: &Address, text: &str) -> Result<()> {
        self.send_messages(recipient, &[text.to_string()]).await
    }

    /// Send several messages to `recipient`, aggregating all share hashes
    /// into a single metadata update per holder.
    pub async fn send_messages(&self, recipient: &Address, texts: &[String]) -> Result<()> {
        let mut all_hashes = Vec::new();
        for text in texts {
            let envelope = Message {
                text: text.clone(),
                timestamp: now_ms(),
            };
            let bytes = serde_json::to_vec(&envelope)?;
            let shares = shamir::split(&bytes, self.shares, self.threshold)?;
            let group = WireUuid::random();

            for share in shares {
                let fragment = Fragment {
                    id: group,
                    content: encode_share(&share),
                };
                let json = serde_json::to_string(&fragment)?;
                let hash = self.swarm.store(&json).await?;
                all_hashes.push(hash);
            }
            trace!(group = %group, recipient = recipient.short(), "message fragments stored");
        }

        if all_hashes.is_empty() {
            return Ok(());
        }
        self.publish_metadata(recipient, all_hashes).await
    }

    /// Retrieve and reconstruct every currently recoverable message for
    /// `owner`.
    pub async fn get_inbox(&self, owner: &Address) -> Result<Vec<Message>> {
        let holders = self.metadata_swarm(owner).await?;
        let local = self.local_address().clone();

        let mut join_set = JoinSet::new();
        for holder in holders {
            let owner = owner.clone();
            if holder == local {
                let metadata = self.cmd_tx.clone();
                join_set.spawn(async move { read_bucket(&metadata, owner).await });
            } else {
                let handshake = self.handshake.clone();
                join_set.spawn(async move {
                    let request = Request::GetMetadata {
                        address: owner,
                        stamp: String::new(),
                    };
                    match handshake.send_request(&holder, request).await {
                        Ok(Response::GetMetadata { metadata }) => metadata,
                        Ok(other) => {
                            debug!(holder = holder.short(), response = ?other, "unexpected metadata response");
                            Vec::new()
                        }
                        Err(e) => {
                            debug!(holder = holder.short(), error = %e, "metadata query failed");
                            Vec::new()
                        }
                    }
                });
            }
        }

        let mut hashes: HashSet<Digest> = HashSet::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok(found) = joined {
                hashes.extend(found);
            }
        }

        let mut groups: HashMap<WireUuid, Vec<Share>> = HashMap::new();
        for hash in hashes {
            let fragment_json = match self.swarm.fetch(&hash).await {
                Ok(Some(json)) => json,
                Ok(None) => continue,
                Err(e) => {
                    debug!(hash = %hash.short_hex(), error = %e, "fragment fetch failed");
                    continue;
                }
            };
            let fragment: Fragment = match serde_json::from_str(&fragment_json) {
                Ok(fragment) => fragment,
                Err(e) => {
                    debug!(hash = %hash.short_hex(), error = %e, "not a message fragment");
                    continue;
                }
            };
            match decode_share(&fragment.content) {
                Some(share) => groups.entry(fragment.id).or_default().push(share),
                None => {
                    debug!(hash = %hash.short_hex(), "fragment carries an undecodable share");
                }
            }
        }

        Ok(reassemble(groups, self.threshold))
    }

    /// Union hashes into this node's own bucket for `owner`.
    pub(crate) async fn union_local(&self, owner: &Address, hashes: Vec<Digest>) {
        let _ = self
            .cmd_tx
            .send(MetadataCommand::Union {
                owner: owner.clone(),
                hashes,
            })
            .await;
    }

    /// Metadata-bucket counters for telemetry.
    pub async fn metadata_stats(&self) -> MetadataStats {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(MetadataCommand::Stats { reply: tx }).await.is_err() {
            return MetadataStats::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn clear(&self) {
        let _ = self.cmd_tx.send(MetadataCommand::Clear).await;
    }

    /// Clear the buckets and stop their actor. Subsequent queries return
    /// empty defaults.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(MetadataCommand::Quit).await;
    }

    async fn metadata_swarm(&self, owner: &Address) -> Result<Vec<Address>> {
        let owner_hash = hashing::blake3(owner.position_bytes());
        self.swarm
            .nearest_peers(owner_hash.tagged().as_bytes(), self.metadata_swarm_size)
            .await
    }

    async fn publish_metadata(&self, recipient: &Address, hashes: Vec<Digest>) -> Result<()> {
        let holders = self.metadata_swarm(recipient).await?;
        let local = self.local_address().clone();

        debug!(
            recipient = recipient.short(),
            hashes = hashes.len(),
            holders = holders.len(),
            "publishing metadata"
        );

        let mut join_set = JoinSet::new();
        for holder in holders {
            if holder == local {
                self.union_local(recipient, hashes.clone()).await;
                continue;
            }
            let handshake = self.handshake.clone();
            let request = Request::SetMetadata {
                owner: recipient.clone(),
                metadata: hashes.clone(),
                stamp: String::new(),
            };
            join_set.spawn(async move {
                if let Err(e) = handshake.send_request(&holder, request).await {
                    debug!(holder = holder.short(), error = %e, "metadata update failed");
                }
            });
        }
        while join_set.join_next().await.is_some() {}
        Ok(())
    }
}

/// Reconstruct every group holding at least `threshold` shares.
fn reassemble(groups: HashMap<WireUuid, Vec<Share>>, threshold: u8) -> Vec<Message> {
    let mut messages = Vec::new();
    for (group, shares) in groups {
        if shares.len() < threshold as usize {
            debug!(
                group = %group,
                shares = shares.len(),
                threshold,
                "dropping group below reconstruction threshold"
            );
            continue;
        }
        let bytes = match shamir::combine(&shares) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(group = %group, error = %e, "share combination failed");
                continue;
            }
        };
        match serde_json::from_slice::<Message>(&bytes) {
            Ok(message) => messages.push(message),
            Err(e) => {
                debug!(group = %group, error = %e, "reconstructed bytes are not an envelope");
            }
        }
    }
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.text.cmp(&b.text)));
    messages
}

fn encode_share(share: &Share) -> String {
    format!("{}{}", SHARE_PREFIX, BASE64.encode(share.to_bytes()))
}

fn decode_share(content: &str) -> Option<Share> {
    let body = content.strip_prefix(SHARE_PREFIX)?;
    let bytes = BASE64.decode(body).ok()?;
    Share::from_bytes(&bytes).ok()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

async fn read_bucket(metadata: &mpsc::Sender<MetadataCommand>, owner: Address) -> Vec<Digest> {
    let (tx, rx) = oneshot::channel();
    if metadata
        .send(MetadataCommand::Get { owner, reply: tx })
        .await
        .is_err()
    {
        return Vec::new();
    }
    rx.await.unwrap_or_default()
}

/// Handles `message:store-metadata-request`.
struct SetMetadataHandler {
    stamper: Arc<Stamper>,
    metadata: mpsc::Sender<MetadataCommand>,
}

#[async_trait]
impl RequestHandler for SetMetadataHandler {
    async fn handle(&self, from: Address, request: Request) -> Result<Outcome> {
        if !self.stamper.verify(&request) {
            warn!(from = from.short(), "invalid stamp on store-metadata request");
            return Ok(Outcome::Drop);
        }
        let Request::SetMetadata { owner, metadata, .. } = request else {
            return Ok(Outcome::Drop);
        };
        trace!(
            from = from.short(),
            owner = owner.short(),
            hashes = metadata.len(),
            "metadata bucket update"
        );
        let _ = self
            .metadata
            .send(MetadataCommand::Union {
                owner,
                hashes: metadata,
            })
            .await;
        Ok(Outcome::Reply(Response::Empty))
    }
}

/// Handles `message:get-metadata-request`.
struct GetMetadataHandler {
    stamper: Arc<Stamper>,
    metadata: mpsc::Sender<MetadataCommand>,
}

#[async_trait]
impl RequestHandler for GetMetadataHandler {
    async fn handle(&self, from: Address, request: Request) -> Result<Outcome> {
        if !self.stamper.verify(&request) {
            warn!(from = from.short(), "invalid stamp on get-metadata request");
            return Ok(Outcome::Drop);
        }
        let Request::GetMetadata { address, .. } = request else {
            return Ok(Outcome::Drop);
        };
        let metadata = read_bucket(&self.metadata, address).await;
        Ok(Outcome::Reply(Response::GetMetadata { metadata }))
    }
}
