//! # High-Level Node API
//!
//! A [`Node`] assembles the four protocol layers over one transport and
//! manages their lifecycle. Construction wires the layers and registers
//! every request handler; [`Node::start`] begins accepting streams,
//! consuming peer events, and running both background audits;
//! [`Node::stop`] cancels the timers, rejects outstanding calls, and clears
//! all in-memory state.
//!
//! ```ignore
//! let node = Node::new(transport, Config::default());
//! node.start().await?;
//!
//! let hash = node.store("hello").await?;
//! let data = node.fetch(&hash).await?;
//!
//! node.send_message(&recipient, "hi").await?;
//! let inbox = node.inbox().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::base::BaseProto;
use crate::handshake::{HandshakeProto, Stamper};
use crate::hashing::Digest;
use crate::identity::Address;
use crate::message::{Message, MessageProto};
use crate::swarm::SwarmProto;
use crate::transport::Transport;

/// Passphrase used when a deployment does not override it.
pub const DEFAULT_PASSPHRASE: &str = "speak friend and enter";

/// Tunable parameters for one node. `Default` carries the protocol's
/// normative values; deployments override the passphrase.
#[derive(Clone, Debug)]
pub struct Config {
    /// Shared secret gating admission.
    pub passphrase: String,
    /// Replication degree for stored content.
    pub swarm_size: usize,
    /// Replication degree for metadata buckets.
    pub metadata_swarm_size: usize,
    /// Maximum iterative lookup rounds.
    pub max_depth: usize,
    /// Per-request deadline; also the admission limiter window.
    pub timeout: Duration,
    /// Cadence of the peer pulse audit.
    pub pulse_interval: Duration,
    /// Age past which a peer record is stale.
    pub pulse_freshness: Duration,
    /// Cadence of the storage audit.
    pub storage_audit_interval: Duration,
    /// Age past which a stored item is stale.
    pub storage_freshness: Duration,
    /// Fresh items audited per cycle beyond the stale ones.
    pub redundancy_margin: usize,
    /// Shares per message envelope.
    pub shamir_shares: u8,
    /// Shares required to reconstruct an envelope.
    pub shamir_threshold: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            passphrase: DEFAULT_PASSPHRASE.to_string(),
            swarm_size: 3,
            metadata_swarm_size: 5,
            max_depth: 5,
            timeout: Duration::from_secs(30),
            pulse_interval: Duration::from_secs(60),
            pulse_freshness: Duration::from_secs(120),
            storage_audit_interval: Duration::from_secs(60),
            storage_freshness: Duration::from_secs(180),
            redundancy_margin: 10,
            shamir_shares: 5,
            shamir_threshold: 3,
        }
    }
}

/// Point-in-time counters aggregated across the layers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Peers currently admitted.
    pub peers: usize,
    /// Admitted peers past the freshness threshold.
    pub stale_peers: usize,
    /// Items in local storage.
    pub stored_items: usize,
    /// Stored items past the storage freshness threshold.
    pub stale_items: usize,
    /// Total payload bytes in local storage.
    pub stored_bytes: usize,
    /// Owners with a live metadata bucket.
    pub metadata_owners: usize,
    /// Content hashes indexed across all buckets.
    pub metadata_hashes: usize,
}

/// One overlay participant: the full protocol stack over one transport.
pub struct Node {
    transport: Arc<dyn Transport>,
    base: Arc<BaseProto>,
    handshake: Arc<HandshakeProto>,
    swarm: Arc<SwarmProto>,
    message: Arc<MessageProto>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Assemble the stack and register every request handler. The node does
    /// not touch the network until [`Node::start`].
    pub fn new(transport: Arc<dyn Transport>, config: Config) -> Self {
        let base = Arc::new(BaseProto::new(transport.clone(), config.timeout));
        let stamper = Arc::new(Stamper::new(&config.passphrase));
        let handshake = Arc::new(HandshakeProto::new(
            base.clone(),
            stamper,
            config.pulse_interval,
            config.pulse_freshness,
        ));
        let swarm = Arc::new(SwarmProto::new(
            handshake.clone(),
            config.swarm_size,
            config.max_depth,
            config.storage_audit_interval,
            config.storage_freshness,
            config.redundancy_margin,
        ));
        let message = Arc::new(MessageProto::new(
            swarm.clone(),
            handshake.clone(),
            config.shamir_shares,
            config.shamir_threshold,
            config.metadata_swarm_size,
        ));

        handshake.register_handlers();
        swarm.register_handlers();
        message.register_handlers();

        Self {
            transport,
            base,
            handshake,
            swarm,
            message,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Begin serving: accept inbound streams, admit identified peers, and
    /// run the pulse and storage audits.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            anyhow::bail!("node already started");
        }

        tasks.push(self.base.start());
        match self.transport.take_events().await {
            Some(events) => tasks.push(self.handshake.start_event_loop(events)),
            None => warn!("transport exposes no peer events; admission is manual"),
        }
        tasks.push(self.handshake.start_pulse_audit());
        tasks.push(self.swarm.start_storage_audit());

        info!(address = self.address().short(), "node started");
        Ok(())
    }

    /// Cancel the background tasks, reject outstanding calls, and shut down
    /// each layer's actor, clearing its state. The node can not be
    /// restarted.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        self.base.shutdown().await;
        self.handshake.quit().await;
        self.swarm.quit().await;
        self.message.quit().await;
        info!(address = self.address().short(), "node stopped");
    }

    /// This node's own address.
    pub fn address(&self) -> &Address {
        self.base.local_address()
    }

    /// Addresses of every currently admitted peer.
    pub async fn peers(&self) -> Vec<Address> {
        self.handshake.known_peers().await
    }

    /// Explicitly admit a peer, as if the transport had identified it.
    pub async fn admit(&self, peer: &Address) -> Result<()> {
        self.handshake.admit(peer).await
    }

    /// Store `data` on its swarm; returns the content hash.
    pub async fn store(&self, data: &str) -> Result<Digest> {
        self.swarm.store(data).await
    }

    /// Fetch the value stored under `hash`, if any peer still holds it.
    pub async fn fetch(&self, hash: &Digest) -> Result<Option<String>> {
        self.swarm.fetch(hash).await
    }

    /// The `n` addresses nearest to the position of `query`.
    pub async fn nearest_peers(&self, query: &[u8], n: usize) -> Result<Vec<Address>> {
        self.swarm.nearest_peers(query, n).await
    }

    /// Send one message to `recipient`.
    pub async fn send_message(&self, recipient: &Address, text: &str) -> Result<()> {
        self.message.send_message(recipient, text).await
    }

    /// Send several messages to `recipient` with one metadata update per
    /// holder.
    pub async fn send_messages(&self, recipient: &Address, texts: &[String]) -> Result<()> {
        self.message.send_messages(recipient, texts).await
    }

    /// Reconstruct every currently recoverable message addressed to this
    /// node.
    pub async fn inbox(&self) -> Result<Vec<Message>> {
        let owner = self.address().clone();
        self.message.get_inbox(&owner).await
    }

    /// Reconstruct the inbox of an arbitrary owner address.
    pub async fn inbox_of(&self, owner: &Address) -> Result<Vec<Message>> {
        self.message.get_inbox(owner).await
    }

    /// Whether this node holds a valid local copy of `hash`.
    pub async fn has_local(&self, hash: &Digest) -> bool {
        self.swarm.has_local(hash).await
    }

    /// Number of items in local storage.
    pub async fn stored_items(&self) -> usize {
        self.swarm.stored_items().await
    }

    /// Aggregate counters from the peer table, storage, and metadata
    /// buckets.
    pub async fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        let peer_stats = self.handshake.table_stats().await;
        let storage_stats = self.swarm.storage_stats().await;
        let metadata_stats = self.message.metadata_stats().await;
        TelemetrySnapshot {
            peers: peer_stats.peers,
            stale_peers: peer_stats.stale,
            stored_items: storage_stats.items,
            stale_items: storage_stats.stale,
            stored_bytes: storage_stats.bytes,
            metadata_owners: metadata_stats.owners,
            metadata_hashes: metadata_stats.hashes,
        }
    }
}
