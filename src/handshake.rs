//! # Handshake Protocol
//!
//! Admission control and peer liveness. Every request on the wire carries a
//! *stamp*: a keyed Blake2b over the request's canonical JSON (with the
//! stamp member removed), keyed by the current rotating key derived from the
//! shared passphrase. Any party that knows the passphrase can stamp; nobody
//! else can. Replays are bounded by the base layer's duplicate cache.
//!
//! The peer table tracks every admitted peer with a `last_seen` instant.
//! A background pulse audit re-validates peers whose record has gone stale,
//! and [`HandshakeProto::send_request`] gates every upper-layer send on the
//! target being fresh, re-pulsing first when it is not. Peers that fail a
//! pulse are evicted.

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
use tracing::{debug, info, trace, warn};

use crate::base::{BaseProto, Outcome, RequestHandler};
use crate::canonical;
use crate::hashing;
use crate::identity::Address;
use crate::totp::Totp;
use crate::transport::PeerEvent;
use crate::wire::{Request, RequestKind, Response};

/// Maximum peers tracked in the admission table.
const PEER_TABLE_CAPACITY: usize = 1024;

/// Command channel capacity for the peer table actor.
const COMMAND_CHANNEL_SIZE: usize = 256;

/// Produces and verifies request stamps from the shared passphrase.
///
/// The passphrase is reduced to a 32-byte initiation token; a 30-second
/// rotating key derived from the token keys the per-request MAC.
/// Verification accepts the adjacent time steps.
#[derive(Clone)]
pub struct Stamper {
    totp: Totp,
}

impl Stamper {
    pub fn new(passphrase: &str) -> Self {
        let token = hashing::blake2b(passphrase.as_bytes());
        Self {
            totp: Totp::new(*token.as_bytes()),
        }
    }

    /// Compute and assign the stamp for `request` under the current key.
    pub fn stamp(&self, request: &mut Request) -> Result<()> {
        let stamp = self.compute(&self.totp.current_key(), request)?;
        request.set_stamp(stamp);
        Ok(())
    }

    /// Re-verify a presented stamp against the current key window.
    pub fn verify(&self, request: &Request) -> bool {
        let presented = request.stamp();
        for key in self.totp.window_keys() {
            if let Ok(expected) = self.compute(&key, request)
                && expected == presented
            {
                return true;
            }
        }
        false
    }

    fn compute(&self, key: &[u8], request: &Request) -> Result<String> {
        let mut value = serde_json::to_value(request)?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| anyhow!("request did not serialize to an object"))?;
        obj.remove("stamp");
        let canonical = canonical::canonicalize(&value);
        Ok(hashing::blake2b_keyed(key, canonical.as_bytes()).tagged())
    }
}

/// Freshness classification of a peer table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerStatus {
    Absent,
    Fresh,
    Stale,
}

/// Point-in-time view of the peer table, for telemetry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerTableStats {
    /// Peers currently admitted.
    pub peers: usize,
    /// Of those, peers whose record has outlived the freshness threshold.
    pub stale: usize,
}

struct PeerRecord {
    last_seen: Instant,
}

enum PeerCommand {
    Upsert(Address),
    Remove(Address),
    Status {
        peer: Address,
        reply: oneshot::Sender<PeerStatus>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<Address>>,
    },
    StalePeers {
        reply: oneshot::Sender<Vec<Address>>,
    },
    Stats {
        reply: oneshot::Sender<PeerTableStats>,
    },
    Clear,
    Quit,
}

struct PeerTableActor {
    peers: LruCache<Address, PeerRecord>,
    freshness: Duration,
}

impl PeerTableActor {
    fn new(freshness: Duration) -> Self {
        let cap = NonZeroUsize::new(PEER_TABLE_CAPACITY).expect("peer capacity must be non-zero");
        Self {
            peers: LruCache::new(cap),
            freshness,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<PeerCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                PeerCommand::Upsert(addr) => {
                    self.peers.put(addr, PeerRecord { last_seen: Instant::now() });
                }
                PeerCommand::Remove(addr) => {
                    if self.peers.pop(&addr).is_some() {
                        debug!(peer = addr.short(), "removed peer record");
                    }
                }
                PeerCommand::Status { peer, reply } => {
                    let status = match self.peers.peek(&peer) {
                        None => PeerStatus::Absent,
                        Some(record) if record.last_seen.elapsed() > self.freshness => {
                            PeerStatus::Stale
                        }
                        Some(_) => PeerStatus::Fresh,
                    };
                    let _ = reply.send(status);
                }
                PeerCommand::Snapshot { reply } => {
                    let peers = self.peers.iter().map(|(addr, _)| addr.clone()).collect();
                    let _ = reply.send(peers);
                }
                PeerCommand::StalePeers { reply } => {
                    let stale = self
                        .peers
                        .iter()
                        .filter(|(_, record)| record.last_seen.elapsed() > self.freshness)
                        .map(|(addr, _)| addr.clone())
                        .collect();
                    let _ = reply.send(stale);
                }
                PeerCommand::Stats { reply } => {
                    let stale = self
                        .peers
                        .iter()
                        .filter(|(_, record)| record.last_seen.elapsed() > self.freshness)
                        .count();
                    let _ = reply.send(PeerTableStats {
                        peers: self.peers.len(),
                        stale,
                    });
                }
                PeerCommand::Clear => {
                    self.peers.clear();
                }
                PeerCommand::Quit => {
                    self.peers.clear();
                    debug!("peer table actor shutting down");
                    break;
                }
            }
        }
    }
}

/// Cheap cloneable view of the peer table, for handlers that only need to
/// read the current peer set.
#[derive(Clone)]
pub struct PeerView {
    cmd_tx: mpsc::Sender<PeerCommand>,
}

impl PeerView {
    /// Addresses of every currently admitted peer.
    pub async fn known_peers(&self) -> Vec<Address> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(PeerCommand::Snapshot { reply: tx }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Admission stamping and peer freshness on top of [`BaseProto`].
pub struct HandshakeProto {
    base: Arc<BaseProto>,
    stamper: Arc<Stamper>,
    cmd_tx: mpsc::Sender<PeerCommand>,
    pulse_interval: Duration,
}

impl HandshakeProto {
    pub fn new(
        base: Arc<BaseProto>,
        stamper: Arc<Stamper>,
        pulse_interval: Duration,
        pulse_freshness: Duration,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        tokio::spawn(PeerTableActor::new(pulse_freshness).run(cmd_rx));
        Self {
            base,
            stamper,
            cmd_tx,
            pulse_interval,
        }
    }

    /// This node's own address.
    pub fn local_address(&self) -> &Address {
        self.base.local_address()
    }

    /// The base layer this protocol is registered on.
    pub fn base(&self) -> &Arc<BaseProto> {
        &self.base
    }

    pub fn stamper(&self) -> &Arc<Stamper> {
        &self.stamper
    }

    /// A read-only view of the peer table.
    pub fn peer_view(&self) -> PeerView {
        PeerView {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Register the admission handlers on the base layer.
    pub fn register_handlers(&self) {
        let handler = Arc::new(AdmissionHandler {
            stamper: self.stamper.clone(),
            peers: self.cmd_tx.clone(),
        });
        self.base
            .register_request_handler(RequestKind::Initiation, handler.clone());
        self.base
            .register_request_handler(RequestKind::Pulse, handler);
    }

    /// Introduce ourselves to a newly identified peer. On success the peer
    /// enters the table as fresh.
    pub async fn admit(&self, peer: &Address) -> Result<()> {
        let mut request = Request::Initiation { stamp: String::new() };
        self.stamper.stamp(&mut request)?;
        self.base.send_request(peer, request).await?;
        self.upsert(peer).await;
        info!(peer = peer.short(), "peer admitted");
        Ok(())
    }

    /// Probe a peer's liveness. Success refreshes `last_seen`; failure
    /// evicts the peer and surfaces the error.
    pub async fn pulse(&self, peer: &Address) -> Result<()> {
        let mut request = Request::Pulse { stamp: String::new() };
        self.stamper.stamp(&mut request)?;
        match self.base.send_request(peer, request).await {
            Ok(_) => {
                self.upsert(peer).await;
                trace!(peer = peer.short(), "pulse ok");
                Ok(())
            }
            Err(e) => {
                debug!(peer = peer.short(), error = %e, "pulse failed, evicting peer");
                let _ = self.cmd_tx.send(PeerCommand::Remove(peer.clone())).await;
                Err(e)
            }
        }
    }

    /// Guarantee the peer is currently considered live, pulsing if needed.
    pub async fn ensure_fresh(&self, peer: &Address) -> Result<()> {
        match self.status(peer).await {
            PeerStatus::Fresh => Ok(()),
            PeerStatus::Stale | PeerStatus::Absent => self.pulse(peer).await,
        }
    }

    /// Stamp and send an upper-layer request, gated on peer freshness.
    pub async fn send_request(&self, peer: &Address, mut request: Request) -> Result<Response> {
        if peer == self.local_address() {
            anyhow::bail!("refusing to send a network request to self");
        }
        self.ensure_fresh(peer).await?;
        self.stamper.stamp(&mut request)?;
        self.base.send_request(peer, request).await
    }

    /// Addresses of every currently admitted peer.
    pub async fn known_peers(&self) -> Vec<Address> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(PeerCommand::Snapshot { reply: tx }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn status(&self, peer: &Address) -> PeerStatus {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(PeerCommand::Status { peer: peer.clone(), reply: tx })
            .await
            .is_err()
        {
            return PeerStatus::Absent;
        }
        rx.await.unwrap_or(PeerStatus::Absent)
    }

    /// Peer-table counters for telemetry.
    pub async fn table_stats(&self) -> PeerTableStats {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(PeerCommand::Stats { reply: tx }).await.is_err() {
            return PeerTableStats::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn remove_peer(&self, peer: &Address) {
        let _ = self.cmd_tx.send(PeerCommand::Remove(peer.clone())).await;
    }

    pub async fn clear(&self) {
        let _ = self.cmd_tx.send(PeerCommand::Clear).await;
    }

    /// Clear the table and stop its actor. Subsequent queries return empty
    /// defaults.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(PeerCommand::Quit).await;
    }

    pub(crate) async fn upsert(&self, peer: &Address) {
        let _ = self.cmd_tx.send(PeerCommand::Upsert(peer.clone())).await;
    }

    /// Consume transport peer events: admit identified peers, forget
    /// disconnected ones.
    pub fn start_event_loop(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<PeerEvent>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PeerEvent::Identified(addr) => {
                        if addr == *this.local_address() {
                            continue;
                        }
                        let proto = this.clone();
                        tokio::spawn(async move {
                            if let Err(e) = proto.admit(&addr).await {
                                warn!(peer = addr.short(), error = %e, "admission failed");
                            }
                        });
                    }
                    PeerEvent::Disconnected(addr) => {
                        this.remove_peer(&addr).await;
                    }
                }
            }
            debug!("peer event loop finished");
        })
    }

    /// Periodically re-pulse peers whose records have gone stale.
    pub fn start_pulse_audit(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let jitter = this.pulse_interval.mul_f64(rand::thread_rng().gen_range(0.0..0.25));
                tokio::time::sleep(this.pulse_interval + jitter).await;

                let (tx, rx) = oneshot::channel();
                if this.cmd_tx.send(PeerCommand::StalePeers { reply: tx }).await.is_err() {
                    break;
                }
                let stale = rx.await.unwrap_or_default();
                if stale.is_empty() {
                    continue;
                }

                debug!(count = stale.len(), "pulsing stale peers");
                let mut join_set = JoinSet::new();
                for peer in stale {
                    let proto = this.clone();
                    join_set.spawn(async move {
                        // pulse() already evicts on failure.
                        let _ = proto.pulse(&peer).await;
                    });
                }
                while join_set.join_next().await.is_some() {}
            }
        })
    }
}

/// Handles `handshake:secret-handshake` and `handshake:request-pulse`.
struct AdmissionHandler {
    stamper: Arc<Stamper>,
    peers: mpsc::Sender<PeerCommand>,
}

#[async_trait]
impl RequestHandler for AdmissionHandler {
    async fn handle(&self, from: Address, request: Request) -> Result<Outcome> {
        if !self.stamper.verify(&request) {
            warn!(from = from.short(), kind = ?request.kind(), "invalid stamp, dropping request");
            return Ok(Outcome::Drop);
        }
        // A valid stamp proves passphrase possession; record the peer.
        let _ = self.peers.send(PeerCommand::Upsert(from.clone())).await;
        trace!(from = from.short(), kind = ?request.kind(), "admission request ok");
        Ok(Outcome::Reply(Response::Empty))
    }
}
