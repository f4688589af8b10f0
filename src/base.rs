//! # Base Protocol
//!
//! The bottom of the stack: parcel framing, callback correlation, admission
//! limiting, and inbound dispatch. Upper layers register one handler per
//! request type and send requests through [`BaseProto::send_request`], which
//! correlates the eventual response by UUID or synthesizes a timeout.
//!
//! ## Architecture
//!
//! State lives in an actor owning three bounded tables:
//! - the callback table (outstanding calls, capacity 32, TTL = timeout)
//! - the per-peer rate limiter (capacity 2048, 32 parcels per window)
//! - the duplicate fingerprint cache (capacity 2048)
//!
//! The public handle talks to the actor over a bounded command channel, so
//! no table is ever touched across an await point.
//!
//! ## Inbound pipeline
//!
//! read to end-of-stream → rate check → duplicate check → parse → sender
//! equals verified remote → correlate (returns) or dispatch (requests).
//! Every rejection on this path is a silent drop; the remote times out.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::hashing::{self, Digest};
use crate::identity::Address;
use crate::transport::{IncomingStream, Transport};
use crate::wire::{
    self, CallbackId, MAX_PARCEL_SIZE, PROTOCOL_ID, Parcel, Payload, Request, RequestKind,
    Response, Return,
};

/// Maximum outstanding outbound calls.
pub const CALLBACK_TABLE_CAPACITY: usize = 32;

/// Maximum peers / fingerprints tracked by the admission limiters.
pub const LIMITER_CACHE_CAPACITY: usize = 2048;

/// Inbound parcels admitted per peer per window (window = timeout).
pub const RATE_LIMIT_PER_PEER: u32 = CALLBACK_TABLE_CAPACITY as u32;

/// Duplicate count at which the escalation warning fires.
const DUPLICATE_ESCALATION_THRESHOLD: u32 = 8;

/// Command channel capacity for the state actor.
const COMMAND_CHANNEL_SIZE: usize = 256;

/// What a request handler wants done with the inbound parcel.
pub enum Outcome {
    /// Send this response back under the inbound callback id.
    Reply(Response),
    /// Drop silently; the remote will time out. Used for validation
    /// failures that must not be surfaced to the peer.
    Drop,
}

/// One registered request handler. Returning `Err` sends a rejection parcel
/// carrying the error's message back to the peer.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, from: Address, request: Request) -> Result<Outcome>;
}

struct PendingCall {
    sender: oneshot::Sender<Return>,
    expires_at: Instant,
}

/// Fixed-window counter reset once the window ages past the TTL.
struct Window {
    count: u32,
    started: Instant,
}

impl Window {
    fn new() -> Self {
        Self {
            count: 0,
            started: Instant::now(),
        }
    }

    fn tick(&mut self, ttl: Duration) -> u32 {
        if self.started.elapsed() > ttl {
            self.count = 0;
            self.started = Instant::now();
        }
        self.count = self.count.saturating_add(1);
        self.count
    }
}

enum Admission {
    Granted,
    RateLimited,
    Duplicate(u32),
}

enum Command {
    RegisterCall {
        id: CallbackId,
        sender: oneshot::Sender<Return>,
    },
    ResolveCall {
        id: CallbackId,
        from: Address,
        ret: Return,
    },
    RemoveCall {
        id: CallbackId,
    },
    AdmitInbound {
        peer: Address,
        fingerprint: Digest,
        reply: oneshot::Sender<Admission>,
    },
    Shutdown,
}

struct BaseActor {
    callbacks: LruCache<CallbackId, PendingCall>,
    rate: LruCache<Address, Window>,
    duplicates: LruCache<Digest, Window>,
    ttl: Duration,
}

impl BaseActor {
    fn new(ttl: Duration) -> Self {
        let callback_cap =
            NonZeroUsize::new(CALLBACK_TABLE_CAPACITY).expect("callback capacity must be non-zero");
        let limiter_cap =
            NonZeroUsize::new(LIMITER_CACHE_CAPACITY).expect("limiter capacity must be non-zero");
        Self {
            callbacks: LruCache::new(callback_cap),
            rate: LruCache::new(limiter_cap),
            duplicates: LruCache::new(limiter_cap),
            ttl,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut cleanup = tokio::time::interval(self.ttl);
        cleanup.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle(cmd) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = cleanup.tick() => {
                    self.purge_expired_calls();
                }
            }
        }
    }

    /// Process one command. Returns true on shutdown.
    fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::RegisterCall { id, sender } => {
                self.purge_expired_calls();
                let expires_at = Instant::now() + self.ttl;
                // Pushing into a full table evicts the oldest pending
                // call; dropping its sender rejects that caller.
                if let Some((evicted_id, _)) =
                    self.callbacks.push(id, PendingCall { sender, expires_at })
                    && evicted_id != id
                {
                    debug!(callback = %evicted_id, "evicted oldest outstanding call");
                }
            }
            Command::ResolveCall { id, from, ret } => match self.callbacks.pop(&id) {
                Some(call) => {
                    let _ = call.sender.send(ret);
                }
                None => {
                    debug!(
                        callback = %id,
                        from = from.short(),
                        "response for unknown or expired callback"
                    );
                }
            },
            Command::RemoveCall { id } => {
                self.callbacks.pop(&id);
            }
            Command::AdmitInbound {
                peer,
                fingerprint,
                reply,
            } => {
                let verdict = self.admit(&peer, fingerprint);
                let _ = reply.send(verdict);
            }
            Command::Shutdown => {
                self.drain();
                return true;
            }
        }
        false
    }

    fn admit(&mut self, peer: &Address, fingerprint: Digest) -> Admission {
        let ttl = self.ttl;
        let rate = self
            .rate
            .get_or_insert_mut(peer.clone(), Window::new)
            .tick(ttl);
        if rate > RATE_LIMIT_PER_PEER {
            return Admission::RateLimited;
        }

        let dups = self
            .duplicates
            .get_or_insert_mut(fingerprint, Window::new)
            .tick(ttl);
        if dups > 1 {
            return Admission::Duplicate(dups);
        }

        Admission::Granted
    }

    fn purge_expired_calls(&mut self) {
        let now = Instant::now();
        let expired: Vec<CallbackId> = self
            .callbacks
            .iter()
            .filter(|(_, call)| now >= call.expires_at)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.callbacks.pop(&id);
        }
    }

    fn drain(&mut self) {
        while let Some((_, call)) = self.callbacks.pop_lru() {
            let _ = call.sender.send(Return::Failure("node shutting down".to_string()));
        }
        self.rate.clear();
        self.duplicates.clear();
    }
}

/// Framing, correlation, and dispatch shared by every upper protocol.
pub struct BaseProto {
    transport: Arc<dyn Transport>,
    local: Address,
    timeout: Duration,
    cmd_tx: mpsc::Sender<Command>,
    handlers: RwLock<HashMap<RequestKind, Arc<dyn RequestHandler>>>,
}

impl BaseProto {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        tokio::spawn(BaseActor::new(timeout).run(cmd_rx));

        let local = transport.local_address();
        Self {
            transport,
            local,
            timeout,
            cmd_tx,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// This node's own address.
    pub fn local_address(&self) -> &Address {
        &self.local
    }

    /// Per-request deadline (also the admission window width).
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register the handler invoked for inbound requests of `kind`.
    /// Later registrations replace earlier ones.
    pub fn register_request_handler(&self, kind: RequestKind, handler: Arc<dyn RequestHandler>) {
        self.handlers
            .write()
            .expect("handler table lock poisoned")
            .insert(kind, handler);
    }

    /// Send a request and await the correlated response.
    ///
    /// A failed return surfaces as an error carrying the remote message; a
    /// missing response surfaces as a timeout rejection after the deadline.
    pub async fn send_request(&self, peer: &Address, request: Request) -> Result<Response> {
        let id = CallbackId::random();
        let parcel = Parcel {
            callback_id: id,
            sender: self.local.clone(),
            payload: Payload::Request(request),
        };
        let bytes = wire::encode(&parcel)?;

        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RegisterCall { id, sender: tx })
            .await
            .map_err(|_| anyhow!("protocol stack is shut down"))?;

        if let Err(e) = self.transmit(peer, &bytes).await {
            let _ = self.cmd_tx.send(Command::RemoveCall { id }).await;
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Return::Success(response))) => Ok(response),
            Ok(Ok(Return::Failure(message))) => Err(anyhow!("{}", message)),
            Ok(Err(_)) => Err(anyhow!(
                "outstanding call to {} dropped before completion",
                peer
            )),
            Err(_) => {
                let _ = self.cmd_tx.send(Command::RemoveCall { id }).await;
                Err(anyhow!("Timeout while waiting for response from: {}", peer))
            }
        }
    }

    /// Accept inbound streams until the transport shuts down.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(incoming) = this.transport.accept().await {
                let proto = this.clone();
                tokio::spawn(async move {
                    proto.handle_stream(incoming).await;
                });
            }
            debug!("inbound accept loop finished");
        })
    }

    /// Reject every outstanding call and clear the admission caches.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    async fn transmit(&self, peer: &Address, bytes: &[u8]) -> Result<()> {
        let mut stream = self.transport.open_stream(peer, PROTOCOL_ID).await?;
        stream.write_all(bytes).await?;
        stream.finish().await?;
        Ok(())
    }

    async fn handle_stream(self: Arc<Self>, incoming: IncomingStream) {
        let IncomingStream { remote, mut stream } = incoming;

        let bytes = match stream.read_to_end(MAX_PARCEL_SIZE).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(from = remote.short(), error = %e, "failed to read inbound stream");
                return;
            }
        };

        let fingerprint = hashing::blake2b(&bytes);
        match self.admit_inbound(&remote, fingerprint).await {
            Admission::Granted => {}
            Admission::RateLimited => {
                warn!(from = remote.short(), "rate limit exceeded, dropping parcel");
                return;
            }
            Admission::Duplicate(count) => {
                if count > DUPLICATE_ESCALATION_THRESHOLD {
                    warn!(
                        from = remote.short(),
                        fingerprint = %fingerprint.short_hex(),
                        count,
                        "excessive duplicates"
                    );
                } else {
                    debug!(
                        from = remote.short(),
                        fingerprint = %fingerprint.short_hex(),
                        "dropping duplicate parcel"
                    );
                }
                return;
            }
        }

        let parcel = match wire::decode(&bytes) {
            Ok(parcel) => parcel,
            Err(e) => {
                debug!(from = remote.short(), error = %e, "dropping malformed parcel");
                return;
            }
        };

        if parcel.sender != remote {
            warn!(
                from = remote.short(),
                claimed = parcel.sender.short(),
                "dropping parcel: declared sender does not match verified remote"
            );
            return;
        }

        match parcel.payload {
            Payload::Return(ret) => {
                let _ = self
                    .cmd_tx
                    .send(Command::ResolveCall {
                        id: parcel.callback_id,
                        from: remote,
                        ret,
                    })
                    .await;
            }
            Payload::Request(request) => {
                self.dispatch_request(remote, parcel.callback_id, request).await;
            }
        }
    }

    async fn dispatch_request(&self, from: Address, callback_id: CallbackId, request: Request) {
        let kind = request.kind();
        let handler = {
            let handlers = self.handlers.read().expect("handler table lock poisoned");
            handlers.get(&kind).cloned()
        };
        let Some(handler) = handler else {
            debug!(from = from.short(), kind = ?kind, "no handler registered, dropping request");
            return;
        };

        trace!(from = from.short(), kind = ?kind, "dispatching request");
        let ret = match handler.handle(from.clone(), request).await {
            Ok(Outcome::Reply(response)) => Return::Success(response),
            Ok(Outcome::Drop) => return,
            Err(e) => Return::Failure(e.to_string()),
        };

        let reply = Parcel {
            callback_id,
            sender: self.local.clone(),
            payload: Payload::Return(ret),
        };
        let bytes = match wire::encode(&reply) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode response parcel");
                return;
            }
        };
        if let Err(e) = self.transmit(&from, &bytes).await {
            debug!(to = from.short(), error = %e, "failed to send response parcel");
        }
    }

    async fn admit_inbound(&self, peer: &Address, fingerprint: Digest) -> Admission {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .cmd_tx
            .send(Command::AdmitInbound {
                peer: peer.clone(),
                fingerprint,
                reply: tx,
            })
            .await;
        if sent.is_err() {
            return Admission::RateLimited;
        }
        rx.await.unwrap_or(Admission::RateLimited)
    }
}
