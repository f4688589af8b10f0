#![allow(dead_code)] // not every test binary uses every helper

//! In-process transport hub for multi-node integration tests.
//!
//! Every endpoint joins a shared hub under its keypair-derived address.
//! Streams deliver whole parcels directly into the target's inbound queue
//! with the sender's verified address attached. Tests drive topology with
//! `connect` (fires identification events both ways) and `crash` (marks an
//! endpoint offline and fires disconnection events), mirroring what a real
//! multiplexer would surface.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::{Mutex as TokioMutex, mpsc};

use cachet::{Address, Config, IncomingStream, Keypair, Node, PeerEvent, Transport, WireStream};

struct Endpoint {
    inbound: mpsc::Sender<IncomingStream>,
    events: mpsc::Sender<PeerEvent>,
    online: bool,
}

#[derive(Default)]
pub struct MemoryHub {
    endpoints: StdMutex<HashMap<Address, Endpoint>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join(self: &Arc<Self>, keypair: &Keypair) -> Arc<MemoryTransport> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(256);
        let local = keypair.address();
        self.endpoints.lock().expect("endpoints lock").insert(
            local.clone(),
            Endpoint {
                inbound: inbound_tx,
                events: events_tx,
                online: true,
            },
        );
        Arc::new(MemoryTransport {
            hub: self.clone(),
            local,
            inbound: TokioMutex::new(inbound_rx),
            events: TokioMutex::new(Some(events_rx)),
        })
    }

    /// Identify two endpoints to each other, as a multiplexer would after a
    /// successful connection.
    pub async fn connect(&self, a: &Address, b: &Address) {
        self.emit(a, PeerEvent::Identified(b.clone())).await;
        self.emit(b, PeerEvent::Identified(a.clone())).await;
    }

    /// Take an endpoint offline without firing any event, as if it died
    /// silently. Only pulses can discover this.
    pub fn silence(&self, victim: &Address) {
        let mut endpoints = self.endpoints.lock().expect("endpoints lock");
        if let Some(endpoint) = endpoints.get_mut(victim) {
            endpoint.online = false;
        }
    }

    /// Take an endpoint offline and tell every other endpoint it is gone.
    pub async fn crash(&self, victim: &Address) {
        let others: Vec<Address> = {
            let mut endpoints = self.endpoints.lock().expect("endpoints lock");
            if let Some(endpoint) = endpoints.get_mut(victim) {
                endpoint.online = false;
            }
            endpoints
                .keys()
                .filter(|addr| *addr != victim)
                .cloned()
                .collect()
        };
        for other in others {
            self.emit(&other, PeerEvent::Disconnected(victim.clone())).await;
        }
    }

    async fn emit(&self, to: &Address, event: PeerEvent) {
        let sender = {
            let endpoints = self.endpoints.lock().expect("endpoints lock");
            endpoints
                .get(to)
                .filter(|endpoint| endpoint.online)
                .map(|endpoint| endpoint.events.clone())
        };
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    fn is_online(&self, addr: &Address) -> bool {
        self.endpoints
            .lock()
            .expect("endpoints lock")
            .get(addr)
            .map(|endpoint| endpoint.online)
            .unwrap_or(false)
    }

    async fn deliver(&self, from: &Address, to: &Address, bytes: Vec<u8>) -> Result<()> {
        let sender = {
            let endpoints = self.endpoints.lock().expect("endpoints lock");
            if !endpoints.get(from).map(|e| e.online).unwrap_or(false) {
                return Err(anyhow!("sender {} is offline", from));
            }
            endpoints
                .get(to)
                .filter(|endpoint| endpoint.online)
                .map(|endpoint| endpoint.inbound.clone())
                .ok_or_else(|| anyhow!("no route to {}", to))?
        };
        sender
            .send(IncomingStream {
                remote: from.clone(),
                stream: Box::new(InboundStream { bytes: Some(bytes) }),
            })
            .await
            .map_err(|_| anyhow!("peer {} stopped accepting", to))
    }
}

pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    local: Address,
    inbound: TokioMutex<mpsc::Receiver<IncomingStream>>,
    events: TokioMutex<Option<mpsc::Receiver<PeerEvent>>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_address(&self) -> Address {
        self.local.clone()
    }

    async fn open_stream(&self, peer: &Address, _protocol: &str) -> Result<Box<dyn WireStream>> {
        if !self.hub.is_online(peer) {
            return Err(anyhow!("no route to {}", peer));
        }
        Ok(Box::new(OutboundStream {
            hub: self.hub.clone(),
            from: self.local.clone(),
            to: peer.clone(),
            buf: Vec::new(),
        }))
    }

    async fn accept(&self) -> Option<IncomingStream> {
        self.inbound.lock().await.recv().await
    }

    async fn take_events(&self) -> Option<mpsc::Receiver<PeerEvent>> {
        self.events.lock().await.take()
    }
}

struct OutboundStream {
    hub: Arc<MemoryHub>,
    from: Address,
    to: Address,
    buf: Vec<u8>,
}

#[async_trait]
impl WireStream for OutboundStream {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let bytes = std::mem::take(&mut self.buf);
        self.hub.deliver(&self.from, &self.to, bytes).await
    }

    async fn read_to_end(&mut self, _limit: usize) -> Result<Vec<u8>> {
        Err(anyhow!("outbound stream is write-only"))
    }
}

struct InboundStream {
    bytes: Option<Vec<u8>>,
}

#[async_trait]
impl WireStream for InboundStream {
    async fn write_all(&mut self, _bytes: &[u8]) -> Result<()> {
        Err(anyhow!("inbound stream is read-only"))
    }

    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read_to_end(&mut self, limit: usize) -> Result<Vec<u8>> {
        let bytes = self.bytes.take().ok_or_else(|| anyhow!("already read"))?;
        if bytes.len() > limit {
            return Err(anyhow!("stream exceeds {} byte limit", limit));
        }
        Ok(bytes)
    }
}

/// Config with short deadlines and quiet background audits, suitable as a
/// baseline for most tests.
pub fn test_config() -> Config {
    Config {
        timeout: Duration::from_secs(2),
        pulse_interval: Duration::from_secs(120),
        pulse_freshness: Duration::from_secs(120),
        storage_audit_interval: Duration::from_secs(120),
        storage_freshness: Duration::from_secs(120),
        ..Config::default()
    }
}

pub fn keypair(seed: u8) -> Keypair {
    Keypair::from_secret_key_bytes(&[seed; 32])
}

/// Join the hub and start a node under a deterministic identity.
pub async fn start_node(hub: &Arc<MemoryHub>, seed: u8, config: Config) -> Arc<Node> {
    let transport = hub.join(&keypair(seed));
    let node = Arc::new(Node::new(transport, config));
    node.start().await.expect("node starts");
    node
}

/// Fully mesh the given nodes and wait until every pair is mutually
/// admitted.
pub async fn mesh(hub: &Arc<MemoryHub>, nodes: &[Arc<Node>]) {
    for i in 0..nodes.len() {
        for j in (i + 1)..nodes.len() {
            hub.connect(nodes[i].address(), nodes[j].address()).await;
        }
    }
    for node in nodes {
        let want = nodes.len() - 1;
        let node = node.clone();
        assert!(
            wait_until(Duration::from_secs(5), move || {
                let node = node.clone();
                async move { node.peers().await.len() >= want }
            })
            .await,
            "mesh admission did not converge"
        );
    }
}

/// Poll `condition` until it holds or the deadline passes.
pub async fn wait_until<F, Fut>(deadline: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = tokio::time::Instant::now();
    loop {
        if condition().await {
            return true;
        }
        if started.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
