//! Shared in-process plumbing for unit tests: a hub of channel-backed
//! transports and a builder for complete protocol stacks with directly
//! seeded peer tables.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::{Mutex as TokioMutex, mpsc};

use crate::base::BaseProto;
use crate::handshake::{HandshakeProto, Stamper};
use crate::identity::{Address, Keypair};
use crate::message::MessageProto;
use crate::swarm::SwarmProto;
use crate::transport::{IncomingStream, PeerEvent, Transport, WireStream};

pub(crate) type Inboxes = Arc<StdMutex<HashMap<Address, mpsc::Sender<IncomingStream>>>>;

pub(crate) fn new_hub() -> Inboxes {
    Arc::new(StdMutex::new(HashMap::new()))
}

pub(crate) fn address(seed: u8) -> Address {
    Keypair::from_secret_key_bytes(&[seed; 32]).address()
}

pub(crate) struct HubTransport {
    local: Address,
    inboxes: Inboxes,
    incoming: TokioMutex<mpsc::Receiver<IncomingStream>>,
}

impl HubTransport {
    pub(crate) fn join(inboxes: &Inboxes, local: Address) -> Self {
        let (tx, rx) = mpsc::channel(64);
        inboxes
            .lock()
            .expect("inboxes lock")
            .insert(local.clone(), tx);
        Self {
            local,
            inboxes: inboxes.clone(),
            incoming: TokioMutex::new(rx),
        }
    }
}

#[async_trait]
impl Transport for HubTransport {
    fn local_address(&self) -> Address {
        self.local.clone()
    }

    async fn open_stream(&self, peer: &Address, _protocol: &str) -> Result<Box<dyn WireStream>> {
        let target = self
            .inboxes
            .lock()
            .expect("inboxes lock")
            .get(peer)
            .cloned()
            .ok_or_else(|| anyhow!("unknown peer {}", peer))?;
        Ok(Box::new(OutboundStream {
            from: self.local.clone(),
            buf: Vec::new(),
            target,
        }))
    }

    async fn accept(&self) -> Option<IncomingStream> {
        self.incoming.lock().await.recv().await
    }

    async fn take_events(&self) -> Option<mpsc::Receiver<PeerEvent>> {
        None
    }
}

struct OutboundStream {
    from: Address,
    buf: Vec<u8>,
    target: mpsc::Sender<IncomingStream>,
}

#[async_trait]
impl WireStream for OutboundStream {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let bytes = std::mem::take(&mut self.buf);
        let incoming = IncomingStream {
            remote: self.from.clone(),
            stream: Box::new(InboundStream { bytes: Some(bytes) }),
        };
        self.target
            .send(incoming)
            .await
            .map_err(|_| anyhow!("peer inbox closed"))
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
            anyhow::bail!("stream exceeds limit");
        }
        Ok(bytes)
    }
}

pub(crate) const TEST_PASSPHRASE: &str = "unit test secret";

/// One complete protocol stack with every handler registered and the accept
/// loop running. Background audits are not started; tests drive them.
pub(crate) struct Stack {
    pub base: Arc<BaseProto>,
    pub handshake: Arc<HandshakeProto>,
    pub swarm: Arc<SwarmProto>,
    pub message: Arc<MessageProto>,
}

impl Stack {
    pub(crate) fn address(&self) -> &Address {
        self.base.local_address()
    }
}

pub(crate) fn build_stack(inboxes: &Inboxes, seed: u8, timeout: Duration) -> Stack {
    let transport = Arc::new(HubTransport::join(inboxes, address(seed)));
    let base = Arc::new(BaseProto::new(transport, timeout));
    let stamper = Arc::new(Stamper::new(TEST_PASSPHRASE));
    let handshake = Arc::new(HandshakeProto::new(
        base.clone(),
        stamper,
        Duration::from_secs(120),
        Duration::from_secs(120),
    ));
    let swarm = Arc::new(SwarmProto::new(
        handshake.clone(),
        3,
        5,
        Duration::from_secs(120),
        Duration::from_secs(120),
        10,
    ));
    let message = Arc::new(MessageProto::new(
        swarm.clone(),
        handshake.clone(),
        5,
        3,
        5,
    ));

    handshake.register_handlers();
    swarm.register_handlers();
    message.register_handlers();
    base.start();

    Stack {
        base,
        handshake,
        swarm,
        message,
    }
}

/// Seed both peer tables directly, skipping the admission round-trip.
pub(crate) async fn link(a: &Stack, b: &Stack) {
    a.handshake.upsert(b.address()).await;
    b.handshake.upsert(a.address()).await;
}
