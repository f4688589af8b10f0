//! # Transport Contract
//!
//! The connection multiplexer is an external collaborator. This module pins
//! the seam: a [`Transport`] hands out freshly opened outbound byte streams
//! addressed by peer identity, surfaces inbound streams with the *verified*
//! remote address attached, and emits peer lifecycle events. How bytes move
//! (QUIC, TCP, an in-process hub in tests) is the implementation's concern.
//!
//! Every stream carries exactly one parcel: the writer sends its bytes and
//! finishes; the reader consumes until end-of-stream.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::identity::Address;

/// Peer lifecycle notifications from the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    /// A remote peer's identity has been verified and streams may be opened.
    Identified(Address),
    /// The peer's last connection went away.
    Disconnected(Address),
}

/// One parcel-bearing byte stream.
#[async_trait]
pub trait WireStream: Send {
    /// Append bytes to the stream.
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Signal end-of-stream; the parcel is complete.
    async fn finish(&mut self) -> Result<()>;

    /// Read the entire stream, failing if it exceeds `limit` bytes.
    async fn read_to_end(&mut self, limit: usize) -> Result<Vec<u8>>;
}

/// An inbound stream paired with the transport-verified remote identity.
pub struct IncomingStream {
    pub remote: Address,
    pub stream: Box<dyn WireStream>,
}

/// The black-box connection multiplexer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// This node's own verified address.
    fn local_address(&self) -> Address;

    /// Open a fresh outbound stream to `peer` for the given protocol.
    async fn open_stream(&self, peer: &Address, protocol: &str) -> Result<Box<dyn WireStream>>;

    /// Wait for the next inbound stream. Returns `None` once the transport
    /// has shut down.
    async fn accept(&self) -> Option<IncomingStream>;

    /// Take the peer event receiver. Yields `Some` exactly once.
    async fn take_events(&self) -> Option<mpsc::Receiver<PeerEvent>>;
}
