//! # Cachet - Stamped-Admission Overlay Network
//!
//! Cachet is a layered peer-to-peer overlay providing:
//!
//! - **Admission**: every request carries a *stamp* derived from a shared
//!   passphrase via a rotating time-step key; only passphrase holders are
//!   answered
//! - **Proximity lookup**: XOR-popcount distance over Blake2b positions,
//!   with an iterative lookup converging on a content hash
//! - **Swarm storage**: content-addressed store/fetch replicated across the
//!   nearest peers, self-healed by a background audit
//! - **Anonymous messaging**: message envelopes Shamir-split into fragments
//!   indexed by per-recipient metadata buckets
//!
//! ## Architecture
//!
//! Four protocols share one wire framing and one callback machinery, each
//! layered on the previous. Stateful components follow the actor pattern:
//! a cheap-to-clone handle in front of a private actor that owns all
//! mutable state and processes commands sequentially, so no table is ever
//! touched across an await point.
//!
//! The connection multiplexer is a collaborator behind the
//! [`transport::Transport`] trait: bidirectional ordered byte streams
//! addressed by peer identity, plus peer lifecycle events. One stream
//! carries exactly one JSON parcel.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level API combining all layers |
//! | `base` | Framing, correlation, rate/duplicate limiting, dispatch |
//! | `handshake` | Stamped admission, peer table, pulse audit |
//! | `swarm` | Proximity lookup, replicated store/fetch, storage audit |
//! | `message` | Shamir fragments, metadata buckets, inbox |
//! | `transport` | Transport contract (the external multiplexer seam) |
//! | `wire` | Parcel/request/response wire types |
//! | `identity` | Ed25519 keypairs and textual addresses |
//! | `hashing` | Blake2b / Blake3 digests |
//! | `distance` | XOR-popcount proximity metric |
//! | `shamir` | Secret split & combine over GF(256) |
//! | `totp` | Rotating stamp-key derivation |

pub mod base;
pub mod canonical;
pub mod distance;
pub mod handshake;
pub mod hashing;
pub mod identity;
pub mod message;
pub mod node;
pub mod shamir;
pub mod swarm;
pub mod totp;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub(crate) mod testutil;

pub use hashing::Digest;
pub use identity::{Address, Keypair};
pub use message::Message;
pub use node::{Config, DEFAULT_PASSPHRASE, Node, TelemetrySnapshot};
pub use transport::{IncomingStream, PeerEvent, Transport, WireStream};
pub use wire::PROTOCOL_ID;
