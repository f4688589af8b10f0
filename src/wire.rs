//! # Wire Protocol Types
//!
//! One request or response is one JSON-encoded *parcel*, sent as the entire
//! payload of one freshly opened stream. A parcel carries a correlation id,
//! the sender's self-declared address, and either a [`Request`] (tagged sum
//! over the `type` member) or a [`Return`] (success/failure envelope).
//!
//! Parsing is bounded: parcels larger than [`MAX_PARCEL_SIZE`] are rejected
//! before JSON decoding. Unknown `type` tags fail deserialization and are
//! dropped by the dispatcher, never silently accepted.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::hashing::Digest;
use crate::identity::Address;

/// Stream protocol identifier handed to the transport. Backward
/// incompatibility is signaled only by the minor version.
pub const PROTOCOL_ID: &str = "/secret-handshake/proto/0.5.x";

/// Upper bound on a single parcel's encoded size (1 MiB).
pub const MAX_PARCEL_SIZE: usize = 1024 * 1024;

/// Optional tag accepted (and stripped) on incoming UUID strings.
const UUID_PREFIX: &str = "uuid,";

/// A v4 UUID used for callback correlation and message-group identity.
///
/// Serialized bare; older peers may send the `uuid,`-tagged form, which is
/// accepted for backwards compatibility.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WireUuid(Uuid);

impl WireUuid {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let body = s.strip_prefix(UUID_PREFIX).unwrap_or(s);
        Uuid::parse_str(body).map(Self)
    }
}

impl std::fmt::Display for WireUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for WireUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WireUuid({})", self.0)
    }
}

impl Serialize for WireUuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for WireUuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        WireUuid::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Correlation id of an outstanding call.
pub type CallbackId = WireUuid;

/// One message on the wire: correlation id, declared sender, and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Parcel {
    #[serde(rename = "callbackId")]
    pub callback_id: CallbackId,
    pub sender: Address,
    pub payload: Payload,
}

/// Either a request or a response envelope.
///
/// Requests carry a top-level `type` member; returns carry `success`.
/// Untagged deserialization tries requests first, then returns.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Request(Request),
    Return(Return),
}

/// The request sum. Every variant carries a `stamp` proving current-window
/// possession of the shared passphrase.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    #[serde(rename = "handshake:secret-handshake")]
    Initiation { stamp: String },
    #[serde(rename = "handshake:request-pulse")]
    Pulse { stamp: String },
    #[serde(rename = "swarm:nearest-peers-request")]
    NearestPeers { n: usize, hash: Digest, stamp: String },
    #[serde(rename = "swarm:store-request")]
    Store { data: String, stamp: String },
    #[serde(rename = "swarm:fetch-request")]
    Fetch { hash: Digest, stamp: String },
    #[serde(rename = "message:store-metadata-request")]
    SetMetadata {
        owner: Address,
        metadata: Vec<Digest>,
        stamp: String,
    },
    #[serde(rename = "message:get-metadata-request")]
    GetMetadata { address: Address, stamp: String },
}

/// Request discriminator used for handler registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Initiation,
    Pulse,
    NearestPeers,
    Store,
    Fetch,
    SetMetadata,
    GetMetadata,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Initiation { .. } => RequestKind::Initiation,
            Request::Pulse { .. } => RequestKind::Pulse,
            Request::NearestPeers { .. } => RequestKind::NearestPeers,
            Request::Store { .. } => RequestKind::Store,
            Request::Fetch { .. } => RequestKind::Fetch,
            Request::SetMetadata { .. } => RequestKind::SetMetadata,
            Request::GetMetadata { .. } => RequestKind::GetMetadata,
        }
    }

    pub fn stamp(&self) -> &str {
        match self {
            Request::Initiation { stamp }
            | Request::Pulse { stamp }
            | Request::NearestPeers { stamp, .. }
            | Request::Store { stamp, .. }
            | Request::Fetch { stamp, .. }
            | Request::SetMetadata { stamp, .. }
            | Request::GetMetadata { stamp, .. } => stamp,
        }
    }

    pub fn set_stamp(&mut self, value: String) {
        match self {
            Request::Initiation { stamp }
            | Request::Pulse { stamp }
            | Request::NearestPeers { stamp, .. }
            | Request::Store { stamp, .. }
            | Request::Fetch { stamp, .. }
            | Request::SetMetadata { stamp, .. }
            | Request::GetMetadata { stamp, .. } => *stamp = value,
        }
    }
}

/// The response sum returned inside a successful [`Return`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    #[serde(rename = "base:empty-response")]
    Empty,
    #[serde(rename = "swarm:nearest-peers-response")]
    NearestPeers { peers: Vec<Address> },
    #[serde(rename = "swarm:fetch-response")]
    Fetch { fragment: Option<String> },
    #[serde(rename = "message:get-metadata-response")]
    GetMetadata { metadata: Vec<Digest> },
}

/// Outcome envelope for a request: a response, or a rejection message.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "ReturnWire", into = "ReturnWire")]
pub enum Return {
    Success(Response),
    Failure(String),
}

#[derive(Clone, Serialize, Deserialize)]
struct ReturnWire {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Response>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl TryFrom<ReturnWire> for Return {
    type Error = String;

    fn try_from(wire: ReturnWire) -> Result<Self, Self::Error> {
        if wire.success {
            let data = wire.data.ok_or("successful return missing `data`")?;
            Ok(Return::Success(data))
        } else {
            let message = wire.message.ok_or("failed return missing `message`")?;
            Ok(Return::Failure(message))
        }
    }
}

impl From<Return> for ReturnWire {
    fn from(value: Return) -> Self {
        match value {
            Return::Success(data) => ReturnWire {
                success: true,
                data: Some(data),
                message: None,
            },
            Return::Failure(message) => ReturnWire {
                success: false,
                data: None,
                message: Some(message),
            },
        }
    }
}

/// Serialize a parcel for the wire.
pub fn encode(parcel: &Parcel) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(parcel)?)
}

/// Parse a parcel, enforcing the size bound before JSON decoding.
pub fn decode(bytes: &[u8]) -> anyhow::Result<Parcel> {
    if bytes.len() > MAX_PARCEL_SIZE {
        anyhow::bail!(
            "parcel too large: {} bytes (max {})",
            bytes.len(),
            MAX_PARCEL_SIZE
        );
    }
    Ok(serde_json::from_slice(bytes)?)
}
