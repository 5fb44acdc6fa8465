//! Wire protocol for collaboration messages.
//!
//! Every frame is a JSON text message wrapped in a common envelope:
//! ```text
//! ┌────────┬──────────────┬─────────┬─────────────┬──────────┐
//! │ type   │ payload      │ from    │ timestamp   │ id       │
//! │ string │ JSON (typed  │ site id │ ms since    │ uuid v4  │
//! │        │ by `type`)   │         │ UNIX epoch  │          │
//! └────────┴──────────────┴─────────┴─────────────┴──────────┘
//! ```
//!
//! `type` is one of `join`, `leave`, `cursor`, `operation`,
//! `sync-request`, `sync-response`, `heartbeat`.

use quill_crdt::{DocumentState, Operation, SiteId, VersionVector};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::presence::{CollaborationUser, CursorPosition};

/// Message types for the collaboration protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    /// Peer announces itself (payload: CollaborationUser)
    Join,
    /// Peer leaves cleanly
    Leave,
    /// Cursor/selection presence update
    Cursor,
    /// Single CRDT operation
    Operation,
    /// Anti-entropy request carrying the sender's version vector
    SyncRequest,
    /// Full document state answering a sync request
    SyncResponse,
    /// Liveness ping
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeavePayload {
    pub user_id: SiteId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPayload {
    pub user_id: SiteId,
    pub cursor: CursorPosition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestPayload {
    pub version_vector: VersionVector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub site_id: SiteId,
    pub clock: u64,
}

/// Typed message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Join(CollaborationUser),
    Leave(LeavePayload),
    Cursor(CursorPayload),
    Operation(Operation),
    SyncRequest(SyncRequestPayload),
    SyncResponse(DocumentState),
    Heartbeat(HeartbeatPayload),
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Join(_) => MessageType::Join,
            Message::Leave(_) => MessageType::Leave,
            Message::Cursor(_) => MessageType::Cursor,
            Message::Operation(_) => MessageType::Operation,
            Message::SyncRequest(_) => MessageType::SyncRequest,
            Message::SyncResponse(_) => MessageType::SyncResponse,
            Message::Heartbeat(_) => MessageType::Heartbeat,
        }
    }

    fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Message::Join(user) => serde_json::to_value(user),
            Message::Leave(p) => serde_json::to_value(p),
            Message::Cursor(p) => serde_json::to_value(p),
            Message::Operation(op) => serde_json::to_value(op),
            Message::SyncRequest(p) => serde_json::to_value(p),
            Message::SyncResponse(state) => serde_json::to_value(state),
            Message::Heartbeat(p) => serde_json::to_value(p),
        }
    }
}

/// Common envelope of every protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub payload: serde_json::Value,
    pub from: SiteId,
    pub timestamp: u64,
    pub id: Uuid,
}

impl Envelope {
    /// Wrap `message` from `from`, stamped now with a fresh id.
    pub fn new(from: SiteId, message: &Message) -> Result<Self, ProtocolError> {
        let payload = message
            .payload()
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            kind: message.kind(),
            payload,
            from,
            timestamp: now_millis(),
            id: Uuid::new_v4(),
        })
    }

    /// Parse the payload according to `type`.
    pub fn message(&self) -> Result<Message, ProtocolError> {
        Ok(match self.kind {
            MessageType::Join => Message::Join(self.typed_payload()?),
            MessageType::Leave => Message::Leave(self.typed_payload()?),
            MessageType::Cursor => Message::Cursor(self.typed_payload()?),
            MessageType::Operation => Message::Operation(self.typed_payload()?),
            MessageType::SyncRequest => Message::SyncRequest(self.typed_payload()?),
            MessageType::SyncResponse => Message::SyncResponse(self.typed_payload()?),
            MessageType::Heartbeat => Message::Heartbeat(self.typed_payload()?),
        })
    }

    fn typed_payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&self.payload)
            .map_err(|e| ProtocolError::Malformed(format!("{:?} payload: {e}", self.kind)))
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Outbound message could not be serialized
    Serialization(String),
    /// Inbound frame failed to parse or did not match its declared type
    Malformed(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Malformed(e) => write!(f, "Malformed frame: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
