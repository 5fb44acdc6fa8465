//! # quill-collab — Real-time collaboration for quill documents
//!
//! Drives a [`quill_crdt::Replica`] across an unreliable duplex channel
//! and tracks who else is editing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   JSON text frames   ┌──────────────┐
//! │ CollabSession│ ◄──────────────────► │ RelayServer  │
//! │ (per user)   │   WebSocket / memory │ (stateless)  │
//! └──────┬───────┘                      └──────┬───────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌──────────────┐                     ┌───────────────┐
//! │ Replica      │                     │ BroadcastGroup│
//! │ (full copy)  │                     │ (per room)    │
//! └──────────────┘                     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Message envelope and typed payloads
//! - [`presence`] — Remote users and cursors
//! - [`channel`] — Connector trait, WebSocket and in-memory channels
//! - [`broadcast`] — Room-based fan-out
//! - [`reconnect`] — Exponential backoff
//! - [`config`] — Session configuration
//! - [`view`] — Editor boundary
//! - [`session`] — The session state machine
//! - [`relay`] — WebSocket relay server

pub mod broadcast;
pub mod channel;
pub mod config;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod reconnect;
pub mod relay;
pub mod session;
pub mod view;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use channel::{ChannelEvent, ChannelHandle, Connector, MemoryConnector, MemoryHub, WsConnector};
pub use config::{SessionConfig, UserProfile};
pub use error::SessionError;
pub use presence::{
    color_for, CollaborationUser, CursorPosition, PresenceEvent, PresenceTable, SelectionRange,
};
pub use protocol::{Envelope, Message, MessageType, ProtocolError};
pub use reconnect::{Backoff, ReconnectPolicy};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use session::{CollabSession, ConnectionState, OfflineQueue, SessionEvent};
pub use view::{DocumentChange, DocumentView};
