//! # quill-crdt — Sequence CRDT for collaborative text
//!
//! A replicated growable array of characters. Independent replicas accept
//! local edits, exchange operations (or whole states) in any order, with
//! duplicates and gaps, and still converge to the same text.
//!
//! ## Architecture
//!
//! ```text
//!  local edit                         remote Operation / DocumentState
//!      │                                         │
//!      ▼                                         ▼
//! Replica::insert/delete        Replica::apply_operation / merge
//!      │                                         │
//!      │                           dependency known? ──no──► PendingBuffer
//!      │                                         │                 │
//!      ▼                                         ▼   released ◄────┘
//! ┌─────────────────────────────────────────────────────────────┐
//! │ elements: Vec<Element>  (document order, tombstones kept)   │
//! │ version:  VersionVector (site → highest clock)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`id`] — Site and element identifiers
//! - [`clock`] — Version vectors
//! - [`operation`] — Operations and elements
//! - [`pending`] — Causal buffer for out-of-order operations
//! - [`replica`] — The engine
//! - [`state`] — Full state and its compact encoding
//!
//! The crate does no I/O and spawns nothing. A replica must be driven from
//! one logical thread of control; wrap it in a lock or an actor to share it.

pub mod clock;
pub mod error;
pub mod id;
pub mod operation;
pub mod pending;
pub mod replica;
pub mod state;

pub use clock::VersionVector;
pub use error::CrdtError;
pub use id::{ElementId, SiteId};
pub use operation::{Element, Operation};
pub use replica::{Replica, ReplicaConfig};
pub use state::DocumentState;
