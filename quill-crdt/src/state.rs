//! Full replicated state for state-based reconciliation.
//!
//! Compact form (for persistence by the host):
//! ```text
//! ┌──────────────┬───────────────────────────────────────────┐
//! │ orig size    │ LZ4 block( bincode(DocumentState) )       │
//! │ 4 bytes LE   │ variable                                  │
//! └──────────────┴───────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::clock::VersionVector;
use crate::error::CrdtError;
use crate::operation::Element;

/// Every element in document order (tombstones included) plus the
/// version vector of the replica that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentState {
    pub elements: Vec<Element>,
    pub version_vector: VersionVector,
}

impl DocumentState {
    /// Visible text of this state.
    pub fn text(&self) -> String {
        self.elements
            .iter()
            .filter(|e| e.visible)
            .map(|e| e.value)
            .collect()
    }

    pub fn tombstone_count(&self) -> usize {
        self.elements.iter().filter(|e| !e.visible).count()
    }

    /// Serialize to the compact binary form.
    pub fn encode(&self) -> Result<Vec<u8>, CrdtError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CrdtError::Encoding(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    /// Deserialize from the compact binary form.
    pub fn decode(bytes: &[u8]) -> Result<Self, CrdtError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| CrdtError::Encoding(e.to_string()))?;
        let (state, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| CrdtError::Encoding(e.to_string()))?;
        Ok(state)
    }
}
