//! Operations and elements of the sequence.

use serde::{Deserialize, Serialize};

use crate::id::{ElementId, SiteId};

/// A self-describing, order-independent edit.
///
/// Applying the same operation twice is a no-op. An operation that names
/// an element this replica has not seen yet is buffered until it arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    /// Place `value` after the element `after` (`None` = start of document).
    Insert {
        id: ElementId,
        #[serde(rename = "char")]
        value: char,
        #[serde(rename = "afterId")]
        after: Option<ElementId>,
    },
    /// Tombstone the element `id`.
    Delete { id: ElementId },
}

impl Operation {
    /// Id of the element this operation creates or tombstones.
    pub fn id(&self) -> ElementId {
        match self {
            Operation::Insert { id, .. } => *id,
            Operation::Delete { id } => *id,
        }
    }

    /// The element this operation cannot be applied without.
    pub fn dependency(&self) -> Option<ElementId> {
        match self {
            Operation::Insert { after, .. } => *after,
            Operation::Delete { id } => Some(*id),
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Operation::Insert { .. })
    }
}

/// One character slot in the replicated sequence.
///
/// Deleted elements stay in place with `visible == false` so that
/// concurrent inserts anchored on them still land in the right spot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub id: ElementId,
    #[serde(rename = "char")]
    pub value: char,
    /// Anchor this element was inserted after (`None` = start sentinel)
    #[serde(rename = "afterId")]
    pub origin: Option<ElementId>,
    pub visible: bool,
}

impl Element {
    /// Site that created this element.
    pub fn site(&self) -> SiteId {
        self.id.site
    }

    /// The insert operation that creates this element.
    pub fn insert_op(&self) -> Operation {
        Operation::Insert {
            id: self.id,
            value: self.value,
            after: self.origin,
        }
    }
}
