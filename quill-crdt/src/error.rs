//! Engine errors.

use crate::id::ElementId;

/// Errors returned by the sequence engine.
///
/// None of these leave the replica in a corrupted state; the caller may
/// keep using it after any of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrdtError {
    /// Local insert offset past the end of the visible text
    OutOfRange { position: usize, len: usize },
    /// No live element at the given offset (usually deleted concurrently)
    NotFound { position: usize },
    /// A buffered remote operation's dependency never arrived
    DependencyTimeout { missing: ElementId },
    /// Snapshot encode/decode failure
    Encoding(String),
}

impl std::fmt::Display for CrdtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfRange { position, len } => {
                write!(f, "Position {position} out of range (length {len})")
            }
            Self::NotFound { position } => write!(f, "No live element at position {position}"),
            Self::DependencyTimeout { missing } => {
                write!(f, "Dependency {missing} never arrived")
            }
            Self::Encoding(e) => write!(f, "Encoding error: {e}"),
        }
    }
}

impl std::error::Error for CrdtError {}
