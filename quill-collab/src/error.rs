//! Session-level errors.

use quill_crdt::CrdtError;

use crate::protocol::ProtocolError;

/// Errors surfaced by the collaboration session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Channel did not acknowledge open within the connect timeout
    ConnectionTimeout,
    /// Transport-level failure
    ChannelError(String),
    /// Inbound data failed to parse or validate
    MalformedMessage(String),
    /// Operation requires an open channel
    NotConnected,
    /// Configuration unusable for the requested operation
    InvalidConfig(String),
    /// Engine-level failure
    Crdt(CrdtError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionTimeout => write!(f, "Connection timeout"),
            Self::ChannelError(e) => write!(f, "Channel error: {e}"),
            Self::MalformedMessage(e) => write!(f, "Malformed message: {e}"),
            Self::NotConnected => write!(f, "Not connected"),
            Self::InvalidConfig(e) => write!(f, "Invalid configuration: {e}"),
            Self::Crdt(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Crdt(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CrdtError> for SessionError {
    fn from(e: CrdtError) -> Self {
        Self::Crdt(e)
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Malformed(msg) => Self::MalformedMessage(msg),
            ProtocolError::Serialization(msg) => Self::ChannelError(format!("encode failed: {msg}")),
        }
    }
}
