//! Replica and element identity.
//!
//! Every replica owns a [`SiteId`]. Every character it creates is tagged
//! with an [`ElementId`]: the pair of the replica's Lamport clock at
//! creation time and its site. The derived ordering compares the clock
//! first and breaks ties by site, giving a total order that every replica
//! agrees on without coordination.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier for one replica (one editing session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(Uuid);

impl SiteId {
    /// Allocate a fresh random site id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic site id (for tests and fixtures).
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// First eight hex digits, handy for display names and logs.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for SiteId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SiteId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Position identifier of a single character element.
///
/// Field order matters: the derived `Ord` compares `clock` before `site`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId {
    /// Lamport clock of the creating site at creation time
    pub clock: u64,
    /// Creating site
    pub site: SiteId,
}

impl ElementId {
    pub fn new(clock: u64, site: SiteId) -> Self {
        Self { clock, site }
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.site.short())
    }
}
