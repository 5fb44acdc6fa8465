//! Version vectors: per-site clock high-water marks.
//!
//! A replica records the highest clock it has observed from each site.
//! Two vectors are compared element-wise; merging takes the element-wise
//! maximum, which makes `merge` a join.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::id::{ElementId, SiteId};

/// Mapping from site to the highest clock known locally for that site.
///
/// Backed by a `BTreeMap` so that equality, iteration and encoding are
/// deterministic across replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector {
    clocks: BTreeMap<SiteId, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest clock seen for `site` (0 when unknown).
    pub fn get(&self, site: &SiteId) -> u64 {
        self.clocks.get(site).copied().unwrap_or(0)
    }

    /// Record that `clock` was observed for `site`.
    pub fn observe(&mut self, site: SiteId, clock: u64) {
        let entry = self.clocks.entry(site).or_insert(0);
        if clock > *entry {
            *entry = clock;
        }
    }

    /// Record the stamp carried by an element id.
    pub fn observe_id(&mut self, id: &ElementId) {
        self.observe(id.site, id.clock);
    }

    /// Whether an element with this id is covered by the vector.
    pub fn includes(&self, id: &ElementId) -> bool {
        self.get(&id.site) >= id.clock
    }

    /// Element-wise maximum.
    pub fn merge(&mut self, other: &VersionVector) {
        for (site, clock) in &other.clocks {
            self.observe(*site, *clock);
        }
    }

    /// True when every entry of `other` is `<=` the matching entry here.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other.clocks.iter().all(|(site, clock)| self.get(site) >= *clock)
    }

    /// Largest clock across all sites.
    pub fn max_clock(&self) -> u64 {
        self.clocks.values().copied().max().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SiteId, &u64)> {
        self.clocks.iter()
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}
