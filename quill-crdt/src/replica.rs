//! The sequence replica: one site's copy of the document.
//!
//! ## Ordering
//!
//! Elements form a tree: each element is a child of the element it was
//! inserted after (its origin), the start sentinel being the root.
//! Siblings are ordered by descending [`ElementId`]; the document is the
//! pre-order walk of that tree.
//!
//! Integration never builds the tree. Starting right after the origin, it
//! skips every element whose id is greater than the new one and inserts
//! at the first smaller id. Ids are Lamport stamps, so every descendant of
//! a larger sibling also carries a larger id and gets skipped with it.
//! The result depends only on the set of elements, never on arrival order.
//!
//! ```text
//! start ── a(1@s1) ── b(2@s1)          order: a b
//!      └── x(1@s2)                     order: x a b   (1@s2 > 1@s1)
//! ```
//!
//! Deletion only flips `visible`, so surviving elements never move
//! relative to each other.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::clock::VersionVector;
use crate::error::CrdtError;
use crate::id::{ElementId, SiteId};
use crate::operation::{Element, Operation};
use crate::pending::PendingBuffer;
use crate::state::DocumentState;

/// Tunables for the causal buffer.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Maximum number of buffered remote operations
    pub max_pending: usize,
    /// How long a buffered operation may wait for its dependency
    pub dependency_timeout: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            max_pending: 1024,
            dependency_timeout: Duration::from_secs(30),
        }
    }
}

/// One replica of the replicated character sequence.
///
/// Not internally synchronized: all mutation goes through `&mut self`.
#[derive(Debug, Clone)]
pub struct Replica {
    site: SiteId,
    /// Lamport clock, bumped on local mutations and on integrating remote ids
    clock: u64,
    /// All elements in document order, tombstones included
    elements: Vec<Element>,
    /// id → visible flag, for O(1) existence checks
    known: HashMap<ElementId, bool>,
    visible_len: usize,
    version: VersionVector,
    pending: PendingBuffer,
}

impl Replica {
    pub fn new(site: SiteId) -> Self {
        Self::with_config(site, ReplicaConfig::default())
    }

    pub fn with_config(site: SiteId, config: ReplicaConfig) -> Self {
        Self {
            site,
            clock: 0,
            elements: Vec::new(),
            known: HashMap::new(),
            visible_len: 0,
            version: VersionVector::new(),
            pending: PendingBuffer::new(config.max_pending, config.dependency_timeout),
        }
    }

    /// Restore a replica for `site` from a previously captured state.
    pub fn from_state(site: SiteId, state: &DocumentState) -> Self {
        let mut replica = Self::new(site);
        replica.merge(state);
        replica
    }

    pub fn site_id(&self) -> SiteId {
        self.site
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.visible_len
    }

    pub fn is_empty(&self) -> bool {
        self.visible_len == 0
    }

    pub fn version_vector(&self) -> &VersionVector {
        &self.version
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.elements.len() - self.visible_len
    }

    pub fn contains(&self, id: &ElementId) -> bool {
        self.known.contains_key(id)
    }

    /// Visible text in document order.
    pub fn text(&self) -> String {
        let mut text = String::with_capacity(self.visible_len);
        text.extend(self.elements.iter().filter(|e| e.visible).map(|e| e.value));
        text
    }

    /// Snapshot of the full state (elements + version vector).
    pub fn state(&self) -> DocumentState {
        DocumentState {
            elements: self.elements.clone(),
            version_vector: self.version.clone(),
        }
    }

    // ── Local edits ──────────────────────────────────────────────

    /// Insert `value` so that it ends up at visible offset `position`.
    pub fn insert(&mut self, position: usize, value: char) -> Result<Operation, CrdtError> {
        if position > self.visible_len {
            return Err(CrdtError::OutOfRange {
                position,
                len: self.visible_len,
            });
        }

        let after = match position {
            0 => None,
            p => self.visible_index(p - 1).map(|i| self.elements[i].id),
        };

        self.clock += 1;
        let id = ElementId::new(self.clock, self.site);
        self.version.observe_id(&id);
        self.integrate(Element {
            id,
            value,
            origin: after,
            visible: true,
        });

        Ok(Operation::Insert { id, value, after })
    }

    /// Insert every character of `text` starting at `position`.
    pub fn insert_str(&mut self, position: usize, text: &str) -> Result<Vec<Operation>, CrdtError> {
        if position > self.visible_len {
            return Err(CrdtError::OutOfRange {
                position,
                len: self.visible_len,
            });
        }
        text.chars()
            .enumerate()
            .map(|(offset, ch)| self.insert(position + offset, ch))
            .collect()
    }

    /// Tombstone the live element at visible offset `position`.
    pub fn delete(&mut self, position: usize) -> Result<Operation, CrdtError> {
        let index = self
            .visible_index(position)
            .ok_or(CrdtError::NotFound { position })?;
        let id = self.elements[index].id;
        self.tombstone(index);

        self.clock += 1;
        self.version.observe(self.site, self.clock);
        Ok(Operation::Delete { id })
    }

    // ── Remote operations ────────────────────────────────────────

    /// Apply a remote operation. See [`Replica::apply_operation_at`].
    pub fn apply_operation(&mut self, op: Operation) -> Result<Vec<Operation>, CrdtError> {
        self.apply_operation_at(op, Instant::now())
    }

    /// Apply a remote operation, using `now` to timestamp it if it has to
    /// wait for a missing dependency.
    ///
    /// Returns every operation that took effect: `op` itself followed by
    /// anything it unblocked. An empty list means duplicate or buffered.
    /// `DependencyTimeout` is returned when buffering `op` pushed the
    /// oldest buffered operation out.
    pub fn apply_operation_at(
        &mut self,
        op: Operation,
        now: Instant,
    ) -> Result<Vec<Operation>, CrdtError> {
        if self.is_redundant(&op) {
            return Ok(Vec::new());
        }

        if let Some(missing) = op.dependency().filter(|dep| !self.known.contains_key(dep)) {
            log::debug!("Buffering {} until {missing} arrives", op.id());
            return match self.pending.push(op, missing, now) {
                Some(evicted) => {
                    log::warn!("Causal buffer full, dropped operation waiting on {evicted}");
                    Err(CrdtError::DependencyTimeout { missing: evicted })
                }
                None => Ok(Vec::new()),
            };
        }

        let mut applied = Vec::new();
        let mut ready = vec![op];
        while let Some(op) = ready.pop() {
            if !self.apply_ready(&op) {
                continue;
            }
            if op.is_insert() {
                let mut released = self.pending.take_waiting_on(&op.id());
                released.reverse();
                ready.extend(released);
            }
            applied.push(op);
        }
        Ok(applied)
    }

    /// Drop buffered operations older than the dependency timeout.
    pub fn expire_pending(&mut self, now: Instant) -> Vec<CrdtError> {
        self.pending
            .expire(now)
            .into_iter()
            .map(|missing| {
                log::warn!("Dropped buffered operation: {missing} never arrived");
                CrdtError::DependencyTimeout { missing }
            })
            .collect()
    }

    // ── State reconciliation ─────────────────────────────────────

    /// Join a remote state into this replica.
    ///
    /// Returns the operations that were new here, dependencies first.
    pub fn merge(&mut self, remote: &DocumentState) -> Vec<Operation> {
        self.merge_at(remote, Instant::now())
    }

    pub fn merge_at(&mut self, remote: &DocumentState, now: Instant) -> Vec<Operation> {
        let mut applied = Vec::new();

        for element in &remote.elements {
            if let Some(&visible) = self.known.get(&element.id) {
                if visible && !element.visible {
                    if let Some(index) = self.index_of(&element.id) {
                        self.tombstone(index);
                        applied.push(Operation::Delete { id: element.id });
                    }
                }
                continue;
            }

            let mut ops = vec![element.insert_op()];
            if !element.visible {
                ops.push(Operation::Delete { id: element.id });
            }
            for op in ops {
                match self.apply_operation_at(op, now) {
                    Ok(done) => applied.extend(done),
                    Err(e) => log::warn!("Merge from remote state: {e}"),
                }
            }
        }

        self.version.merge(&remote.version_vector);
        self.clock = self.clock.max(remote.version_vector.max_clock());
        applied
    }

    // ── Internals ────────────────────────────────────────────────

    fn is_redundant(&self, op: &Operation) -> bool {
        match op {
            Operation::Insert { id, .. } => self.known.contains_key(id),
            Operation::Delete { id } => self.known.get(id) == Some(&false),
        }
    }

    /// Apply an operation whose dependency is present. Returns whether
    /// it changed anything.
    fn apply_ready(&mut self, op: &Operation) -> bool {
        match op {
            Operation::Insert { id, value, after } => {
                if self.known.contains_key(id) {
                    return false;
                }
                self.version.observe_id(id);
                self.clock = self.clock.max(id.clock);
                self.integrate(Element {
                    id: *id,
                    value: *value,
                    origin: *after,
                    visible: true,
                });
                true
            }
            Operation::Delete { id } => match self.index_of(id) {
                Some(index) if self.elements[index].visible => {
                    self.tombstone(index);
                    true
                }
                _ => false,
            },
        }
    }

    /// Splice an element into its position. The origin must be known.
    fn integrate(&mut self, element: Element) {
        let mut index = match element.origin {
            None => 0,
            Some(origin) => self.index_of(&origin).map_or(0, |i| i + 1),
        };
        while index < self.elements.len() && self.elements[index].id > element.id {
            index += 1;
        }

        if element.visible {
            self.visible_len += 1;
        }
        self.known.insert(element.id, element.visible);
        self.elements.insert(index, element);
    }

    fn tombstone(&mut self, index: usize) {
        let element = &mut self.elements[index];
        if element.visible {
            element.visible = false;
            self.visible_len -= 1;
            self.known.insert(element.id, false);
        }
    }

    fn index_of(&self, id: &ElementId) -> Option<usize> {
        self.elements.iter().position(|e| e.id == *id)
    }

    /// Index in `elements` of the `position`-th visible element.
    fn visible_index(&self, position: usize) -> Option<usize> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, e)| e.visible)
            .nth(position)
            .map(|(i, _)| i)
    }
}
