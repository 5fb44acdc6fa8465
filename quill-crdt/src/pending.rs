//! Causal buffer for remote operations that arrived before their dependency.
//!
//! Networks reorder. An insert anchored on an element we have not seen,
//! or a delete of such an element, is parked here keyed on the missing id
//! and released the moment that id is integrated.
//!
//! The buffer is bounded twice: by entry count (oldest evicted first) and
//! by age (entries older than the horizon are dropped on `expire`).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::id::ElementId;
use crate::operation::Operation;

#[derive(Debug, Clone)]
struct PendingOp {
    op: Operation,
    missing: ElementId,
    since: Instant,
}

/// Bounded buffer of operations waiting on a missing element.
#[derive(Debug, Clone)]
pub struct PendingBuffer {
    /// Oldest first
    entries: VecDeque<PendingOp>,
    max_size: usize,
    horizon: Duration,
}

impl PendingBuffer {
    pub fn new(max_size: usize, horizon: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_size.min(64)),
            max_size: max_size.max(1),
            horizon,
        }
    }

    /// Park `op` until `missing` is integrated.
    ///
    /// Returns the missing id of the entry evicted to make room, if any.
    /// Re-buffering an operation that is already waiting is a no-op.
    pub fn push(&mut self, op: Operation, missing: ElementId, now: Instant) -> Option<ElementId> {
        if self.entries.iter().any(|p| p.op == op) {
            return None;
        }

        let evicted = if self.entries.len() >= self.max_size {
            self.entries.pop_front().map(|p| p.missing)
        } else {
            None
        };

        self.entries.push_back(PendingOp { op, missing, since: now });
        evicted
    }

    /// Remove and return every operation waiting on `id`, in arrival order.
    pub fn take_waiting_on(&mut self, id: &ElementId) -> Vec<Operation> {
        if !self.entries.iter().any(|p| p.missing == *id) {
            return Vec::new();
        }

        let mut released = Vec::new();
        self.entries.retain(|p| {
            if p.missing == *id {
                released.push(p.op.clone());
                false
            } else {
                true
            }
        });
        released
    }

    /// Drop entries older than the horizon, returning their missing ids.
    pub fn expire(&mut self, now: Instant) -> Vec<ElementId> {
        let horizon = self.horizon;
        let mut expired = Vec::new();
        self.entries.retain(|p| {
            if now.saturating_duration_since(p.since) >= horizon {
                expired.push(p.missing);
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
