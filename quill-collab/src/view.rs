//! Boundary with the host editor.
//!
//! The session pushes whole-document text into a [`DocumentView`] and
//! receives the editor's local edits as [`DocumentChange`]s through the
//! sender returned by `CollabSession::change_sender`.

use serde::{Deserialize, Serialize};

/// Receives the merged document text.
pub trait DocumentView {
    fn set_content(&mut self, text: &str);
}

impl<F: FnMut(&str)> DocumentView for F {
    fn set_content(&mut self, text: &str) {
        self(text)
    }
}

/// A local edit reported by the editor, in visible-text offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DocumentChange {
    Insert { from: usize, text: String },
    Delete { from: usize, length: usize },
}

impl DocumentChange {
    pub fn insert(from: usize, text: impl Into<String>) -> Self {
        Self::Insert {
            from,
            text: text.into(),
        }
    }

    pub fn delete(from: usize, length: usize) -> Self {
        Self::Delete { from, length }
    }

    /// The smallest splice turning `before` into `after`: one delete
    /// and/or one insert at the first differing character.
    pub fn between(before: &str, after: &str) -> Vec<Self> {
        let old: Vec<char> = before.chars().collect();
        let new: Vec<char> = after.chars().collect();
        let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
        let suffix = old[prefix..]
            .iter()
            .rev()
            .zip(new[prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .count();

        let mut changes = Vec::with_capacity(2);
        let removed = old.len() - prefix - suffix;
        if removed > 0 {
            changes.push(Self::delete(prefix, removed));
        }
        let inserted: String = new[prefix..new.len() - suffix].iter().collect();
        if !inserted.is_empty() {
            changes.push(Self::insert(prefix, inserted));
        }
        changes
    }

    /// Whole-document replacement of `before` with `after`.
    pub fn replace(before: &str, after: &str) -> Vec<Self> {
        let mut changes = Vec::with_capacity(2);
        let removed = before.chars().count();
        if removed > 0 {
            changes.push(Self::delete(0, removed));
        }
        if !after.is_empty() {
            changes.push(Self::insert(0, after));
        }
        changes
    }

    /// Inserts nothing and deletes nothing.
    pub fn is_noop(&self) -> bool {
        match self {
            Self::Insert { text, .. } => text.is_empty(),
            Self::Delete { length, .. } => *length == 0,
        }
    }
}

/// Split changes queued while the view took `before` -> `after` into
/// the view's own echo and genuine edits.
///
/// The echo is either [`DocumentChange::between`] or
/// [`DocumentChange::replace`] appearing in order among `queued`. When
/// neither does, every queued change is genuine.
pub fn strip_echo(queued: Vec<DocumentChange>, before: &str, after: &str) -> Vec<DocumentChange> {
    let queued: Vec<DocumentChange> = queued.into_iter().filter(|c| !c.is_noop()).collect();
    for echo in [
        DocumentChange::between(before, after),
        DocumentChange::replace(before, after),
    ] {
        if echo.is_empty() {
            continue;
        }
        if let Some(matched) = find_in_order(&queued, &echo) {
            return queued
                .into_iter()
                .enumerate()
                .filter(|(i, _)| !matched.contains(i))
                .map(|(_, c)| c)
                .collect();
        }
    }
    queued
}

fn find_in_order(queued: &[DocumentChange], wanted: &[DocumentChange]) -> Option<Vec<usize>> {
    let mut matched = Vec::with_capacity(wanted.len());
    let mut next = wanted.iter();
    let mut target = next.next();
    for (i, change) in queued.iter().enumerate() {
        match target {
            Some(t) if t == change => {
                matched.push(i);
                target = next.next();
            }
            Some(_) => {}
            None => break,
        }
    }
    target.is_none().then_some(matched)
}
