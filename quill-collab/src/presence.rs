//! Presence: who is in the document and where their cursor is.
//!
//! ```text
//! join ──► PresenceTable::join ──► PresenceEvent::Joined
//! cursor ─► update_cursor ───────► PresenceEvent::CursorMoved
//! heartbeat ─► heartbeat (liveness only)
//! leave ──► leave ───────────────► PresenceEvent::Left
//! (tick) ─► mark_idle ───────────► PresenceEvent::WentIdle
//! ```
//!
//! Presence never touches the CRDT; it is advisory state owned by one
//! session and rebuilt from scratch after every reconnect.

use quill_crdt::SiteId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::protocol::now_millis;

/// Selected range of visible offsets, `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: usize,
    pub end: usize,
}

/// Caret position in visible-text offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionRange>,
}

/// A participant in the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationUser {
    pub id: SiteId,
    pub name: String,
    /// CSS hex color, e.g. `#4f8ef7`
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub cursor: Option<CursorPosition>,
    /// Milliseconds since the UNIX epoch
    pub last_active: u64,
    pub online: bool,
}

impl CollaborationUser {
    pub fn new(id: SiteId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            color: color_for(id),
            avatar: None,
            cursor: None,
            last_active: now_millis(),
            online: true,
        }
    }

    /// Stand-in for a peer we heard from before its `join` arrived.
    pub fn placeholder(id: SiteId) -> Self {
        Self::new(id, format!("Peer-{}", id.short()))
    }
}

/// Generate a stable, visually distinct cursor color from a site id.
///
/// Hue comes from the id, saturation and lightness are fixed so every
/// cursor stays vivid on a light background.
pub fn color_for(site: SiteId) -> String {
    let hash = site.as_uuid().as_u128();
    let hue = ((hash % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Presence changes reported to the host application.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Joined(CollaborationUser),
    Left(SiteId),
    CursorMoved {
        user_id: SiteId,
        cursor: CursorPosition,
    },
    /// No traffic from this user within the idle timeout
    WentIdle(SiteId),
}

/// Remote users known to one session, keyed by site id.
#[derive(Debug, Default)]
pub struct PresenceTable {
    users: HashMap<SiteId, CollaborationUser>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a join. Returns `true` if the user was unknown or offline.
    ///
    /// `last_active` is restamped with the local clock; the sender's
    /// clock is never compared against ours.
    pub fn join(&mut self, mut user: CollaborationUser) -> bool {
        user.online = true;
        user.last_active = now_millis();
        let fresh = self
            .users
            .get(&user.id)
            .map_or(true, |existing| !existing.online);
        self.users.insert(user.id, user);
        fresh
    }

    pub fn leave(&mut self, id: &SiteId) -> Option<CollaborationUser> {
        self.users.remove(id)
    }

    /// Update a user's cursor, creating a placeholder entry if needed.
    /// `received_at` is local time in ms.
    pub fn update_cursor(&mut self, id: SiteId, cursor: CursorPosition, received_at: u64) {
        let user = self
            .users
            .entry(id)
            .or_insert_with(|| CollaborationUser::placeholder(id));
        user.cursor = Some(cursor);
        user.last_active = user.last_active.max(received_at);
        user.online = true;
    }

    /// Liveness ping. Unknown ids are ignored until they join.
    pub fn heartbeat(&mut self, id: &SiteId, received_at: u64) -> bool {
        match self.users.get_mut(id) {
            Some(user) => {
                user.last_active = user.last_active.max(received_at);
                user.online = true;
                true
            }
            None => false,
        }
    }

    /// Flag users silent for longer than `timeout` as offline.
    ///
    /// Returns the ids that transitioned on this call.
    pub fn mark_idle(&mut self, now: u64, timeout: Duration) -> Vec<SiteId> {
        let timeout_ms = timeout.as_millis() as u64;
        let mut idle = Vec::new();
        for user in self.users.values_mut() {
            if user.online && now.saturating_sub(user.last_active) > timeout_ms {
                user.online = false;
                idle.push(user.id);
            }
        }
        idle
    }

    pub fn get(&self, id: &SiteId) -> Option<&CollaborationUser> {
        self.users.get(id)
    }

    pub fn users(&self) -> impl Iterator<Item = &CollaborationUser> {
        self.users.values()
    }

    pub fn online_count(&self) -> usize {
        self.users.values().filter(|u| u.online).count()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }
}
