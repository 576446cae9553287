//! Presence tracking: who is in a room and where their caret is.
//!
//! ## Architecture
//!
//! ```text
//! CursorUpdate{pos @ v}
//!       │
//!       ▼
//! RoomSession::update_cursor()
//!       │  transform pos through history since v
//!       ▼
//! RoomPresence::update()  ──► Cursor{..} to peers
//!       ▲
//!       │  every commit moves every stored cursor
//! RoomPresence::transform(op)
//!
//! sweeper (every 1 s) ── RoomPresence::sweep(now) ──► CursorRemoved{..}
//! ```
//!
//! Entries that have not been refreshed for longer than the timeout (5 s by
//! default) are never reported as visible and are dropped on the next sweep.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use scribe_core::{transform_index, ClientId, Operation};

// ───────────────────────────────────────────────────────────────────
// Colours
// ───────────────────────────────────────────────────────────────────

/// Cursor and label palette.
pub const PALETTE: [&str; 12] = [
    "#FF6B6B", // red
    "#4ECDC4", // teal
    "#45B7D1", // blue
    "#96CEB4", // green
    "#FFEAA7", // yellow
    "#DDA0DD", // plum
    "#98D8C8", // mint
    "#F7DC6F", // light yellow
    "#BB8FCE", // light purple
    "#85C1E9", // light blue
    "#F8C471", // light orange
    "#82E0AA", // light green
];

/// Hex colour used to draw a user's caret and name label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserColor(String);

impl UserColor {
    /// Stable palette colour for a display name.
    ///
    /// The name is hashed over its UTF-16 code units with
    /// `hash = hash * 31 + unit` in wrapping 32-bit arithmetic, so browser
    /// clients computing the same hash pick the same colour.
    pub fn for_name(display_name: &str) -> Self {
        let hash = display_name
            .encode_utf16()
            .fold(0i32, |hash, unit| hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(i32::from(unit)));
        let index = hash.unsigned_abs() as usize % PALETTE.len();
        UserColor(PALETTE[index].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UserColor {
    fn default() -> Self {
        UserColor(PALETTE[0].to_string())
    }
}

// ───────────────────────────────────────────────────────────────────
// Positions
// ───────────────────────────────────────────────────────────────────

/// A selection in document offsets; a caret when `anchor == head`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CursorPosition {
    pub anchor: usize,
    pub head: usize,
}

impl CursorPosition {
    pub fn caret(offset: usize) -> Self {
        Self { anchor: offset, head: offset }
    }

    pub fn selection(anchor: usize, head: usize) -> Self {
        Self { anchor, head }
    }

    pub fn is_caret(&self) -> bool {
        self.anchor == self.head
    }

    /// Move both ends through `op`. `owner` is whoever the cursor belongs
    /// to: their own typing pushes the cursor along.
    pub fn transform(self, op: &Operation, owner: ClientId) -> Self {
        Self {
            anchor: transform_index(self.anchor, op, owner),
            head: transform_index(self.head, op, owner),
        }
    }

    /// Pull both ends inside a document of `len` characters.
    pub fn clamp(self, len: usize) -> Self {
        Self {
            anchor: self.anchor.min(len),
            head: self.head.min(len),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Room presence table
// ───────────────────────────────────────────────────────────────────

/// One user's cursor as tracked by the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub client_id: ClientId,
    pub display_name: String,
    pub color: UserColor,
    /// Interpreted against the room's current version.
    pub position: CursorPosition,
    pub last_seen: Instant,
}

impl PresenceEntry {
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

/// Cursor table for one room.
#[derive(Debug, Clone)]
pub struct RoomPresence {
    entries: HashMap<ClientId, PresenceEntry>,
    timeout: Duration,
}

impl RoomPresence {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    /// Overwrite a user's position and refresh its timestamp.
    pub fn update(
        &mut self,
        client_id: ClientId,
        display_name: &str,
        position: CursorPosition,
        now: Instant,
    ) -> &PresenceEntry {
        let entry = self.entries.entry(client_id).or_insert_with(|| PresenceEntry {
            client_id,
            display_name: display_name.to_string(),
            color: UserColor::for_name(display_name),
            position,
            last_seen: now,
        });
        if entry.display_name != display_name {
            entry.display_name = display_name.to_string();
            entry.color = UserColor::for_name(display_name);
        }
        entry.position = position;
        entry.last_seen = now;
        entry
    }

    pub fn remove(&mut self, client_id: &ClientId) -> Option<PresenceEntry> {
        self.entries.remove(client_id)
    }

    /// Move every stored cursor through a committed operation.
    pub fn transform(&mut self, op: &Operation) {
        for entry in self.entries.values_mut() {
            entry.position = entry.position.transform(op, entry.client_id);
        }
    }

    /// Drop entries not refreshed for longer than the timeout.
    ///
    /// Returns the removed client ids.
    pub fn sweep(&mut self, now: Instant) -> Vec<ClientId> {
        let timeout = self.timeout;
        let stale: Vec<ClientId> = self
            .entries
            .values()
            .filter(|e| e.is_stale(now, timeout))
            .map(|e| e.client_id)
            .collect();

        for id in &stale {
            self.entries.remove(id);
        }

        if !stale.is_empty() {
            log::trace!("Swept {} stale cursors", stale.len());
        }
        stale
    }

    /// Non-stale entries.
    pub fn visible(&self, now: Instant) -> Vec<&PresenceEntry> {
        self.entries
            .values()
            .filter(|e| !e.is_stale(now, self.timeout))
            .collect()
    }

    pub fn get(&self, client_id: &ClientId) -> Option<&PresenceEntry> {
        self.entries.get(client_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
