//! Room session: the authority for one room's document.
//!
//! A session owns the room's [`DocumentState`], its member table and its
//! presence table. Everything here is synchronous; the registry serialises
//! calls behind one lock per room, so operations on a room are applied
//! strictly one after another.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use scribe_core::{ClientId, Content, DocumentState, Operation, OtError, RoomId};

use crate::config::ServerConfig;
use crate::presence::{CursorPosition, PresenceEntry, RoomPresence};

/// Session-level failures. Each one rejects a single request and leaves the
/// room untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Ot(#[from] OtError),

    #[error("client {client_id} has not joined room {room_id}")]
    NotJoined { room_id: RoomId, client_id: ClientId },

    #[error("room {room_id} is full ({capacity} clients)")]
    RoomFull { room_id: RoomId, capacity: usize },

    #[error("operation targets room {actual} but was sent to room {expected}")]
    RoomMismatch { expected: RoomId, actual: RoomId },
}

/// Per-member bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub display_name: String,
    pub last_acknowledged_version: u64,
    /// Position in join order, for stable member listings.
    pub joined: u64,
    pub last_seen: Instant,
}

/// What a joining client receives; the only full-document transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSnapshot {
    pub content: Arc<Content>,
    pub version: u64,
    pub users: Vec<String>,
}

/// A committed submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub origin: ClientId,
    /// The operation as applied, rebased onto the previous version.
    pub operation: Operation,
    pub version: u64,
}

pub struct RoomSession {
    room_id: RoomId,
    document: DocumentState,
    clients: HashMap<ClientId, ClientInfo>,
    next_join: u64,
    presence: RoomPresence,
    max_clients: usize,
}

impl RoomSession {
    /// Fresh room seeded with the configured initial text.
    pub fn new(room_id: impl Into<RoomId>, config: &ServerConfig) -> Self {
        let seed = Content::from(config.initial_text.as_str());
        Self {
            room_id: room_id.into(),
            document: DocumentState::with_content(seed, config.history_limit),
            clients: HashMap::new(),
            next_join: 0,
            presence: RoomPresence::new(config.presence_timeout),
            max_clients: config.max_clients_per_room,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn document(&self) -> &DocumentState {
        &self.document
    }

    pub fn version(&self) -> u64 {
        self.document.version()
    }

    pub fn presence(&self) -> &RoomPresence {
        &self.presence
    }

    pub fn client(&self, client_id: &ClientId) -> Option<&ClientInfo> {
        self.clients.get(client_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Member display names in join order.
    pub fn display_names(&self) -> Vec<String> {
        let mut members: Vec<&ClientInfo> = self.clients.values().collect();
        members.sort_by_key(|c| c.joined);
        members.into_iter().map(|c| c.display_name.clone()).collect()
    }

    /// Add a member and hand back the current snapshot.
    ///
    /// Joining again refreshes the snapshot and keeps the member's place.
    pub fn join(
        &mut self,
        client_id: ClientId,
        display_name: &str,
        now: Instant,
    ) -> Result<JoinSnapshot, SessionError> {
        let version = self.document.version();
        match self.clients.get_mut(&client_id) {
            Some(existing) => {
                existing.display_name = display_name.to_string();
                existing.last_acknowledged_version = version;
                existing.last_seen = now;
            }
            None => {
                if self.clients.len() >= self.max_clients {
                    return Err(SessionError::RoomFull {
                        room_id: self.room_id.clone(),
                        capacity: self.max_clients,
                    });
                }
                self.clients.insert(
                    client_id,
                    ClientInfo {
                        display_name: display_name.to_string(),
                        last_acknowledged_version: version,
                        joined: self.next_join,
                        last_seen: now,
                    },
                );
                self.next_join += 1;
            }
        }

        log::info!(
            "{display_name} ({client_id}) joined room {} at version {version}",
            self.room_id
        );

        Ok(JoinSnapshot {
            content: Arc::clone(self.document.content()),
            version,
            users: self.display_names(),
        })
    }

    /// Rebase `op` over whatever was committed since its base version and
    /// apply it.
    pub fn submit(
        &mut self,
        client_id: ClientId,
        op: Operation,
        now: Instant,
    ) -> Result<Commit, SessionError> {
        if op.room_id() != self.room_id {
            return Err(SessionError::RoomMismatch {
                expected: self.room_id.clone(),
                actual: op.room_id().to_string(),
            });
        }
        if !self.clients.contains_key(&client_id) {
            return Err(self.not_joined(client_id));
        }
        if op.client_id() != client_id {
            return Err(OtError::MalformedOperation(format!(
                "operation authored by {} submitted by {client_id}",
                op.client_id()
            ))
            .into());
        }

        let base_version = op.base_version();
        let (committed, version) = self.document.commit(op).map_err(|e| {
            match &e {
                OtError::OutOfOrderOperation { .. } => {
                    log::error!("Out of order commit in room {}: {e}", self.room_id)
                }
                _ => log::warn!("Rejected operation from {client_id} in room {}: {e}", self.room_id),
            }
            SessionError::from(e)
        })?;

        self.presence.transform(&committed);
        if let Some(info) = self.clients.get_mut(&client_id) {
            info.last_acknowledged_version = version;
            info.last_seen = now;
        }

        log::debug!(
            "Room {} committed {:?} from {client_id} (base {base_version}) at version {version}",
            self.room_id,
            committed.kind()
        );

        Ok(Commit {
            origin: client_id,
            operation: committed,
            version,
        })
    }

    /// Remove a member and its cursor.
    pub fn leave(&mut self, client_id: &ClientId) -> Option<ClientInfo> {
        let info = self.clients.remove(client_id)?;
        self.presence.remove(client_id);
        log::info!("{} ({client_id}) left room {}", info.display_name, self.room_id);
        Some(info)
    }

    /// Record a cursor stated against `version`.
    ///
    /// The position is transformed forward to the current version. Returns
    /// `None` when that is impossible (history no longer retained, or a
    /// version from the future); the member's cursor entry is dropped then.
    pub fn update_cursor(
        &mut self,
        client_id: ClientId,
        position: CursorPosition,
        version: u64,
        now: Instant,
    ) -> Result<Option<PresenceEntry>, SessionError> {
        let Some(info) = self.clients.get_mut(&client_id) else {
            return Err(self.not_joined(client_id));
        };
        info.last_seen = now;
        let display_name = info.display_name.clone();

        let current = self.document.version();
        let moved = match self.document.history().since(version, current) {
            Ok(ops) => ops.fold(position, |pos, op| pos.transform(op, client_id)),
            Err(e) => {
                log::trace!("Dropping cursor of {client_id} in room {}: {e}", self.room_id);
                self.presence.remove(&client_id);
                return Ok(None);
            }
        };

        let moved = moved.clamp(self.document.len());
        log::trace!("Cursor of {client_id} in room {} at {moved:?}", self.room_id);
        Ok(Some(self.presence.update(client_id, &display_name, moved, now).clone()))
    }

    /// Drop stale cursors. Returns the affected members.
    pub fn sweep(&mut self, now: Instant) -> Vec<ClientId> {
        self.presence.sweep(now)
    }

    /// Cursors that are still fresh.
    pub fn visible_cursors(&self, now: Instant) -> Vec<PresenceEntry> {
        self.presence.visible(now).into_iter().cloned().collect()
    }

    fn not_joined(&self, client_id: ClientId) -> SessionError {
        SessionError::NotJoined {
            room_id: self.room_id.clone(),
            client_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::Mismatch;
    use std::time::Duration;
    use uuid::Uuid;

    fn alice() -> ClientId {
        Uuid::from_u128(0xA)
    }

    fn bob() -> ClientId {
        Uuid::from_u128(0xB)
    }

    fn room(text: &str) -> RoomSession {
        let config = ServerConfig {
            initial_text: text.to_string(),
            history_limit: 8,
            max_clients_per_room: 2,
            ..ServerConfig::default()
        };
        RoomSession::new("doc", &config)
    }

    #[test]
    fn test_join_returns_snapshot() {
        let mut session = room("Hello");
        let now = Instant::now();
        let snapshot = session.join(alice(), "Alice", now).unwrap();
        assert_eq!(snapshot.content.text(), "Hello");
        assert_eq!(snapshot.version, 0);
        assert_eq!(snapshot.users, vec!["Alice"]);

        let snapshot = session.join(bob(), "Bob", now).unwrap();
        assert_eq!(snapshot.users, vec!["Alice", "Bob"]);
        assert_eq!(session.len(), 2);
    }

    #[test]
    fn test_join_room_full() {
        let mut session = room("");
        let now = Instant::now();
        session.join(alice(), "Alice", now).unwrap();
        session.join(bob(), "Bob", now).unwrap();
        let err = session.join(Uuid::from_u128(0xC), "Carol", now).unwrap_err();
        assert!(matches!(err, SessionError::RoomFull { capacity: 2, .. }));
        // Existing members may rejoin.
        assert!(session.join(alice(), "Alice", now).is_ok());
        assert_eq!(session.display_names(), vec!["Alice", "Bob"]);
    }

    #[test]
    fn test_submit_both_orders_converge() {
        for alice_first in [true, false] {
            let mut session = room("Hello");
            let now = Instant::now();
            session.join(alice(), "Alice", now).unwrap();
            session.join(bob(), "Bob", now).unwrap();

            let x = Operation::insert_at("doc", alice(), 0, 5, 0, "X").unwrap();
            let y = Operation::insert_at("doc", bob(), 0, 5, 5, "Y").unwrap();
            let (first, second) = if alice_first { ((alice(), x), (bob(), y)) } else { ((bob(), y), (alice(), x)) };

            session.submit(first.0, first.1, now).unwrap();
            let commit = session.submit(second.0, second.1, now).unwrap();
            assert_eq!(commit.version, 2);
            assert_eq!(commit.operation.base_version(), 1);
            assert_eq!(session.document().content().text(), "XHelloY");
            assert_eq!(session.client(&second.0).unwrap().last_acknowledged_version, 2);
        }
    }

    #[test]
    fn test_submit_requires_membership() {
        let mut session = room("abc");
        let op = Operation::insert_at("doc", alice(), 0, 3, 0, "x").unwrap();
        let err = session.submit(alice(), op, Instant::now()).unwrap_err();
        assert!(matches!(err, SessionError::NotJoined { .. }));
        assert_eq!(session.version(), 0);
    }

    #[test]
    fn test_submit_wrong_room() {
        let mut session = room("abc");
        session.join(alice(), "Alice", Instant::now()).unwrap();
        let op = Operation::insert_at("other", alice(), 0, 3, 0, "x").unwrap();
        assert!(matches!(
            session.submit(alice(), op, Instant::now()),
            Err(SessionError::RoomMismatch { .. })
        ));
    }

    #[test]
    fn test_submit_foreign_author_rejected() {
        let mut session = room("abc");
        session.join(alice(), "Alice", Instant::now()).unwrap();
        let op = Operation::insert_at("doc", bob(), 0, 3, 0, "x").unwrap();
        assert!(matches!(
            session.submit(alice(), op, Instant::now()),
            Err(SessionError::Ot(OtError::MalformedOperation(_)))
        ));
    }

    #[test]
    fn test_submit_truncated_history() {
        let mut session = room("");
        let now = Instant::now();
        session.join(alice(), "Alice", now).unwrap();
        session.join(bob(), "Bob", now).unwrap();
        for i in 0..10u64 {
            let op = Operation::insert_at("doc", alice(), i, i as usize, 0, "a").unwrap();
            session.submit(alice(), op, now).unwrap();
        }

        let stale = Operation::insert_at("doc", bob(), 1, 1, 0, "b").unwrap();
        let err = session.submit(bob(), stale, now).unwrap_err();
        assert_eq!(
            err,
            SessionError::Ot(OtError::VersionMismatch(Mismatch::Truncated { base_version: 1, oldest: 2 }))
        );
        assert_eq!(session.version(), 10);

        let snapshot = session.join(bob(), "Bob", now).unwrap();
        assert_eq!(snapshot.version, 10);
        assert_eq!(snapshot.content.text(), "a".repeat(10));
    }

    #[test]
    fn test_cursor_transformed_through_commits() {
        let mut session = room("Hello");
        let now = Instant::now();
        session.join(alice(), "Alice", now).unwrap();
        session.join(bob(), "Bob", now).unwrap();

        session.update_cursor(bob(), CursorPosition::caret(3), 0, now).unwrap();
        let op = Operation::insert_at("doc", alice(), 0, 5, 0, "XY").unwrap();
        session.submit(alice(), op, now).unwrap();
        assert_eq!(session.presence().get(&bob()).unwrap().position, CursorPosition::caret(5));

        // A cursor stated against version 0 lands after the insert too.
        let entry = session.update_cursor(bob(), CursorPosition::caret(4), 0, now).unwrap().unwrap();
        assert_eq!(entry.position, CursorPosition::caret(6));
        assert_eq!(entry.display_name, "Bob");
    }

    #[test]
    fn test_cursor_future_version_dropped() {
        let mut session = room("Hello");
        let now = Instant::now();
        session.join(bob(), "Bob", now).unwrap();
        session.update_cursor(bob(), CursorPosition::caret(1), 0, now).unwrap();
        assert!(session.update_cursor(bob(), CursorPosition::caret(1), 9, now).unwrap().is_none());
        assert!(session.presence().get(&bob()).is_none());
    }

    #[test]
    fn test_cursor_clamped_to_document() {
        let mut session = room("abc");
        let now = Instant::now();
        session.join(alice(), "Alice", now).unwrap();
        let entry = session.update_cursor(alice(), CursorPosition::selection(1, 40), 0, now).unwrap().unwrap();
        assert_eq!(entry.position, CursorPosition::selection(1, 3));
    }

    #[test]
    fn test_leave_removes_cursor() {
        let mut session = room("abc");
        let now = Instant::now();
        session.join(alice(), "Alice", now).unwrap();
        session.update_cursor(alice(), CursorPosition::caret(1), 0, now).unwrap();
        assert!(session.leave(&alice()).is_some());
        assert!(session.leave(&alice()).is_none());
        assert!(session.is_empty());
        assert!(session.presence().is_empty());
    }

    #[test]
    fn test_sweep_uses_presence_timeout() {
        let mut session = room("abc");
        let now = Instant::now();
        session.join(alice(), "Alice", now).unwrap();
        session.update_cursor(alice(), CursorPosition::caret(1), 0, now).unwrap();

        let timeout = ServerConfig::default().presence_timeout;
        assert!(session.sweep(now + timeout).is_empty());
        assert_eq!(session.visible_cursors(now + timeout).len(), 1);
        assert_eq!(session.sweep(now + timeout + Duration::from_millis(1)), vec![alice()]);
        // Sweeping presence does not remove the member.
        assert_eq!(session.len(), 1);
    }
}
