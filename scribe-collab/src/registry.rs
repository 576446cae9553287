//! Room registry: room id → live room, created on first join and reclaimed
//! when its last member leaves.
//!
//! Lock order is registry map, then room session. Nothing holds a session
//! lock while waiting for the map, so the two never deadlock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

use scribe_core::{ClientId, Operation, RoomId};

use crate::broadcast::{BroadcastGroup, RoomEvent};
use crate::config::ServerConfig;
use crate::presence::CursorPosition;
use crate::session::{Commit, JoinSnapshot, RoomSession, SessionError};

#[derive(Debug, Default)]
struct RegistryCounters {
    commits: AtomicU64,
    rejections: AtomicU64,
}

/// Registry-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub rooms: usize,
    pub commits: u64,
    pub rejections: u64,
}

/// A live room: its session behind a lock, plus its event channel.
pub struct RoomHandle {
    room_id: RoomId,
    session: Mutex<RoomSession>,
    events: BroadcastGroup,
    counters: Arc<RegistryCounters>,
}

impl RoomHandle {
    fn new(room_id: &str, config: &ServerConfig, counters: Arc<RegistryCounters>) -> Self {
        Self {
            room_id: room_id.to_string(),
            session: Mutex::new(RoomSession::new(room_id, config)),
            events: BroadcastGroup::new(config.broadcast_capacity),
            counters,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn events(&self) -> &BroadcastGroup {
        &self.events
    }

    /// Commit an operation and publish it to the room.
    pub async fn submit(&self, client_id: ClientId, op: Operation) -> Result<Commit, SessionError> {
        let mut session = self.session.lock().await;
        match session.submit(client_id, op, Instant::now()) {
            Ok(commit) => {
                self.events.send(RoomEvent::Committed {
                    origin: commit.origin,
                    operation: commit.operation.clone(),
                    version: commit.version,
                });
                self.counters.commits.fetch_add(1, Ordering::Relaxed);
                Ok(commit)
            }
            Err(e) => {
                self.counters.rejections.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Record a member's cursor and publish where it landed.
    pub async fn update_cursor(
        &self,
        client_id: ClientId,
        position: CursorPosition,
        version: u64,
    ) -> Result<(), SessionError> {
        let mut session = self.session.lock().await;
        let current = session.version();
        let event = match session.update_cursor(client_id, position, version, Instant::now())? {
            Some(entry) => RoomEvent::Cursor {
                client_id,
                display_name: entry.display_name,
                color: entry.color,
                position: entry.position,
                version: current,
            },
            None => RoomEvent::CursorRemoved { client_id },
        };
        self.events.send(event);
        Ok(())
    }

    /// Drop stale cursors and tell the room. Returns how many were removed.
    pub async fn sweep(&self, now: Instant) -> usize {
        let mut session = self.session.lock().await;
        let removed = session.sweep(now);
        for client_id in &removed {
            self.events.send(RoomEvent::CursorRemoved { client_id: *client_id });
        }
        removed.len()
    }

    pub async fn version(&self) -> u64 {
        self.session.lock().await.version()
    }

    pub async fn client_count(&self) -> usize {
        self.session.lock().await.len()
    }

    /// Run `f` against the session under the room lock.
    pub async fn inspect<R>(&self, f: impl FnOnce(&RoomSession) -> R) -> R {
        let session = self.session.lock().await;
        f(&session)
    }
}

/// Result of a successful join.
pub struct Membership {
    pub room: Arc<RoomHandle>,
    pub snapshot: JoinSnapshot,
    /// Subscribed under the room lock, so it starts exactly after the
    /// snapshot's version.
    pub events: broadcast::Receiver<Arc<RoomEvent>>,
}

/// All live rooms of a server.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<RoomHandle>>>,
    config: ServerConfig,
    counters: Arc<RegistryCounters>,
}

impl RoomRegistry {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            config,
            counters: Arc::new(RegistryCounters::default()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Join `room_id`, creating the room if needed.
    pub async fn join(
        &self,
        room_id: &str,
        client_id: ClientId,
        display_name: &str,
    ) -> Result<Membership, SessionError> {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(room_id) {
            Some(room) => Arc::clone(room),
            None => {
                log::info!("Room {room_id} created");
                let room = Arc::new(RoomHandle::new(room_id, &self.config, Arc::clone(&self.counters)));
                rooms.insert(room_id.to_string(), Arc::clone(&room));
                room
            }
        };

        let mut session = room.session.lock().await;
        let snapshot = match session.join(client_id, display_name, Instant::now()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("{display_name} could not join room {room_id}: {e}");
                let empty = session.is_empty();
                drop(session);
                if empty {
                    rooms.remove(room_id);
                }
                return Err(e);
            }
        };
        let events = room.events.subscribe();
        room.events.send(RoomEvent::UsersUpdated {
            display_names: snapshot.users.clone(),
        });
        drop(session);

        Ok(Membership { room, snapshot, events })
    }

    /// Remove a member, telling the rest of the room. Reclaims the room when
    /// it becomes empty. Returns whether the client was a member.
    pub async fn leave(&self, room_id: &str, client_id: &ClientId) -> bool {
        let Some(room) = self.room(room_id).await else {
            return false;
        };

        let empty = {
            let mut session = room.session.lock().await;
            let had_cursor = session.presence().get(client_id).is_some();
            if session.leave(client_id).is_none() {
                return false;
            }
            if had_cursor {
                room.events.send(RoomEvent::CursorRemoved { client_id: *client_id });
            }
            room.events.send(RoomEvent::UsersUpdated {
                display_names: session.display_names(),
            });
            session.is_empty()
        };

        if empty {
            self.reclaim(room_id).await;
        }
        true
    }

    /// Drop a room if it is still registered and still empty; a join may
    /// have raced in since the last member left.
    async fn reclaim(&self, room_id: &str) {
        let mut rooms = self.rooms.write().await;
        let empty = match rooms.get(room_id) {
            Some(room) => room.session.lock().await.is_empty(),
            None => false,
        };
        if empty {
            rooms.remove(room_id);
            log::info!("Room {room_id} removed (empty)");
        }
    }

    /// Sweep stale cursors in every room.
    pub async fn sweep(&self, now: Instant) -> usize {
        let rooms: Vec<Arc<RoomHandle>> = self.rooms.read().await.values().cloned().collect();
        let mut removed = 0;
        for room in rooms {
            removed += room.sweep(now).await;
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until the registry
    /// is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let removed = registry.sweep(Instant::now()).await;
                if removed > 0 {
                    log::debug!("Presence sweep removed {removed} cursors");
                }
            }
        })
    }

    pub async fn room(&self, room_id: &str) -> Option<Arc<RoomHandle>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            rooms: self.room_count().await,
            commits: self.counters.commits.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
        }
    }
}
