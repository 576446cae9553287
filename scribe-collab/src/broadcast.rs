//! Per-room event fan-out.
//!
//! Every member of a room holds a receiver on the room's tokio broadcast
//! channel. Events are sent while the room lock is held, so each receiver
//! observes commits, cursor moves and membership changes in exactly the
//! order the room applied them. Acknowledgements are derived from the same
//! stream, which keeps a client's ack in line with foreign commits.
//!
//! A receiver that falls more than `capacity` events behind loses its place
//! and has to resynchronise.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use scribe_core::{ClientId, Operation};

use crate::presence::{CursorPosition, UserColor};

/// Something that happened in a room, in room order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    Committed {
        origin: ClientId,
        operation: Operation,
        version: u64,
    },
    Cursor {
        client_id: ClientId,
        display_name: String,
        color: UserColor,
        position: CursorPosition,
        version: u64,
    },
    CursorRemoved {
        client_id: ClientId,
    },
    UsersUpdated {
        display_names: Vec<String>,
    },
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub events_sent: u64,
    pub events_lagged: u64,
    pub receivers: usize,
}

/// Atomic counters, updated without taking any lock.
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    events_sent: AtomicU64,
    events_lagged: AtomicU64,
}

/// Event channel of a single room.
#[derive(Debug)]
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RoomEvent>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a group buffering up to `capacity` events per receiver.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Receiver that sees every event sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RoomEvent>> {
        self.sender.subscribe()
    }

    /// Send to every current receiver. Returns how many there were.
    pub fn send(&self, event: RoomEvent) -> usize {
        let count = self.sender.send(Arc::new(event)).unwrap_or(0);
        self.stats.events_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Note that a receiver skipped `missed` events.
    pub fn record_lag(&self, missed: u64) {
        self.stats.events_lagged.fetch_add(missed, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.stats.events_sent.load(Ordering::Relaxed),
            events_lagged: self.stats.events_lagged.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }
}
