//! Per-connection protocol handling, independent of the transport.
//!
//! A [`Connection`] turns decoded [`ClientMessage`]s into replies and turns
//! the room's event stream into the messages this particular client should
//! see. The WebSocket server drives one per socket; tests drive it directly.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use scribe_core::{ClientId, Operation, RoomId};

use crate::broadcast::RoomEvent;
use crate::presence::CursorPosition;
use crate::protocol::{ClientMessage, RejectReason, ServerMessage};
use crate::registry::{RoomHandle, RoomRegistry};
use crate::session::SessionError;

struct Joined {
    room: Arc<RoomHandle>,
    events: broadcast::Receiver<Arc<RoomEvent>>,
    /// Set once the receiver lagged; room events are discarded until the
    /// client joins again.
    lagged: bool,
}

/// Protocol state of one client connection.
pub struct Connection {
    client_id: ClientId,
    registry: Arc<RoomRegistry>,
    joined: Option<Joined>,
}

impl Connection {
    /// New connection with a fresh client id.
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self::with_client_id(registry, Uuid::new_v4())
    }

    pub fn with_client_id(registry: Arc<RoomRegistry>, client_id: ClientId) -> Self {
        Self {
            client_id,
            registry,
            joined: None,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Room this connection is currently a member of.
    pub fn room_id(&self) -> Option<&str> {
        self.joined.as_ref().map(|j| j.room.room_id())
    }

    /// Handle one client message and return the direct replies.
    ///
    /// Acknowledgements are not direct replies: they arrive through
    /// [`next_event`](Self::next_event), in room order.
    pub async fn handle(&mut self, msg: ClientMessage) -> Vec<ServerMessage> {
        match msg {
            ClientMessage::Join { room_id, display_name } => {
                vec![self.join(&room_id, &display_name).await]
            }
            ClientMessage::Submit { operation } => self.submit(operation).await.into_iter().collect(),
            ClientMessage::CursorUpdate {
                room_id,
                position,
                version,
            } => self.update_cursor(&room_id, position, version).await.into_iter().collect(),
            ClientMessage::Leave { room_id } => self.leave(&room_id).await.into_iter().collect(),
            ClientMessage::Ping => vec![ServerMessage::Pong],
        }
    }

    async fn join(&mut self, room_id: &str, display_name: &str) -> ServerMessage {
        if let Some(current) = self.room_id().map(str::to_string) {
            if current != room_id {
                self.registry.leave(&current, &self.client_id).await;
                self.joined = None;
            }
        }

        match self.registry.join(room_id, self.client_id, display_name).await {
            Ok(membership) => {
                self.joined = Some(Joined {
                    room: membership.room,
                    events: membership.events,
                    lagged: false,
                });
                ServerMessage::Joined {
                    room_id: room_id.to_string(),
                    client_id: self.client_id,
                    content: (*membership.snapshot.content).clone(),
                    version: membership.snapshot.version,
                    users: membership.snapshot.users,
                }
            }
            Err(e) => ServerMessage::reject(room_id, &e),
        }
    }

    async fn submit(&mut self, operation: Operation) -> Option<ServerMessage> {
        let Some(joined) = &self.joined else {
            let err = SessionError::NotJoined {
                room_id: operation.room_id().to_string(),
                client_id: self.client_id,
            };
            log::debug!("Submission from {} outside any room", self.client_id);
            return Some(ServerMessage::reject(operation.room_id(), &err));
        };

        let room_id = operation.room_id().to_string();
        if joined.lagged {
            log::debug!("Refusing submission from {} until it rejoins {room_id}", self.client_id);
            return Some(ServerMessage::Reject {
                room_id,
                reason: RejectReason::VersionMismatch,
                message: "connection fell behind the room; rejoin before editing".into(),
            });
        }
        match joined.room.submit(self.client_id, operation).await {
            Ok(_) => None,
            Err(e) => Some(ServerMessage::reject(room_id, &e)),
        }
    }

    async fn update_cursor(
        &mut self,
        room_id: &str,
        position: CursorPosition,
        version: u64,
    ) -> Option<ServerMessage> {
        let Some(room) = self.member_of(room_id) else {
            return Some(ServerMessage::error(format!("not joined to room {room_id}")));
        };
        match room.update_cursor(self.client_id, position, version).await {
            Ok(()) => None,
            Err(e) => Some(ServerMessage::error(e.to_string())),
        }
    }

    async fn leave(&mut self, room_id: &str) -> Option<ServerMessage> {
        if self.member_of(room_id).is_none() {
            return Some(ServerMessage::error(format!("not joined to room {room_id}")));
        }
        self.registry.leave(room_id, &self.client_id).await;
        self.joined = None;
        None
    }

    fn member_of(&self, room_id: &str) -> Option<Arc<RoomHandle>> {
        self.joined
            .as_ref()
            .filter(|j| j.room.room_id() == room_id)
            .map(|j| Arc::clone(&j.room))
    }

    /// Next room event addressed to this client. Pends forever while the
    /// connection is not in a room.
    pub async fn next_event(&mut self) -> Option<ServerMessage> {
        let client_id = self.client_id;
        let Some(joined) = self.joined.as_mut() else {
            return std::future::pending().await;
        };

        loop {
            match joined.events.recv().await {
                Ok(_) if joined.lagged => continue,
                Ok(event) => {
                    if let Some(msg) = translate(&event, client_id, joined.room.room_id()) {
                        return Some(msg);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    joined.room.events().record_lag(missed);
                    if joined.lagged {
                        continue;
                    }
                    joined.lagged = true;
                    log::warn!(
                        "Client {client_id} lagged by {missed} events in room {}",
                        joined.room.room_id()
                    );
                    return Some(ServerMessage::ResyncRequired {
                        room_id: joined.room.room_id().to_string(),
                    });
                }
                Err(RecvError::Closed) => {
                    self.joined = None;
                    return None;
                }
            }
        }
    }

    /// Leave the current room, if any.
    pub async fn close(&mut self) {
        if let Some(joined) = self.joined.take() {
            self.registry.leave(joined.room.room_id(), &self.client_id).await;
        }
    }
}

/// What `client_id` should see of a room event, if anything.
fn translate(event: &RoomEvent, client_id: ClientId, room_id: &str) -> Option<ServerMessage> {
    let room_id: RoomId = room_id.to_string();
    match event {
        RoomEvent::Committed {
            origin,
            operation,
            version,
        } if *origin == client_id => Some(ServerMessage::Ack {
            room_id,
            base_version: operation.base_version(),
            version: *version,
        }),
        RoomEvent::Committed { operation, version, .. } => Some(ServerMessage::Broadcast {
            room_id,
            operation: operation.clone(),
            version: *version,
        }),
        RoomEvent::Cursor { client_id: owner, .. } | RoomEvent::CursorRemoved { client_id: owner }
            if *owner == client_id =>
        {
            None
        }
        RoomEvent::Cursor {
            client_id: owner,
            display_name,
            color,
            position,
            version,
        } => Some(ServerMessage::Cursor {
            room_id,
            client_id: *owner,
            display_name: display_name.clone(),
            color: color.clone(),
            position: *position,
            version: *version,
        }),
        RoomEvent::CursorRemoved { client_id: owner } => Some(ServerMessage::CursorRemoved {
            room_id,
            client_id: *owner,
        }),
        RoomEvent::UsersUpdated { display_names } => Some(ServerMessage::UsersUpdated {
            room_id,
            display_names: display_names.clone(),
        }),
    }
}
