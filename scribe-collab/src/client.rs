//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, join, leave)
//! - A local replica kept in step with the room through [`ClientDocument`]
//! - Cursor updates and remote cursor events
//! - Automatic rejoin when the server asks for a resync
//!
//! Edits are applied locally at once. At most one operation is in flight;
//! later edits are composed into a buffer and sent when the server acks.

use std::ops::Range;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use scribe_core::{Attributes, ClientDocument, ClientId, Operation, RoomId};

use crate::presence::{CursorPosition, UserColor};
use crate::protocol::{ClientMessage, Codec, ProtocolError, RejectReason, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Snapshot received, either on first join or after a resync
    Joined {
        client_id: ClientId,
        version: u64,
        users: Vec<String>,
    },
    /// A foreign edit was applied locally, as `operation`
    RemoteEdit { operation: Operation, version: u64 },
    /// Our in-flight edit was committed at `version`
    Acknowledged { version: u64 },
    CursorMoved {
        client_id: ClientId,
        display_name: String,
        color: UserColor,
        position: CursorPosition,
    },
    CursorRemoved(ClientId),
    UsersUpdated(Vec<String>),
    /// The local replica is being replaced by a fresh snapshot
    Resyncing,
    Rejected { reason: RejectReason, message: String },
    Error(String),
    Pong,
}

type SharedDocument = Arc<Mutex<Option<ClientDocument>>>;

/// The sync client.
///
/// Manages a WebSocket connection to the collaboration server and a local
/// replica of one room's document.
pub struct SyncClient {
    display_name: String,
    room_id: RoomId,
    server_url: String,
    codec: Codec,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Local replica, present once joined
    document: SharedDocument,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<ClientMessage>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// Create a new sync client for `room_id`.
    pub fn new(
        display_name: impl Into<String>,
        room_id: impl Into<RoomId>,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            display_name: display_name.into(),
            room_id: room_id.into(),
            server_url: server_url.into(),
            codec: Codec::Binary,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            document: Arc::new(Mutex::new(None)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Speak JSON text frames instead of bincode binary frames.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and join the room.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(256);
        let codec = self.codec;
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let frame = match encode(&msg, codec) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::error!("Failed to encode {msg:?}: {e}");
                        continue;
                    }
                };
                if ws_writer.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let join = ClientMessage::Join {
            room_id: self.room_id.clone(),
            display_name: self.display_name.clone(),
        };
        out_tx.send(join.clone()).await.map_err(|_| ProtocolError::ConnectionClosed)?;
        self.outgoing_tx = Some(out_tx.clone());

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = Arc::clone(&self.state);
        let document = Arc::clone(&self.document);
        tokio::spawn(async move {
            let link = Link {
                document,
                out_tx,
                event_tx: event_tx.clone(),
                join,
            };
            while let Some(msg) = ws_reader.next().await {
                let decoded = match msg {
                    Ok(Message::Binary(data)) => ServerMessage::decode(&data),
                    Ok(Message::Text(text)) => ServerMessage::from_json(text.as_str()),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match decoded {
                    Ok(msg) => link.dispatch(msg).await,
                    Err(e) => log::warn!("Failed to decode server message: {e}"),
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Apply a local edit and send it when nothing else is in flight.
    pub async fn submit(&self, op: Operation) -> Result<(), ProtocolError> {
        let mut document = self.document.lock().await;
        let doc = document.as_mut().ok_or(ProtocolError::NotJoined)?;
        if let Some(outgoing) = doc.apply_local(op)? {
            self.send(ClientMessage::Submit { operation: outgoing }).await?;
        }
        Ok(())
    }

    /// Build an edit against the current replica, then [`submit`](Self::submit) it.
    pub async fn edit<F>(&self, build: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(&ClientDocument) -> scribe_core::Result<Operation>,
    {
        let mut document = self.document.lock().await;
        let doc = document.as_mut().ok_or(ProtocolError::NotJoined)?;
        let op = build(doc)?;
        if let Some(outgoing) = doc.apply_local(op)? {
            self.send(ClientMessage::Submit { operation: outgoing }).await?;
        }
        Ok(())
    }

    pub async fn insert(&self, position: usize, text: &str) -> Result<(), ProtocolError> {
        self.edit(|doc| {
            Operation::insert_at(
                doc.room_id(),
                doc.client_id(),
                doc.version(),
                doc.content().len(),
                position,
                text,
            )
        })
        .await
    }

    pub async fn delete(&self, range: Range<usize>) -> Result<(), ProtocolError> {
        self.edit(|doc| {
            Operation::delete_range(doc.room_id(), doc.client_id(), doc.version(), doc.content().len(), range)
        })
        .await
    }

    pub async fn format(&self, range: Range<usize>, attributes: Attributes) -> Result<(), ProtocolError> {
        self.edit(|doc| {
            Operation::format_range(
                doc.room_id(),
                doc.client_id(),
                doc.version(),
                doc.content().len(),
                range,
                attributes,
            )
        })
        .await
    }

    /// Report our caret or selection, given in local offsets.
    ///
    /// The position is mapped back past edits still waiting for an ack and
    /// stated against the last server version; the server moves it through
    /// those edits once they commit.
    pub async fn send_cursor(&self, position: CursorPosition) -> Result<(), ProtocolError> {
        let (position, version) = {
            let document = self.document.lock().await;
            let doc = document.as_ref().ok_or(ProtocolError::NotJoined)?;
            let position = CursorPosition::selection(doc.server_index(position.anchor), doc.server_index(position.head));
            (position, doc.version())
        };
        self.send(ClientMessage::CursorUpdate {
            room_id: self.room_id.clone(),
            position,
            version,
        })
        .await
    }

    /// Leave the room; the connection stays open.
    pub async fn leave(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Leave {
            room_id: self.room_id.clone(),
        })
        .await?;
        *self.document.lock().await = None;
        Ok(())
    }

    /// Send a ping.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Ping).await
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(msg).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Local text, including edits not yet acknowledged.
    pub async fn text(&self) -> Option<String> {
        self.document.lock().await.as_ref().map(ClientDocument::text)
    }

    /// Last server version the replica has seen.
    pub async fn version(&self) -> Option<u64> {
        self.document.lock().await.as_ref().map(ClientDocument::version)
    }

    /// Whether an edit is still waiting for its ack.
    pub async fn has_pending(&self) -> bool {
        self.document.lock().await.as_ref().is_some_and(ClientDocument::has_pending)
    }

    /// Client id assigned by the server, once joined.
    pub async fn client_id(&self) -> Option<ClientId> {
        self.document.lock().await.as_ref().map(ClientDocument::client_id)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

/// Reader-side state shared with the writer channel.
struct Link {
    document: SharedDocument,
    out_tx: mpsc::Sender<ClientMessage>,
    event_tx: mpsc::Sender<SyncEvent>,
    join: ClientMessage,
}

impl Link {
    async fn dispatch(&self, msg: ServerMessage) {
        let event = match msg {
            ServerMessage::Joined {
                room_id,
                client_id,
                content,
                version,
                users,
            } => {
                let mut document = self.document.lock().await;
                let doc = match document.take() {
                    Some(mut doc) if doc.client_id() == client_id => {
                        doc.resync(content, version);
                        doc
                    }
                    _ => ClientDocument::new(room_id, client_id, content, version),
                };
                *document = Some(doc);
                Some(SyncEvent::Joined {
                    client_id,
                    version,
                    users,
                })
            }

            ServerMessage::Ack { version, .. } => {
                let mut document = self.document.lock().await;
                let Some(doc) = document.as_mut() else {
                    return;
                };
                match doc.acknowledge(version) {
                    Ok(next) => {
                        if let Some(operation) = next {
                            let _ = self.out_tx.send(ClientMessage::Submit { operation }).await;
                        }
                        Some(SyncEvent::Acknowledged { version })
                    }
                    Err(e) => {
                        log::warn!("Unexpected ack for version {version}: {e}");
                        drop(document);
                        self.rejoin().await;
                        Some(SyncEvent::Resyncing)
                    }
                }
            }

            ServerMessage::Broadcast { operation, version, .. } => {
                let mut document = self.document.lock().await;
                let Some(doc) = document.as_mut() else {
                    return;
                };
                match doc.apply_remote(&operation, version) {
                    Ok(applied) => Some(SyncEvent::RemoteEdit {
                        operation: applied,
                        version,
                    }),
                    Err(e) => {
                        log::warn!("Cannot apply remote edit at version {version}: {e}");
                        drop(document);
                        self.rejoin().await;
                        Some(SyncEvent::Resyncing)
                    }
                }
            }

            ServerMessage::Reject { reason, message, .. } => {
                log::warn!("Server rejected request ({reason:?}): {message}");
                // A refused in-flight edit will never be acked; only a fresh
                // snapshot brings the replica back in line.
                let in_flight = self.document.lock().await.as_ref().is_some_and(ClientDocument::has_pending);
                if reason.requires_resync() || in_flight {
                    self.rejoin().await;
                }
                Some(SyncEvent::Rejected { reason, message })
            }

            ServerMessage::ResyncRequired { room_id } => {
                log::warn!("Server requested resync of room {room_id}");
                self.rejoin().await;
                Some(SyncEvent::Resyncing)
            }

            ServerMessage::Cursor {
                client_id,
                display_name,
                color,
                position,
                ..
            } => Some(SyncEvent::CursorMoved {
                client_id,
                display_name,
                color,
                position,
            }),
            ServerMessage::CursorRemoved { client_id, .. } => Some(SyncEvent::CursorRemoved(client_id)),
            ServerMessage::UsersUpdated { display_names, .. } => Some(SyncEvent::UsersUpdated(display_names)),
            ServerMessage::Error { message } => {
                log::warn!("Server error: {message}");
                Some(SyncEvent::Error(message))
            }
            ServerMessage::Pong => Some(SyncEvent::Pong),
        };

        if let Some(event) = event {
            let _ = self.event_tx.send(event).await;
        }
    }

    async fn rejoin(&self) {
        let _ = self.out_tx.send(self.join.clone()).await;
    }
}

fn encode(msg: &ClientMessage, codec: Codec) -> Result<Message, ProtocolError> {
    Ok(match codec {
        Codec::Binary => Message::Binary(msg.encode()?.into()),
        Codec::Json => Message::Text(msg.to_json()?.into()),
    })
}
