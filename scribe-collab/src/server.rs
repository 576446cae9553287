//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Connection ── RoomRegistry ── RoomHandle(room_id)
//! Client B ──┘                                   │
//!                                                ├── RoomSession (DocumentState,
//!                                                │     members, presence)
//!                                                └── BroadcastGroup
//!                                                       │
//!                                          ┌────────────┼────────────┐
//!                                          ▼            ▼            ▼
//!                                       Client A     Client B     Client C
//! ```
//!
//! Each socket runs one task that multiplexes incoming frames and the room's
//! event stream with `tokio::select!`. A background sweeper drops stale
//! cursors.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::config::ServerConfig;
use crate::handler::Connection;
use crate::protocol::{ClientMessage, Codec, ProtocolError, ServerMessage};
use crate::registry::RoomRegistry;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub commits: u64,
    pub rejections: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new(config.clone())),
            config,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        self.config.validate()?;
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve WebSocket connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let sweeper = self.registry.spawn_sweeper();

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let registry = Arc::clone(&self.registry);
            let stats = Arc::clone(&self.stats);

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        sweeper.abort();
        result
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let mut conn = Connection::new(registry);
        log::info!("WebSocket connection established from {addr} as {}", conn.client_id());

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut codec = Codec::default();

        let result = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        let decoded = match msg {
                            Some(Ok(Message::Binary(data))) => {
                                codec = Codec::Binary;
                                record_message(&stats, data.len()).await;
                                ClientMessage::decode(&data)
                            }
                            Some(Ok(Message::Text(text))) => {
                                codec = Codec::Json;
                                record_message(&stats, text.len()).await;
                                ClientMessage::from_json(text.as_str())
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };

                        let replies = match decoded {
                            Ok(msg) => conn.handle(msg).await,
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                                vec![ServerMessage::error(e.to_string())]
                            }
                        };
                        for reply in &replies {
                            ws_sender.send(frame(reply, codec)?).await?;
                        }
                    }

                    // Outgoing room event
                    event = conn.next_event() => {
                        if let Some(msg) = event {
                            ws_sender.send(frame(&msg, codec)?).await?;
                        }
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        conn.close().await;

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        result
    }

    /// Server statistics, including room counters.
    pub async fn stats(&self) -> ServerStats {
        let registry = self.registry.stats().await;
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = registry.rooms;
        stats.commits = registry.commits;
        stats.rejections = registry.rejections;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}

async fn record_message(stats: &RwLock<ServerStats>, len: usize) {
    let mut s = stats.write().await;
    s.total_messages += 1;
    s.total_bytes += len as u64;
}

/// Encode `msg` as a frame in the connection's current encoding.
fn frame(msg: &ServerMessage, codec: Codec) -> Result<Message, ProtocolError> {
    Ok(match codec {
        Codec::Binary => Message::Binary(msg.encode()?.into()),
        Codec::Json => Message::Text(msg.to_json()?.into()),
    })
}
