//! # scribe-collab: Rooms, presence and transport for collaborative editing
//!
//! Hosts one authoritative [`scribe_core::DocumentState`] per room and keeps
//! every connected client in step with it over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │  bincode / JSON     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │ Connection (per socket)
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌─────────────┐
//! │ClientDocument│                    │RoomRegistry │
//! │ (replica)    │                    └──────┬──────┘
//! └──────────────┘                           │ RoomHandle (per room)
//!                                    ┌───────┴───────┐
//!                                    │ RoomSession   │── RoomPresence
//!                                    │ BroadcastGroup│
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Typed client/server messages and their encodings
//! - [`session`]: Per-room authority: document, members, presence
//! - [`presence`]: Cursor table, colours, stale-entry sweep
//! - [`broadcast`]: Per-room ordered event fan-out
//! - [`registry`]: Room lifecycle and the presence sweeper
//! - [`handler`]: Transport-independent message dispatch
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client
//! - [`config`]: Server configuration

pub mod broadcast;
pub mod client;
pub mod config;
pub mod handler;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomEvent};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use config::{ConfigError, ServerConfig};
pub use handler::Connection;
pub use presence::{CursorPosition, PresenceEntry, RoomPresence, UserColor, PALETTE};
pub use protocol::{ClientMessage, Codec, ProtocolError, RejectReason, ServerMessage};
pub use registry::{Membership, RegistryStats, RoomHandle, RoomRegistry};
pub use server::{ServerStats, SyncServer};
pub use session::{ClientInfo, Commit, JoinSnapshot, RoomSession, SessionError};
