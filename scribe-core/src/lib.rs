//! # scribe-core: Operational transformation for collaborative text
//!
//! Pure, synchronous building blocks shared by the room authority and its
//! clients. Nothing in this crate performs I/O.
//!
//! ## Modules
//!
//! - [`operation`]: Retain/Delete/Insert step lists, builder and `compose`
//! - [`transform`]: Pairwise transform, `rebase` and index transform
//! - [`content`]: Attributed segment storage the operations apply to
//! - [`document`]: Authoritative state: content, version, bounded history
//! - [`client`]: Client replica with a single in-flight operation
//!
//! ```text
//!  client ──Submit(op @ v)──► DocumentState::commit
//!                                 │ rebase over history since v
//!                                 │ apply, version += 1
//!                                 ▼
//!                         (op', v+1) ──► broadcast to peers
//! ```

pub mod attributes;
pub mod client;
pub mod content;
pub mod document;
pub mod error;
pub mod operation;
pub mod transform;

pub use attributes::Attributes;
pub use client::{ClientDocument, SyncState};
pub use content::{Content, Segment};
pub use document::{DocumentState, History, Snapshot, DEFAULT_HISTORY_LIMIT};
pub use error::{Mismatch, OtError, Result};
pub use operation::{compose, ClientId, OpKind, Operation, OperationBuilder, Origin, RoomId, Step};
pub use transform::{rebase, transform, transform_index, untransform_index};
