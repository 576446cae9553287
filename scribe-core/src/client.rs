//! Client-side replica and its synchronisation state machine.
//!
//! ```text
//!                 apply_local                 apply_local
//!  Synchronized ─────────────► AwaitingAck ──────────────► AwaitingWithBuffer
//!       ▲                          │  ▲                            │
//!       └──────── acknowledge ─────┘  └──────── acknowledge ───────┘
//! ```
//!
//! At most one operation is in flight. Edits made while waiting are composed
//! into a buffer that is sent once the in-flight operation is acknowledged.
//! Remote commits are transformed against both before being applied locally.

use crate::content::Content;
use crate::error::{OtError, Result};
use crate::operation::{compose, ClientId, Operation, OperationBuilder, RoomId};
use crate::transform::{transform, transform_index, untransform_index};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Synchronized,
    AwaitingAck {
        pending: Operation,
    },
    AwaitingWithBuffer {
        pending: Operation,
        buffer: Operation,
    },
}

/// A client's local copy of a room document.
#[derive(Debug, Clone)]
pub struct ClientDocument {
    room_id: RoomId,
    client_id: ClientId,
    content: Content,
    version: u64,
    state: SyncState,
}

impl ClientDocument {
    /// Start from a join snapshot.
    pub fn new(room_id: impl Into<RoomId>, client_id: ClientId, content: Content, version: u64) -> Self {
        Self {
            room_id: room_id.into(),
            client_id,
            content,
            version,
            state: SyncState::Synchronized,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Local content, including unacknowledged edits.
    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn text(&self) -> String {
        self.content.text()
    }

    /// Last server version this replica has seen.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn has_pending(&self) -> bool {
        !matches!(self.state, SyncState::Synchronized)
    }

    /// Builder for an edit against the current local content.
    pub fn edit(&self) -> OperationBuilder {
        Operation::builder(self.room_id.clone(), self.client_id, self.version)
    }

    /// Apply a local edit. Returns the operation to submit when nothing else
    /// is in flight.
    pub fn apply_local(&mut self, op: Operation) -> Result<Option<Operation>> {
        let next = self.content.apply(&op)?;
        let (state, outgoing) = match &self.state {
            SyncState::Synchronized => {
                let op = op.rebased_to(self.version);
                (SyncState::AwaitingAck { pending: op.clone() }, Some(op))
            }
            SyncState::AwaitingAck { pending } => (
                SyncState::AwaitingWithBuffer {
                    pending: pending.clone(),
                    buffer: op,
                },
                None,
            ),
            SyncState::AwaitingWithBuffer { pending, buffer } => (
                SyncState::AwaitingWithBuffer {
                    pending: pending.clone(),
                    buffer: compose(buffer, &op)?,
                },
                None,
            ),
        };
        self.content = next;
        self.state = state;
        Ok(outgoing)
    }

    /// Apply a foreign commit that the server broadcast at `version`.
    ///
    /// Returns the operation as applied to the local content, which callers
    /// use to move local carets.
    pub fn apply_remote(&mut self, op: &Operation, version: u64) -> Result<Operation> {
        if version != self.version + 1 {
            return Err(OtError::OutOfOrderOperation {
                expected: self.version + 1,
                actual: version,
            });
        }
        let (state, local) = match &self.state {
            SyncState::Synchronized => (SyncState::Synchronized, op.clone()),
            SyncState::AwaitingAck { pending } => {
                let (pending, local) = transform(pending, op)?;
                (SyncState::AwaitingAck { pending }, local)
            }
            SyncState::AwaitingWithBuffer { pending, buffer } => {
                let (pending, through_pending) = transform(pending, op)?;
                let (buffer, local) = transform(buffer, &through_pending)?;
                (SyncState::AwaitingWithBuffer { pending, buffer }, local)
            }
        };
        self.content = self.content.apply(&local)?;
        self.state = state;
        self.version = version;
        Ok(local)
    }

    /// The in-flight operation was committed at `version`. Returns the
    /// buffered operation to submit next, if any.
    pub fn acknowledge(&mut self, version: u64) -> Result<Option<Operation>> {
        if version != self.version + 1 {
            return Err(OtError::OutOfOrderOperation {
                expected: self.version + 1,
                actual: version,
            });
        }
        let (state, outgoing) = match &self.state {
            SyncState::Synchronized => {
                return Err(OtError::malformed("acknowledgement without an operation in flight"));
            }
            SyncState::AwaitingAck { .. } => (SyncState::Synchronized, None),
            SyncState::AwaitingWithBuffer { buffer, .. } => {
                let next = buffer.clone().rebased_to(version);
                (SyncState::AwaitingAck { pending: next.clone() }, Some(next))
            }
        };
        self.state = state;
        self.version = version;
        Ok(outgoing)
    }

    /// Move a local caret through an operation returned by
    /// [`apply_remote`](Self::apply_remote).
    pub fn transform_cursor(&self, index: usize, applied: &Operation) -> usize {
        transform_index(index, applied, self.client_id)
    }

    /// Map a local offset to the document at [`version`](Self::version) by
    /// undoing the edits still in flight. Cursors reported to the server are
    /// stated against that version.
    pub fn server_index(&self, index: usize) -> usize {
        match &self.state {
            SyncState::Synchronized => index,
            SyncState::AwaitingAck { pending } => untransform_index(index, pending),
            SyncState::AwaitingWithBuffer { pending, buffer } => {
                untransform_index(untransform_index(index, buffer), pending)
            }
        }
    }

    /// Replace everything with a fresh snapshot, discarding unsent edits.
    pub fn resync(&mut self, content: Content, version: u64) {
        if self.has_pending() {
            log::warn!("Discarding unacknowledged edits in room {} on resync", self.room_id);
        }
        self.content = content;
        self.version = version;
        self.state = SyncState::Synchronized;
    }
}
