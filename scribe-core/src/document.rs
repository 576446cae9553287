//! Authoritative per-room document state: content, version and a bounded
//! history of committed operations.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::content::Content;
use crate::error::{Mismatch, OtError, Result};
use crate::operation::Operation;
use crate::transform;

/// Default number of committed operations kept for rebasing late arrivals.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

/// Bounded log of the most recent committed operations.
///
/// Entries are contiguous: the last entry was committed at the current
/// version, the first at `current - len`.
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<Operation>,
    limit: usize,
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit.min(1024)),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Base version of the oldest retained operation.
    pub fn oldest_version(&self) -> Option<u64> {
        self.entries.front().map(Operation::base_version)
    }

    fn push(&mut self, op: Operation) {
        self.entries.push_back(op);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    /// Operations committed at or after `base_version`, in commit order.
    ///
    /// `current` is the version the history ends at.
    pub fn since(
        &self,
        base_version: u64,
        current: u64,
    ) -> Result<impl Iterator<Item = &Operation> + '_> {
        if base_version > current {
            return Err(OtError::VersionMismatch(Mismatch::Future { base_version, current }));
        }
        let oldest = current - self.entries.len() as u64;
        if base_version < oldest {
            return Err(OtError::VersionMismatch(Mismatch::Truncated { base_version, oldest }));
        }
        Ok(self.entries.iter().skip((base_version - oldest) as usize))
    }
}

/// Content plus version, as handed to a joining client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub content: Arc<Content>,
    pub version: u64,
}

/// The authoritative document of one room.
#[derive(Debug, Clone)]
pub struct DocumentState {
    content: Arc<Content>,
    version: u64,
    history: History,
}

impl DocumentState {
    /// Empty document at version 0.
    pub fn new(history_limit: usize) -> Self {
        Self::with_content(Content::new(), history_limit)
    }

    /// Seed content at version 0.
    pub fn with_content(content: Content, history_limit: usize) -> Self {
        Self {
            content: Arc::new(content),
            version: 0,
            history: History::new(history_limit),
        }
    }

    pub fn content(&self) -> &Arc<Content> {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            content: Arc::clone(&self.content),
            version: self.version,
        }
    }

    /// Commit `op`, which must be based on the current version.
    ///
    /// The new content is built in full before it replaces the old one, so
    /// a failing operation leaves the state exactly as it was.
    pub fn apply(&mut self, op: Operation) -> Result<u64> {
        if op.base_version() != self.version {
            return Err(OtError::OutOfOrderOperation {
                expected: self.version,
                actual: op.base_version(),
            });
        }
        let next = self.content.apply(&op)?;
        self.content = Arc::new(next);
        self.history.push(op);
        self.version += 1;
        Ok(self.version)
    }

    /// Transform `op` forward over everything committed since its base
    /// version.
    pub fn rebase(&self, op: Operation) -> Result<Operation> {
        if op.base_version() == self.version {
            return Ok(op);
        }
        let committed = self.history.since(op.base_version(), self.version)?;
        transform::rebase(op, committed)
    }

    /// Rebase then apply; returns the committed operation and new version.
    pub fn commit(&mut self, op: Operation) -> Result<(Operation, u64)> {
        let rebased = self.rebase(op)?;
        let version = self.apply(rebased.clone())?;
        Ok((rebased, version))
    }
}

impl Default for DocumentState {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::ClientId;
    use uuid::Uuid;

    fn alice() -> ClientId {
        Uuid::from_u128(0xA)
    }

    fn bob() -> ClientId {
        Uuid::from_u128(0xB)
    }

    #[test]
    fn test_apply_increments_version() {
        let mut doc = DocumentState::with_content(Content::from("Hello"), 16);
        let op = Operation::insert_at("r", alice(), 0, 5, 5, "!").unwrap();
        assert_eq!(doc.apply(op).unwrap(), 1);
        assert_eq!(doc.version(), 1);
        assert_eq!(doc.content().text(), "Hello!");
        assert_eq!(doc.history().len(), 1);
    }

    #[test]
    fn test_apply_out_of_order() {
        let mut doc = DocumentState::with_content(Content::from("Hello"), 16);
        let op = Operation::insert_at("r", alice(), 3, 5, 0, "x").unwrap();
        let err = doc.apply(op).unwrap_err();
        assert_eq!(err, OtError::OutOfOrderOperation { expected: 0, actual: 3 });
        assert_eq!(doc.version(), 0);
        assert_eq!(doc.content().text(), "Hello");
    }

    #[test]
    fn test_failed_apply_leaves_state() {
        let mut doc = DocumentState::with_content(Content::from("abc"), 16);
        let before = doc.snapshot();
        let op = Operation::builder("r", alice(), 0).retain(7).build();
        assert!(doc.apply(op).is_err());
        assert_eq!(doc.snapshot(), before);
        assert!(doc.history().is_empty());
    }

    #[test]
    fn test_commit_rebases_stale_operation() {
        let mut doc = DocumentState::with_content(Content::from("Hello"), 16);
        let a = Operation::insert_at("r", alice(), 0, 5, 0, "X").unwrap();
        let b = Operation::insert_at("r", bob(), 0, 5, 5, "Y").unwrap();

        doc.commit(a).unwrap();
        let (committed, version) = doc.commit(b).unwrap();
        assert_eq!(version, 2);
        assert_eq!(committed.base_version(), 1);
        assert_eq!(doc.content().text(), "XHelloY");
    }

    #[test]
    fn test_mixed_edits_commit_in_any_order() {
        let carol = Uuid::from_u128(0xC);
        let ops = [
            Operation::insert_at("r", bob(), 0, 3, 1, "x").unwrap(),
            Operation::delete_range("r", carol, 0, 3, 1..2).unwrap(),
            Operation::insert_at("r", alice(), 0, 3, 2, "y").unwrap(),
        ];
        for order in [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]] {
            let mut doc = DocumentState::with_content(Content::from("abc"), 16);
            for i in order {
                doc.commit(ops[i].clone()).unwrap();
            }
            assert_eq!(doc.content().text(), "axyc", "order {order:?}");
            assert_eq!(doc.version(), 3);
        }
    }

    #[test]
    fn test_history_eviction_and_truncation() {
        let mut doc = DocumentState::with_content(Content::from(""), 2);
        for i in 0..4u64 {
            let op = Operation::insert_at("r", alice(), i, i as usize, i as usize, "a").unwrap();
            doc.apply(op).unwrap();
        }
        assert_eq!(doc.history().len(), 2);
        assert_eq!(doc.history().oldest_version(), Some(2));

        let stale = Operation::insert_at("r", bob(), 1, 1, 0, "z").unwrap();
        let err = doc.rebase(stale).unwrap_err();
        assert_eq!(
            err,
            OtError::VersionMismatch(Mismatch::Truncated { base_version: 1, oldest: 2 })
        );

        let recent = Operation::insert_at("r", bob(), 2, 2, 0, "z").unwrap();
        let rebased = doc.rebase(recent).unwrap();
        assert_eq!(rebased.base_version(), 4);
    }

    #[test]
    fn test_history_rejects_future_version() {
        let doc = DocumentState::with_content(Content::from("ab"), 8);
        let op = Operation::insert_at("r", alice(), 5, 2, 0, "z").unwrap();
        assert!(matches!(
            doc.rebase(op),
            Err(OtError::VersionMismatch(Mismatch::Future { base_version: 5, current: 0 }))
        ));
    }

    #[test]
    fn test_zero_history_limit() {
        let mut doc = DocumentState::with_content(Content::from("ab"), 0);
        doc.apply(Operation::insert_at("r", alice(), 0, 2, 0, "x").unwrap()).unwrap();
        assert!(doc.history().is_empty());
        let stale = Operation::insert_at("r", bob(), 0, 2, 0, "y").unwrap();
        assert!(doc.rebase(stale).unwrap_err().requires_resync());
    }
}
