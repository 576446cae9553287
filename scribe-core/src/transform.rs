//! Transform engine: rebases concurrent operations so every replica
//! converges.
//!
//! For `a` and `b` authored against the same document `S`,
//! `transform(a, b)` returns `(a', b')` with
//!
//! ```text
//!            a
//!      S ─────────► S·a
//!      │             │
//!    b │             │ b'
//!      ▼             ▼
//!     S·b ────────► S·a·b' == S·b·a'
//!            a'
//! ```
//!
//! Conflict rules:
//! - an insert on one side becomes a retain over the inserted text on the other;
//! - when both sides delete the same characters neither transformed side
//!   deletes them again;
//! - two inserts at the same position are ordered by origin when both were
//!   authored against the same version, otherwise by client id, smaller first;
//! - a delete beats a concurrent formatting retain;
//! - on a formatting conflict `a` (the later commit when used by the room
//!   authority) wins per attribute.

use crate::attributes::Attributes;
use crate::error::{OtError, Result};
use crate::operation::{ClientId, Operation, Origin, Step, StepCursor, Steps};

/// Whether an insert from `ours` goes before one from `theirs` when both sit
/// at the same offset.
///
/// Origins from the same version are positions in the same document, so a
/// smaller offset keeps its place even after the text between the two gaps
/// has been deleted.
fn goes_first(ours: (Origin, ClientId), theirs: (Origin, ClientId)) -> bool {
    let ((ours, our_client), (theirs, their_client)) = (ours, theirs);
    if ours.version == theirs.version && ours.offset != theirs.offset {
        ours.offset < theirs.offset
    } else {
        our_client <= their_client
    }
}

/// Transform two concurrent operations against each other.
pub fn transform(a: &Operation, b: &Operation) -> Result<(Operation, Operation)> {
    if a.base_length() != b.base_length() {
        return Err(OtError::length(b.base_length(), a.base_length()));
    }

    let mut a_prime = Steps::default();
    let mut b_prime = Steps::default();
    let mut left = StepCursor::new(a.steps());
    let mut right = StepCursor::new(b.steps());
    // Base characters consumed so far; the same on both sides.
    let mut offset = 0usize;

    let origin_of = |op: &Operation, step: &Step, offset: usize| {
        step.origin().unwrap_or(Origin {
            version: op.base_version(),
            offset,
        })
    };

    loop {
        match (left.peek(), right.peek()) {
            (None, None) => break,
            (Some(ours @ Step::Insert { .. }), Some(theirs @ Step::Insert { .. }))
                if !goes_first(
                    (origin_of(a, ours, offset), a.client_id()),
                    (origin_of(b, theirs, offset), b.client_id()),
                ) =>
            {
                let origin = origin_of(b, theirs, offset);
                let n = right.peek_len();
                a_prime.retain(n, Attributes::new());
                if let Some(step) = right.take(usize::MAX) {
                    b_prime.push(step.anchored(origin));
                }
            }
            (Some(ours @ Step::Insert { .. }), _) => {
                let origin = origin_of(a, ours, offset);
                let n = left.peek_len();
                b_prime.retain(n, Attributes::new());
                if let Some(step) = left.take(usize::MAX) {
                    a_prime.push(step.anchored(origin));
                }
            }
            (_, Some(theirs @ Step::Insert { .. })) => {
                let origin = origin_of(b, theirs, offset);
                let n = right.peek_len();
                a_prime.retain(n, Attributes::new());
                if let Some(step) = right.take(usize::MAX) {
                    b_prime.push(step.anchored(origin));
                }
            }
            (None, _) | (_, None) => {
                return Err(OtError::malformed("transform ran off the end of an operation"));
            }
            _ => {
                let n = left.peek_len().min(right.peek_len());
                offset += n;
                match (left.take(n), right.take(n)) {
                    (
                        Some(Step::Retain { attributes: ours, .. }),
                        Some(Step::Retain { attributes: theirs, .. }),
                    ) => {
                        b_prime.retain(n, theirs.yield_to(&ours));
                        a_prime.retain(n, ours);
                    }
                    // Already gone on both sides.
                    (Some(Step::Delete(_)), Some(Step::Delete(_))) => {}
                    (Some(Step::Delete(_)), Some(Step::Retain { .. })) => a_prime.delete(n),
                    (Some(Step::Retain { .. }), Some(Step::Delete(_))) => b_prime.delete(n),
                    _ => return Err(OtError::malformed("transform lost step alignment")),
                }
            }
        }
    }

    let a_prime = Operation::from_steps(
        a.room_id().to_string(),
        a.client_id(),
        b.base_version() + 1,
        a_prime,
    );
    let b_prime = Operation::from_steps(
        b.room_id().to_string(),
        b.client_id(),
        a.base_version() + 1,
        b_prime,
    );
    Ok((a_prime, b_prime))
}

/// Rebase `op` over `committed`, applied in commit order.
pub fn rebase<'a, I>(op: Operation, committed: I) -> Result<Operation>
where
    I: IntoIterator<Item = &'a Operation>,
{
    let mut current = op;
    let mut hops = 0usize;
    for other in committed {
        let (rebased, _) = transform(&current, other)?;
        current = rebased;
        hops += 1;
    }
    if hops > 0 {
        log::debug!(
            "Rebased operation from {} over {hops} commits to version {}",
            current.client_id(),
            current.base_version()
        );
    }
    Ok(current)
}

/// Move a document offset through `op`.
///
/// Inserts before the offset push it right. An insert exactly at the offset
/// pushes it only when `owner` authored the operation, so a client's caret
/// follows its own typing but stays put for others. Offsets inside a deleted
/// range collapse to the start of the range.
pub fn transform_index(index: usize, op: &Operation, owner: ClientId) -> usize {
    let mut moved = index;
    let mut base = 0usize;
    for step in op.steps() {
        if base > index {
            break;
        }
        match step {
            Step::Retain { len, .. } => base += len,
            Step::Insert { .. } => {
                if base < index || op.client_id() == owner {
                    moved += step.len();
                }
            }
            Step::Delete(len) => {
                moved -= (*len).min(index - base);
                base += len;
            }
        }
    }
    moved
}

/// Move an offset in the document after `op` back to the document before
/// it. Offsets inside text `op` inserted collapse to the insertion point.
pub fn untransform_index(index: usize, op: &Operation) -> usize {
    let mut before = 0usize;
    let mut after = 0usize;
    for step in op.steps() {
        if after >= index {
            break;
        }
        match step {
            Step::Retain { len, .. } => {
                let n = (*len).min(index - after);
                before += n;
                after += n;
            }
            Step::Insert { .. } => after += step.len().min(index - after),
            Step::Delete(len) => before += len,
        }
    }
    before
}
