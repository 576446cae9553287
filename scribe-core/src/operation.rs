//! Operations: immutable, validated edit descriptions.
//!
//! An operation walks the whole document it was authored against. Retain and
//! delete steps consume base characters; insert steps produce new ones.
//! Lengths are counted in Unicode scalar values.
//!
//! ```text
//!  base:   H e l l o
//!  steps:  Retain(5) Insert("Y")        → "HelloY"
//!          Insert("X") Retain(5)        → "XHello"
//!          Retain(1) Delete(3) Retain(1) → "Ho"
//! ```
//!
//! Steps are kept canonical: empty steps are dropped, neighbouring steps of
//! the same shape merge, and an insert next to a delete is always placed
//! before it. Two operations with the same effect therefore compare equal.
//!
//! Inserts that have been rebased remember their [`Origin`], the gap in the
//! document they were first authored against. Concurrent inserts that end up
//! at the same offset are ordered by origin before client id, so a delete
//! between them cannot swap them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attributes::Attributes;
use crate::error::{OtError, Result};

/// Opaque room identifier supplied by the join UI.
pub type RoomId = String;

/// Stable identifier of a client session.
pub type ClientId = Uuid;

/// Where an insert was first authored: the gap at `offset` in the document
/// at `version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub version: u64,
    pub offset: usize,
}

/// A single primitive edit step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Retain {
        len: usize,
        #[serde(default)]
        attributes: Attributes,
    },
    Delete(usize),
    Insert {
        text: String,
        #[serde(default)]
        attributes: Attributes,
        /// Unset until the insert is first transformed; until then the
        /// operation's own base version and offset stand in for it.
        #[serde(default)]
        origin: Option<Origin>,
    },
}

impl Step {
    /// Length of the step: consumed characters for retain/delete, produced
    /// characters for insert.
    pub fn len(&self) -> usize {
        match self {
            Step::Retain { len, .. } => *len,
            Step::Delete(len) => *len,
            Step::Insert { text, .. } => text.chars().count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Step::Insert { .. })
    }

    /// Recorded origin of an insert.
    pub fn origin(&self) -> Option<Origin> {
        match self {
            Step::Insert { origin, .. } => *origin,
            _ => None,
        }
    }

    /// Record `origin` on an insert that has none yet.
    pub(crate) fn anchored(self, fallback: Origin) -> Step {
        match self {
            Step::Insert { text, attributes, origin } => Step::Insert {
                text,
                attributes,
                origin: Some(origin.unwrap_or(fallback)),
            },
            other => other,
        }
    }
}

/// Coarse classification of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Only retains (possibly carrying formatting).
    Retain,
    /// Inserts, no deletes.
    Insert,
    /// Deletes, no inserts.
    Delete,
    /// Inserts and deletes.
    Composite,
}

/// Canonicalising step accumulator shared by the builder, compose and
/// transform.
///
/// Lengths that would overflow `usize` are not recorded; the accumulator
/// remembers the overflow and [`Operation::new`] rejects it.
#[derive(Debug, Clone, Default)]
pub(crate) struct Steps {
    steps: Vec<Step>,
    base_length: usize,
    target_length: usize,
    overflowed: bool,
}

impl Steps {
    pub(crate) fn push(&mut self, step: Step) {
        match step {
            Step::Retain { len, attributes } => self.retain(len, attributes),
            Step::Delete(len) => self.delete(len),
            Step::Insert { text, attributes, origin } => self.insert_at_origin(text, attributes, origin),
        }
    }

    fn grow(&mut self, base: usize, target: usize) -> bool {
        match (
            self.base_length.checked_add(base),
            self.target_length.checked_add(target),
        ) {
            (Some(base_length), Some(target_length)) => {
                self.base_length = base_length;
                self.target_length = target_length;
                true
            }
            _ => {
                self.overflowed = true;
                false
            }
        }
    }

    pub(crate) fn retain(&mut self, len: usize, attributes: Attributes) {
        if len == 0 || !self.grow(len, len) {
            return;
        }
        if let Some(Step::Retain { len: last, attributes: prev }) = self.steps.last_mut() {
            if *prev == attributes {
                *last += len;
                return;
            }
        }
        self.steps.push(Step::Retain { len, attributes });
    }

    pub(crate) fn delete(&mut self, len: usize) {
        if len == 0 || !self.grow(len, 0) {
            return;
        }
        if let Some(Step::Delete(last)) = self.steps.last_mut() {
            *last += len;
            return;
        }
        self.steps.push(Step::Delete(len));
    }

    pub(crate) fn insert(&mut self, text: String, attributes: Attributes) {
        self.insert_at_origin(text, attributes, None);
    }

    pub(crate) fn insert_at_origin(&mut self, text: String, attributes: Attributes, origin: Option<Origin>) {
        if text.is_empty() || !self.grow(0, text.chars().count()) {
            return;
        }
        let attributes = attributes.normalized();

        // Inserts sort before a trailing delete so equivalent edits compare equal.
        let slot = match self.steps.last() {
            Some(Step::Delete(_)) => self.steps.len() - 1,
            _ => self.steps.len(),
        };
        if slot > 0 {
            if let Step::Insert {
                text: prev,
                attributes: prev_attrs,
                origin: prev_origin,
            } = &mut self.steps[slot - 1]
            {
                if *prev_attrs == attributes && *prev_origin == origin {
                    prev.push_str(&text);
                    return;
                }
            }
        }
        self.steps.insert(slot, Step::Insert { text, attributes, origin });
    }

    pub(crate) fn base_length(&self) -> usize {
        self.base_length
    }
}

/// Raw serialized shape; every decode goes back through [`Operation::new`].
#[derive(Serialize, Deserialize)]
struct RawOperation {
    room_id: RoomId,
    client_id: ClientId,
    base_version: u64,
    base_length: usize,
    steps: Vec<Step>,
}

/// An immutable, validated edit authored against `base_version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawOperation", into = "RawOperation")]
pub struct Operation {
    room_id: RoomId,
    client_id: ClientId,
    base_version: u64,
    base_length: usize,
    target_length: usize,
    steps: Vec<Step>,
}

impl TryFrom<RawOperation> for Operation {
    type Error = OtError;

    fn try_from(raw: RawOperation) -> Result<Self> {
        Operation::new(raw.room_id, raw.client_id, raw.base_version, raw.base_length, raw.steps)
    }
}

impl From<Operation> for RawOperation {
    fn from(op: Operation) -> Self {
        RawOperation {
            room_id: op.room_id,
            client_id: op.client_id,
            base_version: op.base_version,
            base_length: op.base_length,
            steps: op.steps,
        }
    }
}

impl Operation {
    /// Validate and canonicalise a step list.
    ///
    /// Fails with `MalformedOperation` when the retained and deleted lengths
    /// do not add up to `base_length`, or when any length sum overflows.
    pub fn new(
        room_id: impl Into<RoomId>,
        client_id: ClientId,
        base_version: u64,
        base_length: usize,
        steps: Vec<Step>,
    ) -> Result<Self> {
        let mut acc = Steps::default();
        for step in steps {
            acc.push(step);
        }
        if acc.overflowed {
            return Err(OtError::malformed("step lengths overflow"));
        }
        if acc.base_length() != base_length {
            return Err(OtError::malformed(format!(
                "steps consume {} characters but base length is {}",
                acc.base_length(),
                base_length
            )));
        }
        Ok(Self::from_steps(room_id.into(), client_id, base_version, acc))
    }

    pub(crate) fn from_steps(
        room_id: RoomId,
        client_id: ClientId,
        base_version: u64,
        steps: Steps,
    ) -> Self {
        Self {
            room_id,
            client_id,
            base_version,
            base_length: steps.base_length,
            target_length: steps.target_length,
            steps: steps.steps,
        }
    }

    /// Start building an operation step by step.
    pub fn builder(room_id: impl Into<RoomId>, client_id: ClientId, base_version: u64) -> OperationBuilder {
        OperationBuilder {
            room_id: room_id.into(),
            client_id,
            base_version,
            steps: Steps::default(),
        }
    }

    /// Insert `text` at `position` in a document of `base_length` characters.
    pub fn insert_at(
        room_id: impl Into<RoomId>,
        client_id: ClientId,
        base_version: u64,
        base_length: usize,
        position: usize,
        text: &str,
    ) -> Result<Self> {
        if position > base_length {
            return Err(OtError::malformed(format!(
                "insert position {position} is past the end of a {base_length} character document"
            )));
        }
        Self::builder(room_id, client_id, base_version)
            .retain(position)
            .insert(text)
            .build_for(base_length)
    }

    /// Delete the characters in `range`.
    pub fn delete_range(
        room_id: impl Into<RoomId>,
        client_id: ClientId,
        base_version: u64,
        base_length: usize,
        range: std::ops::Range<usize>,
    ) -> Result<Self> {
        check_range(&range, base_length)?;
        Self::builder(room_id, client_id, base_version)
            .retain(range.start)
            .delete(range.end - range.start)
            .build_for(base_length)
    }

    /// Apply `attributes` to the characters in `range`.
    pub fn format_range(
        room_id: impl Into<RoomId>,
        client_id: ClientId,
        base_version: u64,
        base_length: usize,
        range: std::ops::Range<usize>,
        attributes: Attributes,
    ) -> Result<Self> {
        check_range(&range, base_length)?;
        Self::builder(room_id, client_id, base_version)
            .retain(range.start)
            .retain_with(range.end - range.start, attributes)
            .build_for(base_length)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    /// Document length the operation expects.
    pub fn base_length(&self) -> usize {
        self.base_length
    }

    /// Document length after the operation.
    pub fn target_length(&self) -> usize {
        self.target_length
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn kind(&self) -> OpKind {
        let inserts = self.steps.iter().any(Step::is_insert);
        let deletes = self.steps.iter().any(|s| matches!(s, Step::Delete(_)));
        match (inserts, deletes) {
            (false, false) => OpKind::Retain,
            (true, false) => OpKind::Insert,
            (false, true) => OpKind::Delete,
            (true, true) => OpKind::Composite,
        }
    }

    /// True when applying the operation changes nothing.
    pub fn is_noop(&self) -> bool {
        self.steps.iter().all(|s| match s {
            Step::Retain { attributes, .. } => attributes.is_empty(),
            _ => false,
        })
    }

    /// Same edit, re-addressed to another base version. Recorded origins
    /// are dropped: the new base version and offsets stand in for them.
    pub(crate) fn rebased_to(self, base_version: u64) -> Self {
        let mut steps = Steps::default();
        for step in self.steps {
            match step {
                Step::Insert { text, attributes, .. } => steps.insert(text, attributes),
                other => steps.push(other),
            }
        }
        Self::from_steps(self.room_id, self.client_id, base_version, steps)
    }
}

fn check_range(range: &std::ops::Range<usize>, base_length: usize) -> Result<()> {
    if range.start > range.end || range.end > base_length {
        return Err(OtError::malformed(format!(
            "range {}..{} is outside a {base_length} character document",
            range.start, range.end
        )));
    }
    Ok(())
}

/// Fluent construction of an [`Operation`].
#[derive(Debug, Clone)]
pub struct OperationBuilder {
    room_id: RoomId,
    client_id: ClientId,
    base_version: u64,
    steps: Steps,
}

impl OperationBuilder {
    pub fn retain(mut self, len: usize) -> Self {
        self.steps.retain(len, Attributes::new());
        self
    }

    pub fn retain_with(mut self, len: usize, attributes: Attributes) -> Self {
        self.steps.retain(len, attributes);
        self
    }

    pub fn insert(mut self, text: impl Into<String>) -> Self {
        self.steps.insert(text.into(), Attributes::new());
        self
    }

    pub fn insert_with(mut self, text: impl Into<String>, attributes: Attributes) -> Self {
        self.steps.insert(text.into(), attributes);
        self
    }

    pub fn delete(mut self, len: usize) -> Self {
        self.steps.delete(len);
        self
    }

    /// Finish, taking the consumed length as the base length.
    pub fn build(self) -> Operation {
        Operation::from_steps(self.room_id, self.client_id, self.base_version, self.steps)
    }

    /// Finish against a document of `base_length` characters, retaining
    /// whatever the steps did not reach.
    pub fn build_for(mut self, base_length: usize) -> Result<Operation> {
        if self.steps.overflowed {
            return Err(OtError::malformed("step lengths overflow"));
        }
        let consumed = self.steps.base_length();
        if consumed > base_length {
            return Err(OtError::malformed(format!(
                "steps consume {consumed} characters but the document has {base_length}"
            )));
        }
        self.steps.retain(base_length - consumed, Attributes::new());
        Ok(self.build())
    }
}

/// Byte slice of `len` characters starting at character `start`.
pub(crate) fn char_slice(s: &str, start: usize, len: usize) -> &str {
    let mut offsets = s.char_indices().map(|(i, _)| i).chain(std::iter::once(s.len()));
    let from = offsets.nth(start).unwrap_or(s.len());
    let to = if len == 0 {
        from
    } else {
        offsets.nth(len - 1).unwrap_or(s.len())
    };
    &s[from..to]
}

/// Walks a step list handing out pieces of bounded length.
pub(crate) struct StepCursor<'a> {
    steps: &'a [Step],
    index: usize,
    offset: usize,
}

impl<'a> StepCursor<'a> {
    pub(crate) fn new(steps: &'a [Step]) -> Self {
        Self { steps, index: 0, offset: 0 }
    }

    pub(crate) fn peek(&self) -> Option<&'a Step> {
        self.steps.get(self.index)
    }

    /// Remaining length of the current step.
    pub(crate) fn peek_len(&self) -> usize {
        self.peek().map_or(0, |s| s.len() - self.offset)
    }

    /// Take at most `max` characters worth of the current step.
    pub(crate) fn take(&mut self, max: usize) -> Option<Step> {
        let step = self.peek()?;
        let remaining = step.len() - self.offset;
        let n = remaining.min(max);
        let piece = match step {
            Step::Retain { attributes, .. } => Step::Retain { len: n, attributes: attributes.clone() },
            Step::Delete(_) => Step::Delete(n),
            Step::Insert { text, attributes, origin } => Step::Insert {
                text: char_slice(text, self.offset, n).to_string(),
                attributes: attributes.clone(),
                origin: *origin,
            },
        };
        if n == remaining {
            self.index += 1;
            self.offset = 0;
        } else {
            self.offset += n;
        }
        Some(piece)
    }
}

/// Combine `a` and `b` (authored after `a`) into one operation with the same
/// effect as applying them in sequence.
pub fn compose(a: &Operation, b: &Operation) -> Result<Operation> {
    if a.target_length != b.base_length {
        return Err(OtError::length(a.target_length, b.base_length));
    }

    let mut out = Steps::default();
    let mut left = StepCursor::new(&a.steps);
    let mut right = StepCursor::new(&b.steps);

    loop {
        match (left.peek(), right.peek()) {
            (None, None) => break,
            (Some(Step::Delete(_)), _) => {
                if let Some(step) = left.take(usize::MAX) {
                    out.push(step);
                }
            }
            (_, Some(Step::Insert { .. })) => {
                if let Some(step) = right.take(usize::MAX) {
                    out.push(step);
                }
            }
            (None, _) | (_, None) => {
                return Err(OtError::malformed("compose ran off the end of an operation"));
            }
            _ => {
                let n = left.peek_len().min(right.peek_len());
                match (left.take(n), right.take(n)) {
                    (
                        Some(Step::Retain { attributes: first, .. }),
                        Some(Step::Retain { attributes: second, .. }),
                    ) => out.retain(n, first.compose(&second, true)),
                    (Some(Step::Retain { .. }), Some(Step::Delete(_))) => out.delete(n),
                    (
                        Some(Step::Insert { text, attributes, origin }),
                        Some(Step::Retain { attributes: second, .. }),
                    ) => out.insert_at_origin(text, attributes.compose(&second, false), origin),
                    // Inserted then deleted: nothing survives.
                    (Some(Step::Insert { .. }), Some(Step::Delete(_))) => {}
                    _ => return Err(OtError::malformed("compose lost step alignment")),
                }
            }
        }
    }

    Ok(Operation::from_steps(a.room_id.clone(), a.client_id, a.base_version, out))
}
