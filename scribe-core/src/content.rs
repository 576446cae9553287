//! Document content: an ordered run of attributed text segments.

use serde::{Deserialize, Serialize};

use crate::attributes::Attributes;
use crate::error::{OtError, Result};
use crate::operation::{char_slice, Operation, Step};

/// A run of text sharing one attribute set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub text: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Segment {
    pub fn new(text: impl Into<String>, attributes: Attributes) -> Self {
        Self { text: text.into(), attributes }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self::new(text, Attributes::new())
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Immutable-by-convention document body.
///
/// Adjacent segments never share an attribute set and no segment is empty,
/// so equal documents compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Segment>", into = "Vec<Segment>")]
pub struct Content {
    segments: Vec<Segment>,
    len: usize,
}

impl Content {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Plain text with attributes dropped.
    pub fn text(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }

    /// Append text, merging into the last segment when attributes match.
    pub fn push_str(&mut self, text: &str, attributes: Attributes) {
        if text.is_empty() {
            return;
        }
        let attributes = attributes.normalized();
        self.len += text.chars().count();
        if let Some(last) = self.segments.last_mut() {
            if last.attributes == attributes {
                last.text.push_str(text);
                return;
            }
        }
        self.segments.push(Segment::new(text, attributes));
    }

    /// Apply `op` and return the resulting content, leaving `self` untouched.
    pub fn apply(&self, op: &Operation) -> Result<Content> {
        if op.base_length() != self.len {
            return Err(OtError::length(self.len, op.base_length()));
        }

        let mut out = Content::new();
        let mut reader = SegmentReader::new(&self.segments);
        for step in op.steps() {
            match step {
                Step::Retain { len, attributes } => {
                    reader.take(*len, |text, current| {
                        if attributes.is_empty() {
                            out.push_str(text, current.clone());
                        } else {
                            out.push_str(text, current.compose(attributes, false));
                        }
                    })?;
                }
                Step::Delete(len) => reader.take(*len, |_, _| {})?,
                Step::Insert { text, attributes, .. } => out.push_str(text, attributes.clone()),
            }
        }
        Ok(out)
    }
}

impl From<Vec<Segment>> for Content {
    fn from(segments: Vec<Segment>) -> Self {
        let mut content = Content::new();
        for segment in segments {
            content.push_str(&segment.text, segment.attributes);
        }
        content
    }
}

impl From<Content> for Vec<Segment> {
    fn from(content: Content) -> Self {
        content.segments
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        let mut content = Content::new();
        content.push_str(text, Attributes::new());
        content
    }
}

/// Character-addressed reader over a segment list.
struct SegmentReader<'a> {
    segments: &'a [Segment],
    index: usize,
    offset: usize,
}

impl<'a> SegmentReader<'a> {
    fn new(segments: &'a [Segment]) -> Self {
        Self { segments, index: 0, offset: 0 }
    }

    /// Feed the next `len` characters to `visit`, split at segment borders.
    fn take<F>(&mut self, len: usize, mut visit: F) -> Result<()>
    where
        F: FnMut(&'a str, &'a Attributes),
    {
        let mut remaining = len;
        while remaining > 0 {
            let segment = self
                .segments
                .get(self.index)
                .ok_or_else(|| OtError::malformed("operation runs past the end of the document"))?;
            let available = segment.len() - self.offset;
            let n = available.min(remaining);
            visit(char_slice(&segment.text, self.offset, n), &segment.attributes);
            remaining -= n;
            if n == available {
                self.index += 1;
                self.offset = 0;
            } else {
                self.offset += n;
            }
        }
        Ok(())
    }
}
