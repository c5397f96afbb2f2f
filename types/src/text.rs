//! Edits, locations and edit classification.
//!
//! Offsets and columns count Unicode scalar values (`char`s), matching the
//! indexing of the rope that backs every snapshot.

use serde::{Deserialize, Serialize};

/// One atomic replacement, expressed against the text it is applied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEdit {
    start: usize,
    removed: usize,
    inserted: String,
}

impl TextEdit {
    #[must_use]
    pub fn new(start: usize, removed: usize, inserted: impl Into<String>) -> Self {
        Self {
            start,
            removed,
            inserted: inserted.into(),
        }
    }

    #[must_use]
    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self::new(at, 0, text)
    }

    #[must_use]
    pub fn delete(start: usize, len: usize) -> Self {
        Self::new(start, len, String::new())
    }

    #[must_use]
    pub fn start(&self) -> usize {
        self.start
    }

    /// Number of chars removed starting at `start`.
    #[must_use]
    pub fn removed_len(&self) -> usize {
        self.removed
    }

    /// End of the removed region in the old text (exclusive), saturating.
    #[must_use]
    pub fn old_end(&self) -> usize {
        self.start.saturating_add(self.removed)
    }

    #[must_use]
    pub fn inserted(&self) -> &str {
        &self.inserted
    }

    /// Inserted length in chars.
    #[must_use]
    pub fn inserted_len(&self) -> usize {
        self.inserted.chars().count()
    }

    /// Net change in document length caused by this edit.
    #[must_use]
    pub fn delta(&self) -> isize {
        self.inserted_len() as isize - self.removed as isize
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.removed == 0 && self.inserted.is_empty()
    }
}

/// 0-indexed line and column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl Location {
    #[must_use]
    pub const fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

/// Half-open range between two locations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceSpan {
    pub start: Location,
    pub end: Location,
}

impl SourceSpan {
    #[must_use]
    pub const fn new(start: Location, end: Location) -> Self {
        Self { start, end }
    }
}

/// Classification of one content change, used to pick a sync strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    /// Nothing visible changed (e.g. the encoding was switched).
    NoTextChange,
    /// Text changed on a single line; no line break added or removed.
    Text,
    /// Only bare line breaks were inserted.
    LineBreak,
    /// Line breaks together with other text changes.
    Mixed,
}

impl EditKind {
    /// Classify a set of edits given the text each one removed.
    pub fn classify<'a>(edits: impl IntoIterator<Item = (&'a TextEdit, &'a str)>) -> Self {
        let mut line_changes = false;
        let mut text_changes = false;
        let mut any = false;
        for (edit, removed) in edits {
            any = true;
            if contains_line_break(removed) || contains_line_break(edit.inserted()) {
                line_changes = true;
            }
            if !removed.is_empty() || !is_line_break(edit.inserted()) {
                text_changes = true;
            }
        }
        match (any, line_changes, text_changes) {
            (false, _, _) => Self::NoTextChange,
            (true, true, true) => Self::Mixed,
            (true, true, false) => Self::LineBreak,
            (true, false, _) => Self::Text,
        }
    }

    #[must_use]
    pub fn includes_line_changes(self) -> bool {
        matches!(self, Self::LineBreak | Self::Mixed)
    }

    #[must_use]
    pub fn includes_text_changes(self) -> bool {
        matches!(self, Self::Text | Self::Mixed)
    }
}

fn contains_line_break(text: &str) -> bool {
    text.contains(['\n', '\r'])
}

fn is_line_break(text: &str) -> bool {
    matches!(text, "\n" | "\r\n" | "\r")
}
