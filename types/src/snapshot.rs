//! Immutable text snapshots linked into a version chain.
//!
//! A [`TextBuffer`] owns the head of a chain. Every successful
//! [`TextBuffer::apply`] creates a new [`Snapshot`] with the next version
//! number and links it from its predecessor together with the edits that
//! produced it. Links point forward only, so versions nobody holds any more
//! are freed while the chain from any held snapshot up to the head stays
//! walkable.

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};
use ropey::Rope;

use crate::ids::BufferInstanceId;
use crate::text::{EditKind, Location, TextEdit};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    #[error("edit {start}..{end} is outside the document (length {len})")]
    OutOfBounds { start: usize, end: usize, len: usize },
    #[error("edit starting at {start} overlaps the previous edit ending at {previous_end}")]
    Overlapping { previous_end: usize, start: usize },
}

struct Link {
    edits: Arc<[TextEdit]>,
    next: Snapshot,
}

struct Node {
    instance: BufferInstanceId,
    version: i32,
    text: Rope,
    next: OnceLock<Link>,
}

impl Drop for Node {
    // Unlink iteratively; a long uniquely-owned tail would otherwise
    // recurse once per version.
    fn drop(&mut self) {
        let mut link = self.next.take();
        while let Some(Link { next, .. }) = link {
            match Arc::into_inner(next.0) {
                Some(mut node) => link = node.next.take(),
                None => break,
            }
        }
    }
}

/// A point-in-time view of a buffer's text.
///
/// Cloning is cheap. Two snapshots compare equal only if they are the same
/// version of the same buffer instance.
#[derive(Clone)]
pub struct Snapshot(Arc<Node>);

impl Snapshot {
    fn root(instance: BufferInstanceId, text: Rope) -> Self {
        Self(Arc::new(Node {
            instance,
            version: 0,
            text,
            next: OnceLock::new(),
        }))
    }

    #[must_use]
    pub fn version(&self) -> i32 {
        self.0.version
    }

    /// Identity of the buffer this snapshot belongs to.
    #[must_use]
    pub fn instance(&self) -> BufferInstanceId {
        self.0.instance
    }

    #[must_use]
    pub fn text(&self) -> &Rope {
        &self.0.text
    }

    #[must_use]
    pub fn len_chars(&self) -> usize {
        self.0.text.len_chars()
    }

    #[must_use]
    pub fn line_count(&self) -> usize {
        self.0.text.len_lines()
    }

    /// Successor snapshot, once one exists.
    #[must_use]
    pub fn next(&self) -> Option<Snapshot> {
        self.0.next.get().map(|link| link.next.clone())
    }

    /// Edits leading from this snapshot to [`Snapshot::next`], ascending
    /// and non-overlapping, each relative to this snapshot's text.
    #[must_use]
    pub fn edits_to_next(&self) -> Option<&[TextEdit]> {
        self.0.next.get().map(|link| &*link.edits)
    }

    #[must_use]
    pub fn same_buffer(&self, other: &Snapshot) -> bool {
        self.instance() == other.instance()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Walk forward to the snapshot with `version`, if it is reachable.
    #[must_use]
    pub fn walk_to(&self, version: i32) -> Option<Snapshot> {
        let mut current = self.clone();
        loop {
            if current.version() == version {
                return Some(current);
            }
            if current.version() > version {
                return None;
            }
            current = current.next()?;
        }
    }

    /// Every `(snapshot, edits to its successor)` pair from `self` up to,
    /// but excluding, `target`. `None` if `target` is not reachable.
    #[must_use]
    pub fn steps_to(&self, target: &Snapshot) -> Option<Vec<(Snapshot, Arc<[TextEdit]>)>> {
        if !self.same_buffer(target) || self.version() > target.version() {
            return None;
        }
        let mut steps = Vec::new();
        let mut current = self.clone();
        while current.version() < target.version() {
            let link = current.0.next.get()?;
            let next = link.next.clone();
            let edits = Arc::clone(&link.edits);
            steps.push((current, edits));
            current = next;
        }
        Some(steps)
    }

    /// Text of `len` chars starting at `start`, clamped to the document.
    #[must_use]
    pub fn slice_to_string(&self, start: usize, len: usize) -> String {
        let total = self.len_chars();
        let start = start.min(total);
        let end = start.saturating_add(len).min(total);
        self.0.text.slice(start..end).to_string()
    }

    /// Convert a char offset into a line/column pair. Offsets past the end
    /// clamp to the end of the document.
    #[must_use]
    pub fn offset_to_location(&self, offset: usize) -> Location {
        let text = &self.0.text;
        let offset = offset.min(text.len_chars());
        let line = text.char_to_line(offset);
        Location::new(line, offset - text.line_to_char(line))
    }

    /// Convert a line/column pair into a char offset, clamping the line to
    /// the document and the column to the line's content.
    #[must_use]
    pub fn location_to_offset(&self, location: Location) -> usize {
        let text = &self.0.text;
        let last_line = text.len_lines().saturating_sub(1);
        let line = location.line.min(last_line);
        let line_start = text.line_to_char(line);
        line_start + location.column.min(self.line_content_len(line))
    }

    /// Length of `line` in chars, excluding its line break.
    fn line_content_len(&self, line: usize) -> usize {
        let slice = self.0.text.line(line);
        let mut len = slice.len_chars();
        if len > 0 && is_break_char(slice.char(len - 1)) {
            len -= 1;
            if len > 0 && slice.char(len) == '\n' && slice.char(len - 1) == '\r' {
                len -= 1;
            }
        }
        len
    }
}

fn is_break_char(c: char) -> bool {
    matches!(
        c,
        '\n' | '\r' | '\u{0B}' | '\u{0C}' | '\u{85}' | '\u{2028}' | '\u{2029}'
    )
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.instance() == other.instance() && self.version() == other.version()
    }
}

impl Eq for Snapshot {}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("instance", &self.instance())
            .field("version", &self.version())
            .field("len_chars", &self.len_chars())
            .finish()
    }
}

/// One applied content change.
#[derive(Debug, Clone)]
pub struct TextChange {
    pub before: Snapshot,
    pub after: Snapshot,
    pub kind: EditKind,
}

/// Notification delivered to buffer listeners.
#[derive(Debug, Clone)]
pub enum BufferEvent {
    ContentChanged(TextChange),
    /// Nothing in the text changed but the content should be re-read
    /// (e.g. the document encoding was switched).
    EncodingChanged,
}

impl BufferEvent {
    #[must_use]
    pub fn kind(&self) -> EditKind {
        match self {
            Self::ContentChanged(change) => change.kind,
            Self::EncodingChanged => EditKind::NoTextChange,
        }
    }
}

/// Receiver of buffer notifications. Called synchronously on the editing
/// thread after the buffer lock has been released.
pub trait BufferListener: Send + Sync {
    fn on_buffer_event(&self, buffer: &TextBuffer, event: &BufferEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listeners {
    next_id: u64,
    entries: Vec<(ListenerId, Weak<dyn BufferListener>)>,
}

/// A mutable text buffer whose history is exposed as a chain of snapshots.
pub struct TextBuffer {
    instance: BufferInstanceId,
    head: RwLock<Snapshot>,
    listeners: Mutex<Listeners>,
}

impl TextBuffer {
    #[must_use]
    pub fn new(text: &str) -> Arc<Self> {
        let instance = BufferInstanceId::next();
        Arc::new(Self {
            instance,
            head: RwLock::new(Snapshot::root(instance, Rope::from_str(text))),
            listeners: Mutex::new(Listeners {
                next_id: 0,
                entries: Vec::new(),
            }),
        })
    }

    #[must_use]
    pub fn instance(&self) -> BufferInstanceId {
        self.instance
    }

    #[must_use]
    pub fn current(&self) -> Snapshot {
        self.head.read().clone()
    }

    /// Apply a batch of edits as one new version.
    ///
    /// Edits are relative to the current text and must be sorted by start
    /// and non-overlapping. No-op edits are dropped; a batch with nothing
    /// left returns the current snapshot without creating a version.
    pub fn apply(&self, edits: Vec<TextEdit>) -> Result<Snapshot, EditError> {
        let edits: Vec<TextEdit> = edits.into_iter().filter(|e| !e.is_noop()).collect();

        let change = {
            let mut head = self.head.write();
            if edits.is_empty() {
                return Ok(head.clone());
            }
            validate(&edits, head.len_chars())?;

            let before = head.clone();
            let removed: Vec<String> = edits
                .iter()
                .map(|e| before.slice_to_string(e.start(), e.removed_len()))
                .collect();
            let kind = EditKind::classify(edits.iter().zip(removed.iter().map(String::as_str)));

            let mut text = before.text().clone();
            for edit in edits.iter().rev() {
                text.remove(edit.start()..edit.old_end());
                text.insert(edit.start(), edit.inserted());
            }

            let after = Snapshot(Arc::new(Node {
                instance: self.instance,
                version: before.version() + 1,
                text,
                next: OnceLock::new(),
            }));
            // Only the head is ever linked, under the write lock.
            let _ = before.0.next.set(Link {
                edits: edits.into(),
                next: after.clone(),
            });
            *head = after.clone();

            TextChange {
                before,
                after,
                kind,
            }
        };

        let after = change.after.clone();
        self.notify(&BufferEvent::ContentChanged(change));
        Ok(after)
    }

    /// Insert `text` at char `offset`.
    pub fn insert(&self, offset: usize, text: &str) -> Result<Snapshot, EditError> {
        self.apply(vec![TextEdit::insert(offset, text)])
    }

    /// Replace `len` chars at `start` with `text`.
    pub fn replace(&self, start: usize, len: usize, text: &str) -> Result<Snapshot, EditError> {
        self.apply(vec![TextEdit::new(start, len, text)])
    }

    /// Signal that the content must be re-read although no text changed.
    pub fn notify_encoding_changed(&self) {
        self.notify(&BufferEvent::EncodingChanged);
    }

    pub fn subscribe(&self, listener: Weak<dyn BufferListener>) -> ListenerId {
        let mut listeners = self.listeners.lock();
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        listeners.entries.push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners.lock().entries.retain(|(entry, _)| *entry != id);
    }

    fn notify(&self, event: &BufferEvent) {
        let live: Vec<Arc<dyn BufferListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.entries.retain(|(_, weak)| weak.strong_count() > 0);
            listeners
                .entries
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };
        for listener in live {
            listener.on_buffer_event(self, event);
        }
    }
}

impl fmt::Debug for TextBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextBuffer")
            .field("instance", &self.instance)
            .field("version", &self.head.read().version())
            .finish_non_exhaustive()
    }
}

fn validate(edits: &[TextEdit], len: usize) -> Result<(), EditError> {
    let mut previous_end = 0;
    for (i, edit) in edits.iter().enumerate() {
        let end = edit.start().checked_add(edit.removed_len());
        let Some(end) = end.filter(|&end| end <= len) else {
            return Err(EditError::OutOfBounds {
                start: edit.start(),
                end: edit.old_end(),
                len,
            });
        };
        if i > 0 && edit.start() < previous_end {
            return Err(EditError::Overlapping {
                previous_end,
                start: edit.start(),
            });
        }
        previous_end = end;
    }
    Ok(())
}
