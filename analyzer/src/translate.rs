//! Re-anchoring positions computed against one snapshot onto another.
//!
//! Translation walks the version chain between the two snapshots and moves
//! the offset through every edit. An offset inside a removed region snaps to
//! the start of the edit, and an insertion exactly at the offset leaves it
//! in place. Snapshots of different buffers, or versions no longer
//! reachable, fall back to keeping line and column unchanged.

use std::collections::VecDeque;

use anchor_types::{Location, Snapshot, SourceSpan, TextEdit};

/// Base snapshots kept per buffer.
const TRACKED_SNAPSHOTS: usize = 5;

/// Move `offset` forward through one edit set.
fn track_forward(offset: usize, edits: &[TextEdit]) -> usize {
    let mut shift: isize = 0;
    for edit in edits {
        if offset <= edit.start() {
            break;
        }
        if offset < edit.old_end() {
            return edit.start().saturating_add_signed(shift);
        }
        shift += edit.delta();
    }
    offset.saturating_add_signed(shift)
}

/// Move `offset` backward through one edit set: `offset` is relative to the
/// text after the edits, the result to the text before them.
fn track_backward(offset: usize, edits: &[TextEdit]) -> usize {
    let mut shift: isize = 0;
    for edit in edits {
        let new_start = edit.start().saturating_add_signed(shift);
        if offset <= new_start {
            break;
        }
        let new_end = new_start + edit.inserted_len();
        if offset < new_end {
            return edit.start();
        }
        shift += edit.delta();
    }
    offset.saturating_add_signed(-shift)
}

/// Translate a char offset from `from` to `to`. `None` when the two
/// snapshots are not connected by the version chain.
#[must_use]
pub fn translate_offset(offset: usize, from: &Snapshot, to: &Snapshot) -> Option<usize> {
    if !from.same_buffer(to) {
        return None;
    }
    let offset = offset.min(from.len_chars());
    if from.version() <= to.version() {
        let steps = from.steps_to(to)?;
        Some(
            steps
                .iter()
                .fold(offset, |offset, (_, edits)| track_forward(offset, edits)),
        )
    } else {
        let steps = to.steps_to(from)?;
        Some(
            steps
                .iter()
                .rev()
                .fold(offset, |offset, (_, edits)| track_backward(offset, edits)),
        )
    }
}

/// Translate a location. With no source snapshot, or when the snapshots are
/// unrelated, the location is returned unchanged.
#[must_use]
pub fn translate_location(location: Location, from: Option<&Snapshot>, to: &Snapshot) -> Location {
    let Some(from) = from else {
        return location;
    };
    let offset = from.location_to_offset(location);
    match translate_offset(offset, from, to) {
        Some(offset) => to.offset_to_location(offset),
        None => location,
    }
}

#[must_use]
pub fn translate_span(span: SourceSpan, from: Option<&Snapshot>, to: &Snapshot) -> SourceSpan {
    SourceSpan::new(
        translate_location(span.start, from, to),
        translate_location(span.end, from, to),
    )
}

/// Recent snapshots a buffer's analysis results may refer to.
///
/// Results from the analyzer carry only a version number. The tracker keeps
/// the last few acknowledged snapshots so such a number can be resolved back
/// to text and translated to the caller's snapshot.
#[derive(Debug, Default)]
pub struct LocationTracker {
    bases: VecDeque<Snapshot>,
}

impl LocationTracker {
    #[must_use]
    pub fn new(base: Snapshot) -> Self {
        let mut tracker = Self::default();
        tracker.update_base(base);
        tracker
    }

    /// Record a newly acknowledged snapshot. A snapshot of another buffer
    /// replaces the history.
    pub fn update_base(&mut self, snapshot: Snapshot) {
        if self.bases.back().is_some_and(|last| !last.same_buffer(&snapshot)) {
            self.bases.clear();
        }
        if self.bases.back() == Some(&snapshot) {
            return;
        }
        self.bases.push_back(snapshot);
        while self.bases.len() > TRACKED_SNAPSHOTS {
            self.bases.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.bases.clear();
    }

    #[must_use]
    pub fn latest(&self) -> Option<&Snapshot> {
        self.bases.back()
    }

    /// True if `version` is the newest base or reachable from it.
    #[must_use]
    pub fn can_translate_from(&self, version: i32) -> bool {
        self.bases
            .back()
            .and_then(|base| base.walk_to(version))
            .is_some()
    }

    /// Resolve `version` against the kept bases.
    #[must_use]
    pub fn snapshot_at(&self, version: i32) -> Option<Snapshot> {
        self.bases.iter().find_map(|base| base.walk_to(version))
    }

    #[must_use]
    pub fn translate(&self, location: Location, from_version: i32, to: &Snapshot) -> Location {
        let from = self.snapshot_at(from_version);
        if from.is_none() {
            tracing::debug!(from_version, to = to.version(), "version not tracked; location kept as is");
        }
        translate_location(location, from.as_ref(), to)
    }

    #[must_use]
    pub fn translate_span(&self, span: SourceSpan, from_version: i32, to: &Snapshot) -> SourceSpan {
        let from = self.snapshot_at(from_version);
        translate_span(span, from.as_ref(), to)
    }
}
