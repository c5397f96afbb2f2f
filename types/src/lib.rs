//! Core domain types for Anchor.
//!
//! Text snapshots and the version chain that links them, edits, locations
//! and the identifiers shared between the editor side and the analyzer
//! protocol. No IO, no async.

mod ids;
mod snapshot;
mod text;

pub use ids::{BufferId, BufferInstanceId, FileId};
pub use snapshot::{
    BufferEvent, BufferListener, EditError, ListenerId, Snapshot, TextBuffer, TextChange,
};
pub use text::{EditKind, Location, SourceSpan, TextEdit};
