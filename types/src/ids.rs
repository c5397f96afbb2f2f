use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier the analyzer assigns to a logical file on `addFile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct FileId(i32);

impl FileId {
    #[must_use]
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn value(self) -> i32 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Small integer naming one buffer binding within a file.
///
/// Stable for the lifetime of the binding; reused only after the binding
/// is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct BufferId(i32);

impl BufferId {
    #[must_use]
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn value(self) -> i32 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique identity of one `TextBuffer` object.
///
/// Two buffers showing the same path (e.g. a file closed and reopened) have
/// different instance ids; version numbers are only comparable within one
/// instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferInstanceId(u64);

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

impl BufferInstanceId {
    pub(crate) fn next() -> Self {
        Self(NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
