//! When to push a document's edits to the analyzer.
//!
//! [`ChangeDebouncer`] is a plain state machine; the document owns the timer
//! task and acts on the returned [`DebounceAction`]. Typing on one line waits
//! for a quiet period, finishing a line (a line break right after text edits)
//! syncs at once, and edits that arrive while a sync is in flight are folded
//! into one follow-up sync.

use std::time::Duration;

use anchor_types::EditKind;

/// What the caller must do after an edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceAction {
    /// Start a sync now.
    SyncNow,
    /// (Re)arm the quiet-period timer. The generation identifies this timer
    /// so a superseded one that still fires is ignored.
    StartTimer { generation: u64, delay: Duration },
    /// A sync is in flight; another one follows when it completes.
    Requeued,
}

#[derive(Debug)]
pub struct ChangeDebouncer {
    quiet_period: Duration,
    sync_immediately: bool,
    syncing: bool,
    requeue: bool,
    saw_text_edit: bool,
    generation: u64,
    timer_armed: bool,
}

impl ChangeDebouncer {
    #[must_use]
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            sync_immediately: false,
            syncing: false,
            requeue: false,
            saw_text_edit: false,
            generation: 0,
            timer_armed: false,
        }
    }

    pub fn set_sync_immediately(&mut self, value: bool) {
        self.sync_immediately = value;
    }

    #[must_use]
    pub fn sync_immediately(&self) -> bool {
        self.sync_immediately
    }

    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    #[must_use]
    pub fn timer_armed(&self) -> bool {
        self.timer_armed
    }

    pub fn on_edit(&mut self, kind: EditKind) -> DebounceAction {
        if self.syncing {
            self.requeue = true;
            self.disarm();
            return DebounceAction::Requeued;
        }
        if self.sync_immediately || kind == EditKind::NoTextChange || self.line_after_text(kind) {
            self.disarm();
            return DebounceAction::SyncNow;
        }

        self.saw_text_edit = kind.includes_text_changes();
        self.generation += 1;
        self.timer_armed = true;
        DebounceAction::StartTimer {
            generation: self.generation,
            delay: self.quiet_period,
        }
    }

    /// Finishing a line after typing on it is worth an immediate sync.
    fn line_after_text(&mut self, kind: EditKind) -> bool {
        if self.saw_text_edit {
            self.saw_text_edit = false;
            kind.includes_line_changes()
        } else {
            kind.includes_line_changes() && kind.includes_text_changes()
        }
    }

    /// A timer fired. Returns true if it is still current and the caller
    /// should start a sync.
    pub fn on_timer(&mut self, generation: u64) -> bool {
        if !self.timer_armed || generation != self.generation {
            return false;
        }
        self.timer_armed = false;
        true
    }

    /// Claim the single in-flight slot. If a sync is already running the
    /// request becomes a requeue and false is returned.
    pub fn begin_sync(&mut self) -> bool {
        if self.syncing {
            self.requeue = true;
            return false;
        }
        self.syncing = true;
        true
    }

    /// The in-flight sync completed. Returns true if edits arrived in the
    /// meantime; the slot then stays claimed for the follow-up sync.
    pub fn finish_sync(&mut self) -> bool {
        if std::mem::take(&mut self.requeue) {
            return true;
        }
        self.syncing = false;
        false
    }

    fn disarm(&mut self) {
        if self.timer_armed {
            self.timer_armed = false;
            self.generation += 1;
        }
    }
}
