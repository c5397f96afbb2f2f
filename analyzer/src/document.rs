//! One analyzed file and the buffers attached to it.
//!
//! A [`Document`] listens to every bound [`TextBuffer`], feeds edits through
//! its [`ChangeDebouncer`] and pushes `fileUpdate` requests to the analyzer.
//! Per buffer it remembers the last snapshot sent, so a sync carries either
//! the per-version edits since then or, when there is no usable baseline, the
//! full text.
//!
//! Locking: `state` is a short critical section that is never held across an
//! await. `gate` is held for the whole duration of a sync request and keeps
//! at most one in flight per document.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Notify, broadcast};
use tokio::task::AbortHandle;

use anchor_types::{
    BufferEvent, BufferId, BufferListener, EditKind, FileId, ListenerId, Snapshot, SourceSpan,
    TextBuffer, TextEdit,
};

use crate::channel::Requester;
use crate::correlator::{AckKind, VersionMarker};
use crate::debounce::{ChangeDebouncer, DebounceAction};
use crate::protocol::{ChangeInfo, FileUpdate, FileUpdateRequest};
use crate::translate::{self, LocationTracker};
use crate::types::{AnalysisComplete, DocumentPath, ParseComplete};

/// Counters shared by every document of one orchestrator.
#[derive(Debug, Default)]
pub(crate) struct SyncStats {
    pub pending_syncs: AtomicUsize,
    pub stale_responses: AtomicU64,
}

impl SyncStats {
    pub fn settle(&self, count: usize) {
        if count > 0 {
            self.pending_syncs.fetch_sub(count, Ordering::SeqCst);
        }
    }
}

/// What every document needs from its orchestrator.
pub(crate) struct SyncContext {
    pub requester: Requester,
    pub runtime: Handle,
    pub quiet_period: Duration,
    pub sync_immediately: bool,
    pub channel_capacity: usize,
    pub stats: Arc<SyncStats>,
    /// Woken whenever an acknowledgement is applied.
    pub progress: Notify,
}

/// Per-buffer behaviour chosen when the buffer is monitored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferOptions {
    /// Sync on every edit instead of debouncing.
    pub sync_immediately: bool,
    /// Attach the buffer without ever sending its content.
    pub do_not_sync: bool,
}

/// Result of one sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The analyzer already has the current text.
    UpToDate,
    /// Updates were sent and accepted.
    Sent,
    /// The request failed; the next sync sends the full text.
    Failed,
    /// The document was unloaded.
    Unloaded,
}

/// Sync bookkeeping for one buffer of a document.
pub(crate) struct BufferSyncState {
    pub buffer: Arc<TextBuffer>,
    pub listener: ListenerId,
    pub refs: usize,
    pub options: BufferOptions,
    pub last_sent: Option<Snapshot>,
    pub parse: VersionMarker,
    pub analysis: VersionMarker,
    pub tracker: LocationTracker,
}

/// What one buffer contributed to a sync request.
pub(crate) struct PreparedSync {
    pub updates: Vec<FileUpdate>,
    pub target: Snapshot,
    pub expected: Vec<i32>,
}

impl BufferSyncState {
    fn new(buffer: Arc<TextBuffer>, listener: ListenerId, options: BufferOptions) -> Self {
        Self {
            buffer,
            listener,
            refs: 1,
            options,
            last_sent: None,
            parse: VersionMarker::default(),
            analysis: VersionMarker::default(),
            tracker: LocationTracker::default(),
        }
    }

    /// Compute the updates that bring the analyzer from the last sent
    /// snapshot to the buffer's current one, and record them as sent.
    pub fn prepare(&mut self, buffer_id: BufferId) -> Option<PreparedSync> {
        if self.options.do_not_sync {
            return None;
        }
        let current = self.buffer.current();
        let steps = match &self.last_sent {
            Some(last) if last.same_buffer(&current) => {
                if last.version() == current.version() {
                    return None;
                }
                last.steps_to(&current)
            }
            _ => None,
        };

        let (updates, produced): (Vec<FileUpdate>, Vec<Snapshot>) = match steps {
            Some(steps) => steps
                .iter()
                .filter_map(|(snapshot, edits)| {
                    let next = snapshot.next()?;
                    let update = FileUpdate::Changes {
                        buffer_id,
                        version: next.version(),
                        changes: descending_changes(edits),
                    };
                    Some((update, next))
                })
                .unzip(),
            None => (
                vec![FileUpdate::Reset {
                    buffer_id,
                    version: current.version(),
                    content: current.text().to_string(),
                }],
                vec![current.clone()],
            ),
        };

        let expected = produced.iter().map(Snapshot::version).collect();
        for snapshot in produced {
            self.parse.expect(snapshot.clone());
            self.analysis.expect(snapshot);
        }
        self.last_sent = Some(current.clone());
        Some(PreparedSync {
            updates,
            target: current,
            expected,
        })
    }

    /// Undo [`prepare`](Self::prepare) after the request failed.
    fn rollback(&mut self, prepared: &PreparedSync) {
        if self.last_sent.as_ref() == Some(&prepared.target) {
            self.last_sent = None;
        }
        self.parse.withdraw(&prepared.expected);
        self.analysis.withdraw(&prepared.expected);
    }

    /// Snapshot for `version`, from anything this buffer still holds.
    pub fn snapshot_at(&self, version: i32) -> Option<Snapshot> {
        [
            self.last_sent.as_ref(),
            self.analysis.acknowledged(),
            self.parse.acknowledged(),
        ]
        .into_iter()
        .flatten()
        .chain(self.parse.expected())
        .chain(self.analysis.expected())
        .find_map(|snapshot| snapshot.walk_to(version))
        .or_else(|| self.tracker.snapshot_at(version))
    }
}

/// Edits of one version, last first, so each applies to the text the
/// previous one left behind.
fn descending_changes(edits: &[TextEdit]) -> Vec<ChangeInfo> {
    edits
        .iter()
        .rev()
        .map(|edit| ChangeInfo {
            start: edit.start(),
            removed: edit.removed_len(),
            text: edit.inserted().to_string(),
        })
        .collect()
}

/// A sync request the analyzer accepted but has not parsed yet.
#[derive(Debug)]
pub(crate) struct OutstandingSync {
    pub awaiting: Vec<(BufferId, i32)>,
}

pub(crate) struct DocumentState {
    pub buffers: BTreeMap<BufferId, BufferSyncState>,
    pub debouncer: ChangeDebouncer,
    pub timer: Option<AbortHandle>,
    pub cookie: Option<Snapshot>,
    pub outstanding: Vec<OutstandingSync>,
    pub unloaded: bool,
}

impl DocumentState {
    /// Parse of `buffer_id` reached `version`; returns how many outstanding
    /// syncs that completed.
    pub fn settle_parsed(&mut self, buffer_id: BufferId, version: i32) -> usize {
        let before = self.outstanding.len();
        for sync in &mut self.outstanding {
            sync.awaiting.retain(|&(id, v)| id != buffer_id || v > version);
        }
        self.outstanding.retain(|sync| !sync.awaiting.is_empty());
        before - self.outstanding.len()
    }

    /// `buffer_id` is no longer bound to what it was synced from, so its
    /// versions will never be parsed. Returns how many outstanding syncs
    /// that completed.
    pub fn forget_buffer(&mut self, buffer_id: BufferId) -> usize {
        let before = self.outstanding.len();
        for sync in &mut self.outstanding {
            sync.awaiting.retain(|&(id, _)| id != buffer_id);
        }
        self.outstanding.retain(|sync| !sync.awaiting.is_empty());
        before - self.outstanding.len()
    }

    fn drain_outstanding(&mut self) -> usize {
        std::mem::take(&mut self.outstanding).len()
    }

    fn refresh_sync_immediately(&mut self, default: bool) {
        let any = self.buffers.values().any(|b| b.options.sync_immediately);
        self.debouncer.set_sync_immediately(default || any);
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// A logical file known to the analyzer.
pub struct Document {
    file_id: FileId,
    path: DocumentPath,
    pub(crate) state: Mutex<DocumentState>,
    gate: tokio::sync::Mutex<()>,
    parse_complete: broadcast::Sender<ParseComplete>,
    analysis_complete: broadcast::Sender<AnalysisComplete>,
    pub(crate) ctx: Arc<SyncContext>,
    this: Weak<Document>,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("file_id", &self.file_id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Document {
    pub(crate) fn new(file_id: FileId, path: DocumentPath, ctx: Arc<SyncContext>) -> Arc<Self> {
        let (parse_complete, _) = broadcast::channel(ctx.channel_capacity);
        let (analysis_complete, _) = broadcast::channel(ctx.channel_capacity);
        let mut debouncer = ChangeDebouncer::new(ctx.quiet_period);
        debouncer.set_sync_immediately(ctx.sync_immediately);
        Arc::new_cyclic(|this| Self {
            file_id,
            path,
            state: Mutex::new(DocumentState {
                buffers: BTreeMap::new(),
                debouncer,
                timer: None,
                cookie: None,
                outstanding: Vec::new(),
                unloaded: false,
            }),
            gate: tokio::sync::Mutex::new(()),
            parse_complete,
            analysis_complete,
            ctx,
            this: this.clone(),
        })
    }

    #[must_use]
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    #[must_use]
    pub fn path(&self) -> &DocumentPath {
        &self.path
    }

    /// Receive a notification each time the analyzer finishes parsing one
    /// of this document's buffers.
    #[must_use]
    pub fn on_parse_complete(&self) -> broadcast::Receiver<ParseComplete> {
        self.parse_complete.subscribe()
    }

    #[must_use]
    pub fn on_analysis_complete(&self) -> broadcast::Receiver<AnalysisComplete> {
        self.analysis_complete.subscribe()
    }

    /// Bind `buffer`, or add a reference if it is already bound. Returns the
    /// buffer id, the lowest one not in use.
    pub fn add_buffer(&self, buffer: &Arc<TextBuffer>, options: BufferOptions) -> BufferId {
        let mut state = self.state.lock();
        if let Some((&id, existing)) = state
            .buffers
            .iter_mut()
            .find(|(_, b)| b.buffer.instance() == buffer.instance())
        {
            existing.refs += 1;
            return id;
        }

        let id = (0..)
            .map(BufferId::new)
            .find(|id| !state.buffers.contains_key(id))
            .unwrap_or_else(|| BufferId::new(i32::MAX));
        let listener: Weak<dyn BufferListener> = self.this.clone();
        let listener = buffer.subscribe(listener);
        state
            .buffers
            .insert(id, BufferSyncState::new(Arc::clone(buffer), listener, options));
        state.refresh_sync_immediately(self.ctx.sync_immediately);
        tracing::debug!(file = %self.path, buffer = %id, "buffer attached");
        id
    }

    /// Drop one reference to a binding. Returns true when the binding is
    /// gone.
    pub fn remove_buffer(&self, buffer_id: BufferId) -> bool {
        let mut state = self.state.lock();
        let Some(binding) = state.buffers.get_mut(&buffer_id) else {
            return false;
        };
        binding.refs -= 1;
        if binding.refs > 0 {
            return false;
        }
        if let Some(binding) = state.buffers.remove(&buffer_id) {
            binding.buffer.unsubscribe(binding.listener);
        }
        let settled = state.forget_buffer(buffer_id);
        self.ctx.stats.settle(settled);
        state.refresh_sync_immediately(self.ctx.sync_immediately);
        tracing::debug!(file = %self.path, buffer = %buffer_id, "buffer detached");
        true
    }

    pub fn clear_buffers(&self) {
        let mut state = self.state.lock();
        for (_, binding) in std::mem::take(&mut state.buffers) {
            binding.buffer.unsubscribe(binding.listener);
        }
        let settled = state.drain_outstanding();
        self.ctx.stats.settle(settled);
        state.cancel_timer();
        state.refresh_sync_immediately(self.ctx.sync_immediately);
    }

    /// Point an existing binding at a different buffer object. The next sync
    /// of that binding sends the full text.
    pub fn replace_buffer(&self, buffer_id: BufferId, buffer: &Arc<TextBuffer>) -> bool {
        {
            let mut state = self.state.lock();
            let Some(binding) = state.buffers.get_mut(&buffer_id) else {
                return false;
            };
            binding.buffer.unsubscribe(binding.listener);
            let listener: Weak<dyn BufferListener> = self.this.clone();
            binding.listener = buffer.subscribe(listener);
            binding.buffer = Arc::clone(buffer);
            binding.parse.reset();
            binding.analysis.reset();
            binding.tracker.clear();
            let settled = state.forget_buffer(buffer_id);
            self.ctx.stats.settle(settled);
        }
        self.request_sync();
        true
    }

    pub fn set_do_not_sync(&self, buffer_id: BufferId, do_not_sync: bool) {
        if let Some(binding) = self.state.lock().buffers.get_mut(&buffer_id) {
            binding.options.do_not_sync = do_not_sync;
        }
    }

    #[must_use]
    pub fn buffers(&self) -> Vec<BufferId> {
        self.state.lock().buffers.keys().copied().collect()
    }

    /// The buffer whose text the analyzer treats as canonical.
    #[must_use]
    pub fn default_buffer(&self) -> Option<BufferId> {
        self.state.lock().buffers.keys().next().copied()
    }

    #[must_use]
    pub fn buffer(&self, buffer_id: BufferId) -> Option<Arc<TextBuffer>> {
        self.state
            .lock()
            .buffers
            .get(&buffer_id)
            .map(|b| Arc::clone(&b.buffer))
    }

    /// The snapshot of the default buffer most recently sent.
    #[must_use]
    pub fn analysis_cookie(&self) -> Option<Snapshot> {
        self.state.lock().cookie.clone()
    }

    #[must_use]
    pub fn last_sent(&self, buffer_id: BufferId) -> Option<Snapshot> {
        self.state
            .lock()
            .buffers
            .get(&buffer_id)
            .and_then(|b| b.last_sent.clone())
    }

    #[must_use]
    pub fn acknowledged_version(&self, buffer_id: BufferId, kind: AckKind) -> Option<i32> {
        let state = self.state.lock();
        let binding = state.buffers.get(&buffer_id)?;
        match kind {
            AckKind::Parse => binding.parse.acknowledged_version(),
            AckKind::Analysis => binding.analysis.acknowledged_version(),
        }
    }

    /// True while some synced buffer has text the analyzer has not finished
    /// analyzing.
    #[must_use]
    pub fn is_analyzing(&self) -> bool {
        let state = self.state.lock();
        state
            .buffers
            .values()
            .filter(|b| !b.options.do_not_sync)
            .any(|b| b.analysis.acknowledged_version() != Some(b.buffer.current().version()))
    }

    /// Translate `span`, computed by the analyzer against `from_version` of
    /// the buffer, onto `to`.
    #[must_use]
    pub fn translate_span(
        &self,
        buffer_id: BufferId,
        span: SourceSpan,
        from_version: i32,
        to: &Snapshot,
    ) -> SourceSpan {
        let from = self
            .state
            .lock()
            .buffers
            .get(&buffer_id)
            .and_then(|b| b.snapshot_at(from_version));
        if from.is_none() {
            tracing::debug!(file = %self.path, buffer = %buffer_id, from_version, "no snapshot for version; span kept");
        }
        translate::translate_span(span, from.as_ref(), to)
    }

    /// Snapshot of `buffer_id` at `version`, if still reachable.
    #[must_use]
    pub fn snapshot_at(&self, buffer_id: BufferId, version: i32) -> Option<Snapshot> {
        self.state
            .lock()
            .buffers
            .get(&buffer_id)
            .and_then(|b| b.snapshot_at(version))
    }

    /// Schedule a sync outside the debounce timer.
    pub fn request_sync(&self) {
        if let Some(this) = self.this.upgrade() {
            this.on_edit(EditKind::NoTextChange);
        }
    }

    /// Make sure the analyzer has the current text of `buffer_id`, waiting
    /// for any sync already in flight. `force` resends the full text.
    pub async fn ensure_synced(&self, buffer_id: BufferId, force: bool) -> SyncOutcome {
        self.sync(Some(buffer_id), force).await
    }

    fn on_edit(self: &Arc<Self>, kind: EditKind) {
        let action = {
            let mut state = self.state.lock();
            if state.unloaded {
                return;
            }
            let action = state.debouncer.on_edit(kind);
            state.cancel_timer();
            if let DebounceAction::StartTimer { generation, delay } = action {
                // The quiet period runs from the edit, not from when the
                // task is first polled.
                let deadline = tokio::time::Instant::now() + delay;
                let document = Arc::downgrade(self);
                let timer = self.ctx.runtime.spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    if let Some(document) = document.upgrade() {
                        document.on_timer(generation);
                    }
                });
                state.timer = Some(timer.abort_handle());
            }
            action
        };
        tracing::trace!(file = %self.path, ?kind, ?action, "edit");
        if action == DebounceAction::SyncNow {
            self.spawn_sync();
        }
    }

    fn on_timer(self: &Arc<Self>, generation: u64) {
        let fire = {
            let mut state = self.state.lock();
            state.timer = None;
            !state.unloaded && state.debouncer.on_timer(generation)
        };
        if fire {
            self.spawn_sync();
        }
    }

    fn spawn_sync(self: &Arc<Self>) {
        let document = Arc::clone(self);
        self.ctx.runtime.spawn(async move { document.run_debounced_syncs().await });
    }

    async fn run_debounced_syncs(&self) {
        if !self.state.lock().debouncer.begin_sync() {
            return;
        }
        loop {
            self.sync(None, false).await;
            if !self.state.lock().debouncer.finish_sync() {
                break;
            }
        }
    }

    async fn sync(&self, only: Option<BufferId>, force: bool) -> SyncOutcome {
        let _in_flight = self.gate.lock().await;

        let (request, prepared) = {
            let mut state = self.state.lock();
            if state.unloaded {
                return SyncOutcome::Unloaded;
            }
            let default = state.buffers.keys().next().copied();
            let mut prepared = Vec::new();
            for (&id, binding) in &mut state.buffers {
                if only.is_some_and(|only| only != id) {
                    continue;
                }
                if force {
                    binding.last_sent = None;
                }
                if let Some(sync) = binding.prepare(id) {
                    prepared.push((id, sync));
                }
            }
            if prepared.is_empty() {
                return SyncOutcome::UpToDate;
            }
            if let Some((_, sync)) = prepared.iter().find(|(id, _)| Some(*id) == default) {
                state.cookie = Some(sync.target.clone());
            }
            let updates = prepared
                .iter()
                .flat_map(|(_, sync)| sync.updates.iter().cloned())
                .collect();
            let request = FileUpdateRequest {
                file_id: self.file_id,
                updates,
            };
            (request, prepared)
        };

        self.ctx.stats.pending_syncs.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            file = %self.path,
            updates = request.updates.len(),
            reset = request.updates.iter().any(FileUpdate::is_reset),
            "sending file update"
        );
        let result = self.ctx.requester.request(&request).await;

        let mut state = self.state.lock();
        match &result {
            Ok(response) if !response.failed && !state.unloaded => {
                // Buffers detached or replaced while the request was in
                // flight will never be acknowledged for these versions.
                let awaiting: Vec<(BufferId, i32)> = prepared
                    .iter()
                    .filter(|(id, sync)| {
                        state.buffers.get(id).is_some_and(|b| {
                            b.buffer.instance() == sync.target.instance()
                                && b
                                    .parse
                                    .acknowledged_version()
                                    .is_none_or(|parsed| parsed < sync.target.version())
                        })
                    })
                    .map(|(id, sync)| (*id, sync.target.version()))
                    .collect();
                if awaiting.is_empty() {
                    self.ctx.stats.settle(1);
                } else {
                    state.outstanding.push(OutstandingSync { awaiting });
                }
                SyncOutcome::Sent
            }
            outcome => {
                match outcome {
                    Ok(response) if response.failed => {
                        tracing::warn!(file = %self.path, "analyzer failed to apply update");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(file = %self.path, "file update failed: {e}"),
                }
                self.ctx.stats.settle(1);
                for (id, sync) in &prepared {
                    if let Some(binding) = state.buffers.get_mut(id) {
                        binding.rollback(sync);
                    }
                }
                if state.unloaded {
                    SyncOutcome::Unloaded
                } else {
                    SyncOutcome::Failed
                }
            }
        }
    }

    pub(crate) fn publish_parse(&self, buffer_id: BufferId, version: i32) {
        let _ = self.parse_complete.send(ParseComplete {
            file_id: self.file_id,
            buffer_id,
            version,
        });
        self.ctx.progress.notify_waiters();
    }

    pub(crate) fn publish_analysis(&self, buffer_id: BufferId, version: i32) {
        let _ = self.analysis_complete.send(AnalysisComplete {
            file_id: self.file_id,
            buffer_id,
            version,
        });
        self.ctx.progress.notify_waiters();
    }

    /// The analyzer went away: nothing in flight will be acknowledged and
    /// whatever it knew is lost.
    pub(crate) fn analyzer_stopped(&self) {
        let mut state = self.state.lock();
        state.cancel_timer();
        let settled = state.drain_outstanding();
        self.ctx.stats.settle(settled);
        for binding in state.buffers.values_mut() {
            binding.last_sent = None;
            binding.parse.clear_expected();
            binding.analysis.clear_expected();
        }
    }

    /// Detach from every buffer and refuse further syncs.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.unloaded = true;
        state.cancel_timer();
        let settled = state.drain_outstanding();
        self.ctx.stats.settle(settled);
        for (_, binding) in std::mem::take(&mut state.buffers) {
            binding.buffer.unsubscribe(binding.listener);
        }
    }
}

impl BufferListener for Document {
    fn on_buffer_event(&self, buffer: &TextBuffer, event: &BufferEvent) {
        let bound = self.state.lock().buffers.values().any(|b| {
            b.buffer.instance() == buffer.instance() && !b.options.do_not_sync
        });
        if !bound {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            this.on_edit(event.kind());
        }
    }
}
