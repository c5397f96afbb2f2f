//! AnalysisOrchestrator facade: the public API consumed by editors.
//!
//! The orchestrator owns the analyzer channel, the registry of documents and
//! the local work queue. Inbound analyzer events are routed to documents by
//! a dispatch task; outbound queries make sure the buffer is synced first and
//! re-anchor every span in the answer to the caller's snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use anchor_types::{BufferId, FileId, Location, Snapshot, SourceSpan, TextBuffer};

use crate::channel::{ChannelError, RequestChannel, Requester};
use crate::correlator::AckKind;
use crate::document::{BufferOptions, Document, SyncContext, SyncOutcome, SyncStats};
use crate::process::AnalyzerProcess;
use crate::protocol::{
    self, AddFileRequest, AnalyzerNotification, AnalyzerRequest, CompletionItem,
    CompletionsRequest, DefinitionsRequest, FileVersionsEvent, LocationQuery, OptionsChanged,
    QuickInfoRequest, SignatureInfo, SignaturesRequest, UnloadFileRequest,
};
use crate::queue::{Analyzable, LocalWorkQueue, Priority};
use crate::translate;
use crate::types::{
    AnalysisComplete, AnalyzerConfig, AnalyzerEvent, AnalyzerExited, DocumentPath,
    OrchestratorConfig, ParseComplete, StopReason,
};

/// A buffer monitored on behalf of a caller.
///
/// Returned by [`AnalysisOrchestrator::monitor`]; hand it back to
/// [`AnalysisOrchestrator::unmonitor`] when done.
#[derive(Debug, Clone)]
pub struct BufferBinding {
    document: Arc<Document>,
    buffer_id: BufferId,
}

impl BufferBinding {
    #[must_use]
    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    #[must_use]
    pub fn buffer_id(&self) -> BufferId {
        self.buffer_id
    }

    #[must_use]
    pub fn file_id(&self) -> FileId {
        self.document.file_id()
    }

    #[must_use]
    pub fn buffer(&self) -> Option<Arc<TextBuffer>> {
        self.document.buffer(self.buffer_id)
    }
}

/// Signature help at a location, spans relative to the caller's snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signatures {
    pub span: Option<SourceSpan>,
    pub active_parameter: Option<usize>,
    pub signatures: Vec<SignatureInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completions {
    /// Span an accepted completion replaces.
    pub span: Option<SourceSpan>,
    pub items: Vec<CompletionItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuickInfo {
    pub span: Option<SourceSpan>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    pub file_id: FileId,
    /// Path of the defining document, when it is one of ours.
    pub path: Option<DocumentPath>,
    pub span: SourceSpan,
    pub name: Option<String>,
}

#[derive(Default)]
struct Registry {
    documents: HashMap<FileId, Arc<Document>>,
    paths: HashMap<DocumentPath, FileId>,
}

struct Inner {
    requester: Requester,
    ctx: Arc<SyncContext>,
    registry: Mutex<Registry>,
    queue: Arc<LocalWorkQueue>,
    queue_stop_timeout: Duration,
    owners: AtomicUsize,
    torn_down: AtomicBool,
    progress: Notify,
    exited: broadcast::Sender<AnalyzerExited>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.requester.cancel_token().cancel();
        if let Some(dispatch) = self.dispatch.get_mut().take() {
            dispatch.abort();
        }
    }
}

/// Keeps one analyzer in sync with every monitored buffer.
///
/// Clones share the same orchestrator. Lifetime is governed by an explicit
/// owner count: construction makes one owner, [`acquire`](Self::acquire)
/// adds one and [`release`](Self::release) tears everything down when the
/// last owner leaves.
#[derive(Clone)]
pub struct AnalysisOrchestrator {
    inner: Arc<Inner>,
}

impl AnalysisOrchestrator {
    /// Spawn the analyzer process and start orchestrating it.
    pub async fn start(analyzer: &AnalyzerConfig, config: OrchestratorConfig) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::channel(config.events.channel_capacity());
        tracing::info!("Starting analyzer '{}'...", analyzer.command());
        let process = AnalyzerProcess::start(analyzer, event_tx)
            .await
            .with_context(|| format!("starting analyzer '{}'", analyzer.command()))?;
        tracing::info!("Analyzer '{}' started successfully", analyzer.command());
        Self::with_channel(Arc::new(process), event_rx, config)
    }

    /// Orchestrate over an existing channel. `events` carries the channel's
    /// inbound notifications and its stop event.
    pub fn with_channel(
        channel: Arc<dyn RequestChannel>,
        events: mpsc::Receiver<AnalyzerEvent>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let runtime = Handle::try_current().context("orchestrator needs a tokio runtime")?;
        let cancel = CancellationToken::new();
        let queue = LocalWorkQueue::start(cancel.child_token()).context("starting work queue")?;
        let requester = Requester::new(channel, cancel);
        let ctx = Arc::new(SyncContext {
            requester: requester.clone(),
            runtime: runtime.clone(),
            quiet_period: config.sync.quiet_period(),
            sync_immediately: config.sync.sync_immediately(),
            channel_capacity: config.events.channel_capacity(),
            stats: Arc::new(SyncStats::default()),
            progress: Notify::new(),
        });
        let (exited, _) = broadcast::channel(config.events.channel_capacity());

        let inner = Arc::new(Inner {
            requester,
            ctx,
            registry: Mutex::new(Registry::default()),
            queue: Arc::new(queue),
            queue_stop_timeout: config.queue.stop_timeout(),
            owners: AtomicUsize::new(1),
            torn_down: AtomicBool::new(false),
            progress: Notify::new(),
            exited,
            dispatch: Mutex::new(None),
        });

        let dispatch = runtime.spawn(dispatch_events(Arc::downgrade(&inner), events));
        *inner.dispatch.lock() = Some(dispatch);
        Ok(Self { inner })
    }

    // ------------------------------------------------------------------
    // Registry

    /// The document for `path`, registering it with the analyzer first if
    /// needed. `None` if the analyzer could not be reached.
    pub async fn analyze_file(&self, path: DocumentPath) -> Option<Arc<Document>> {
        if let Some(document) = self.get_document(&path) {
            return Some(document);
        }

        let uri = match &path {
            DocumentPath::File(file) => match protocol::path_to_file_uri(file) {
                Ok(uri) => Some(uri.to_string()),
                Err(e) => {
                    tracing::debug!("{e}; registering without a URI");
                    None
                }
            },
            DocumentPath::Synthetic(_) => None,
        };
        let request = AddFileRequest {
            path: path.to_string(),
            uri,
        };
        let response = self.send_request(&request).await?;

        let (document, duplicate) = {
            let mut registry = self.inner.registry.lock();
            if let Some(existing) = registry
                .paths
                .get(&path)
                .and_then(|id| registry.documents.get(id))
            {
                (Arc::clone(existing), true)
            } else {
                let document = Document::new(response.file_id, path.clone(), Arc::clone(&self.inner.ctx));
                registry.paths.insert(path, response.file_id);
                registry
                    .documents
                    .insert(response.file_id, Arc::clone(&document));
                (document, false)
            }
        };

        if duplicate {
            // Lost a race with a concurrent registration of the same path.
            if document.file_id() != response.file_id {
                let unload = UnloadFileRequest {
                    file_id: response.file_id,
                };
                let _ = self.send_request(&unload).await;
            }
        } else {
            tracing::debug!(file = %document.path(), file_id = %document.file_id(), "document registered");
        }
        Some(document)
    }

    #[must_use]
    pub fn get_document(&self, path: &DocumentPath) -> Option<Arc<Document>> {
        let registry = self.inner.registry.lock();
        registry
            .paths
            .get(path)
            .and_then(|id| registry.documents.get(id))
            .cloned()
    }

    #[must_use]
    pub fn get_document_by_id(&self, file_id: FileId) -> Option<Arc<Document>> {
        self.inner.registry.lock().documents.get(&file_id).cloned()
    }

    #[must_use]
    pub fn documents(&self) -> Vec<Arc<Document>> {
        let mut documents: Vec<_> = self.inner.registry.lock().documents.values().cloned().collect();
        documents.sort_by_key(|d| d.file_id());
        documents
    }

    /// Forget `document` and tell the analyzer to drop it.
    pub async fn unload_file(&self, document: &Arc<Document>) {
        let removed = {
            let mut registry = self.inner.registry.lock();
            let removed = registry.documents.remove(&document.file_id());
            if removed.is_some() {
                registry.paths.remove(document.path());
            }
            removed
        };
        let Some(document) = removed else {
            return;
        };
        document.close();
        self.inner.progress.notify_waiters();
        tracing::debug!(file = %document.path(), "document unloaded");

        let request = UnloadFileRequest {
            file_id: document.file_id(),
        };
        let _ = self.send_request(&request).await;
    }

    // ------------------------------------------------------------------
    // Buffers

    /// Start tracking `buffer` as (one of) the text of `path`. The first
    /// sync is scheduled immediately unless `options.do_not_sync` is set.
    pub async fn monitor(
        &self,
        buffer: &Arc<TextBuffer>,
        path: DocumentPath,
        options: BufferOptions,
    ) -> Option<BufferBinding> {
        let document = self.analyze_file(path).await?;
        let buffer_id = document.add_buffer(buffer, options);
        if !options.do_not_sync {
            document.request_sync();
        }
        Some(BufferBinding { document, buffer_id })
    }

    /// Release a binding. The document is unloaded once its last buffer is
    /// gone.
    pub async fn unmonitor(&self, binding: BufferBinding) {
        let document = binding.document;
        if document.remove_buffer(binding.buffer_id) && document.buffers().is_empty() {
            self.unload_file(&document).await;
        }
    }

    /// Push the current text of `binding` now, bypassing the debounce timer.
    pub async fn ensure_synced(&self, binding: &BufferBinding, force: bool) -> SyncOutcome {
        binding.document.ensure_synced(binding.buffer_id, force).await
    }

    // ------------------------------------------------------------------
    // Raw protocol access

    /// Send a typed request. Transport failures, cancellation and error
    /// replies are logged and become `None`.
    pub async fn send_request<R: AnalyzerRequest>(&self, request: &R) -> Option<R::Response> {
        match self.inner.requester.request(request).await {
            Ok(response) => Some(response),
            Err(ChannelError::Cancelled) => {
                tracing::debug!(method = R::METHOD, "request cancelled");
                None
            }
            Err(e) => {
                tracing::warn!(method = R::METHOD, "analyzer request failed: {e}");
                None
            }
        }
    }

    pub async fn send_event<E: AnalyzerNotification>(&self, event: &E) -> bool {
        match self.inner.requester.notify(event).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(method = E::METHOD, "analyzer notification failed: {e}");
                false
            }
        }
    }

    /// Tell the analyzer the interpreter changed and resend every buffer in
    /// full.
    pub async fn notify_options_changed(
        &self,
        interpreter_id: Option<String>,
        language_version: Option<String>,
    ) {
        let event = OptionsChanged {
            interpreter_id,
            language_version,
        };
        if !self.send_event(&event).await {
            return;
        }
        for document in self.documents() {
            for buffer_id in document.buffers() {
                document.ensure_synced(buffer_id, true).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries

    /// Sync `binding` and build the query for `location`, which is relative
    /// to `snapshot`.
    async fn locate(
        &self,
        binding: &BufferBinding,
        snapshot: &Snapshot,
        location: Location,
    ) -> Option<LocationQuery> {
        let document = &binding.document;
        match document.ensure_synced(binding.buffer_id, false).await {
            SyncOutcome::UpToDate | SyncOutcome::Sent => {}
            outcome => {
                tracing::debug!(file = %document.path(), ?outcome, "buffer not synced; query skipped");
                return None;
            }
        }
        let Some(sent) = document.last_sent(binding.buffer_id) else {
            tracing::debug!(file = %document.path(), buffer = %binding.buffer_id, "buffer never sent; query skipped");
            return None;
        };
        Some(LocationQuery {
            file_id: document.file_id(),
            buffer_id: binding.buffer_id,
            version: sent.version(),
            location: translate::translate_location(location, Some(snapshot), &sent),
        })
    }

    fn reanchor(
        binding: &BufferBinding,
        span: Option<SourceSpan>,
        version: i32,
        snapshot: &Snapshot,
    ) -> Option<SourceSpan> {
        span.map(|span| {
            binding
                .document
                .translate_span(binding.buffer_id, span, version, snapshot)
        })
    }

    pub async fn get_signatures(
        &self,
        binding: &BufferBinding,
        snapshot: &Snapshot,
        location: Location,
    ) -> Option<Signatures> {
        let query = self.locate(binding, snapshot, location).await?;
        let response = self.send_request(&SignaturesRequest(query)).await?;
        Some(Signatures {
            span: Self::reanchor(binding, response.span, response.version, snapshot),
            active_parameter: response.active_parameter,
            signatures: response.signatures,
        })
    }

    pub async fn get_completions(
        &self,
        binding: &BufferBinding,
        snapshot: &Snapshot,
        location: Location,
    ) -> Option<Completions> {
        let query = self.locate(binding, snapshot, location).await?;
        let response = self.send_request(&CompletionsRequest(query)).await?;
        Some(Completions {
            span: Self::reanchor(binding, response.span, response.version, snapshot),
            items: response.completions,
        })
    }

    pub async fn get_quick_info(
        &self,
        binding: &BufferBinding,
        snapshot: &Snapshot,
        location: Location,
    ) -> Option<QuickInfo> {
        let query = self.locate(binding, snapshot, location).await?;
        let response = self.send_request(&QuickInfoRequest(query)).await?;
        Some(QuickInfo {
            span: Self::reanchor(binding, response.span, response.version, snapshot),
            text: response.text,
        })
    }

    /// Definitions of the symbol at `location`. Spans inside the queried
    /// file are re-anchored; spans in other files are left as reported.
    pub async fn get_definitions(
        &self,
        binding: &BufferBinding,
        snapshot: &Snapshot,
        location: Location,
    ) -> Option<Vec<Definition>> {
        let query = self.locate(binding, snapshot, location).await?;
        let response = self.send_request(&DefinitionsRequest(query)).await?;
        let definitions = response
            .definitions
            .into_iter()
            .map(|definition| {
                let local = definition.file_id == binding.file_id();
                let span = if local {
                    binding.document.translate_span(
                        binding.buffer_id,
                        definition.span,
                        response.version,
                        snapshot,
                    )
                } else {
                    definition.span
                };
                Definition {
                    file_id: definition.file_id,
                    path: self
                        .get_document_by_id(definition.file_id)
                        .map(|d| d.path().clone()),
                    span,
                    name: definition.name,
                }
            })
            .collect();
        Some(definitions)
    }

    // ------------------------------------------------------------------
    // Notifications

    #[must_use]
    pub fn on_parse_complete(&self, document: &Document) -> broadcast::Receiver<ParseComplete> {
        document.on_parse_complete()
    }

    #[must_use]
    pub fn on_analysis_complete(
        &self,
        document: &Document,
    ) -> broadcast::Receiver<AnalysisComplete> {
        document.on_analysis_complete()
    }

    #[must_use]
    pub fn on_analyzer_exited(&self) -> broadcast::Receiver<AnalyzerExited> {
        self.inner.exited.subscribe()
    }

    // ------------------------------------------------------------------
    // Local work

    pub fn enqueue_local(&self, item: Arc<dyn Analyzable>, priority: Priority) {
        self.inner.queue.enqueue(item, priority);
    }

    #[must_use]
    pub fn queue(&self) -> &LocalWorkQueue {
        &self.inner.queue
    }

    // ------------------------------------------------------------------
    // Progress

    /// True while any document has text the analyzer has not finished
    /// analyzing, or local work is queued or running.
    #[must_use]
    pub fn is_analyzing(&self) -> bool {
        self.inner.queue.is_analyzing()
            || self
                .inner
                .registry
                .lock()
                .documents
                .values()
                .any(|d| d.is_analyzing())
    }

    /// Sync requests sent and not yet parsed.
    #[must_use]
    pub fn pending_syncs(&self) -> usize {
        self.inner.ctx.stats.pending_syncs.load(Ordering::SeqCst)
    }

    /// Acknowledgements discarded as older than one already applied.
    #[must_use]
    pub fn stale_responses(&self) -> u64 {
        self.inner.ctx.stats.stale_responses.load(Ordering::Relaxed)
    }

    /// Wait until nothing is analyzing. Returns false on timeout.
    pub async fn wait_for_complete_analysis(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut drained = self.inner.queue.subscribe();
        loop {
            let acknowledged = self.inner.ctx.progress.notified();
            let unloaded = self.inner.progress.notified();
            if !self.is_analyzing() {
                return true;
            }
            tokio::select! {
                () = acknowledged => {}
                () = unloaded => {}
                _ = drained.recv() => {}
                () = tokio::time::sleep_until(deadline) => return !self.is_analyzing(),
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifetime

    /// Add an owner. Returns false if the orchestrator was already torn
    /// down.
    pub fn acquire(&self) -> bool {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.owners.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Drop an owner; the last one tears down the queue, the documents and
    /// the analyzer.
    pub async fn release(&self) {
        let previous = self
            .inner
            .owners
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.teardown().await;
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inner.torn_down.load(Ordering::SeqCst)
    }

    async fn teardown(&self) {
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down analysis orchestrator...");
        self.inner.requester.cancel_token().cancel();

        let documents: Vec<_> = {
            let mut registry = self.inner.registry.lock();
            registry.paths.clear();
            registry.documents.drain().map(|(_, d)| d).collect()
        };
        for document in documents {
            document.close();
        }

        let queue = Arc::clone(&self.inner.queue);
        let timeout = self.inner.queue_stop_timeout;
        match tokio::task::spawn_blocking(move || queue.stop(timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("work queue did not stop cleanly: {e}"),
            Err(e) => tracing::warn!("work queue stop task failed: {e}"),
        }

        self.inner.requester.channel().shutdown().await;
        if let Some(dispatch) = self.inner.dispatch.lock().take() {
            dispatch.abort();
        }
        self.inner.progress.notify_waiters();
    }
}

/// Route inbound analyzer events until the channel closes or the
/// orchestrator goes away.
async fn dispatch_events(inner: Weak<Inner>, mut events: mpsc::Receiver<AnalyzerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        handle_event(&inner, event);
    }
}

fn handle_event(inner: &Inner, event: AnalyzerEvent) {
    match event {
        AnalyzerEvent::Notification { method, params } => {
            let kind = match method.as_str() {
                protocol::FILE_PARSED => AckKind::Parse,
                protocol::ANALYSIS_COMPLETE => AckKind::Analysis,
                _ => {
                    tracing::trace!(%method, "ignoring analyzer notification");
                    return;
                }
            };
            let payload: FileVersionsEvent =
                match serde_json::from_value(params.unwrap_or(Value::Null)) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(%method, "malformed analyzer notification: {e}");
                        return;
                    }
                };
            let document = inner
                .registry
                .lock()
                .documents
                .get(&payload.file_id)
                .cloned();
            match document {
                Some(document) => document.correlate(kind, &payload),
                None => tracing::error!(
                    %method,
                    file_id = %payload.file_id,
                    "acknowledgement for unknown file"
                ),
            }
        }
        AnalyzerEvent::Stopped { reason } => {
            match &reason {
                StopReason::Exited { code: Some(0), .. } => tracing::info!("analyzer exited"),
                StopReason::Exited { code, stderr } => {
                    tracing::warn!(?code, "analyzer exited unexpectedly");
                    if !stderr.is_empty() {
                        tracing::warn!("analyzer stderr:\n{stderr}");
                    }
                }
                StopReason::Failed(msg) => {
                    tracing::warn!(error = %msg, "analyzer failed");
                }
            }
            // Nothing in flight will be answered now.
            inner.requester.end_session();
            let documents: Vec<_> = inner.registry.lock().documents.values().cloned().collect();
            for document in documents {
                document.analyzer_stopped();
            }
            let _ = inner.exited.send(AnalyzerExited { reason });
            inner.progress.notify_waiters();
        }
    }
}
