//! The analyzer child process and its JSON-RPC transport.
//!
//! One writer task owns stdin, one reader task owns stdout and resolves
//! pending requests, and one task drains stderr into the log and a bounded
//! tail that is reported if the process dies.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channel::{ChannelError, RequestChannel};
use crate::codec::{FrameReader, FrameWriter};
use crate::protocol::{
    AnalyzerNotification, AnalyzerRequest, Exit, InitializeRequest, InitializeResponse,
    Initialized, Notification, Request, ResponseError, ShutdownRequest,
};
use crate::types::{AnalyzerConfig, AnalyzerEvent, StopReason};

const INIT_TIMEOUT: Duration = Duration::from_secs(30);

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for stderr to drain after stdout closed.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const WRITER_CHANNEL_CAPACITY: usize = 64;

const STDERR_TAIL_LINES: usize = 200;

const METHOD_NOT_FOUND: i64 = -32601;

enum WriterCommand {
    Send(Value),
    Shutdown,
}

enum IncomingFrame {
    Response { id: u64, body: Value },
    ServerRequest { id: Value, method: String },
    Notification { method: String, params: Option<Value> },
}

fn parse_incoming(frame: &Value) -> Option<IncomingFrame> {
    let id = frame.get("id");
    let method = frame.get("method").and_then(Value::as_str).map(String::from);
    let is_response = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, is_response) {
        (Some(id), None, true) => Some(IncomingFrame::Response {
            id: id.as_u64()?,
            body: frame.clone(),
        }),
        (Some(id), Some(method), _) => Some(IncomingFrame::ServerRequest {
            id: id.clone(),
            method,
        }),
        (None, Some(method), _) => Some(IncomingFrame::Notification {
            method,
            params: frame.get("params").cloned(),
        }),
        _ => None,
    }
}

struct PendingRequest {
    method: &'static str,
    reply: oneshot::Sender<Result<Value, ChannelError>>,
}

/// Requests awaiting a response. Once `closed` is set no new entries are
/// accepted, so nothing can wait on a reader that has already exited.
#[derive(Default)]
struct PendingRequests {
    closed: bool,
    requests: HashMap<u64, PendingRequest>,
}

impl PendingRequests {
    fn close(&mut self) {
        self.closed = true;
        for (_, request) in self.requests.drain() {
            let _ = request.reply.send(Err(ChannelError::Closed));
        }
    }
}

type SharedPending = Arc<Mutex<PendingRequests>>;

/// Removes the pending entry if the request future is dropped early.
struct PendingGuard<'a> {
    pending: &'a Mutex<PendingRequests>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().requests.remove(&self.id);
    }
}

fn into_result(method: &'static str, body: &Value) -> Result<Value, ChannelError> {
    if let Some(error) = body.get("error") {
        let error: ResponseError =
            serde_json::from_value(error.clone()).map_err(|e| ChannelError::Malformed {
                method,
                detail: format!("bad error object: {e}"),
            })?;
        return Err(ChannelError::Rejected {
            method,
            code: error.code,
            message: error.message,
        });
    }
    Ok(body.get("result").cloned().unwrap_or(Value::Null))
}

/// Last lines the analyzer wrote to stderr.
#[derive(Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
}

impl StderrTail {
    fn push(&mut self, line: String) {
        if self.lines.len() == STDERR_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn joined(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

pub struct AnalyzerProcess {
    name: String,
    child: Arc<tokio::sync::Mutex<Option<Child>>>,
    writer_tx: mpsc::Sender<WriterCommand>,
    next_id: AtomicU64,
    pending: SharedPending,
    shut_down: AtomicBool,
    #[allow(dead_code)]
    reader_handle: JoinHandle<()>,
    #[allow(dead_code)]
    writer_handle: JoinHandle<()>,
}

impl AnalyzerProcess {
    /// Spawn the analyzer and complete the `initialize` handshake.
    pub async fn start(config: &AnalyzerConfig, event_tx: mpsc::Sender<AnalyzerEvent>) -> Result<Self> {
        let resolved = which::which(config.command())
            .with_context(|| format!("{} not found in PATH", config.command()))?;
        let mut child = Command::new(&resolved)
            .args(config.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", config.command()))?;

        let stdin = child.stdin.take().context("no stdin from analyzer")?;
        let stdout = child.stdout.take().context("no stdout from analyzer")?;
        let stderr = child.stderr.take().context("no stderr from analyzer")?;

        let name = config.command().to_string();
        let pending: SharedPending = Arc::default();
        let tail = Arc::new(Mutex::new(StderrTail::default()));
        let child = Arc::new(tokio::sync::Mutex::new(Some(child)));

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_name = name.clone();
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(stdin);
            while let Some(command) = writer_rx.recv().await {
                match command {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!(analyzer = %writer_name, "write failed: {e:#}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
        });

        let stderr_tail = Arc::clone(&tail);
        let stderr_name = name.clone();
        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(analyzer = %stderr_name, "stderr: {line}");
                stderr_tail.lock().push(line);
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_writer_tx = writer_tx.clone();
        let reader_child = Arc::clone(&child);
        let reader_name = name.clone();
        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(stdout);
            let outcome = loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => {
                        Self::dispatch_frame(
                            &frame,
                            &reader_pending,
                            &event_tx,
                            &reader_writer_tx,
                            &reader_name,
                        )
                        .await;
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            };

            reader_pending.lock().close();
            let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, stderr_handle).await;

            let reason = match outcome {
                Ok(()) => {
                    let code = collect_exit_code(&reader_child).await;
                    let stderr = tail.lock().joined();
                    tracing::info!(analyzer = %reader_name, ?code, "analyzer closed its output");
                    StopReason::Exited { code, stderr }
                }
                Err(e) => {
                    tracing::warn!(analyzer = %reader_name, "analyzer read failed: {e:#}");
                    StopReason::Failed(format!("{e:#}"))
                }
            };
            let _ = event_tx.send(AnalyzerEvent::Stopped { reason }).await;
        });

        let process = Self {
            name,
            child,
            writer_tx,
            next_id: AtomicU64::new(1),
            pending,
            shut_down: AtomicBool::new(false),
            reader_handle,
            writer_handle,
        };
        process.initialize(config).await?;
        Ok(process)
    }

    async fn dispatch_frame(
        frame: &Value,
        pending: &Mutex<PendingRequests>,
        event_tx: &mpsc::Sender<AnalyzerEvent>,
        writer_tx: &mpsc::Sender<WriterCommand>,
        name: &str,
    ) {
        let Some(incoming) = parse_incoming(frame) else {
            tracing::trace!(analyzer = %name, "ignoring malformed frame");
            return;
        };

        match incoming {
            IncomingFrame::Response { id, body } => {
                let request = pending.lock().requests.remove(&id);
                match request {
                    Some(request) => {
                        let _ = request.reply.send(into_result(request.method, &body));
                    }
                    None => tracing::trace!(analyzer = %name, id, "response for unknown request"),
                }
            }
            IncomingFrame::ServerRequest { id, method } => {
                tracing::debug!(analyzer = %name, %method, "unsupported request from analyzer");
                let response = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": METHOD_NOT_FOUND,
                        "message": format!("Method not found: {method}")
                    }
                });
                let _ = writer_tx.send(WriterCommand::Send(response)).await;
            }
            IncomingFrame::Notification { method, params } => {
                tracing::trace!(analyzer = %name, %method, "notification");
                let _ = event_tx
                    .send(AnalyzerEvent::Notification { method, params })
                    .await;
            }
        }
    }

    async fn initialize(&self, config: &AnalyzerConfig) -> Result<()> {
        let request = InitializeRequest {
            process_id: std::process::id(),
            interpreter_id: config.interpreter_id().map(String::from),
            language_version: config.language_version().map(String::from),
        };
        let params = serde_json::to_value(&request).context("encoding initialize params")?;
        let result = tokio::time::timeout(
            INIT_TIMEOUT,
            self.send_request(InitializeRequest::METHOD, params),
        )
        .await
        .context("initialize timed out")?
        .context("initialize failed")?;

        let response: InitializeResponse =
            serde_json::from_value(result).context("decoding initialize response")?;
        if let Some(error) = response.error {
            bail!("analyzer refused to initialize: {error}");
        }

        self.send_event(Initialized::METHOD, serde_json::json!({}))
            .await
            .context("sending initialized")?;
        tracing::info!(analyzer = %self.name, "analyzer initialized");
        Ok(())
    }

    async fn send_frame(&self, frame: Value) -> Result<(), ChannelError> {
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| ChannelError::Closed)
    }
}

async fn collect_exit_code(child: &tokio::sync::Mutex<Option<Child>>) -> Option<i32> {
    let mut child = child.lock().await;
    let child = child.as_mut()?;
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            tracing::debug!("waiting for analyzer exit failed: {e}");
            None
        }
        Err(_) => None,
    }
}

#[async_trait]
impl RequestChannel for AnalyzerProcess {
    async fn send_request(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<Value, ChannelError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(ChannelError::Closed);
            }
            pending
                .requests
                .insert(id, PendingRequest { method, reply });
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let frame = serde_json::to_value(Request::new(id, method, Some(params))).map_err(|e| {
            ChannelError::Malformed {
                method,
                detail: e.to_string(),
            }
        })?;
        self.send_frame(frame).await?;
        rx.await.map_err(|_| ChannelError::Closed)?
    }

    async fn send_event(&self, method: &'static str, params: Value) -> Result<(), ChannelError> {
        let frame = serde_json::to_value(Notification::new(method, Some(params))).map_err(|e| {
            ChannelError::Malformed {
                method,
                detail: e.to_string(),
            }
        })?;
        self.send_frame(frame).await
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let polite = tokio::time::timeout(
            SHUTDOWN_TIMEOUT,
            self.send_request(ShutdownRequest::METHOD, serde_json::json!({})),
        )
        .await;
        if matches!(polite, Ok(Ok(_))) {
            let _ = self.send_event(Exit::METHOD, serde_json::json!({})).await;
        }
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await.is_err() {
            tracing::debug!(analyzer = %self.name, "analyzer didn't exit in time, killing");
            let _ = child.kill().await;
        }
    }
}
