//! Shared test utilities and fixtures
//!
//! `MockChannel` stands in for the analyzer process. It answers requests the
//! way the analyzer would, keeps its own copy of every buffer by applying the
//! updates it receives, and lets tests inject acknowledgements or a crash.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use anchor_analyzer::{
    AnalysisOrchestrator, AnalyzerEvent, ChannelError, DocumentPath, OrchestratorConfig,
    RequestChannel, StopReason,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;

/// One request or notification as the mock saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: &'static str,
    pub params: Value,
    pub at: Instant,
}

pub struct MockChannel {
    events: mpsc::Sender<AnalyzerEvent>,
    requests: Mutex<Vec<Recorded>>,
    notifications: Mutex<Vec<Recorded>>,
    /// Buffer text as the analyzer would have it, keyed by (file, buffer).
    texts: Mutex<HashMap<(i64, i64), String>>,
    replies: Mutex<HashMap<&'static str, Value>>,
    next_file_id: AtomicI32,
    /// Answer every accepted update with `fileParsed` and
    /// `analysisComplete` for the versions it carried.
    pub auto_ack: AtomicBool,
    pub fail_updates: AtomicBool,
    pub reject_updates: AtomicBool,
    pub shut_down: AtomicBool,
    /// Updates wait for a permit when set.
    hold: Mutex<Option<Arc<Semaphore>>>,
}

impl MockChannel {
    pub fn new(events: mpsc::Sender<AnalyzerEvent>) -> Self {
        Self {
            events,
            requests: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            texts: Mutex::new(HashMap::new()),
            replies: Mutex::new(HashMap::new()),
            next_file_id: AtomicI32::new(1),
            auto_ack: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
            reject_updates: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            hold: Mutex::new(None),
        }
    }

    pub fn requests(&self, method: &str) -> Vec<Recorded> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == method)
            .cloned()
            .collect()
    }

    /// Params of every `fileUpdate` received so far.
    pub fn updates(&self) -> Vec<Value> {
        self.requests("fileUpdate")
            .into_iter()
            .map(|r| r.params)
            .collect()
    }

    pub fn notifications(&self, method: &str) -> Vec<Value> {
        self.notifications
            .lock()
            .iter()
            .filter(|r| r.method == method)
            .map(|r| r.params.clone())
            .collect()
    }

    pub fn text(&self, file_id: i32, buffer_id: i32) -> Option<String> {
        self.texts
            .lock()
            .get(&(i64::from(file_id), i64::from(buffer_id)))
            .cloned()
    }

    pub fn reply_with(&self, method: &'static str, reply: Value) {
        self.replies.lock().insert(method, reply);
    }

    /// Make `fileUpdate` wait until [`release_updates`] hands out permits.
    ///
    /// [`release_updates`]: MockChannel::release_updates
    pub fn hold_updates(&self) {
        *self.hold.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_updates(&self, count: usize) {
        if let Some(hold) = self.hold.lock().as_ref() {
            hold.add_permits(count);
        }
    }

    pub async fn parsed(&self, file_id: i32, buffer_id: i32, version: i32) {
        self.emit("fileParsed", file_id, buffer_id, version).await;
    }

    pub async fn analyzed(&self, file_id: i32, buffer_id: i32, version: i32) {
        self.emit("analysisComplete", file_id, buffer_id, version).await;
    }

    async fn emit(&self, method: &str, file_id: i32, buffer_id: i32, version: i32) {
        let params = json!({
            "fileId": file_id,
            "buffers": [{"bufferId": buffer_id, "version": version}],
        });
        self.events
            .send(AnalyzerEvent::Notification {
                method: method.to_string(),
                params: Some(params),
            })
            .await
            .unwrap();
    }

    /// Simulate the analyzer process dying.
    pub async fn crash(&self) {
        self.texts.lock().clear();
        self.events
            .send(AnalyzerEvent::Stopped {
                reason: StopReason::Exited {
                    code: Some(1),
                    stderr: "Segmentation fault".to_string(),
                },
            })
            .await
            .unwrap();
    }

    fn apply_update(&self, params: &Value) -> Vec<(i64, i64)> {
        let file_id = params["fileId"].as_i64().unwrap();
        let mut texts = self.texts.lock();
        let mut acknowledged = Vec::new();
        for update in params["updates"].as_array().unwrap() {
            let buffer_id = update["bufferId"].as_i64().unwrap();
            let version = update["version"].as_i64().unwrap();
            let key = (file_id, buffer_id);
            match update["kind"].as_str().unwrap() {
                "reset" => {
                    texts.insert(key, update["content"].as_str().unwrap().to_string());
                }
                "changes" => {
                    let text = texts.get_mut(&key).expect("changes before reset");
                    let mut chars: Vec<char> = text.chars().collect();
                    for change in update["changes"].as_array().unwrap() {
                        let start = change["start"].as_u64().unwrap() as usize;
                        let removed = change["removed"].as_u64().unwrap() as usize;
                        let inserted = change["text"].as_str().unwrap();
                        chars.splice(start..start + removed, inserted.chars());
                    }
                    *text = chars.into_iter().collect();
                }
                other => panic!("unknown update kind {other}"),
            }
            acknowledged.retain(|&(id, _)| id != buffer_id);
            acknowledged.push((buffer_id, version));
        }
        acknowledged
    }
}

#[async_trait]
impl RequestChannel for MockChannel {
    async fn send_request(&self, method: &'static str, params: Value) -> Result<Value, ChannelError> {
        self.requests.lock().push(Recorded {
            method,
            params: params.clone(),
            at: Instant::now(),
        });
        match method {
            "addFile" => Ok(json!({"fileId": self.next_file_id.fetch_add(1, Ordering::SeqCst)})),
            "fileUpdate" => {
                let hold = self.hold.lock().clone();
                if let Some(hold) = hold {
                    hold.acquire().await.map_err(|_| ChannelError::Closed)?.forget();
                }
                if self.fail_updates.load(Ordering::SeqCst) {
                    return Err(ChannelError::Closed);
                }
                if self.reject_updates.load(Ordering::SeqCst) {
                    return Ok(json!({"failed": true}));
                }
                let applied = self.apply_update(&params);
                if self.auto_ack.load(Ordering::SeqCst) {
                    let file_id = params["fileId"].as_i64().unwrap() as i32;
                    for (buffer_id, version) in applied {
                        self.parsed(file_id, buffer_id as i32, version as i32).await;
                        self.analyzed(file_id, buffer_id as i32, version as i32).await;
                    }
                }
                Ok(json!({}))
            }
            _ => Ok(self.replies.lock().get(method).cloned().unwrap_or_else(|| json!({}))),
        }
    }

    async fn send_event(&self, method: &'static str, params: Value) -> Result<(), ChannelError> {
        self.notifications.lock().push(Recorded {
            method,
            params,
            at: Instant::now(),
        });
        Ok(())
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

pub fn harness(config: OrchestratorConfig) -> (AnalysisOrchestrator, Arc<MockChannel>) {
    let (events_tx, events_rx) = mpsc::channel(256);
    let mock = Arc::new(MockChannel::new(events_tx));
    let orchestrator = AnalysisOrchestrator::with_channel(mock.clone(), events_rx, config).unwrap();
    (orchestrator, mock)
}

pub fn scratch(name: &str) -> DocumentPath {
    DocumentPath::Synthetic(name.to_string())
}

/// Let every spawned task run to quiescence. Under a paused clock this also
/// advances time by one millisecond.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
