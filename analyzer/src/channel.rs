//! Request/response seam between the orchestrator and the analyzer.
//!
//! [`RequestChannel`] is untyped (method name plus JSON params) so it can be
//! implemented by the child-process transport and by test doubles alike.
//! [`Requester`] layers typed requests and cancellation on top.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::protocol::{AnalyzerNotification, AnalyzerRequest};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The analyzer is gone or the transport was shut down.
    #[error("analyzer channel is closed")]
    Closed,
    /// The caller's cancellation token fired first.
    #[error("request was cancelled")]
    Cancelled,
    /// The analyzer answered with a JSON-RPC error.
    #[error("analyzer rejected `{method}` ({code}): {message}")]
    Rejected {
        method: &'static str,
        code: i64,
        message: String,
    },
    /// The answer did not have the expected shape.
    #[error("malformed response to `{method}`: {detail}")]
    Malformed {
        method: &'static str,
        detail: String,
    },
    #[error("failed to write to analyzer: {0}")]
    Io(String),
}

impl ChannelError {
    /// True when the analyzer can no longer be reached at all.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Closed | Self::Io(_))
    }
}

#[async_trait]
pub trait RequestChannel: Send + Sync {
    /// Send a request and wait for its result. There is no timeout here;
    /// callers that need one race the future themselves.
    async fn send_request(&self, method: &'static str, params: Value)
    -> Result<Value, ChannelError>;

    /// Send a notification; no reply is expected.
    async fn send_event(&self, method: &'static str, params: Value) -> Result<(), ChannelError>;

    /// Ask the analyzer to exit and release the transport.
    async fn shutdown(&self) {}
}

/// Typed, cancellable access to a [`RequestChannel`].
///
/// Requests run inside a session: a child of the root token. Ending the
/// session resolves every request in flight as cancelled while later
/// requests start a new one. Cancelling the root ends everything for good.
#[derive(Clone)]
pub struct Requester {
    channel: Arc<dyn RequestChannel>,
    cancel: CancellationToken,
    session: Arc<Mutex<CancellationToken>>,
}

impl Requester {
    pub fn new(channel: Arc<dyn RequestChannel>, cancel: CancellationToken) -> Self {
        let session = Arc::new(Mutex::new(cancel.child_token()));
        Self {
            channel,
            cancel,
            session,
        }
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel the requests of the current session and start a new one.
    pub fn end_session(&self) {
        let mut session = self.session.lock();
        session.cancel();
        *session = self.cancel.child_token();
    }

    fn session(&self) -> CancellationToken {
        self.session.lock().clone()
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<dyn RequestChannel> {
        &self.channel
    }

    pub async fn request<R: AnalyzerRequest>(
        &self,
        request: &R,
    ) -> Result<R::Response, ChannelError> {
        let params = serde_json::to_value(request).map_err(|e| ChannelError::Malformed {
            method: R::METHOD,
            detail: format!("cannot encode params: {e}"),
        })?;
        let session = self.session();
        if session.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }
        let result = tokio::select! {
            biased;
            () = session.cancelled() => return Err(ChannelError::Cancelled),
            result = self.channel.send_request(R::METHOD, params) => result?,
        };
        serde_json::from_value(result).map_err(|e| ChannelError::Malformed {
            method: R::METHOD,
            detail: e.to_string(),
        })
    }

    pub async fn notify<E: AnalyzerNotification>(&self, event: &E) -> Result<(), ChannelError> {
        let params = serde_json::to_value(event).map_err(|e| ChannelError::Malformed {
            method: E::METHOD,
            detail: format!("cannot encode params: {e}"),
        })?;
        if self.cancel.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }
        self.channel.send_event(E::METHOD, params).await
    }
}
