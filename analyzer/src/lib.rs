//! Analyzer client: keeps an out-of-process analyzer in sync with live text
//! buffers and re-anchors its answers to the caller's snapshot.

pub mod channel;
pub mod codec;
pub mod debounce;
pub mod protocol;
pub mod queue;
pub mod translate;
pub mod types;

pub(crate) mod correlator;
pub(crate) mod document;
pub(crate) mod process;

mod orchestrator;

pub use channel::{ChannelError, RequestChannel, Requester};
pub use correlator::AckKind;
pub use document::{BufferOptions, Document, SyncOutcome};
pub use orchestrator::{
    AnalysisOrchestrator, BufferBinding, Completions, Definition, QuickInfo, Signatures,
};
pub use process::AnalyzerProcess;
pub use queue::{
    Analyzable, AnalysisGroup, AnalysisOutcome, GroupKey, LocalWorkQueue, Priority, QueueError,
    QueueEvent, WorkKey,
};
pub use translate::LocationTracker;
pub use types::{
    AnalysisComplete, AnalyzerConfig, AnalyzerEvent, AnalyzerExited, DocumentPath, EventsConfig,
    OrchestratorConfig, ParseComplete, QueueConfig, StopReason, SyncConfig,
};
