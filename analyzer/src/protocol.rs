//! Wire messages exchanged with the analyzer.
//!
//! The envelope is JSON-RPC 2.0. Payloads use camelCase field names. Every
//! request type implements [`AnalyzerRequest`], which ties the method name
//! to the response type so callers never match on strings.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use anchor_types::{BufferId, FileId, Location, SourceSpan};

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

/// A request with a typed response.
pub trait AnalyzerRequest: Serialize + Send + Sync {
    const METHOD: &'static str;
    type Response: DeserializeOwned + Send;
}

/// A one-way message to the analyzer.
pub trait AnalyzerNotification: Serialize + Send + Sync {
    const METHOD: &'static str;
}

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: u64, method: &'static str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: &'static str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Error object of a failed JSON-RPC response.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ResponseError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Acknowledgement with no useful body. Accepts `null`, `{}` or anything
/// else the analyzer sends back.
#[derive(Debug, Clone, Default)]
pub struct Empty {}

impl<'de> Deserialize<'de> for Empty {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde::de::IgnoredAny::deserialize(deserializer)?;
        Ok(Self {})
    }
}

// ---------------------------------------------------------------------------
// Lifecycle

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    pub process_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreter_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    /// Set when the analyzer could not start for this interpreter.
    #[serde(default)]
    pub error: Option<String>,
}

impl AnalyzerRequest for InitializeRequest {
    const METHOD: &'static str = "initialize";
    type Response = InitializeResponse;
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownRequest {}

impl AnalyzerRequest for ShutdownRequest {
    const METHOD: &'static str = "shutdown";
    type Response = Empty;
}

#[derive(Debug, Clone, Serialize)]
pub struct Initialized {}

impl AnalyzerNotification for Initialized {
    const METHOD: &'static str = "initialized";
}

#[derive(Debug, Clone, Serialize)]
pub struct Exit {}

impl AnalyzerNotification for Exit {
    const METHOD: &'static str = "exit";
}

/// Sent when the interpreter settings change underneath a running analyzer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsChanged {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreter_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_version: Option<String>,
}

impl AnalyzerNotification for OptionsChanged {
    const METHOD: &'static str = "optionsChanged";
}

// ---------------------------------------------------------------------------
// Files

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddFileRequest {
    /// Display name: the filesystem path, or the synthetic name.
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddFileResponse {
    pub file_id: FileId,
}

impl AnalyzerRequest for AddFileRequest {
    const METHOD: &'static str = "addFile";
    type Response = AddFileResponse;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnloadFileRequest {
    pub file_id: FileId,
}

impl AnalyzerRequest for UnloadFileRequest {
    const METHOD: &'static str = "unloadFile";
    type Response = Empty;
}

/// One replacement, relative to the text produced by the previous list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeInfo {
    pub start: usize,
    pub removed: usize,
    pub text: String,
}

/// Content update for one buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FileUpdate {
    /// Replace the whole buffer.
    #[serde(rename_all = "camelCase")]
    Reset {
        buffer_id: BufferId,
        version: i32,
        content: String,
    },
    /// Edits that turn `version - 1` into `version`, in descending start
    /// order.
    #[serde(rename_all = "camelCase")]
    Changes {
        buffer_id: BufferId,
        version: i32,
        changes: Vec<ChangeInfo>,
    },
}

impl FileUpdate {
    #[must_use]
    pub fn buffer_id(&self) -> BufferId {
        match self {
            Self::Reset { buffer_id, .. } | Self::Changes { buffer_id, .. } => *buffer_id,
        }
    }

    #[must_use]
    pub fn version(&self) -> i32 {
        match self {
            Self::Reset { version, .. } | Self::Changes { version, .. } => *version,
        }
    }

    #[must_use]
    pub fn is_reset(&self) -> bool {
        matches!(self, Self::Reset { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpdateRequest {
    pub file_id: FileId,
    pub updates: Vec<FileUpdate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpdateResponse {
    /// The analyzer could not apply the updates; its copy is now unknown.
    #[serde(default)]
    pub failed: bool,
}

impl AnalyzerRequest for FileUpdateRequest {
    const METHOD: &'static str = "fileUpdate";
    type Response = FileUpdateResponse;
}

// ---------------------------------------------------------------------------
// Positional queries

/// Where a positional query applies: a location in a specific version of a
/// specific buffer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationQuery {
    pub file_id: FileId,
    pub buffer_id: BufferId,
    pub version: i32,
    pub location: Location,
}

#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct SignaturesRequest(pub LocationQuery);

#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct CompletionsRequest(pub LocationQuery);

#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct QuickInfoRequest(pub LocationQuery);

#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct DefinitionsRequest(pub LocationQuery);

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterInfo {
    pub name: String,
    #[serde(default)]
    pub documentation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    pub name: String,
    #[serde(default)]
    pub documentation: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignaturesResponse {
    /// Version the analyzer answered against.
    pub version: i32,
    /// Span of the call the signatures apply to.
    #[serde(default)]
    pub span: Option<SourceSpan>,
    #[serde(default)]
    pub active_parameter: Option<usize>,
    #[serde(default)]
    pub signatures: Vec<SignatureInfo>,
}

impl AnalyzerRequest for SignaturesRequest {
    const METHOD: &'static str = "signatures";
    type Response = SignaturesResponse;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionItem {
    pub name: String,
    #[serde(default)]
    pub insert_text: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub documentation: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionsResponse {
    pub version: i32,
    /// Span the accepted completion replaces.
    #[serde(default)]
    pub span: Option<SourceSpan>,
    #[serde(default)]
    pub completions: Vec<CompletionItem>,
}

impl AnalyzerRequest for CompletionsRequest {
    const METHOD: &'static str = "completions";
    type Response = CompletionsResponse;
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickInfoResponse {
    pub version: i32,
    #[serde(default)]
    pub span: Option<SourceSpan>,
    #[serde(default)]
    pub text: String,
}

impl AnalyzerRequest for QuickInfoRequest {
    const METHOD: &'static str = "quickInfo";
    type Response = QuickInfoResponse;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionInfo {
    pub file_id: FileId,
    pub span: SourceSpan,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionsResponse {
    pub version: i32,
    #[serde(default)]
    pub definitions: Vec<DefinitionInfo>,
}

impl AnalyzerRequest for DefinitionsRequest {
    const METHOD: &'static str = "definitions";
    type Response = DefinitionsResponse;
}

// ---------------------------------------------------------------------------
// Inbound events

pub(crate) const FILE_PARSED: &str = "fileParsed";
pub(crate) const ANALYSIS_COMPLETE: &str = "analysisComplete";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BufferVersion {
    pub buffer_id: BufferId,
    pub version: i32,
}

/// Payload of both `fileParsed` and `analysisComplete`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileVersionsEvent {
    pub file_id: FileId,
    #[serde(default)]
    pub buffers: Vec<BufferVersion>,
}

pub fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}
