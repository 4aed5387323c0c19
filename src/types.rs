//! Conversation data model: turns, code blocks, execution results, artifacts

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InterpreterError;

/// Who authored a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An extracted unit of executable source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    /// Canonical language tag (e.g. "python")
    pub language: String,
    /// Source text, without the surrounding fence
    pub source: String,
}

impl CodeBlock {
    pub fn new(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            source: source.into(),
        }
    }

    /// Render as a fenced markdown block
    pub fn to_fence(&self) -> String {
        format!("```{}\n{}\n```", self.language, self.source)
    }
}

/// A named payload produced by (or handed to) the sandbox
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub content_type: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact")
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .field("size", &self.content.len())
            .finish()
    }
}

impl Artifact {
    /// Create an artifact, inferring the content type from name and bytes
    pub fn new(name: impl Into<String>, content: Vec<u8>) -> Self {
        let name = name.into();
        let content_type = content_type_for(&name, &content).to_string();
        Self {
            name,
            content_type,
            content,
        }
    }

    pub fn with_content_type(
        name: impl Into<String>,
        content_type: impl Into<String>,
        content: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            content,
        }
    }

    /// Read a local file into an artifact named after the file
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} has no file name", path.display()),
                )
            })?;
        Ok(Self::new(name, content))
    }

    /// Write the payload to `dir/name`, returning the written path
    pub async fn save_to(&self, dir: impl AsRef<Path>) -> std::io::Result<std::path::PathBuf> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        // Names come from the sandbox; only the final component is trusted
        let file_name = Path::new(&self.name).file_name().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("artifact name {:?} is not a file name", self.name),
            )
        })?;
        let path = dir.join(file_name);
        tokio::fs::write(&path, &self.content).await?;
        Ok(path)
    }

    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }
}

/// Infer a MIME type from magic bytes first, then the file extension
pub fn content_type_for(name: &str, content: &[u8]) -> &'static str {
    if content.starts_with(b"\x89PNG\r\n\x1a\n") {
        return "image/png";
    }
    if content.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "image/jpeg";
    }
    if content.starts_with(b"GIF87a") || content.starts_with(b"GIF89a") {
        return "image/gif";
    }
    if content.starts_with(b"%PDF") {
        return "application/pdf";
    }

    let ext = Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "csv" => "text/csv",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "md" => "text/markdown",
        "txt" | "log" => "text/plain",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

mod base64_bytes {
    use super::{Engine, BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Status of a single code execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Ok,
    Error,
}

/// Outcome of running one code block in the sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Session-wide execution counter value for this run
    pub sequence: u64,
    pub status: ExecutionStatus,
    pub stdout: String,
    /// Captured stderr or traceback; never empty when `status` is `Error`
    pub stderr: String,
    pub artifacts: Vec<Artifact>,
    pub duration_ms: f64,
}

const UNKNOWN_ERROR: &str = "execution failed without error output";

impl ExecutionResult {
    pub fn ok(sequence: u64, stdout: impl Into<String>, artifacts: Vec<Artifact>) -> Self {
        Self {
            sequence,
            status: ExecutionStatus::Ok,
            stdout: stdout.into(),
            stderr: String::new(),
            artifacts,
            duration_ms: 0.0,
        }
    }

    /// An error result; blank error text is replaced so it is never empty
    pub fn error(
        sequence: u64,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        artifacts: Vec<Artifact>,
    ) -> Self {
        let stderr = stderr.into();
        let stderr = if stderr.trim().is_empty() {
            UNKNOWN_ERROR.to_string()
        } else {
            stderr
        };
        Self {
            sequence,
            status: ExecutionStatus::Error,
            stdout: stdout.into(),
            stderr,
            artifacts,
            duration_ms: 0.0,
        }
    }

    pub fn with_duration(mut self, duration_ms: f64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ExecutionStatus::Ok
    }

    /// Error text for failed executions
    pub fn error_text(&self) -> Option<&str> {
        match self.status {
            ExecutionStatus::Ok => None,
            ExecutionStatus::Error => Some(&self.stderr),
        }
    }
}

/// Lifecycle status of a turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// Not finalized: part of a prompt or the loop's working transcript
    #[default]
    Pending,
    Success,
    RetryExhausted,
    Failed,
    Cancelled,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Pending => "pending",
            TurnStatus::Success => "success",
            TurnStatus::RetryExhausted => "retry_exhausted",
            TurnStatus::Failed => "failed",
            TurnStatus::Cancelled => "cancelled",
        }
    }
}

/// One role-tagged exchange in a conversation
///
/// Finalized turns (the ones stored in memory) are assistant turns that also
/// record the user request they answer, the results of the executed code and
/// the outcome of the whole exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub role: Role,
    /// Prose, with code blocks replaced by `[code block N]` placeholders
    pub content: String,
    #[serde(default)]
    pub code_blocks: Vec<CodeBlock>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// The user request this turn answers (finalized turns only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    /// Names of files uploaded with the request
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_files: Vec<String>,
    /// Results for `code_blocks`, in order; shorter when execution stopped early
    #[serde(default)]
    pub executions: Vec<ExecutionResult>,
    #[serde(default)]
    pub status: TurnStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<InterpreterError>,
    /// Automatic retries consumed while producing this turn
    #[serde(default)]
    pub retries: u32,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    fn pending(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            role,
            content: content.into(),
            code_blocks: Vec::new(),
            artifacts: Vec::new(),
            request: None,
            input_files: Vec::new(),
            executions: Vec::new(),
            status: TurnStatus::Pending,
            error: None,
            retries: 0,
            created_at: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::pending(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::pending(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, code_blocks: Vec<CodeBlock>) -> Self {
        let mut turn = Self::pending(Role::Assistant, content);
        turn.code_blocks = code_blocks;
        turn
    }

    pub fn is_finalized(&self) -> bool {
        self.status != TurnStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == TurnStatus::Success
    }

    pub fn last_execution(&self) -> Option<&ExecutionResult> {
        self.executions.last()
    }

    /// Error text of the last failed execution, if any
    pub fn last_error_text(&self) -> Option<&str> {
        self.executions.iter().rev().find_map(|e| e.error_text())
    }

    /// Markdown rendering with code restored and execution output inlined
    ///
    /// This is what the model sees when the turn is replayed as history.
    pub fn render(&self) -> String {
        crate::parser::render(&self.content, &self.code_blocks, &self.executions)
    }
}
