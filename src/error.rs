//! Error types for every layer of the interpreter
//!
//! Collaborator failures (`ModelError`, `CodeBoxError`) are converted into
//! `SessionError` by the sandbox session and into `InterpreterError` at the
//! execution loop boundary. `InterpreterError` is the only error a caller ever
//! sees, and it is carried on the finalized `Turn` rather than returned.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of the language model capability
#[derive(Debug, Error)]
pub enum ModelError {
    /// Transport, auth or protocol failure talking to the model
    #[error("model unavailable: {0}")]
    Unavailable(String),
    /// The model did not answer before its deadline
    #[error("model call timed out after {0} ms")]
    Timeout(u64),
}

/// Failure reported by a code box backend
#[derive(Debug, Error)]
pub enum CodeBoxError {
    /// The service could not allocate an execution context
    #[error("code box unavailable: {0}")]
    Unavailable(String),
    /// The connection to the execution context dropped
    #[error("code box transport failure: {0}")]
    Transport(String),
    /// The service understood the request and refused it
    #[error("code box rejected request: {0}")]
    Rejected(String),
}

/// Failure of a sandbox session operation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("sandbox session unavailable: {0}")]
    Unavailable(String),
    #[error("sandbox session lost: {0}")]
    Lost(String),
    #[error("sandbox session closed")]
    Closed,
    #[error("file transfer failed: {0}")]
    FileTransfer(String),
    #[error("package installation failed: {0}")]
    Install(String),
}

/// Turn-level error taxonomy surfaced to callers
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum InterpreterError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("model call timed out after {0} ms")]
    ModelTimeout(u64),
    #[error("code execution failed: {0}")]
    RecoverableExecution(String),
    #[error("retry budget exhausted after {retries} retries: {last_error}")]
    RetryExhausted { retries: u32, last_error: String },
    #[error("fatal execution error: {0}")]
    FatalExecution(String),
    #[error("sandbox session unavailable: {0}")]
    SessionUnavailable(String),
    #[error("sandbox session lost: {0}")]
    SessionLost(String),
    #[error("sandbox session closed")]
    SessionClosed,
    #[error("file transfer failed: {0}")]
    FileTransfer(String),
    #[error("malformed model response: {0}")]
    MalformedResponse(String),
    #[error("tool call failed: {0}")]
    ToolCall(String),
    #[error("turn cancelled")]
    Cancelled,
}

impl InterpreterError {
    /// Whether the error came from the model capability rather than execution
    pub fn is_model_failure(&self) -> bool {
        matches!(
            self,
            InterpreterError::ModelUnavailable(_) | InterpreterError::ModelTimeout(_)
        )
    }

    /// Short stable label, used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            InterpreterError::ModelUnavailable(_) => "model_unavailable",
            InterpreterError::ModelTimeout(_) => "model_timeout",
            InterpreterError::RecoverableExecution(_) => "recoverable_execution",
            InterpreterError::RetryExhausted { .. } => "retry_exhausted",
            InterpreterError::FatalExecution(_) => "fatal_execution",
            InterpreterError::SessionUnavailable(_) => "session_unavailable",
            InterpreterError::SessionLost(_) => "session_lost",
            InterpreterError::SessionClosed => "session_closed",
            InterpreterError::FileTransfer(_) => "file_transfer",
            InterpreterError::MalformedResponse(_) => "malformed_response",
            InterpreterError::ToolCall(_) => "tool_call",
            InterpreterError::Cancelled => "cancelled",
        }
    }
}

impl From<ModelError> for InterpreterError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::Unavailable(msg) => InterpreterError::ModelUnavailable(msg),
            ModelError::Timeout(ms) => InterpreterError::ModelTimeout(ms),
        }
    }
}

impl From<SessionError> for InterpreterError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Unavailable(msg) => InterpreterError::SessionUnavailable(msg),
            SessionError::Lost(msg) => InterpreterError::SessionLost(msg),
            SessionError::Closed => InterpreterError::SessionClosed,
            SessionError::FileTransfer(msg) => InterpreterError::FileTransfer(msg),
            SessionError::Install(msg) => InterpreterError::FatalExecution(msg),
        }
    }
}

/// Failure of a caller tool
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// The model asked for a tool nobody registered
    #[error("unknown tool `{0}`")]
    Unknown(String),
    /// Registration would shadow the code execution tool or an empty name
    #[error("tool name `{0}` is reserved")]
    ReservedName(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
}

/// Invalid configuration value
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}
