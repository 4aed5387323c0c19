//! Code box module - sandboxed execution contexts
//!
//! This module provides:
//! - The `CodeBox` trait every sandbox backend implements
//! - `SandboxSession`, the single owner of one conversation's execution context
//! - `HttpCodeBox`, a client for a remote code box REST service
//! - `LocalCodeBox`, a subprocess backend running `python3` in a scratch directory
//!
//! # Architecture
//!
//! ```text
//! Interpreter ──execute(code)──► SandboxSession ──► dyn CodeBox
//!                                     │                 │
//!                                     │          HttpCodeBox / LocalCodeBox
//!                                     │                 │
//!                                     ◄── CodeBoxOutput ┘
//!                                     │
//!                     timeout, reconnect-once, file downloads
//!                                     │
//!                                     ▼
//!                              ExecutionResult
//! ```

pub mod http;
pub mod local;
pub mod session;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CodeBoxError;
use crate::types::{Artifact, ExecutionStatus};

pub use http::HttpCodeBox;
pub use local::LocalCodeBox;
pub use session::{ConnectionState, SandboxSession};

/// Identity of one remote execution context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: String,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Raw output of one backend execution call
#[derive(Debug, Clone, Default)]
pub struct CodeBoxOutput {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    /// Payloads returned inline (rendered images, new files)
    pub artifacts: Vec<Artifact>,
    /// Files the backend reports as produced but did not return inline
    pub produced_files: Vec<String>,
}

impl CodeBoxOutput {
    pub fn text(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn error(stderr: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Error,
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// Liveness reported by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeBoxStatus {
    Running,
    Stopped,
    Unknown,
}

/// Sandbox execution capability
///
/// Implementations hold no per-conversation state of their own beyond what is
/// keyed by `SessionHandle`; `SandboxSession` owns the lifecycle.
#[async_trait]
pub trait CodeBox: Send + Sync {
    /// Allocate a fresh execution context
    async fn open(&self) -> Result<SessionHandle, CodeBoxError>;

    /// Run `code` and capture its output
    async fn execute(&self, handle: &SessionHandle, code: &str)
        -> Result<CodeBoxOutput, CodeBoxError>;

    /// Place a file in the context's working directory
    async fn upload(
        &self,
        handle: &SessionHandle,
        name: &str,
        content: &[u8],
    ) -> Result<(), CodeBoxError>;

    /// Fetch a file from the context's working directory
    async fn download(&self, handle: &SessionHandle, name: &str) -> Result<Vec<u8>, CodeBoxError>;

    /// Install a package into the context
    async fn install(&self, handle: &SessionHandle, package: &str) -> Result<(), CodeBoxError>;

    async fn status(&self, handle: &SessionHandle) -> Result<CodeBoxStatus, CodeBoxError>;

    /// Release the context
    async fn close(&self, handle: &SessionHandle) -> Result<(), CodeBoxError>;
}
