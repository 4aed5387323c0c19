//! Sandbox Session - single owner of one conversation's execution context
//!
//! Tracks connectivity through its lifecycle:
//! Disconnected -> Connecting -> Ready -> (Broken | Closed)
//!
//! A transport loss during `execute` marks the session broken and triggers
//! exactly one automatic reconnect; the code is then re-run against the new
//! context, with the input files uploaded so far restored into it. A second
//! consecutive loss inside the same turn is surfaced as `SessionError::Lost`.
//! A broken session refuses every operation until `start()` is called or the
//! next turn begins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{CodeBox, CodeBoxOutput, CodeBoxStatus, SessionHandle};
use crate::classifier::{normalize_artifacts, SANDBOX_ERROR_PREFIX, TIMEOUT_ERROR_PREFIX};
use crate::error::{CodeBoxError, SessionError};
use crate::metrics::{
    CODE_EXECUTION_DURATION, SESSIONS_ACTIVE, SESSION_LOSSES, SESSION_RECONNECTS, SESSION_STARTS,
};
use crate::types::{Artifact, ExecutionResult, ExecutionStatus};

/// Connectivity state of a sandbox session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No context allocated yet
    Disconnected,
    /// Allocation in progress
    Connecting,
    /// Context allocated and usable
    Ready,
    /// Transport lost; needs `start()` or a new turn
    Broken,
    /// Released by `stop()`
    Closed,
}

/// Owner of one remote execution context
pub struct SandboxSession {
    backend: Arc<dyn CodeBox>,
    handle: Option<SessionHandle>,
    state: ConnectionState,
    /// Monotonic count of execution attempts over the session's life
    executions: u64,
    execution_timeout: Duration,
    /// Losses since the last successful backend response in this turn
    consecutive_losses: u32,
    /// Input files, kept so a replacement context can be restored; never
    /// reported back as outputs
    uploaded: HashMap<String, Vec<u8>>,
}

impl SandboxSession {
    /// Create a disconnected session; nothing is allocated until first use
    pub fn new(backend: Arc<dyn CodeBox>, execution_timeout: Duration) -> Self {
        Self {
            backend,
            handle: None,
            state: ConnectionState::Disconnected,
            executions: 0,
            execution_timeout,
            consecutive_losses: 0,
            uploaded: HashMap::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn handle(&self) -> Option<&SessionHandle> {
        self.handle.as_ref()
    }

    /// Total execution attempts made through this session
    pub fn execution_count(&self) -> u64 {
        self.executions
    }

    /// Files uploaded as inputs so far
    pub fn uploaded_files(&self) -> impl Iterator<Item = &str> {
        self.uploaded.keys().map(String::as_str)
    }

    /// Reset the per-turn reconnect allowance
    ///
    /// A session broken during an earlier turn becomes disconnected again, so
    /// the new turn reconnects on first use.
    pub fn begin_turn(&mut self) {
        self.consecutive_losses = 0;
        if self.state == ConnectionState::Broken {
            debug!("Clearing broken session for the new turn");
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Acquire a remote context; a no-op when already ready
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.state == ConnectionState::Ready && self.handle.is_some() {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        self.handle = None;
        let handle = match self.backend.open().await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "Failed to start sandbox session");
                SESSION_STARTS.with_label_values(&["unavailable"]).inc();
                self.state = ConnectionState::Disconnected;
                return Err(SessionError::Unavailable(e.to_string()));
            }
        };

        if let Err(e) = self.restore_inputs(&handle).await {
            warn!(session_id = %handle.id, error = %e, "Failed to restore input files");
            SESSION_STARTS.with_label_values(&["unavailable"]).inc();
            if let Err(e) = self.backend.close(&handle).await {
                debug!(session_id = %handle.id, error = %e, "Failed to release context");
            }
            self.state = ConnectionState::Disconnected;
            return Err(SessionError::Unavailable(format!(
                "cannot restore input files: {}",
                e
            )));
        }

        info!(session_id = %handle.id, restored = self.uploaded.len(), "Sandbox session started");
        SESSION_STARTS.with_label_values(&["ok"]).inc();
        SESSIONS_ACTIVE.inc();
        self.handle = Some(handle);
        self.state = ConnectionState::Ready;
        Ok(())
    }

    /// Upload every known input file into a freshly opened context
    async fn restore_inputs(&self, handle: &SessionHandle) -> Result<(), CodeBoxError> {
        for (name, content) in &self.uploaded {
            self.backend.upload(handle, name, content).await?;
            debug!(session_id = %handle.id, file = %name, "Restored input file");
        }
        Ok(())
    }

    /// Execute one code block
    ///
    /// Timeouts come back as an error result (recoverable); transport
    /// failures are retried once against a fresh context before surfacing as
    /// `SessionError::Lost`.
    pub async fn execute(&mut self, code: &str) -> Result<ExecutionResult, SessionError> {
        match self.state {
            ConnectionState::Closed => return Err(SessionError::Closed),
            ConnectionState::Broken => return Err(broken()),
            ConnectionState::Disconnected | ConnectionState::Connecting => self.start().await?,
            ConnectionState::Ready => {}
        }

        loop {
            match self.run_once(code).await {
                Ok(result) => {
                    self.consecutive_losses = 0;
                    return Ok(result);
                }
                Err(reason) => {
                    SESSION_LOSSES.inc();
                    self.state = ConnectionState::Broken;
                    if self.handle.take().is_some() {
                        SESSIONS_ACTIVE.dec();
                    }
                    self.consecutive_losses += 1;
                    warn!(
                        error = %reason,
                        losses = self.consecutive_losses,
                        "Sandbox transport lost"
                    );

                    if self.consecutive_losses > 1 {
                        return Err(SessionError::Lost(reason));
                    }

                    SESSION_RECONNECTS.inc();
                    if let Err(e) = self.start().await {
                        self.state = ConnectionState::Broken;
                        return Err(SessionError::Lost(format!(
                            "{}; reconnect failed: {}",
                            reason, e
                        )));
                    }
                    info!("Sandbox reconnected, re-running code");
                }
            }
        }
    }

    /// One execution attempt; `Err` carries a transport-loss reason
    async fn run_once(&mut self, code: &str) -> Result<ExecutionResult, String> {
        let handle = self
            .handle
            .clone()
            .ok_or_else(|| "no execution context".to_string())?;

        self.executions += 1;
        let sequence = self.executions;
        let start = Instant::now();

        debug!(session_id = %handle.id, sequence, code_len = code.len(), "Executing code");

        let outcome =
            tokio::time::timeout(self.execution_timeout, self.backend.execute(&handle, code)).await;

        let duration = start.elapsed();
        CODE_EXECUTION_DURATION.observe(duration.as_secs_f64());
        let duration_ms = duration.as_secs_f64() * 1000.0;

        let result = match outcome {
            Err(_) => {
                let timeout_secs = self.execution_timeout.as_secs();
                warn!(sequence, timeout_secs, "Execution timed out");
                ExecutionResult::error(
                    sequence,
                    "",
                    format!(
                        "{} execution exceeded {}s",
                        TIMEOUT_ERROR_PREFIX,
                        self.execution_timeout.as_secs()
                    ),
                    vec![],
                )
            }
            Ok(Err(CodeBoxError::Transport(msg))) | Ok(Err(CodeBoxError::Unavailable(msg))) => {
                return Err(msg);
            }
            Ok(Err(e @ CodeBoxError::Rejected(_))) => ExecutionResult::error(
                sequence,
                "",
                format!("{} {}", SANDBOX_ERROR_PREFIX, e),
                vec![],
            ),
            Ok(Ok(output)) => self.collect(&handle, sequence, output).await,
        };

        Ok(result.with_duration(duration_ms))
    }

    /// Turn backend output into an `ExecutionResult`, fetching produced files
    async fn collect(
        &self,
        handle: &SessionHandle,
        sequence: u64,
        output: CodeBoxOutput,
    ) -> ExecutionResult {
        let mut artifacts = output.artifacts;

        for name in &output.produced_files {
            if self.uploaded.contains_key(name) || artifacts.iter().any(|a| &a.name == name) {
                continue;
            }
            match self.backend.download(handle, name).await {
                Ok(content) => artifacts.push(Artifact::new(name.clone(), content)),
                Err(e) => warn!(file = %name, error = %e, "Failed to fetch produced file"),
            }
        }

        artifacts.retain(|a| !self.uploaded.contains_key(&a.name));
        let artifacts = normalize_artifacts(artifacts);

        match output.status {
            ExecutionStatus::Ok => ExecutionResult {
                stderr: output.stderr,
                ..ExecutionResult::ok(sequence, output.stdout, artifacts)
            },
            ExecutionStatus::Error => {
                ExecutionResult::error(sequence, output.stdout, output.stderr, artifacts)
            }
        }
    }

    /// Make sure a context exists before a file transfer
    async fn ensure_ready(&mut self) -> Result<SessionHandle, SessionError> {
        match self.state {
            ConnectionState::Closed => return Err(SessionError::Closed),
            ConnectionState::Broken => return Err(broken()),
            ConnectionState::Ready => {}
            ConnectionState::Disconnected | ConnectionState::Connecting => self.start().await?,
        }
        self.handle
            .clone()
            .ok_or_else(|| SessionError::Unavailable("no execution context".to_string()))
    }

    /// Upload a file into the sandbox working area
    pub async fn upload(&mut self, name: &str, content: &[u8]) -> Result<(), SessionError> {
        let handle = self.ensure_ready().await?;
        self.backend
            .upload(&handle, name, content)
            .await
            .map_err(|e| SessionError::FileTransfer(e.to_string()))?;
        debug!(file = %name, size = content.len(), "Uploaded file");
        self.uploaded.insert(name.to_string(), content.to_vec());
        Ok(())
    }

    /// Download a file from the sandbox working area
    pub async fn download(&mut self, name: &str) -> Result<Vec<u8>, SessionError> {
        let handle = self.ensure_ready().await?;
        self.backend
            .download(&handle, name)
            .await
            .map_err(|e| SessionError::FileTransfer(e.to_string()))
    }

    /// Install a package inside the sandbox
    pub async fn install(&mut self, package: &str) -> Result<(), SessionError> {
        let handle = self.ensure_ready().await?;
        info!(package = %package, "Installing package in sandbox");
        self.backend
            .install(&handle, package)
            .await
            .map_err(|e| SessionError::Install(e.to_string()))
    }

    /// Whether the backend reports the context as running
    pub async fn is_running(&self) -> bool {
        match (&self.state, &self.handle) {
            (ConnectionState::Ready, Some(handle)) => matches!(
                self.backend.status(handle).await,
                Ok(CodeBoxStatus::Running)
            ),
            _ => false,
        }
    }

    /// Release the context; calling it again is a no-op
    pub async fn stop(&mut self) -> Result<(), SessionError> {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.backend.close(&handle).await {
                warn!(session_id = %handle.id, error = %e, "Failed to close sandbox context");
            }
            SESSIONS_ACTIVE.dec();
            info!(session_id = %handle.id, "Sandbox session stopped");
        }
        self.state = ConnectionState::Closed;
        Ok(())
    }
}

fn broken() -> SessionError {
    SessionError::Lost("session is broken; restart it first".to_string())
}
