//! codebox-interpreter - a code interpreter loop for language models
//!
//! This library lets a caller hold a multi-turn conversation with a language
//! model that writes code, runs it in a sandboxed code box, observes the real
//! output (text, errors, images, files) and corrects itself when execution
//! fails, within a bounded retry budget.
//!
//! # Modules
//!
//! - `agent` - The execution loop, conversation memory, events and transcripts
//! - `parser` - Extraction of fenced code blocks from model responses
//! - `classifier` - Success / recoverable / fatal classification of results
//! - `codebox` - Sandbox backends and the session that owns a context
//! - `ollama` - Ollama `/api/chat` language model adapter
//! - `config` - Configuration from defaults, `.env` and environment
//! - `metrics` - Prometheus metrics for observability
//! - `tracing` - Logging and OpenTelemetry setup
//!
//! # Quick Start
//!
//! ```ignore
//! use codebox_interpreter::{Interpreter, InterpreterConfig};
//!
//! let mut interpreter = Interpreter::from_config(InterpreterConfig::from_env()?);
//! let turn = interpreter.submit("Plot a sine wave", vec![]).await;
//! for artifact in &turn.artifacts {
//!     artifact.save_to(".").await?;
//! }
//! interpreter.close().await?;
//! ```

pub mod agent;
pub mod classifier;
pub mod codebox;
pub mod config;
pub mod error;
pub mod metrics;
pub mod ollama;
pub mod parser;
pub mod tracing;
pub mod types;

// Re-export commonly used types at crate root for convenience
pub use agent::{
    ConversationMemory, Interpreter, LanguageModel, MemoryPolicy, ModelOutput, RetryBudget, Tool,
    ToolRegistry, ToolRequest, ToolSpec, Transcript, TranscriptStore, TurnEvent,
};
pub use classifier::{classify, Classification};
pub use codebox::{
    CodeBox, CodeBoxOutput, ConnectionState, HttpCodeBox, LocalCodeBox, SandboxSession,
};
pub use config::{CodeBoxConfig, InterpreterConfig};
pub use error::{CodeBoxError, InterpreterError, ModelError, SessionError, ToolError};
pub use parser::{ParsedResponse, ResponseParser};
pub use types::{Artifact, CodeBlock, ExecutionResult, ExecutionStatus, Role, Turn, TurnStatus};
