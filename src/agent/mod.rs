//! Agent module - the conversation loop around a model and a sandbox
//!
//! This module provides the execution loop that orchestrates:
//! - A language model that writes code and explanations
//! - A sandbox session that runs the code
//! - A bounded recovery protocol feeding errors back to the model
//!
//! # Architecture
//!
//! ```text
//! submit(request, files) → Interpreter
//!                  ↓
//!           upload files → SandboxSession
//!                  ↓
//!           ConversationMemory.build_prompt() + request → LanguageModel
//!                  ↓
//!           ResponseParser → prose + code blocks
//!                  ↓
//!           SandboxSession.execute() per block (fail-fast)
//!                  ↓
//!           classify() → success / recoverable / fatal
//!                  ↓
//!           ToolRegistry.invoke() for caller tool requests
//!                  ↓
//!           Retry with error or tool feedback, or finalize the Turn → memory
//! ```

pub mod controller;
pub mod events;
pub mod memory;
pub mod model;
pub mod tools;
pub mod transcript;

pub use controller::{Interpreter, RetryBudget, GENERIC_FAILURE_MESSAGE};
pub use events::{EventSink, TurnEvent, TurnEventStream};
pub use memory::{estimate_tokens, ConversationMemory, MemoryPolicy};
pub use model::{LanguageModel, ModelOutput, ToolRequest, ToolSpec};
pub use tools::{Tool, ToolRegistry};
pub use transcript::{Transcript, TranscriptStore, TranscriptSummary};
