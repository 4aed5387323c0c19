//! Ollama LLM integration module
//!
//! This module provides a `LanguageModel` backed by Ollama's `/api/chat`
//! endpoint, with optional tool calling.

pub mod chat;

pub use chat::{ChatClient, ChatMessage, ChatResponse, Tool, ToolCall};
