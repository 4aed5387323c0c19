//! Ollama Chat API adapter
//!
//! Implements `LanguageModel` on top of Ollama's `/api/chat` endpoint.
//! Conversation turns are flattened into chat messages; a finalized turn
//! becomes the user request it answered followed by the assistant reply with
//! execution output inlined.
//!
//! When tools are enabled the model is offered a `python` tool. Python tool
//! calls, whether native or emitted as JSON in the text, are rendered back
//! into fenced code so the response parser sees one uniform format. Calls to
//! any other tool are handed to the caller as `ToolRequest`s.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::tools::CODE_TOOL_NAME;
use crate::agent::{LanguageModel, ModelOutput, ToolRequest, ToolSpec};
use crate::error::ModelError;
use crate::types::{Role, Turn};

/// A message in a chat conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant", "tool"
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    /// Messages replaying one turn
    pub fn from_turn(turn: &Turn) -> Vec<ChatMessage> {
        match (&turn.role, &turn.request) {
            (Role::Assistant, Some(request)) => vec![
                ChatMessage::user(request.clone()),
                ChatMessage::assistant(turn.render()),
            ],
            (Role::Assistant, None) => vec![ChatMessage::assistant(turn.render())],
            (Role::User, _) => vec![ChatMessage::user(turn.content.clone())],
            (Role::System, _) => vec![ChatMessage::system(turn.content.clone())],
        }
    }
}

/// A tool call from the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: FunctionCall,
}

/// Function call details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

impl FunctionCall {
    /// Code carried by a call to the python tool
    fn code(&self) -> Option<&str> {
        match &self.arguments {
            serde_json::Value::String(code) => Some(code),
            args => args.get("code").and_then(|c| c.as_str()),
        }
    }
}

/// Tool definition for the model
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String, // Always "function"
    pub function: ToolFunction,
}

/// Function specification for a tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value, // JSON Schema
}

impl From<&ToolSpec> for Tool {
    fn from(spec: &ToolSpec) -> Self {
        Tool {
            tool_type: "function".to_string(),
            function: ToolFunction {
                name: spec.name.clone(),
                description: spec.description.clone(),
                parameters: spec.parameters.clone(),
            },
        }
    }
}

/// Response from /api/chat
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub message: ChatMessage,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub eval_count: u32,
    #[serde(default)]
    pub eval_duration: u64,
}

/// Client for Ollama's /api/chat endpoint
#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
    timeout: Duration,
    use_tools: bool,
}

impl ChatClient {
    /// Create a new chat client
    ///
    /// # Arguments
    /// * `base_url` - The Ollama server (e.g., "http://localhost:11434")
    /// * `model` - The model name (e.g., "qwen3")
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(180),
            use_tools: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Offer the `python` tool to the model
    pub fn with_tools(mut self, enabled: bool) -> Self {
        self.use_tools = enabled;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a chat request, offering `tools` next to the python tool
    pub async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolSpec],
    ) -> Result<ChatResponse, ModelError> {
        let endpoint = format!("{}/api/chat", self.base_url);

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": 0.0
            }
        });

        let offered = self.offered_tools(tools);
        if !offered.is_empty() {
            body["tools"] = serde_json::to_value(offered)
                .map_err(|e| ModelError::Unavailable(e.to_string()))?;
        }

        let response = self
            .client
            .post(&endpoint)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.request_error(e))?;

        if !status.is_success() {
            return Err(ModelError::Unavailable(format!("{}: {}", status, text.trim())));
        }
        if text.is_empty() {
            return Err(ModelError::Unavailable("empty response from Ollama".to_string()));
        }

        serde_json::from_str(&text)
            .map_err(|e| ModelError::Unavailable(format!("invalid chat response: {}", e)))
    }

    fn request_error(&self, e: reqwest::Error) -> ModelError {
        if e.is_timeout() {
            ModelError::Timeout(self.timeout.as_millis() as u64)
        } else {
            ModelError::Unavailable(e.to_string())
        }
    }

    /// Tool definitions sent with a request
    pub fn offered_tools(&self, tools: &[ToolSpec]) -> Vec<Tool> {
        let python = self.use_tools.then(Self::python_tool);
        python
            .into_iter()
            .chain(tools.iter().map(Tool::from))
            .collect()
    }

    /// Create the python tool definition
    pub fn python_tool() -> Tool {
        Tool {
            tool_type: "function".to_string(),
            function: ToolFunction {
                name: CODE_TOOL_NAME.to_string(),
                description: "Run Python code in a persistent sandbox and see its output. Files \
                    in the working directory are available to the code; images and files it \
                    creates are returned to the user."
                    .to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "code": {
                            "type": "string",
                            "description": "The Python code to execute"
                        }
                    },
                    "required": ["code"]
                }),
            },
        }
    }
}

#[async_trait]
impl LanguageModel for ChatClient {
    /// Text only; caller tool requests are noted in the text instead of run
    async fn generate(&self, transcript: &[Turn]) -> Result<String, ModelError> {
        let output = self.generate_with_tools(transcript, &[]).await?;
        let mut text = output.text;
        for request in &output.tool_requests {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&format!(
                "[Tool call not run: {}({})]",
                request.name, request.arguments
            ));
        }
        Ok(text)
    }

    async fn generate_with_tools(
        &self,
        transcript: &[Turn],
        tools: &[ToolSpec],
    ) -> Result<ModelOutput, ModelError> {
        let messages: Vec<ChatMessage> =
            transcript.iter().flat_map(ChatMessage::from_turn).collect();
        let response = self.chat(messages, tools).await?;

        debug!(
            model = %self.model,
            eval_count = response.eval_count,
            eval_duration_ms = response.eval_duration / 1_000_000,
            "Chat response received"
        );

        Ok(response_output(response.message))
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Split a reply into text and caller tool requests
///
/// Python tool calls are rendered into the text as python fences. Every
/// other call, and a python call without code, becomes a `ToolRequest`.
pub fn response_output(message: ChatMessage) -> ModelOutput {
    let mut calls = message.tool_calls.unwrap_or_default();
    let mut content = message.content;

    if calls.is_empty() {
        calls = parse_tool_calls_from_text(&content);
        if !calls.is_empty() {
            // The whole reply was a tool call written as JSON
            content.clear();
        }
    }

    let mut tool_requests = Vec::new();
    for call in calls {
        let code = (call.function.name == CODE_TOOL_NAME)
            .then(|| call.function.code().map(str::to_string))
            .flatten();
        match code {
            Some(code) => {
                if !content.is_empty() && !content.ends_with('\n') {
                    content.push('\n');
                }
                content.push_str(&format!("```python\n{}\n```\n", code.trim_end()));
            }
            None => tool_requests.push(ToolRequest {
                name: call.function.name,
                arguments: call.function.arguments,
            }),
        }
    }

    ModelOutput {
        text: content,
        tool_requests,
    }
}

/// Parse tool calls written as JSON in the reply text
///
/// Only replies that are a single JSON object are considered, so prose that
/// merely mentions JSON is left alone.
pub fn parse_tool_calls_from_text(content: &str) -> Vec<ToolCall> {
    let content = content.trim();
    if !(content.starts_with('{') && content.ends_with('}')) {
        return Vec::new();
    }
    serde_json::from_str::<serde_json::Value>(content)
        .ok()
        .and_then(|value| parse_tool_call_from_value(&value))
        .into_iter()
        .collect()
}

/// Parse a tool call from a JSON Value
fn parse_tool_call_from_value(value: &serde_json::Value) -> Option<ToolCall> {
    // Expected format: {"name": "...", "arguments": {...}}
    let name = value.get("name").and_then(|n| n.as_str())?;

    // Some models use "parameters" instead of "arguments"
    let arguments = value
        .get("arguments")
        .or_else(|| value.get("parameters"))?
        .clone();

    Some(ToolCall {
        function: FunctionCall {
            name: name.to_string(),
            arguments,
        },
    })
}
