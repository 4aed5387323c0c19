//! Language model capability

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::ModelError;
use crate::types::Turn;

/// A caller tool as advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object
    pub parameters: Value,
}

/// The model asking for a caller tool to be run
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRequest {
    pub name: String,
    pub arguments: Value,
}

/// Raw response text plus any caller tool requests that came with it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelOutput {
    pub text: String,
    pub tool_requests: Vec<ToolRequest>,
}

impl From<String> for ModelOutput {
    fn from(text: String) -> Self {
        Self {
            text,
            tool_requests: Vec::new(),
        }
    }
}

/// Text generation over a role-tagged transcript
///
/// The transcript is the full prompt: system instructions, replayed history
/// and the turns of the attempt in progress. Implementations return the raw
/// response text; parsing is done by the caller.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, transcript: &[Turn]) -> Result<String, ModelError>;

    /// Generate with caller tools on offer
    ///
    /// Models without native tool calling ignore `tools` and never return
    /// tool requests; the tools are still listed in the system prompt.
    async fn generate_with_tools(
        &self,
        transcript: &[Turn],
        _tools: &[ToolSpec],
    ) -> Result<ModelOutput, ModelError> {
        Ok(self.generate(transcript).await?.into())
    }

    /// Name reported in logs and metrics
    fn name(&self) -> &str {
        "model"
    }
}
