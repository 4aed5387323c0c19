//! Caller tools the model may call alongside writing code
//!
//! Tools are registered on the `Interpreter`, advertised to the model with
//! every request and run by the execution loop when the model asks for them.
//! Their output goes back to the model as a user turn, the same way error
//! feedback does.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::model::{ToolRequest, ToolSpec};
use crate::error::ToolError;

/// Name of the built-in code execution tool
pub const CODE_TOOL_NAME: &str = "python";

/// A capability the caller exposes to the model
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// What the tool does, as shown to the model
    fn description(&self) -> &str;

    /// JSON Schema of the arguments object
    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn call(&self, arguments: Value) -> Result<String, ToolError>;
}

/// Registered caller tools, in registration order
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool, replacing any earlier tool with the same name
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().trim();
        if name.is_empty() || name == CODE_TOOL_NAME {
            return Err(ToolError::ReservedName(name.to_string()));
        }
        match self.tools.iter().position(|t| t.name() == tool.name()) {
            Some(index) => self.tools[index] = tool,
            None => self.tools.push(tool),
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Descriptions handed to the model
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect()
    }

    /// Lines appended to the system prompt while tools are registered
    pub fn prompt_section(&self) -> Option<String> {
        if self.tools.is_empty() {
            return None;
        }
        let mut section = String::from("Besides running code you can call these tools:\n");
        for tool in &self.tools {
            section.push_str(&format!("- {}: {}\n", tool.name(), tool.description()));
        }
        Some(section)
    }

    /// Run the tool a request names
    pub async fn invoke(&self, request: &ToolRequest) -> Result<String, ToolError> {
        if request.name == CODE_TOOL_NAME {
            return Err(ToolError::InvalidArguments(
                "python calls need a `code` string argument".to_string(),
            ));
        }
        let tool = self
            .get(&request.name)
            .ok_or_else(|| ToolError::Unknown(request.name.clone()))?;
        tool.call(request.arguments.clone()).await
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

/// Message telling the model what a tool call produced
pub fn tool_feedback(
    request: &ToolRequest,
    outcome: &Result<String, ToolError>,
    registry: &ToolRegistry,
) -> String {
    match outcome {
        Ok(output) => format!(
            "Result of tool `{}`:\n```\n{}\n```",
            request.name,
            output.trim_end()
        ),
        Err(ToolError::Unknown(name)) => {
            let available = registry.names();
            let available = if available.is_empty() {
                "none".to_string()
            } else {
                available.join(", ")
            };
            format!(
                "There is no tool named `{}`. Available tools: {}. \
                 Use a python code block to run code.",
                name, available
            )
        }
        Err(e) => format!("Tool `{}` failed: {}", request.name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Weather;

    #[async_trait]
    impl Tool for Weather {
        fn name(&self) -> &str {
            "weather"
        }

        fn description(&self) -> &str {
            "Current temperature for a city"
        }

        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "city": { "type": "string" } },
                "required": ["city"]
            })
        }

        async fn call(&self, arguments: Value) -> Result<String, ToolError> {
            let city = arguments["city"]
                .as_str()
                .ok_or_else(|| ToolError::InvalidArguments("city is required".into()))?;
            Ok(format!("{}: 18C", city))
        }
    }

    struct Named(&'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "second version"
        }

        async fn call(&self, _arguments: Value) -> Result<String, ToolError> {
            Ok(String::new())
        }
    }

    fn request(name: &str, arguments: Value) -> ToolRequest {
        ToolRequest {
            name: name.to_string(),
            arguments,
        }
    }

    #[tokio::test]
    async fn test_invoke_registered_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Weather)).unwrap();

        let output = registry
            .invoke(&request("weather", json!({"city": "Oslo"})))
            .await
            .unwrap();
        assert_eq!(output, "Oslo: 18C");

        let err = registry
            .invoke(&request("weather", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        let req = request("search", json!({}));
        let outcome = registry.invoke(&req).await;
        assert_eq!(outcome, Err(ToolError::Unknown("search".into())));

        let feedback = tool_feedback(&req, &outcome, &registry);
        assert!(feedback.contains("no tool named `search`"));
        assert!(feedback.contains("Available tools: none"));
    }

    #[tokio::test]
    async fn test_python_call_without_code_is_invalid() {
        let registry = ToolRegistry::new();
        let err = registry
            .invoke(&request("python", json!({"script": "print(1)"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn test_register_rejects_reserved_names() {
        let mut registry = ToolRegistry::new();
        assert_eq!(
            registry.register(Arc::new(Named("python"))),
            Err(ToolError::ReservedName("python".into()))
        );
        assert!(registry.register(Arc::new(Named(" "))).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Weather)).unwrap();
        registry.register(Arc::new(Named("lookup"))).unwrap();
        registry.register(Arc::new(Named("weather"))).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["weather", "lookup"]);
        assert_eq!(registry.specs()[0].description, "second version");
    }

    #[test]
    fn test_specs_and_prompt_section() {
        let mut registry = ToolRegistry::new();
        assert!(registry.prompt_section().is_none());

        registry.register(Arc::new(Weather)).unwrap();
        let specs = registry.specs();
        assert_eq!(specs[0].name, "weather");
        assert_eq!(specs[0].parameters["required"][0], "city");

        let section = registry.prompt_section().unwrap();
        assert!(section.contains("- weather: Current temperature for a city"));
    }
}
