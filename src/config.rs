//! Interpreter configuration
//!
//! `InterpreterConfig::default()` gives a working local setup (Ollama on
//! localhost, code run by a host `python3`). `from_env()` layers a `.env`
//! file and process environment on top; CLI flags override both.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::MemoryPolicy;
use crate::codebox::{CodeBox, HttpCodeBox, LocalCodeBox};
use crate::error::ConfigError;

/// Default system prompt for the code interpreter
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a helpful assistant with access to a
persistent Python sandbox.

To run code, write it in a fenced block tagged python:

```python
print("hello")
```

Every python block you write is executed in order and its output is shown to you. Guidelines:
- Use code to calculate, analyse data and verify results rather than guessing
- Files the user uploads are in the current working directory
- Variables and imports persist between blocks, so later blocks can build on earlier ones
- Show plots with plt.show(); every open matplotlib figure is returned to the user as an image
- Do not also save a figure you show to a file
- Files you write to the working directory are returned to the user
- If code fails, read the error, fix the code and try again
- When you are done, answer in plain text without a code block"#;

/// Where code runs
#[derive(Debug, Clone, PartialEq)]
pub enum CodeBoxConfig {
    /// A remote code box REST service
    Remote {
        url: String,
        api_key: Option<String>,
        open_retries: u32,
        retry_delay_ms: u64,
    },
    /// A host interpreter in scratch directories under `root`
    Local { root: PathBuf, python: String },
}

impl Default for CodeBoxConfig {
    fn default() -> Self {
        CodeBoxConfig::Local {
            root: std::env::temp_dir().join("codebox-interpreter"),
            python: "python3".to_string(),
        }
    }
}

impl CodeBoxConfig {
    /// Construct the backend this config describes
    pub fn build(&self) -> Arc<dyn CodeBox> {
        match self {
            CodeBoxConfig::Remote {
                url,
                api_key,
                open_retries,
                retry_delay_ms,
            } => Arc::new(
                HttpCodeBox::new(url.clone(), api_key.clone())
                    .with_open_retries(*open_retries, *retry_delay_ms),
            ),
            CodeBoxConfig::Local { root, python } => {
                Arc::new(LocalCodeBox::new(root.clone()).with_python(python.clone()))
            }
        }
    }
}

/// Configuration for one interpreter conversation
#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    /// Model to use for Ollama (e.g., "qwen3")
    pub model: String,
    /// Base URL of the Ollama server
    pub ollama_url: String,
    /// Automatic error-correction retries allowed per turn
    pub max_retries: u32,
    pub model_timeout: Duration,
    pub execution_timeout: Duration,
    /// Executable code block language
    pub language: String,
    pub memory_policy: MemoryPolicy,
    /// Put the underlying error text in failed turns' content
    pub detailed_errors: bool,
    /// Echo code and outputs at info level
    pub verbose: bool,
    /// Custom system prompt (uses default if None)
    pub system_prompt: Option<String>,
    /// Offer the model a `python` tool instead of relying on fences alone
    pub use_tools: bool,
    /// Caller tool rounds allowed per turn
    pub max_tool_rounds: u32,
    pub codebox: CodeBoxConfig,
    /// OTLP collector for trace export
    pub otlp_endpoint: Option<String>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            model: "qwen3".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            max_retries: 3,
            model_timeout: Duration::from_secs(180),
            execution_timeout: Duration::from_secs(60),
            language: "python".to_string(),
            memory_policy: MemoryPolicy::KeepAll,
            detailed_errors: false,
            verbose: false,
            system_prompt: None,
            use_tools: false,
            max_tool_rounds: 5,
            codebox: CodeBoxConfig::default(),
            otlp_endpoint: None,
        }
    }
}

impl InterpreterConfig {
    /// Load from `.env` and the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(model) = get("INTERPRETER_MODEL") {
            config.model = model;
        }
        if let Some(host) = get("OLLAMA_HOST") {
            config.ollama_url = normalize_host(&host);
        }
        if let Some(v) = get("INTERPRETER_MAX_RETRIES") {
            config.max_retries = parse_number("INTERPRETER_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("INTERPRETER_MAX_TOOL_ROUNDS") {
            config.max_tool_rounds = parse_number("INTERPRETER_MAX_TOOL_ROUNDS", &v)?;
        }
        if let Some(v) = get("INTERPRETER_MODEL_TIMEOUT") {
            config.model_timeout =
                Duration::from_secs(parse_number("INTERPRETER_MODEL_TIMEOUT", &v)?);
        }
        if let Some(v) = get("INTERPRETER_EXECUTION_TIMEOUT") {
            config.execution_timeout =
                Duration::from_secs(parse_number("INTERPRETER_EXECUTION_TIMEOUT", &v)?);
        }
        if let Some(v) = get("INTERPRETER_MEMORY") {
            config.memory_policy =
                MemoryPolicy::parse(&v).ok_or_else(|| ConfigError::InvalidValue {
                    key: "INTERPRETER_MEMORY",
                    value: v.clone(),
                    reason: "expected all, last:N, tokens:N or summarize:N".to_string(),
                })?;
        }
        if let Some(v) = get("INTERPRETER_VERBOSE") {
            config.verbose = parse_bool("INTERPRETER_VERBOSE", &v)?;
        }
        if let Some(v) = get("INTERPRETER_DETAILED_ERRORS") {
            config.detailed_errors = parse_bool("INTERPRETER_DETAILED_ERRORS", &v)?;
        }
        if let Some(url) = get("CODEBOX_API_URL") {
            config.codebox = CodeBoxConfig::Remote {
                url,
                api_key: get("CODEBOX_API_KEY"),
                open_retries: 3,
                retry_delay_ms: 500,
            };
        }
        config.otlp_endpoint = get("OTEL_EXPORTER_OTLP_ENDPOINT");

        Ok(config)
    }

    pub fn system_prompt(&self) -> &str {
        self.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }
}

/// `OLLAMA_HOST` may be a bare host:port
fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}
