//! Scripted collaborators for interpreter integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use codebox_interpreter::codebox::{CodeBoxOutput, CodeBoxStatus, SessionHandle};
use codebox_interpreter::config::InterpreterConfig;
use codebox_interpreter::error::ToolError;
use codebox_interpreter::{
    CodeBox, CodeBoxError, Interpreter, LanguageModel, ModelError, ModelOutput, Tool, ToolRequest,
    ToolSpec, Turn,
};
use serde_json::Value;

/// Smallest valid PNG signature plus filler
pub const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR";

/// Code containing this marker never finishes executing
pub const HANG: &str = "# hang";

/// Model replaying scripted responses and recording every transcript it saw
#[derive(Default)]
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Result<String, ModelError>>>,
    transcripts: Mutex<Vec<Vec<Turn>>>,
    delay: Option<Duration>,
    outputs: Mutex<VecDeque<ModelOutput>>,
    offered: Mutex<Vec<Vec<String>>>,
}

impl ScriptedModel {
    pub fn new<I, S>(responses: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().map(|r| Ok(r.into())).collect()),
            ..Default::default()
        })
    }

    pub fn with_results(results: Vec<Result<String, ModelError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(results.into()),
            ..Default::default()
        })
    }

    /// Model that takes `delay` to answer anything
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    /// Model replaying full outputs, tool requests included
    pub fn with_outputs(outputs: Vec<ModelOutput>) -> Arc<Self> {
        Arc::new(Self {
            outputs: Mutex::new(outputs.into()),
            ..Default::default()
        })
    }

    /// Tool names offered on each call
    pub fn offered(&self) -> Vec<Vec<String>> {
        self.offered.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.transcripts.lock().unwrap().len()
    }

    pub fn transcript(&self, call: usize) -> Vec<Turn> {
        self.transcripts.lock().unwrap()[call].clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(&self, transcript: &[Turn]) -> Result<String, ModelError> {
        self.transcripts.lock().unwrap().push(transcript.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("Done.".to_string()))
    }

    async fn generate_with_tools(
        &self,
        transcript: &[Turn],
        tools: &[ToolSpec],
    ) -> Result<ModelOutput, ModelError> {
        let names = tools.iter().map(|t| t.name.clone()).collect();
        self.offered.lock().unwrap().push(names);
        let scripted = self.outputs.lock().unwrap().pop_front();
        match scripted {
            Some(output) => {
                self.transcripts.lock().unwrap().push(transcript.to_vec());
                Ok(output)
            }
            None => Ok(self.generate(transcript).await?.into()),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// In-memory code box replaying scripted execution outcomes
///
/// Unscripted executions succeed with empty output.
#[derive(Default)]
pub struct FakeCodeBox {
    outcomes: Mutex<VecDeque<Result<CodeBoxOutput, CodeBoxError>>>,
    pub executed: Mutex<Vec<String>>,
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub installed: Mutex<Vec<String>>,
    pub opens: Mutex<u32>,
    pub closes: Mutex<u32>,
}

impl FakeCodeBox {
    pub fn new(outcomes: Vec<Result<CodeBoxOutput, CodeBoxError>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            ..Default::default()
        })
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn opens(&self) -> u32 {
        *self.opens.lock().unwrap()
    }

    pub fn put_file(&self, name: &str, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(name.to_string(), content.to_vec());
    }
}

#[async_trait]
impl CodeBox for FakeCodeBox {
    async fn open(&self) -> Result<SessionHandle, CodeBoxError> {
        let mut opens = self.opens.lock().unwrap();
        *opens += 1;
        Ok(SessionHandle::new(format!("fake-{}", opens)))
    }

    async fn execute(
        &self,
        _handle: &SessionHandle,
        code: &str,
    ) -> Result<CodeBoxOutput, CodeBoxError> {
        self.executed.lock().unwrap().push(code.to_string());
        if code.contains(HANG) {
            std::future::pending::<()>().await;
        }
        let next = self.outcomes.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(CodeBoxOutput::text("")))
    }

    async fn upload(
        &self,
        _handle: &SessionHandle,
        name: &str,
        content: &[u8],
    ) -> Result<(), CodeBoxError> {
        self.put_file(name, content);
        Ok(())
    }

    async fn download(&self, _handle: &SessionHandle, name: &str) -> Result<Vec<u8>, CodeBoxError> {
        self.files
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| CodeBoxError::Rejected(format!("no such file: {}", name)))
    }

    async fn install(&self, _handle: &SessionHandle, package: &str) -> Result<(), CodeBoxError> {
        self.installed.lock().unwrap().push(package.to_string());
        Ok(())
    }

    async fn status(&self, _handle: &SessionHandle) -> Result<CodeBoxStatus, CodeBoxError> {
        Ok(CodeBoxStatus::Running)
    }

    async fn close(&self, _handle: &SessionHandle) -> Result<(), CodeBoxError> {
        *self.closes.lock().unwrap() += 1;
        Ok(())
    }
}

/// Caller tool that echoes its `text` argument and counts calls
#[derive(Default)]
pub struct EchoTool {
    pub calls: Mutex<Vec<Value>>,
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Repeat the given text"
    }

    async fn call(&self, arguments: Value) -> Result<String, ToolError> {
        self.calls.lock().unwrap().push(arguments.clone());
        arguments["text"]
            .as_str()
            .map(|t| format!("echo: {}", t))
            .ok_or_else(|| ToolError::InvalidArguments("text is required".to_string()))
    }
}

/// Model output asking for one tool
pub fn tool_call(text: &str, name: &str, arguments: Value) -> ModelOutput {
    ModelOutput {
        text: text.to_string(),
        tool_requests: vec![ToolRequest {
            name: name.to_string(),
            arguments,
        }],
    }
}

/// A python fence around `code`
pub fn fence(code: &str) -> String {
    format!("```python\n{}\n```", code)
}

pub fn traceback(last_line: &str) -> String {
    format!(
        "Traceback (most recent call last):\n  File \"<stdin>\", line 1, in <module>\n{}",
        last_line
    )
}

pub fn config_with_retries(max_retries: u32) -> InterpreterConfig {
    InterpreterConfig {
        max_retries,
        ..Default::default()
    }
}

pub fn interpreter(
    model: &Arc<ScriptedModel>,
    codebox: &Arc<FakeCodeBox>,
    config: InterpreterConfig,
) -> Interpreter {
    Interpreter::new(model.clone(), codebox.clone(), config)
}
