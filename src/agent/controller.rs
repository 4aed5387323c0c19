//! Interpreter - the execution loop for one conversation
//!
//! Drives every user request through the cycle
//!
//! ```text
//! AwaitingUserInput → Prompting → Parsing → Executing → Classifying
//!        ▲                 ▲                                 │
//!        │                 └──────────── Retrying ◄──────────┤ recoverable, budget left
//!        └─────────────────────────── Finalizing ◄───────────┘ success / exhausted / fatal
//! ```
//!
//! and always hands back a finalized `Turn`, even on failure. Errors never
//! escape `submit`; they are recorded on the turn.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::events::{EventSink, TurnEvent, TurnEventStream};
use super::memory::ConversationMemory;
use super::model::{LanguageModel, ModelOutput, ToolRequest, ToolSpec};
use super::tools::{tool_feedback, Tool, ToolRegistry};
use crate::classifier::{classify, Classification, FatalKind, RecoverableKind};
use crate::codebox::{CodeBox, SandboxSession};
use crate::config::InterpreterConfig;
use crate::error::{InterpreterError, ToolError};
use crate::metrics::{
    ARTIFACTS_PRODUCED, CODE_EXECUTIONS, LLM_CALL_TIME, LLM_ERRORS, TOOL_CALLS, TURNS_TOTAL,
    TURN_DURATION, TURN_RETRIES,
};
use crate::ollama::ChatClient;
use crate::parser::{strip_artifact_links, ResponseParser};
use crate::types::{Artifact, Turn, TurnStatus};

/// User-facing text for failed turns when detailed errors are off
pub const GENERIC_FAILURE_MESSAGE: &str = "Sorry, something went wrong while generating your \
    response. Please try again or restart the session.";

/// Per-turn bound on automatic error-correction retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    max: u32,
    remaining: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self {
            max,
            remaining: max,
        }
    }

    /// Spend one retry; `false` once the budget is exhausted
    pub fn try_consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn used(&self) -> u32 {
        self.max - self.remaining
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}

/// One conversation: a model, a sandbox session and the history between them
pub struct Interpreter {
    model: Arc<dyn LanguageModel>,
    backend: Arc<dyn CodeBox>,
    session: SandboxSession,
    memory: ConversationMemory,
    parser: ResponseParser,
    config: InterpreterConfig,
    events: EventSink,
    tools: ToolRegistry,
}

impl Interpreter {
    /// Create an interpreter over explicit collaborators
    ///
    /// # Arguments
    /// * `model` - Language model capability
    /// * `backend` - Code box the sandbox session runs code in
    /// * `config` - Retry, timeout and memory settings
    pub fn new(
        model: Arc<dyn LanguageModel>,
        backend: Arc<dyn CodeBox>,
        config: InterpreterConfig,
    ) -> Self {
        Self {
            model,
            session: SandboxSession::new(backend.clone(), config.execution_timeout),
            backend,
            memory: ConversationMemory::new(config.memory_policy),
            parser: ResponseParser::new(config.language.clone()),
            config,
            events: EventSink::default(),
            tools: ToolRegistry::new(),
        }
    }

    /// Create an interpreter using Ollama and the configured code box
    pub fn from_config(config: InterpreterConfig) -> Self {
        let model = ChatClient::new(config.ollama_url.clone(), config.model.clone())
            .with_timeout(config.model_timeout)
            .with_tools(config.use_tools);
        let backend = config.codebox.build();
        Self::new(Arc::new(model), backend, config)
    }

    /// Offer a caller tool to the model on every later turn
    ///
    /// The name `python` is reserved for code execution.
    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        self.tools.register(tool)?;
        debug!(tools = ?self.tools.names(), "Tool registered");
        Ok(())
    }

    /// Builder form of `register_tool`
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Result<Self, ToolError> {
        self.register_tool(tool)?;
        Ok(self)
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Continue a previous conversation
    pub fn with_memory(mut self, memory: ConversationMemory) -> Self {
        self.memory = memory;
        self
    }

    /// Acquire the sandbox context up front instead of on first execution
    pub async fn start(&mut self) -> Result<(), InterpreterError> {
        Ok(self.session.start().await?)
    }

    /// Stream of progress events for every subsequent turn
    pub fn subscribe(&mut self) -> TurnEventStream {
        self.events.subscribe()
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn session(&self) -> &SandboxSession {
        &self.session
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub async fn is_running(&self) -> bool {
        self.session.is_running().await
    }

    /// Forget the conversation and start over with a fresh sandbox context
    pub async fn reset(&mut self) -> Result<(), InterpreterError> {
        self.session.stop().await?;
        self.session = SandboxSession::new(self.backend.clone(), self.config.execution_timeout);
        self.memory = ConversationMemory::new(self.config.memory_policy);
        info!("Conversation reset");
        Ok(())
    }

    /// Release the sandbox context; later turns fail with `SessionClosed`
    pub async fn close(&mut self) -> Result<(), InterpreterError> {
        Ok(self.session.stop().await?)
    }

    /// Handle one user request
    pub async fn submit(&mut self, text: &str, files: Vec<Artifact>) -> Turn {
        self.submit_cancellable(text, files, &CancellationToken::new())
            .await
    }

    /// Handle one user request, abandoning it when `cancel` fires
    ///
    /// A cancelled turn keeps the results of code that already ran but is not
    /// added to memory.
    pub async fn submit_cancellable(
        &mut self,
        text: &str,
        files: Vec<Artifact>,
        cancel: &CancellationToken,
    ) -> Turn {
        let trace_id = Uuid::now_v7().to_string();
        let turn_span = info_span!(
            "turn",
            trace_id = %trace_id,
            model = %self.model.name(),
            otel.name = "turn"
        );
        let started = Instant::now();

        let turn = self
            .run_turn(text, files, cancel, &trace_id)
            .instrument(turn_span)
            .await;

        TURNS_TOTAL.with_label_values(&[turn.status.as_str()]).inc();
        TURN_RETRIES.observe(turn.retries as f64);
        TURN_DURATION.observe(started.elapsed().as_secs_f64());

        let remember = turn.status != TurnStatus::Cancelled
            && !turn.error.as_ref().is_some_and(InterpreterError::is_model_failure);
        if remember {
            self.memory.append(turn.clone());
        }

        info!(
            trace_id = %trace_id,
            status = turn.status.as_str(),
            retries = turn.retries,
            artifacts = turn.artifacts.len(),
            remembered = remember,
            "Turn finalized"
        );
        self.events.emit(TurnEvent::TurnFinalized {
            turn_id: turn.id.clone(),
            status: turn.status,
            retries: turn.retries,
        });
        turn
    }

    async fn run_turn(
        &mut self,
        text: &str,
        files: Vec<Artifact>,
        cancel: &CancellationToken,
        trace_id: &str,
    ) -> Turn {
        self.session.begin_turn();
        let mut budget = RetryBudget::new(self.config.max_retries);
        let input_files: Vec<String> = files.iter().map(|f| f.name.clone()).collect();
        let context = TurnContext {
            turn_id: Uuid::now_v7().to_string(),
            request: request_text(text, &input_files),
            input_files,
        };
        let turn_id = context.turn_id.as_str();

        debug!(
            state = "awaiting_user_input",
            files = context.input_files.len(),
            "Request received"
        );

        if let Err(e) = self.upload_inputs(&files, cancel).await {
            let status = status_for(&e);
            return self.finalize(Turn::assistant("", vec![]), &context, status, Some(e), 0);
        }

        let mut system = self.config.system_prompt().to_string();
        if let Some(section) = self.tools.prompt_section() {
            system.push_str("\n\n");
            system.push_str(&section);
        }
        let tool_specs = self.tools.specs();

        let mut transcript = vec![Turn::system(system)];
        transcript.extend(self.memory.build_prompt());
        transcript.push(Turn::user(context.request.clone()));

        let mut attempt: u32 = 0;
        let mut tool_rounds: u32 = 0;
        let mut previous: Option<Turn> = None;

        loop {
            attempt += 1;
            debug!(state = "prompting", attempt, history = transcript.len(), "Calling model");

            let output = self
                .call_model(&transcript, &tool_specs, cancel, trace_id, attempt)
                .await;
            let ModelOutput {
                text: raw,
                tool_requests,
            } = match output {
                Ok(output) => output,
                Err(e) => {
                    let status = status_for(&e);
                    let turn = previous.take().unwrap_or_else(|| Turn::assistant("", vec![]));
                    return self.finalize(turn, &context, status, Some(e), budget.used());
                }
            };

            debug!(state = "parsing", attempt, len = raw.len(), tools = tool_requests.len());
            let parsed = self.parser.parse(&raw);
            self.events.emit(TurnEvent::ModelResponseReceived {
                turn_id: turn_id.to_string(),
                attempt,
                code_blocks: parsed.code_blocks.len(),
            });

            let mut response = Turn::assistant(parsed.prose.clone(), parsed.code_blocks.clone());

            if !parsed.has_code() && tool_requests.is_empty() {
                debug!(state = "finalizing", malformed = parsed.malformed, "Prose-only response");
                let error = parsed.malformed.then(|| {
                    InterpreterError::MalformedResponse(if parsed.prose.trim().is_empty() {
                        "empty response".to_string()
                    } else {
                        "unterminated code fence".to_string()
                    })
                });
                let retries = budget.used();
                return self.finalize(response, &context, TurnStatus::Success, error, retries);
            }

            if parsed.has_code() {
                debug!(state = "executing", blocks = response.code_blocks.len());
                if let Err(e) = self.execute_blocks(&mut response, turn_id, cancel, trace_id).await
                {
                    let status = status_for(&e);
                    return self.finalize(response, &context, status, Some(e), budget.used());
                }

                let classification = response
                    .last_execution()
                    .map(classify)
                    .unwrap_or(Classification::Success);
                debug!(state = "classifying", outcome = classification.label());

                match classification {
                    Classification::Success if tool_requests.is_empty() => {
                        let (status, retries) = (TurnStatus::Success, budget.used());
                        return self.finalize(response, &context, status, None, retries);
                    }
                    Classification::Success => {}
                    Classification::Fatal(kind) => {
                        let text = response.last_error_text().unwrap_or_default().to_string();
                        warn!(kind = ?kind, "Fatal execution error");
                        let error = match kind {
                            FatalKind::ResourceExhausted | FatalKind::SessionFailure => {
                                InterpreterError::FatalExecution(text)
                            }
                        };
                        let retries = budget.used();
                        return self.finalize(
                            response,
                            &context,
                            TurnStatus::Failed,
                            Some(error),
                            retries,
                        );
                    }
                    Classification::Recoverable(kind) => {
                        let error_text = response.last_error_text().unwrap_or_default().to_string();
                        if !budget.try_consume() {
                            warn!(retries = budget.used(), "Retry budget exhausted");
                            let retries = budget.used();
                            let error = InterpreterError::RetryExhausted {
                                retries,
                                last_error: error_text,
                            };
                            return self.finalize(
                                response,
                                &context,
                                TurnStatus::RetryExhausted,
                                Some(error),
                                retries,
                            );
                        }

                        info!(
                            retry = budget.used(),
                            remaining = budget.remaining(),
                            kind = ?kind,
                            "Retrying after recoverable error"
                        );
                        self.events.emit(TurnEvent::RetryTriggered {
                            turn_id: turn_id.to_string(),
                            retry: budget.used(),
                            error: error_text.clone(),
                        });

                        let feedback = self.feedback_for(&kind, &error_text).await;
                        debug!(state = "retrying", attempt);
                        transcript.push(response.clone());
                        transcript.push(Turn::user(feedback));
                        previous = Some(response);
                        continue;
                    }
                }
            }

            tool_rounds += 1;
            if tool_rounds > self.config.max_tool_rounds {
                warn!(rounds = tool_rounds - 1, "Tool round limit reached");
                let error = InterpreterError::ToolCall(format!(
                    "the model kept calling tools after {} rounds",
                    self.config.max_tool_rounds
                ));
                let retries = budget.used();
                return self.finalize(response, &context, TurnStatus::Failed, Some(error), retries);
            }

            let (feedback, failure) = match self
                .call_tools(&tool_requests, &mut response, turn_id, cancel, trace_id)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    let status = status_for(&e);
                    return self.finalize(response, &context, status, Some(e), budget.used());
                }
            };

            let feedback = match failure {
                None => feedback,
                Some(error_text) => {
                    if !budget.try_consume() {
                        warn!(retries = budget.used(), "Retry budget exhausted on a tool call");
                        let retries = budget.used();
                        let error = InterpreterError::RetryExhausted {
                            retries,
                            last_error: error_text,
                        };
                        return self.finalize(
                            response,
                            &context,
                            TurnStatus::RetryExhausted,
                            Some(error),
                            retries,
                        );
                    }
                    self.events.emit(TurnEvent::RetryTriggered {
                        turn_id: turn_id.to_string(),
                        retry: budget.used(),
                        error: error_text,
                    });
                    format!("{}\nPlease fix the tool call or continue without it.", feedback)
                }
            };

            debug!(state = "tool_feedback", round = tool_rounds);
            transcript.push(response.clone());
            transcript.push(Turn::user(feedback));
            previous = Some(response);
        }
    }

    /// Upload the request's input files, honouring cancellation
    async fn upload_inputs(
        &mut self,
        files: &[Artifact],
        cancel: &CancellationToken,
    ) -> Result<(), InterpreterError> {
        for file in files {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(InterpreterError::Cancelled),
                result = self.session.upload(&file.name, &file.content) => result?,
            }
            info!(file = %file.name, size = file.size(), "Input file uploaded");
        }
        Ok(())
    }

    async fn call_model(
        &self,
        transcript: &[Turn],
        tools: &[ToolSpec],
        cancel: &CancellationToken,
        trace_id: &str,
        attempt: u32,
    ) -> Result<ModelOutput, InterpreterError> {
        let llm_span = info_span!(
            "llm_call",
            trace_id = %trace_id,
            attempt,
            model = %self.model.name(),
            otel.name = "llm_call"
        );
        let timeout = self.config.model_timeout;
        let call_start = Instant::now();
        let generate = self.model.generate_with_tools(transcript, tools);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InterpreterError::Cancelled),
            outcome = tokio::time::timeout(timeout, generate).instrument(llm_span) => outcome,
        };

        let elapsed = call_start.elapsed();
        LLM_CALL_TIME
            .with_label_values(&[self.model.name()])
            .observe(elapsed.as_secs_f64());

        let result = match outcome {
            Err(_) => Err(InterpreterError::ModelTimeout(timeout.as_millis() as u64)),
            Ok(Err(e)) => Err(InterpreterError::from(e)),
            Ok(Ok(output)) => Ok(output),
        };

        match &result {
            Ok(output) => {
                info!(
                    attempt,
                    duration_ms = elapsed.as_secs_f64() * 1000.0,
                    len = output.text.len(),
                    tool_requests = output.tool_requests.len(),
                    "LLM call completed"
                )
            }
            Err(e) => {
                LLM_ERRORS.with_label_values(&[e.label()]).inc();
                warn!(attempt, error = %e, "LLM call failed");
            }
        }
        result
    }

    /// Run the model's caller tool requests in order
    ///
    /// Returns the feedback for the model and, when any call failed, the first
    /// failure's text. The calls are noted on `response` so the model sees
    /// what it asked for on the next attempt.
    async fn call_tools(
        &mut self,
        requests: &[ToolRequest],
        response: &mut Turn,
        turn_id: &str,
        cancel: &CancellationToken,
        trace_id: &str,
    ) -> Result<(String, Option<String>), InterpreterError> {
        let timeout = self.config.execution_timeout;
        let mut reports = Vec::with_capacity(requests.len());
        let mut failure = None;

        for request in requests {
            let tool_span = info_span!(
                "tool_call",
                trace_id = %trace_id,
                tool = %request.name,
                otel.name = "tool_call"
            );
            let started = Instant::now();
            let call = tokio::time::timeout(timeout, self.tools.invoke(request));
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(InterpreterError::Cancelled),
                outcome = call.instrument(tool_span) => outcome,
            };
            let outcome = outcome.unwrap_or_else(|_| {
                Err(ToolError::Failed(format!("timed out after {} s", timeout.as_secs())))
            });

            let succeeded = outcome.is_ok();
            let label = if succeeded { "success" } else { "error" };
            TOOL_CALLS.with_label_values(&[label]).inc();
            match &outcome {
                Ok(output) => info!(
                    tool = %request.name,
                    len = output.len(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Tool call completed"
                ),
                Err(e) => warn!(tool = %request.name, error = %e, "Tool call failed"),
            }
            self.events.emit(TurnEvent::ToolCalled {
                turn_id: turn_id.to_string(),
                name: request.name.clone(),
                succeeded,
            });

            if !response.content.is_empty() {
                response.content.push('\n');
            }
            response
                .content
                .push_str(&format!("[Tool call: {}({})]", request.name, request.arguments));

            let report = tool_feedback(request, &outcome, &self.tools);
            if let Err(e) = &outcome {
                failure.get_or_insert_with(|| format!("{}: {}", request.name, e));
            }
            reports.push(report);
        }
        Ok((reports.join("\n\n"), failure))
    }

    /// Run the response's code blocks in order, stopping at the first failure
    async fn execute_blocks(
        &mut self,
        response: &mut Turn,
        turn_id: &str,
        cancel: &CancellationToken,
        trace_id: &str,
    ) -> Result<(), InterpreterError> {
        let blocks = response.code_blocks.clone();

        for (index, block) in blocks.iter().enumerate() {
            self.events.emit(TurnEvent::CodeBlockExecuting {
                turn_id: turn_id.to_string(),
                index,
                code: block.source.clone(),
            });
            if self.config.verbose {
                info!(index, code = %block.source, "Executing code block");
            }

            let exec_span = info_span!(
                "code_execution",
                trace_id = %trace_id,
                index,
                code_len = block.source.len(),
                otel.name = "code_execution"
            );
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(InterpreterError::Cancelled),
                result = self.session.execute(&block.source).instrument(exec_span) => result?,
            };

            let classification = classify(&result);
            CODE_EXECUTIONS
                .with_label_values(&[classification.label()])
                .inc();
            if self.config.verbose {
                info!(
                    index,
                    stdout = %result.stdout,
                    stderr = %result.stderr,
                    outcome = classification.label(),
                    "Execution output"
                );
            } else {
                debug!(
                    index,
                    sequence = result.sequence,
                    outcome = classification.label(),
                    duration_ms = result.duration_ms,
                    "Code block executed"
                );
            }

            for artifact in &result.artifacts {
                ARTIFACTS_PRODUCED
                    .with_label_values(&[artifact.content_type.as_str()])
                    .inc();
                self.events.emit(TurnEvent::artifact(turn_id, artifact));
            }
            response.artifacts.extend(result.artifacts.iter().cloned());

            let failed = !result.is_ok();
            response.executions.push(result);
            if failed {
                if index + 1 < blocks.len() {
                    let skipped = blocks.len() - index - 1;
                    debug!(index, skipped, "Stopping at first failing block");
                }
                break;
            }
        }
        Ok(())
    }

    /// Message telling the model what went wrong
    async fn feedback_for(&mut self, kind: &RecoverableKind, error_text: &str) -> String {
        if let RecoverableKind::MissingModule(package) = kind {
            return match self.session.install(package).await {
                Ok(()) => format!(
                    "The code failed because the module `{}` was missing:\n```\n{}\n```\n\
                     It has now been installed. Please run the code again.",
                    package,
                    error_text.trim_end()
                ),
                Err(e) => {
                    warn!(package = %package, error = %e, "Package installation failed");
                    format!(
                        "The code failed because the module `{}` is missing and it could not \
                         be installed ({}). Please solve the task without it.",
                        package, e
                    )
                }
            };
        }

        let hint = match kind {
            RecoverableKind::Timeout => {
                "The code took too long. Make it faster or process less data."
            }
            RecoverableKind::Syntax => "Please fix the syntax and try again.",
            _ => "Please fix the code and try again.",
        };
        format!(
            "The code failed with the following error:\n```\n{}\n```\n{}",
            error_text.trim_end(),
            hint
        )
    }

    fn finalize(
        &self,
        mut turn: Turn,
        context: &TurnContext,
        status: TurnStatus,
        error: Option<InterpreterError>,
        retries: u32,
    ) -> Turn {
        turn.id = context.turn_id.clone();
        turn.request = Some(context.request.clone());
        turn.input_files = context.input_files.clone();
        turn.status = status;
        turn.retries = retries;
        turn.content = strip_artifact_links(&turn.content, &turn.artifacts);

        if status != TurnStatus::Success {
            if let Some(e) = &error {
                let message = if self.config.detailed_errors {
                    format!("Error: {}", e)
                } else {
                    GENERIC_FAILURE_MESSAGE.to_string()
                };
                if !turn.content.is_empty() {
                    turn.content.push_str("\n\n");
                }
                turn.content.push_str(&message);
            }
        }
        turn.error = error;
        turn
    }
}

/// Identity of the turn being produced
struct TurnContext {
    turn_id: String,
    request: String,
    input_files: Vec<String>,
}

/// Status of a turn ending in `error` outside the retry path
fn status_for(error: &InterpreterError) -> TurnStatus {
    match error {
        InterpreterError::Cancelled => TurnStatus::Cancelled,
        _ => TurnStatus::Failed,
    }
}

/// The request as the model sees it, with attachment notes
pub fn request_text(text: &str, input_files: &[String]) -> String {
    if input_files.is_empty() {
        return text.to_string();
    }
    let mut request = if text.trim().is_empty() {
        "I uploaded the attached file(s). Please confirm you can access them.".to_string()
    } else {
        text.to_string()
    };
    for name in input_files {
        request.push_str(&format!("\n[Attachment: {}]", name));
    }
    request.push_str("\nThe attached files are available in the current working directory.");
    request
}
