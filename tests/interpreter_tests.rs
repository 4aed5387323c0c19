//! Integration tests for the interpreter loop
//!
//! The model and the code box are scripted fakes, so these tests exercise the
//! real parser, classifier, sandbox session, memory and controller without
//! Ollama or a sandbox service.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use codebox_interpreter::agent::GENERIC_FAILURE_MESSAGE;
use codebox_interpreter::codebox::CodeBoxOutput;
use codebox_interpreter::{
    Artifact, CodeBoxError, ConnectionState, Interpreter, InterpreterConfig, InterpreterError,
    LocalCodeBox, ModelError, ModelOutput, Role, ToolError, TurnEvent, TurnStatus,
};

use common::{
    config_with_retries, fence, interpreter, tool_call, traceback, EchoTool, FakeCodeBox,
    ScriptedModel, HANG, PNG,
};

fn failure(text: &str) -> Result<CodeBoxOutput, CodeBoxError> {
    Ok(CodeBoxOutput::error(traceback(text)))
}

fn output(stdout: &str) -> Result<CodeBoxOutput, CodeBoxError> {
    Ok(CodeBoxOutput::text(stdout))
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_n_successful_submits_give_n_turns() {
    let model = ScriptedModel::new((0..4).map(|i| fence(&format!("print({})", i))));
    let codebox = FakeCodeBox::new(vec![]);
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default());

    for i in 0..4 {
        let turn = interp.submit(&format!("request {}", i), vec![]).await;
        assert_eq!(turn.status, TurnStatus::Success);
    }

    assert_eq!(interp.memory().len(), 4);
    assert!(interp.memory().turns().iter().all(|t| t.is_finalized()));
    assert_eq!(codebox.opens(), 1, "one context for the whole conversation");
}

#[tokio::test]
async fn test_history_is_replayed_to_the_model() {
    let model = ScriptedModel::new(["First answer.", "Second answer."]);
    let codebox = FakeCodeBox::new(vec![]);
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default());

    interp.submit("first question", vec![]).await;
    interp.submit("second question", vec![]).await;

    let second = model.transcript(1);
    assert_eq!(second.len(), 3);
    assert_eq!(second[0].role, Role::System);
    assert_eq!(second[1].request.as_deref(), Some("first question"));
    assert_eq!(second[1].content, "First answer.");
    assert_eq!(second[2].role, Role::User);
    assert_eq!(second[2].content, "second question");
}

#[tokio::test]
async fn test_prose_only_response_finalizes_without_execution() {
    let model = ScriptedModel::new(["2 + 2 is 4."]);
    let codebox = FakeCodeBox::new(vec![]);
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default());

    let turn = interp.submit("what is 2 + 2?", vec![]).await;

    assert_eq!(turn.status, TurnStatus::Success);
    assert_eq!(turn.content, "2 + 2 is 4.");
    assert!(turn.executions.is_empty());
    assert!(turn.error.is_none());
    assert!(codebox.executed().is_empty());
    assert_eq!(codebox.opens(), 0, "no context allocated without code");
    assert_eq!(interp.memory().len(), 1);
}

#[tokio::test]
async fn test_empty_response_is_malformed_but_not_fatal() {
    let model = ScriptedModel::new([""]);
    let codebox = FakeCodeBox::new(vec![]);
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default());

    let turn = interp.submit("hello?", vec![]).await;

    assert_eq!(turn.status, TurnStatus::Success);
    assert!(matches!(turn.error, Some(InterpreterError::MalformedResponse(_))));
    assert_eq!(interp.memory().len(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_plot_sine_wave_produces_one_image() {
    let response = format!(
        "Here is the plot:\n{}\n![sine wave](sandbox:/mnt/data/sine.png)",
        fence(
            "import numpy as np\nimport matplotlib.pyplot as plt\n\
             x = np.linspace(0, 6.28)\nplt.plot(x, np.sin(x))\nplt.show()"
        )
    );
    let model = ScriptedModel::new([response]);
    let image = Artifact::with_content_type("", "image/png", PNG.to_vec());
    let codebox = FakeCodeBox::new(vec![Ok(CodeBoxOutput::text("").with_artifact(image))]);
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default());

    let turn = interp.submit("plot sine wave", vec![]).await;

    assert_eq!(turn.status, TurnStatus::Success);
    assert_eq!(turn.artifacts.len(), 1);
    assert!(turn.artifacts[0].is_image());
    assert!(turn.artifacts[0].name.starts_with("image-"));
    assert!(turn.artifacts[0].name.ends_with(".png"));
    assert!(!turn.content.contains("sandbox:"));
    assert_eq!(turn.content, "Here is the plot:\n[code block 1]");
}

#[tokio::test]
async fn test_division_by_zero_retries_once_then_succeeds() {
    let model = ScriptedModel::new([
        fence("print(1 / 0)"),
        fence("print(1 / 2)"),
    ]);
    let codebox = FakeCodeBox::new(vec![
        failure("ZeroDivisionError: division by zero"),
        output("0.5\n"),
    ]);
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default());

    let turn = interp.submit("divide 1 by 0, then fix it", vec![]).await;

    assert_eq!(turn.status, TurnStatus::Success);
    assert_eq!(turn.retries, 1);
    assert_eq!(turn.executions.len(), 1);
    assert_eq!(turn.executions[0].stdout, "0.5\n");
    assert_eq!(model.calls(), 2);

    let retry_prompt = model.transcript(1);
    let feedback = retry_prompt.last().unwrap();
    assert_eq!(feedback.role, Role::User);
    assert!(feedback.content.contains("ZeroDivisionError: division by zero"));
    // The failed attempt is shown to the model with its error inlined
    let failed_attempt = &retry_prompt[retry_prompt.len() - 2];
    assert_eq!(failed_attempt.role, Role::Assistant);
    assert!(failed_attempt.render().contains("Error:"));
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let model = ScriptedModel::new([
        fence("int('a')"),
        fence("int('b')"),
        fence("int('c')"),
    ]);
    let codebox = FakeCodeBox::new(vec![
        failure("ValueError: invalid literal for int() with base 10: 'a'"),
        failure("ValueError: invalid literal for int() with base 10: 'b'"),
        failure("ValueError: invalid literal for int() with base 10: 'c'"),
    ]);
    let mut interp = interpreter(&model, &codebox, config_with_retries(2));

    let turn = interp.submit("parse some letters", vec![]).await;

    assert_eq!(turn.status, TurnStatus::RetryExhausted);
    assert_eq!(turn.retries, 2);
    match &turn.error {
        Some(InterpreterError::RetryExhausted { retries, last_error }) => {
            assert_eq!(*retries, 2);
            assert!(last_error.contains("'c'"));
        }
        other => panic!("expected RetryExhausted, got {:?}", other),
    }
    assert!(turn.last_error_text().unwrap().contains("'c'"));
    assert_eq!(model.calls(), 3);
    assert_eq!(codebox.executed().len(), 3);
    // Exhausted turns are still part of the conversation
    assert_eq!(interp.memory().len(), 1);
}

#[tokio::test]
async fn test_retries_never_exceed_budget() {
    for budget in 0..=3u32 {
        let model = ScriptedModel::new((0..10).map(|_| fence("assert False")));
        let codebox = FakeCodeBox::new((0..10).map(|_| failure("AssertionError")).collect());
        let mut interp = interpreter(&model, &codebox, config_with_retries(budget));

        let turn = interp.submit("keep failing", vec![]).await;

        assert_eq!(turn.retries, budget);
        assert_eq!(model.calls() as u32, budget + 1);
        assert_eq!(turn.status, TurnStatus::RetryExhausted);
    }
}

#[tokio::test]
async fn test_connectivity_drop_reconnects_without_spending_budget() {
    let model = ScriptedModel::new([fence("print(42)")]);
    let codebox = FakeCodeBox::new(vec![
        Err(CodeBoxError::Transport("connection reset by peer".into())),
        output("42\n"),
    ]);
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default());

    let turn = interp.submit("print 42", vec![]).await;

    assert_eq!(turn.status, TurnStatus::Success);
    assert_eq!(turn.retries, 0);
    assert_eq!(turn.executions[0].stdout, "42\n");
    assert_eq!(codebox.opens(), 2, "exactly one reconnect");
    assert_eq!(codebox.executed().len(), 2, "the code was re-run");
    assert_eq!(model.calls(), 1);
    assert_eq!(interp.session().state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_second_consecutive_loss_fails_the_turn() {
    let model = ScriptedModel::new([fence("print(42)")]);
    let codebox = FakeCodeBox::new(vec![
        Err(CodeBoxError::Transport("reset".into())),
        Err(CodeBoxError::Transport("reset again".into())),
    ]);
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default());

    let turn = interp.submit("print 42", vec![]).await;

    assert_eq!(turn.status, TurnStatus::Failed);
    assert!(matches!(turn.error, Some(InterpreterError::SessionLost(_))));
    assert_eq!(turn.retries, 0);
    assert_eq!(codebox.opens(), 2);
    assert_eq!(interp.session().state(), ConnectionState::Broken);
}

#[tokio::test]
async fn test_fail_fast_stops_at_first_failing_block() {
    let response = format!(
        "Three steps:\n{}\n{}\n{}",
        fence("a = 1"),
        fence("b = a / 0"),
        fence("print('never')")
    );
    let model = ScriptedModel::new([response]);
    let codebox =
        FakeCodeBox::new(vec![output(""), failure("ZeroDivisionError: division by zero")]);
    let mut interp = interpreter(&model, &codebox, config_with_retries(0));

    let turn = interp.submit("run three steps", vec![]).await;

    assert_eq!(turn.code_blocks.len(), 3);
    assert_eq!(turn.executions.len(), 2);
    assert!(turn.executions[0].is_ok());
    assert!(!turn.executions[1].is_ok());
    assert_eq!(codebox.executed(), vec!["a = 1".to_string(), "b = a / 0".to_string()]);
    assert_eq!(turn.status, TurnStatus::RetryExhausted);
}

#[tokio::test]
async fn test_fatal_error_ends_turn_without_retry() {
    let model = ScriptedModel::new([fence("x = [0] * 10**12")]);
    let codebox = FakeCodeBox::new(vec![failure("The kernel died unexpectedly")]);
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default());

    let turn = interp.submit("allocate a lot", vec![]).await;

    assert_eq!(turn.status, TurnStatus::Failed);
    assert!(matches!(turn.error, Some(InterpreterError::FatalExecution(_))));
    assert_eq!(turn.retries, 0);
    assert_eq!(model.calls(), 1);
}

#[tokio::test]
async fn test_missing_module_is_installed_and_retried() {
    let model = ScriptedModel::new([
        fence("import seaborn"),
        fence("import seaborn\nprint('ok')"),
    ]);
    let codebox = FakeCodeBox::new(vec![
        failure("ModuleNotFoundError: No module named 'seaborn'"),
        output("ok\n"),
    ]);
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default());

    let turn = interp.submit("use seaborn", vec![]).await;

    assert_eq!(turn.status, TurnStatus::Success);
    assert_eq!(turn.retries, 1);
    assert_eq!(*codebox.installed.lock().unwrap(), vec!["seaborn".to_string()]);
    let feedback = model.transcript(1).last().unwrap().content.clone();
    assert!(feedback.contains("has now been installed"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Files
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_input_files_are_uploaded_and_not_returned() {
    let model = ScriptedModel::new([fence(
        "import pandas as pd\npd.read_csv('data.csv').describe().to_csv('summary.csv')",
    )]);
    let codebox = FakeCodeBox::new(vec![Ok(CodeBoxOutput {
        produced_files: vec!["data.csv".into(), "summary.csv".into()],
        ..CodeBoxOutput::text("")
    })]);
    codebox.put_file("summary.csv", b"stat,x\nmean,1.5\n");
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default());

    let files = vec![Artifact::new("data.csv", b"x\n1\n2\n".to_vec())];
    let turn = interp.submit("summarize this", files).await;

    assert_eq!(turn.status, TurnStatus::Success);
    assert_eq!(turn.input_files, vec!["data.csv".to_string()]);
    assert!(turn.request.as_deref().unwrap().contains("[Attachment: data.csv]"));
    assert_eq!(codebox.files.lock().unwrap()["data.csv"], b"x\n1\n2\n");

    let names: Vec<&str> = turn.artifacts.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["summary.csv"]);
    assert_eq!(turn.artifacts[0].content_type, "text/csv");

    let prompt = model.transcript(0);
    assert!(prompt.last().unwrap().content.contains("[Attachment: data.csv]"));
}

#[tokio::test]
async fn test_files_without_text_ask_for_confirmation() {
    let model = ScriptedModel::new(["I can see notes.txt."]);
    let codebox = FakeCodeBox::new(vec![]);
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default());

    let turn = interp
        .submit("", vec![Artifact::new("notes.txt", b"hello".to_vec())])
        .await;

    assert_eq!(turn.status, TurnStatus::Success);
    assert!(turn.request.as_deref().unwrap().starts_with("I uploaded the attached file(s)"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Failures, cancellation and lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_model_unavailable_is_not_retried_or_remembered() {
    let refused = ModelError::Unavailable("connection refused".into());
    let model = ScriptedModel::with_results(vec![Err(refused)]);
    let codebox = FakeCodeBox::new(vec![]);
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default());

    let turn = interp.submit("hello", vec![]).await;

    assert_eq!(turn.status, TurnStatus::Failed);
    assert!(matches!(turn.error, Some(InterpreterError::ModelUnavailable(_))));
    assert_eq!(turn.content, GENERIC_FAILURE_MESSAGE);
    assert_eq!(model.calls(), 1);
    assert!(interp.memory().is_empty());
}

#[tokio::test]
async fn test_detailed_errors_show_the_cause() {
    let refused = ModelError::Unavailable("connection refused".into());
    let model = ScriptedModel::with_results(vec![Err(refused)]);
    let codebox = FakeCodeBox::new(vec![]);
    let config = InterpreterConfig {
        detailed_errors: true,
        ..Default::default()
    };
    let mut interp = interpreter(&model, &codebox, config);

    let turn = interp.submit("hello", vec![]).await;

    assert!(turn.content.contains("connection refused"));
    assert_ne!(turn.content, GENERIC_FAILURE_MESSAGE);
}

#[tokio::test]
async fn test_model_timeout() {
    let model = ScriptedModel::slow(Duration::from_secs(5));
    let codebox = FakeCodeBox::new(vec![]);
    let config = InterpreterConfig {
        model_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let mut interp = interpreter(&model, &codebox, config);

    let turn = interp.submit("hello", vec![]).await;

    assert_eq!(turn.status, TurnStatus::Failed);
    assert_eq!(turn.error, Some(InterpreterError::ModelTimeout(50)));
    assert!(interp.memory().is_empty());
}

#[tokio::test]
async fn test_cancellation_keeps_partial_results_out_of_memory() {
    let response = format!(
        "{}\n{}",
        fence("print('first')"),
        fence(&format!("{}\nprint('second')", HANG))
    );
    let model = ScriptedModel::new([response]);
    let codebox = FakeCodeBox::new(vec![output("first\n")]);
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let turn = interp.submit_cancellable("run both", vec![], &cancel).await;

    assert_eq!(turn.status, TurnStatus::Cancelled);
    assert_eq!(turn.error, Some(InterpreterError::Cancelled));
    assert_eq!(turn.executions.len(), 1);
    assert_eq!(turn.executions[0].stdout, "first\n");
    assert!(interp.memory().is_empty());
}

#[tokio::test]
async fn test_close_is_idempotent_and_blocks_execution() {
    let model = ScriptedModel::new([fence("print(1)"), fence("print(2)")]);
    let codebox = FakeCodeBox::new(vec![]);
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default());

    interp.submit("first", vec![]).await;
    interp.close().await.unwrap();
    interp.close().await.unwrap();
    assert_eq!(*codebox.closes.lock().unwrap(), 1);

    let turn = interp.submit("second", vec![]).await;
    assert_eq!(turn.status, TurnStatus::Failed);
    assert_eq!(turn.error, Some(InterpreterError::SessionClosed));
}

#[tokio::test]
async fn test_reset_starts_a_fresh_conversation() {
    let model = ScriptedModel::new([fence("x = 1"), fence("print(x)")]);
    let codebox = FakeCodeBox::new(vec![]);
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default());

    interp.submit("set x", vec![]).await;
    assert_eq!(interp.memory().len(), 1);

    interp.reset().await.unwrap();
    assert!(interp.memory().is_empty());

    let turn = interp.submit("print x", vec![]).await;
    assert_eq!(turn.status, TurnStatus::Success);
    assert_eq!(codebox.opens(), 2);
    // Only the system prompt and the new request reach the model
    assert_eq!(model.transcript(1).len(), 2);
}

#[tokio::test]
async fn test_explicit_start_and_status() {
    let model = ScriptedModel::new(Vec::<String>::new());
    let codebox = FakeCodeBox::new(vec![]);
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default());

    assert!(!interp.is_running().await);
    interp.start().await.unwrap();
    interp.start().await.unwrap();
    assert!(interp.is_running().await);
    assert_eq!(codebox.opens(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_events_follow_the_turn() {
    let model = ScriptedModel::new([fence("raise ValueError('x')"), fence("plt.show()")]);
    let codebox = FakeCodeBox::new(vec![
        failure("ValueError: x"),
        Ok(CodeBoxOutput::text("").with_artifact(Artifact::with_content_type(
            "",
            "image/png",
            PNG.to_vec(),
        ))),
    ]);
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default());
    let mut events = interp.subscribe();

    let turn = interp.submit("plot something", vec![]).await;

    let mut kinds = Vec::new();
    while let Some(event) = events.next().await {
        assert_eq!(event.turn_id(), turn.id);
        let done = matches!(event, TurnEvent::TurnFinalized { .. });
        kinds.push(match event {
            TurnEvent::ModelResponseReceived { .. } => "model",
            TurnEvent::CodeBlockExecuting { .. } => "executing",
            TurnEvent::RetryTriggered { .. } => "retry",
            TurnEvent::ToolCalled { .. } => "tool",
            TurnEvent::ArtifactProduced { .. } => "artifact",
            TurnEvent::TurnFinalized { .. } => "finalized",
        });
        if done {
            break;
        }
    }

    assert_eq!(
        kinds,
        vec!["model", "executing", "retry", "model", "executing", "artifact", "finalized"]
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Caller tools
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_registered_tool_output_is_fed_back() {
    let model = ScriptedModel::with_outputs(vec![
        tool_call("Let me ask the tool.", "echo", json!({"text": "hello"})),
        ModelOutput::from("The tool said hello.".to_string()),
    ]);
    let codebox = FakeCodeBox::new(vec![]);
    let echo = Arc::new(EchoTool::default());
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default())
        .with_tool(echo.clone())
        .unwrap();

    let turn = interp.submit("say hello", vec![]).await;

    assert_eq!(turn.status, TurnStatus::Success);
    assert_eq!(turn.content, "The tool said hello.");
    assert_eq!(turn.retries, 0);
    assert_eq!(echo.calls.lock().unwrap().len(), 1);
    assert_eq!(model.offered()[0], vec!["echo".to_string()]);

    let system = &model.transcript(0)[0];
    assert!(system.content.contains("- echo: Repeat the given text"));

    let second = model.transcript(1);
    let feedback = second.last().unwrap();
    assert_eq!(feedback.role, Role::User);
    assert!(feedback.content.contains("Result of tool `echo`"));
    assert!(feedback.content.contains("echo: hello"));
    let asked = &second[second.len() - 2];
    assert!(asked.content.contains("[Tool call: echo("));
}

#[tokio::test]
async fn test_unknown_tool_call_is_reported_to_the_model() {
    let model = ScriptedModel::with_outputs(vec![
        tool_call("", "search", json!({"q": "rust"})),
        ModelOutput::from("I will answer without searching.".to_string()),
    ]);
    let codebox = FakeCodeBox::new(vec![]);
    let mut interp = interpreter(&model, &codebox, config_with_retries(2));
    let mut events = interp.subscribe();

    let turn = interp.submit("look it up", vec![]).await;

    assert_eq!(turn.status, TurnStatus::Success);
    assert_eq!(turn.retries, 1, "an unknown tool spends a retry");
    let feedback = model.transcript(1).last().unwrap().content.clone();
    assert!(feedback.contains("no tool named `search`"));

    let mut saw_failed_call = false;
    while let Some(event) = events.next().await {
        if let TurnEvent::ToolCalled {
            name, succeeded, ..
        } = &event
        {
            assert_eq!(name, "search");
            saw_failed_call = !succeeded;
        }
        if matches!(event, TurnEvent::TurnFinalized { .. }) {
            break;
        }
    }
    assert!(saw_failed_call);
}

#[tokio::test]
async fn test_unknown_tool_calls_exhaust_the_budget() {
    let model = ScriptedModel::with_outputs(vec![
        tool_call("", "search", json!({})),
        tool_call("", "search", json!({})),
    ]);
    let codebox = FakeCodeBox::new(vec![]);
    let mut interp = interpreter(&model, &codebox, config_with_retries(1));

    let turn = interp.submit("look it up", vec![]).await;

    assert_eq!(turn.status, TurnStatus::RetryExhausted);
    match turn.error {
        Some(InterpreterError::RetryExhausted { retries, last_error }) => {
            assert_eq!(retries, 1);
            assert!(last_error.contains("unknown tool `search`"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_tool_rounds_are_bounded() {
    let outputs = (0..4)
        .map(|i| tool_call("", "echo", json!({"text": i.to_string()})))
        .collect();
    let model = ScriptedModel::with_outputs(outputs);
    let codebox = FakeCodeBox::new(vec![]);
    let config = InterpreterConfig {
        max_tool_rounds: 2,
        ..Default::default()
    };
    let echo = Arc::new(EchoTool::default());
    let mut interp = interpreter(&model, &codebox, config)
        .with_tool(echo.clone())
        .unwrap();

    let turn = interp.submit("keep echoing", vec![]).await;

    assert_eq!(turn.status, TurnStatus::Failed);
    assert!(matches!(turn.error, Some(InterpreterError::ToolCall(_))));
    assert_eq!(echo.calls.lock().unwrap().len(), 2);
    assert_eq!(model.calls(), 3);
}

#[tokio::test]
async fn test_code_runs_before_tools_in_the_same_reply() {
    let model = ScriptedModel::with_outputs(vec![
        tool_call(&fence("print(1)"), "echo", json!({"text": "after"})),
        ModelOutput::from("Both done.".to_string()),
    ]);
    let codebox = FakeCodeBox::new(vec![]);
    let echo = Arc::new(EchoTool::default());
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default())
        .with_tool(echo.clone())
        .unwrap();

    let turn = interp.submit("do both", vec![]).await;

    assert_eq!(turn.status, TurnStatus::Success);
    assert_eq!(codebox.executed(), vec!["print(1)".to_string()]);
    assert_eq!(echo.calls.lock().unwrap().len(), 1);
    let replayed = model.transcript(1);
    assert_eq!(replayed[replayed.len() - 2].executions.len(), 1);
}

#[tokio::test]
async fn test_python_tool_name_is_reserved() {
    let model = ScriptedModel::new(Vec::<String>::new());
    let codebox = FakeCodeBox::new(vec![]);
    let mut interp = interpreter(&model, &codebox, InterpreterConfig::default());

    struct Shadow;

    #[async_trait::async_trait]
    impl codebox_interpreter::Tool for Shadow {
        fn name(&self) -> &str {
            "python"
        }

        fn description(&self) -> &str {
            "not allowed"
        }

        async fn call(&self, _arguments: serde_json::Value) -> Result<String, ToolError> {
            Ok(String::new())
        }
    }

    let err = interp.register_tool(Arc::new(Shadow)).unwrap_err();
    assert_eq!(err, ToolError::ReservedName("python".into()));
    assert!(interp.tools().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Local kernel
// ─────────────────────────────────────────────────────────────────────────────

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_local_variables_survive_between_blocks() {
    if !python_available() {
        return;
    }
    let root = tempfile::TempDir::new().unwrap();
    let model = ScriptedModel::new([format!("{}\n\n{}", fence("x = 21"), fence("print(x * 2)"))]);
    let mut interp = Interpreter::new(
        model.clone(),
        Arc::new(LocalCodeBox::new(root.path())),
        config_with_retries(0),
    );

    let turn = interp.submit("double 21", vec![]).await;

    assert_eq!(turn.status, TurnStatus::Success, "{:?}", turn.error);
    assert_eq!(turn.executions.len(), 2);
    assert_eq!(turn.executions[1].stdout, "42\n");
    interp.close().await.unwrap();
}
