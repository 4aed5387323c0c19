//! Prometheus metrics for the interpreter
//!
//! All metrics live in the default global registry so any embedding service
//! can expose them next to its own. `encode_metrics()` renders the text
//! exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec,
    TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Turn Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Finalized turns by outcome.
    ///
    /// Labels:
    /// - status: "success", "retry_exhausted", "failed", "cancelled"
    pub static ref TURNS_TOTAL: CounterVec = register_counter_vec!(
        "codebox_interpreter_turns_total",
        "Finalized conversation turns by status",
        &["status"]
    ).expect("failed to register TURNS_TOTAL metric");

    /// Automatic retries consumed per turn.
    pub static ref TURN_RETRIES: Histogram = register_histogram!(
        "codebox_interpreter_turn_retries",
        "Automatic error-correction retries consumed per turn",
        vec![0.0, 1.0, 2.0, 3.0, 5.0, 8.0]
    ).expect("failed to register TURN_RETRIES metric");

    /// Wall time of a whole turn, from request to finalization.
    pub static ref TURN_DURATION: Histogram = register_histogram!(
        "codebox_interpreter_turn_duration_seconds",
        "Wall time of a conversation turn",
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).expect("failed to register TURN_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Model Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Duration of model calls.
    ///
    /// Labels:
    /// - model: model name
    pub static ref LLM_CALL_TIME: HistogramVec = register_histogram_vec!(
        "codebox_interpreter_llm_call_seconds",
        "Duration of language model calls",
        &["model"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 180.0]
    ).expect("failed to register LLM_CALL_TIME metric");

    /// Failed model calls by error kind ("model_unavailable", "model_timeout").
    pub static ref LLM_ERRORS: CounterVec = register_counter_vec!(
        "codebox_interpreter_llm_errors_total",
        "Failed language model calls by error kind",
        &["kind"]
    ).expect("failed to register LLM_ERRORS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Execution Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Code executions by classification label.
    pub static ref CODE_EXECUTIONS: CounterVec = register_counter_vec!(
        "codebox_interpreter_code_executions_total",
        "Code executions by classification",
        &["outcome"]
    ).expect("failed to register CODE_EXECUTIONS metric");

    /// Duration of individual code executions.
    pub static ref CODE_EXECUTION_DURATION: Histogram = register_histogram!(
        "codebox_interpreter_code_execution_seconds",
        "Duration of sandbox code executions",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]
    ).expect("failed to register CODE_EXECUTION_DURATION metric");

    /// Artifacts produced by executions, by content type.
    pub static ref ARTIFACTS_PRODUCED: CounterVec = register_counter_vec!(
        "codebox_interpreter_artifacts_total",
        "Artifacts produced by code executions",
        &["content_type"]
    ).expect("failed to register ARTIFACTS_PRODUCED metric");

    /// Caller tool calls by outcome.
    ///
    /// Labels:
    /// - outcome: "success", "error"
    pub static ref TOOL_CALLS: CounterVec = register_counter_vec!(
        "codebox_interpreter_tool_calls_total",
        "Caller tool calls requested by the model",
        &["outcome"]
    ).expect("failed to register TOOL_CALLS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Session Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Sandbox context starts by result ("ok", "unavailable").
    pub static ref SESSION_STARTS: CounterVec = register_counter_vec!(
        "codebox_interpreter_session_starts_total",
        "Sandbox context allocations by result",
        &["result"]
    ).expect("failed to register SESSION_STARTS metric");

    /// Transport losses observed by sandbox sessions.
    pub static ref SESSION_LOSSES: Counter = register_counter!(
        "codebox_interpreter_session_losses_total",
        "Sandbox transport losses"
    ).expect("failed to register SESSION_LOSSES metric");

    /// Automatic reconnects after a transport loss.
    pub static ref SESSION_RECONNECTS: Counter = register_counter!(
        "codebox_interpreter_session_reconnects_total",
        "Automatic sandbox reconnects"
    ).expect("failed to register SESSION_RECONNECTS metric");

    /// Sandbox sessions currently holding a live context.
    pub static ref SESSIONS_ACTIVE: Gauge = register_gauge!(
        "codebox_interpreter_sessions_active",
        "Sandbox sessions holding a live execution context"
    ).expect("failed to register SESSIONS_ACTIVE metric");
}

/// Force registration of every metric, so the catalogue is complete even
/// before anything has been recorded
pub fn register_all() {
    lazy_static::initialize(&TURNS_TOTAL);
    lazy_static::initialize(&TURN_RETRIES);
    lazy_static::initialize(&TURN_DURATION);
    lazy_static::initialize(&LLM_CALL_TIME);
    lazy_static::initialize(&LLM_ERRORS);
    lazy_static::initialize(&CODE_EXECUTIONS);
    lazy_static::initialize(&CODE_EXECUTION_DURATION);
    lazy_static::initialize(&ARTIFACTS_PRODUCED);
    lazy_static::initialize(&TOOL_CALLS);
    lazy_static::initialize(&SESSION_STARTS);
    lazy_static::initialize(&SESSION_LOSSES);
    lazy_static::initialize(&SESSION_RECONNECTS);
    lazy_static::initialize(&SESSIONS_ACTIVE);
}

/// Render every registered metric in the Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
