//! Execution result classifier
//!
//! Decides what the execution loop should do with an `ExecutionResult`:
//! finish, re-prompt the model with the error, or give up on the turn. The
//! decision depends only on the status and the error text; how many retries
//! are left is the loop's business.
//!
//! ```text
//! status=ok ─────────────────────────────────────────► Success
//! status=error ─┬─ kernel died / out of memory / ... ─► Fatal(ResourceExhausted)
//!               ├─ SandboxError: / session expired ───► Fatal(SessionFailure)
//!               ├─ No module named 'x' ───────────────► Recoverable(MissingModule)
//!               ├─ TimeoutError / timed out ──────────► Recoverable(Timeout)
//!               ├─ SyntaxError / IndentationError ────► Recoverable(Syntax)
//!               ├─ AssertionError ────────────────────► Recoverable(Assertion)
//!               └─ anything else ─────────────────────► Recoverable(Exception)
//! ```

use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;

use crate::types::{content_type_for, Artifact, ExecutionResult};

/// Error prefix the sandbox session uses for backend rejections
pub const SANDBOX_ERROR_PREFIX: &str = "SandboxError:";

/// Prefix of the error text produced when an execution exceeds its deadline
pub const TIMEOUT_ERROR_PREFIX: &str = "TimeoutError:";

/// Kind of failure the model can plausibly fix by rewriting its code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverableKind {
    Syntax,
    Exception,
    Assertion,
    Timeout,
    /// A Python import failed; carries the top-level package name
    MissingModule(String),
}

/// Kind of failure that ends the turn regardless of retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    ResourceExhausted,
    SessionFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Success,
    Recoverable(RecoverableKind),
    Fatal(FatalKind),
}

impl Classification {
    pub fn is_success(&self) -> bool {
        matches!(self, Classification::Success)
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Classification::Recoverable(_))
    }

    /// Stable label, used for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            Classification::Success => "success",
            Classification::Recoverable(RecoverableKind::Syntax) => "syntax_error",
            Classification::Recoverable(RecoverableKind::Exception) => "exception",
            Classification::Recoverable(RecoverableKind::Assertion) => "assertion",
            Classification::Recoverable(RecoverableKind::Timeout) => "timeout",
            Classification::Recoverable(RecoverableKind::MissingModule(_)) => "missing_module",
            Classification::Fatal(FatalKind::ResourceExhausted) => "resource_exhausted",
            Classification::Fatal(FatalKind::SessionFailure) => "session_failure",
        }
    }
}

lazy_static! {
    static ref RESOURCE_EXHAUSTED: Regex = Regex::new(concat!(
        r"(?i)(kernel\s+(has\s+)?died|dead\s+kernel|resource\s*exhausted|out\s+of\s+memory",
        r"|oom[\s_-]?kill|no\s+space\s+left\s+on\s+device|disk\s+quota\s+exceeded)"
    ))
    .expect("valid resource exhaustion regex");
    static ref SESSION_FAILURE: Regex = Regex::new(
        r"(?i)(^SandboxError:|session\s+(has\s+)?(expired|not\s+found)|kernel\s+not\s+found)"
    )
    .expect("valid session failure regex");
    static ref MISSING_MODULE: Regex =
        Regex::new(r"(?:ModuleNotFoundError|ImportError): No module named '([A-Za-z0-9_\-]+)")
            .expect("valid missing module regex");
    static ref TIMEOUT: Regex =
        Regex::new(r"(?i)(\bTimeoutError\b|\btimed\s+out\b|time\s+limit\s+exceeded)")
            .expect("valid timeout regex");
    static ref SYNTAX: Regex =
        Regex::new(r"\b(SyntaxError|IndentationError|TabError)\b").expect("valid syntax regex");
    static ref ASSERTION: Regex = Regex::new(r"\bAssertionError\b").expect("valid assertion regex");
}

/// Classify an execution outcome
pub fn classify(result: &ExecutionResult) -> Classification {
    let Some(text) = result.error_text() else {
        return Classification::Success;
    };

    if RESOURCE_EXHAUSTED.is_match(text) {
        return Classification::Fatal(FatalKind::ResourceExhausted);
    }
    if SESSION_FAILURE.is_match(text.trim_start()) {
        return Classification::Fatal(FatalKind::SessionFailure);
    }
    if let Some(caps) = MISSING_MODULE.captures(text) {
        return Classification::Recoverable(RecoverableKind::MissingModule(caps[1].to_string()));
    }
    if TIMEOUT.is_match(text) {
        return Classification::Recoverable(RecoverableKind::Timeout);
    }
    if SYNTAX.is_match(text) {
        return Classification::Recoverable(RecoverableKind::Syntax);
    }
    if ASSERTION.is_match(text) {
        return Classification::Recoverable(RecoverableKind::Assertion);
    }
    Classification::Recoverable(RecoverableKind::Exception)
}

/// Clean up artifacts captured from one execution
///
/// Empty payloads are dropped, missing or generic content types are sniffed,
/// unnamed payloads get a generated name and duplicate names keep the first
/// occurrence.
pub fn normalize_artifacts(artifacts: Vec<Artifact>) -> Vec<Artifact> {
    let mut seen = HashSet::new();
    artifacts
        .into_iter()
        .filter(|a| !a.content.is_empty())
        .map(|mut a| {
            if a.content_type.is_empty() || a.content_type == "application/octet-stream" {
                a.content_type = content_type_for(&a.name, &a.content).to_string();
            }
            if a.name.trim().is_empty() {
                a.name = generated_name(&a.content_type);
            }
            a
        })
        .filter(|a| seen.insert(a.name.clone()))
        .collect()
}

/// Name for an unnamed payload, e.g. `image-<uuid>.png`
pub fn generated_name(content_type: &str) -> String {
    let id = uuid::Uuid::new_v4();
    match content_type {
        "image/png" => format!("image-{}.png", id),
        "image/jpeg" => format!("image-{}.jpg", id),
        "image/gif" => format!("image-{}.gif", id),
        "image/svg+xml" => format!("image-{}.svg", id),
        t if t.starts_with("image/") => format!("image-{}.png", id),
        "text/csv" => format!("file-{}.csv", id),
        "application/json" => format!("file-{}.json", id),
        "text/plain" => format!("file-{}.txt", id),
        _ => format!("file-{}.bin", id),
    }
}
