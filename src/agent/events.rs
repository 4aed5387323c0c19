//! Turn progress events
//!
//! Callers that want to follow a turn while it runs call
//! `Interpreter::subscribe()` and get a stream of `TurnEvent`s. Events are
//! delivered over unbounded channels so emitting never blocks the loop;
//! dropped subscribers are pruned on the next emit.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::types::{Artifact, TurnStatus};

/// Something observable that happened during a turn
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TurnEvent {
    ModelResponseReceived {
        turn_id: String,
        attempt: u32,
        code_blocks: usize,
    },
    CodeBlockExecuting {
        turn_id: String,
        /// 0-based position of the block in the response
        index: usize,
        code: String,
    },
    RetryTriggered {
        turn_id: String,
        /// Retries consumed so far, including this one
        retry: u32,
        error: String,
    },
    ToolCalled {
        turn_id: String,
        name: String,
        succeeded: bool,
    },
    ArtifactProduced {
        turn_id: String,
        name: String,
        content_type: String,
        size: usize,
    },
    TurnFinalized {
        turn_id: String,
        status: TurnStatus,
        retries: u32,
    },
}

impl TurnEvent {
    pub fn artifact(turn_id: &str, artifact: &Artifact) -> Self {
        TurnEvent::ArtifactProduced {
            turn_id: turn_id.to_string(),
            name: artifact.name.clone(),
            content_type: artifact.content_type.clone(),
            size: artifact.size(),
        }
    }

    pub fn turn_id(&self) -> &str {
        match self {
            TurnEvent::ModelResponseReceived { turn_id, .. }
            | TurnEvent::CodeBlockExecuting { turn_id, .. }
            | TurnEvent::RetryTriggered { turn_id, .. }
            | TurnEvent::ToolCalled { turn_id, .. }
            | TurnEvent::ArtifactProduced { turn_id, .. }
            | TurnEvent::TurnFinalized { turn_id, .. } => turn_id,
        }
    }
}

/// Stream of events handed to a subscriber
pub type TurnEventStream = UnboundedReceiverStream<TurnEvent>;

/// Fan-out of turn events to live subscribers
#[derive(Debug, Default)]
pub struct EventSink {
    subscribers: Vec<mpsc::UnboundedSender<TurnEvent>>,
}

impl EventSink {
    pub fn subscribe(&mut self) -> TurnEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        UnboundedReceiverStream::new(rx)
    }

    pub fn emit(&mut self, event: TurnEvent) {
        if self.subscribers.is_empty() {
            return;
        }
        self.subscribers.retain(|tx| !tx.is_closed());
        if let Some((last, rest)) = self.subscribers.split_last() {
            for tx in rest {
                let _ = tx.send(event.clone());
            }
            let _ = last.send(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.iter().filter(|tx| !tx.is_closed()).count()
    }
}
