//! Conversation memory
//!
//! Append-only history of finalized turns. `build_prompt()` decides how much
//! of it the model sees, according to a `MemoryPolicy`. Nothing is ever
//! removed from the stored history; truncation only affects the prompt.

use serde::{Deserialize, Serialize};

use crate::types::Turn;

/// How much history goes into the next prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum MemoryPolicy {
    /// Every turn, verbatim
    #[default]
    KeepAll,
    /// The newest `turns` turns
    KeepLast { turns: usize },
    /// As many of the newest turns as fit in `tokens` (estimated)
    TokenBudget { tokens: usize },
    /// The newest `keep` turns verbatim, older ones folded into a summary
    SummarizeOverflow { keep: usize },
}

impl MemoryPolicy {
    /// Parse a policy from its CLI/env form: `all`, `last:N`, `tokens:N`,
    /// `summarize:N`
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        if value == "all" || value == "keep-all" {
            return Some(MemoryPolicy::KeepAll);
        }
        let (kind, n) = value.split_once(':')?;
        let n: usize = n.trim().parse().ok()?;
        match kind.trim() {
            "last" => Some(MemoryPolicy::KeepLast { turns: n }),
            "tokens" => Some(MemoryPolicy::TokenBudget { tokens: n }),
            "summarize" => Some(MemoryPolicy::SummarizeOverflow { keep: n }),
            _ => None,
        }
    }
}

/// Rough token estimate: one token per four characters
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

fn turn_tokens(turn: &Turn) -> usize {
    estimate_tokens(turn.request.as_deref().unwrap_or_default()) + estimate_tokens(&turn.render())
}

/// Ordered history of finalized turns
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationMemory {
    turns: Vec<Turn>,
    policy: MemoryPolicy,
}

impl ConversationMemory {
    pub fn new(policy: MemoryPolicy) -> Self {
        Self {
            turns: Vec::new(),
            policy,
        }
    }

    /// Rebuild memory from previously saved turns
    pub fn from_turns(turns: Vec<Turn>, policy: MemoryPolicy) -> Self {
        Self { turns, policy }
    }

    /// Add a finalized turn to the end of the history
    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn policy(&self) -> MemoryPolicy {
        self.policy
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// History to send with the next model request, oldest first
    pub fn build_prompt(&self) -> Vec<Turn> {
        match self.policy {
            MemoryPolicy::KeepAll => self.turns.clone(),
            MemoryPolicy::KeepLast { turns } => self.newest(turns).to_vec(),
            MemoryPolicy::TokenBudget { tokens } => {
                let mut used = 0;
                let mut start = self.turns.len();
                for turn in self.turns.iter().rev() {
                    let cost = turn_tokens(turn);
                    if used + cost > tokens {
                        break;
                    }
                    used += cost;
                    start -= 1;
                }
                self.turns[start..].to_vec()
            }
            MemoryPolicy::SummarizeOverflow { keep } => {
                let split = self.turns.len().saturating_sub(keep);
                let (older, newer) = self.turns.split_at(split);
                let mut prompt = Vec::with_capacity(newer.len() + 1);
                if !older.is_empty() {
                    prompt.push(Turn::system(summarize(older)));
                }
                prompt.extend(newer.iter().cloned());
                prompt
            }
        }
    }

    fn newest(&self, n: usize) -> &[Turn] {
        &self.turns[self.turns.len().saturating_sub(n)..]
    }
}

/// One-line-per-turn digest of folded history
fn summarize(turns: &[Turn]) -> String {
    let mut summary = format!(
        "Summary of {} earlier exchange(s) in this conversation:\n",
        turns.len()
    );
    for turn in turns {
        let request = turn.request.as_deref().unwrap_or("(no request)");
        let answer = turn
            .content
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("(no answer)");
        summary.push_str(&format!(
            "- [{}] {} => {}\n",
            turn.status.as_str(),
            excerpt(request, 80),
            excerpt(answer, 120)
        ));
    }
    summary
}

fn excerpt(text: &str, max: usize) -> String {
    let text = text.trim().replace('\n', " ");
    if text.chars().count() <= max {
        text
    } else {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
