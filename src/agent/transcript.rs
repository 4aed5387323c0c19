//! Persistent conversation transcripts
//!
//! Saves a conversation's finalized turns to disk as pretty JSON so it can be
//! inspected later or resumed into a fresh `ConversationMemory`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::memory::{ConversationMemory, MemoryPolicy};
use crate::types::{Turn, TurnStatus};

/// A saved conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    /// Unique transcript ID
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Model used for this conversation
    pub model: String,
    /// Finalized turns, oldest first
    pub turns: Vec<Turn>,
}

impl Transcript {
    pub fn new(model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            created_at: now,
            updated_at: now,
            model: model.into(),
            turns: Vec::new(),
        }
    }

    /// Snapshot a conversation's memory
    pub fn from_memory(model: impl Into<String>, memory: &ConversationMemory) -> Self {
        let mut transcript = Self::new(model);
        transcript.turns = memory.turns().to_vec();
        transcript
    }

    /// Replace the stored turns with the current memory contents
    pub fn update(&mut self, memory: &ConversationMemory) {
        self.turns = memory.turns().to_vec();
        self.updated_at = Utc::now();
    }

    /// Rebuild a memory holding these turns
    pub fn to_memory(&self, policy: MemoryPolicy) -> ConversationMemory {
        ConversationMemory::from_turns(self.turns.clone(), policy)
    }

    /// The request that opened the conversation
    pub fn title(&self) -> &str {
        self.turns
            .iter()
            .find_map(|t| t.request.as_deref())
            .unwrap_or("(empty conversation)")
    }
}

/// Transcript storage manager
pub struct TranscriptStore {
    /// Base directory for transcript files
    base_dir: PathBuf,
}

impl TranscriptStore {
    /// Create a store rooted at `base_dir`, creating it if needed
    pub fn new(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Create with default directory (~/.codebox-interpreter/sessions)
    pub fn default_store() -> std::io::Result<Self> {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self::new(PathBuf::from(home).join(".codebox-interpreter").join("sessions"))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Save a transcript to disk
    pub fn save(&self, transcript: &Transcript) -> std::io::Result<PathBuf> {
        let path = self.transcript_path(&transcript.id);
        let json = serde_json::to_string_pretty(transcript)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    /// Load a transcript by ID
    pub fn load(&self, id: &str) -> std::io::Result<Transcript> {
        load_from_path(&self.transcript_path(id))
    }

    /// List all transcripts, newest first
    pub fn list(&self) -> std::io::Result<Vec<TranscriptSummary>> {
        let mut summaries = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(transcript) = load_from_path(&path) {
                    summaries.push(TranscriptSummary::from(&transcript));
                }
            }
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// Delete a transcript
    pub fn delete(&self, id: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.transcript_path(id))
    }

    fn transcript_path(&self, id: &str) -> PathBuf {
        // IDs are file stems; keep them from naming anything outside the store
        let stem: String = id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        self.base_dir.join(format!("{}.json", stem))
    }
}

fn load_from_path(path: &Path) -> std::io::Result<Transcript> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Summary of a transcript for listing
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptSummary {
    pub id: String,
    pub title: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub turns: usize,
    /// Turns that ended in success
    pub succeeded: usize,
}

impl From<&Transcript> for TranscriptSummary {
    fn from(transcript: &Transcript) -> Self {
        Self {
            id: transcript.id.clone(),
            title: truncate(transcript.title(), 50),
            model: transcript.model.clone(),
            created_at: transcript.created_at,
            turns: transcript.turns.len(),
            succeeded: transcript
                .turns
                .iter()
                .filter(|t| t.status == TurnStatus::Success)
                .count(),
        }
    }
}

/// Truncate a string to `max_len` characters, adding an ellipsis if needed
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
