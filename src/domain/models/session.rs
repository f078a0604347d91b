//! Session routing domain models.
//!
//! A topic (conversation thread) drives at most one session at a time. The
//! binding state machine is `idle -> browsing -> spawning -> active -> closed`,
//! with `closed` decaying back to idle after a grace window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Routing key shared between the chat layer and the session registry.
pub type TopicId = String;

/// State of a topic's session binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    /// No session and nothing in progress
    Idle,
    /// Directory or target selection is in progress
    Browsing,
    /// A spawn was claimed but the session has not produced output yet
    Spawning,
    /// Inbound replies are routed to the bound session
    Active,
    /// Session ended; residual output is still dropped
    Closed,
}

impl BindingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Browsing => "browsing",
            Self::Spawning => "spawning",
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    /// Spawning or active topics cannot start another session.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Spawning | Self::Active)
    }
}

impl std::fmt::Display for BindingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session was closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Completed,
    Failed(String),
    Cancelled,
    UserRequested,
    ProcessExited(Option<i32>),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::UserRequested => f.write_str("user_requested"),
            Self::ProcessExited(Some(code)) => write!(f, "process exited with code {code}"),
            Self::ProcessExited(None) => f.write_str("process terminated by signal"),
        }
    }
}

/// Who produced a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    User,
    Assistant,
    Tool,
}

impl TranscriptRole {
    fn label(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: TranscriptRole,
    pub text: String,
}

/// Characters kept per transcript entry unless configured otherwise.
pub const DEFAULT_MAX_ENTRY_CHARS: usize = 8_000;

/// Bounded ring buffer of recent conversation, used as handoff context.
///
/// Bounded both in entries and in characters per entry, so a long
/// text-only session holds only its most recent output.
#[derive(Debug, Clone)]
pub struct TranscriptTail {
    entries: VecDeque<TranscriptEntry>,
    max_entries: usize,
    max_entry_chars: usize,
}

impl TranscriptTail {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(256)),
            max_entries: max_entries.max(1),
            max_entry_chars: DEFAULT_MAX_ENTRY_CHARS,
        }
    }

    pub fn with_max_entry_chars(mut self, max_entry_chars: usize) -> Self {
        self.max_entry_chars = max_entry_chars.max(1);
        self
    }

    /// Append an entry, merging consecutive assistant text.
    pub fn push(&mut self, role: TranscriptRole, text: &str) {
        if text.is_empty() {
            return;
        }
        if role == TranscriptRole::Assistant {
            if let Some(last) = self.entries.back_mut() {
                if last.role == TranscriptRole::Assistant {
                    last.text.push_str(text);
                    keep_last_chars(&mut last.text, self.max_entry_chars);
                    return;
                }
            }
        }
        if self.entries.len() == self.max_entries {
            self.entries.pop_front();
        }
        let mut text = text.to_string();
        keep_last_chars(&mut text, self.max_entry_chars);
        self.entries.push_back(TranscriptEntry { role, text });
    }

    /// Total characters currently held.
    pub fn char_count(&self) -> usize {
        self.entries.iter().map(|e| e.text.chars().count()).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &TranscriptEntry> {
        self.entries.iter()
    }

    /// Render the most recent entries, keeping at most `max_chars` characters.
    ///
    /// Older content is dropped first; the result never exceeds `max_chars`.
    pub fn render_excerpt(&self, max_chars: usize) -> String {
        let mut parts: Vec<String> = Vec::new();
        let mut used = 0usize;
        for entry in self.entries.iter().rev() {
            let line = format!("[{}] {}", entry.role.label(), entry.text.trim());
            let len = line.chars().count();
            let sep = usize::from(!parts.is_empty());
            if used + len + sep <= max_chars {
                used += len + sep;
                parts.push(line);
                continue;
            }
            let remaining = max_chars.saturating_sub(used + sep);
            if remaining > 0 {
                let skip = len - remaining;
                parts.push(line.chars().skip(skip).collect());
            }
            break;
        }
        parts.reverse();
        parts.join("\n")
    }
}

/// Drop leading characters so at most `max_chars` remain.
fn keep_last_chars(text: &mut String, max_chars: usize) {
    // Byte length bounds char count, so short strings skip the scan.
    if text.len() <= max_chars {
        return;
    }
    let count = text.chars().count();
    if count <= max_chars {
        return;
    }
    let cut = text
        .char_indices()
        .nth(count - max_chars)
        .map_or(text.len(), |(i, _)| i);
    text.drain(..cut);
}

/// Informational record of an engine handoff. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub id: Uuid,
    pub task_id: Option<Uuid>,
    pub topic_id: TopicId,
    pub engine_from: String,
    pub engine_to: String,
    pub reason: String,
    pub transcript_excerpt: String,
    pub created_at: DateTime<Utc>,
}

impl HandoffRecord {
    pub fn new(
        task_id: Option<Uuid>,
        topic_id: impl Into<TopicId>,
        engine_from: impl Into<String>,
        engine_to: impl Into<String>,
        reason: impl Into<String>,
        transcript_excerpt: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            topic_id: topic_id.into(),
            engine_from: engine_from.into(),
            engine_to: engine_to.into(),
            reason: reason.into(),
            transcript_excerpt: transcript_excerpt.into(),
            created_at: Utc::now(),
        }
    }
}
