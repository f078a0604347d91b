//! Classified messages produced by the stream protocol parser.
//!
//! The engine emits one JSON object per line. Every complete line is decoded
//! into zero or more [`StreamMessage`]s; anything unrecognized becomes
//! [`StreamMessage::Ignorable`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One selectable option of an interactive question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// A question the engine is blocked on until a human answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingQuestion {
    /// Tool-call id the answer must reference
    pub tool_call_id: String,
    pub question: String,
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

impl PendingQuestion {
    /// Render the question as a chat message with numbered options.
    pub fn render(&self) -> String {
        let mut out = format!("❓ {}", self.question);
        for (i, option) in self.options.iter().enumerate() {
            out.push_str(&format!("\n  {}. {}", i + 1, option.label));
            if let Some(desc) = option.description.as_deref().filter(|d| !d.is_empty()) {
                out.push_str(&format!(" ({desc})"));
            }
        }
        if self.options.is_empty() {
            out.push_str("\nReply with your answer.");
        } else if self.multi_select {
            out.push_str("\nReply with one or more option numbers, comma separated.");
        } else {
            out.push_str("\nReply with an option number or label.");
        }
        out
    }

    /// Resolve a human reply to the answer text the engine expects.
    ///
    /// Accepts 1-based option numbers (comma separated for multi-select) or an
    /// option label, case-insensitively. Free text is passed through when the
    /// question has no options. Returns `None` if the reply does not match.
    pub fn resolve_selection(&self, reply: &str) -> Option<String> {
        let reply = reply.trim();
        if reply.is_empty() {
            return None;
        }
        if self.options.is_empty() {
            return Some(reply.to_string());
        }

        let by_label = |text: &str| {
            self.options
                .iter()
                .find(|o| o.label.eq_ignore_ascii_case(text.trim()))
                .map(|o| o.label.clone())
        };
        let by_index = |text: &str| {
            text.trim()
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| self.options.get(i))
                .map(|o| o.label.clone())
        };

        if self.multi_select {
            let picks: Option<Vec<String>> = reply
                .split(',')
                .map(|part| by_index(part).or_else(|| by_label(part)))
                .collect();
            return picks.filter(|p| !p.is_empty()).map(|p| p.join(", "));
        }

        by_index(reply).or_else(|| by_label(reply))
    }
}

/// Rate-limit notice emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSignal {
    /// Suggested wait before retrying, when the engine provides one
    pub retry_after: Option<Duration>,
    pub message: String,
}

/// A classified line of engine output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamMessage {
    /// Prose the assistant wants shown to the human
    AssistantText { text: String },
    /// The engine started a tool call
    ToolInvocation {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// A tool call returned
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    /// The engine is blocked on human input
    InteractiveQuestion(PendingQuestion),
    /// The engine finished its turn
    FinalResult {
        text: Option<String>,
        is_error: bool,
        cost_usd: Option<f64>,
        engine_session_id: Option<String>,
    },
    /// The engine is being rate limited
    RateLimit(RateLimitSignal),
    /// Init, system, echo, or unknown lines
    Ignorable { tag: String },
}

impl StreamMessage {
    pub fn ignorable(tag: impl Into<String>) -> Self {
        Self::Ignorable { tag: tag.into() }
    }

    pub fn is_ignorable(&self) -> bool {
        matches!(self, Self::Ignorable { .. })
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AssistantText { .. } => "assistant_text",
            Self::ToolInvocation { .. } => "tool_invocation",
            Self::ToolResult { .. } => "tool_result",
            Self::InteractiveQuestion(_) => "interactive_question",
            Self::FinalResult { .. } => "final_result",
            Self::RateLimit(_) => "rate_limit",
            Self::Ignorable { .. } => "ignorable",
        }
    }
}

/// Encode a human reply as a stream-json user frame, newline terminated.
pub fn user_frame(text: &str) -> Vec<u8> {
    frame(&serde_json::json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": text }],
        },
    }))
}

/// Encode the answer to a pending interactive question as a `tool_result`
/// frame referencing the blocked tool call.
pub fn tool_answer_frame(tool_use_id: &str, answer: &str) -> Vec<u8> {
    frame(&serde_json::json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": answer,
            }],
        },
    }))
}

fn frame(value: &serde_json::Value) -> Vec<u8> {
    let mut bytes = value.to_string().into_bytes();
    bytes.push(b'\n');
    bytes
}
