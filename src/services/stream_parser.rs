//! Incremental parser for the engine's newline-delimited JSON stream.
//!
//! Output arrives in arbitrary chunks; a JSON object may be split across any
//! number of them. The parser keeps one pending buffer, only ever decodes
//! complete lines, and classifies each line through a closed wire enum.
//! Unknown tags decode to `Ignorable`; malformed lines are logged and skipped.

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::models::{PendingQuestion, QuestionOption, RateLimitSignal, StreamMessage};

/// Tool name engines use to block on a human answer.
pub const ASK_USER_TOOL: &str = "AskUserQuestion";

const LOG_PREVIEW_CHARS: usize = 200;

/// Top-level wire event, discriminated by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    System {
        #[serde(default)]
        subtype: Option<String>,
    },
    Assistant {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        message: Option<WireMessage>,
    },
    User {
        #[serde(default)]
        message: Option<WireMessage>,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(alias = "rate_limit_event")]
    RateLimit {
        #[serde(default, alias = "retry_after")]
        retry_after_secs: Option<f64>,
        #[serde(default)]
        message: Option<String>,
    },
    Error {
        #[serde(default)]
        error: Option<Value>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<WireContent>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Blocks(Vec<WireBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// Per-stream incremental line classifier.
#[derive(Debug, Default)]
pub struct StreamProtocolParser {
    pending: Vec<u8>,
    lines: u64,
    malformed: u64,
}

impl StreamProtocolParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and classify every line it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamMessage> {
        self.pending.extend_from_slice(chunk);
        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let complete: Vec<u8> = self.pending.drain(..=last_newline).collect();
        let mut out = Vec::new();
        for line in complete.split(|b| *b == b'\n') {
            self.process_line(line, &mut out);
        }
        out
    }

    /// Classify a trailing line that never received its newline (end of stream).
    pub fn finish(&mut self) -> Vec<StreamMessage> {
        let rest = std::mem::take(&mut self.pending);
        let mut out = Vec::new();
        self.process_line(&rest, &mut out);
        out
    }

    /// Bytes buffered waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn lines_seen(&self) -> u64 {
        self.lines
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }

    fn process_line(&mut self, raw: &[u8], out: &mut Vec<StreamMessage>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        self.lines += 1;

        let line = match std::str::from_utf8(raw) {
            Ok(line) => line,
            Err(e) => {
                self.malformed += 1;
                warn!(error = %e, "skipping stream line with invalid UTF-8");
                return;
            }
        };

        match classify_line(line) {
            Ok(messages) => out.extend(messages),
            Err(e) => {
                self.malformed += 1;
                warn!(error = %e, line = %preview(line), "skipping malformed stream line");
            }
        }
    }
}

fn preview(line: &str) -> String {
    if line.chars().count() <= LOG_PREVIEW_CHARS {
        line.to_string()
    } else {
        let head: String = line.chars().take(LOG_PREVIEW_CHARS).collect();
        format!("{head}...")
    }
}

/// Classify one complete line. Never yields an empty vector for valid JSON.
pub fn classify_line(line: &str) -> Result<Vec<StreamMessage>, serde_json::Error> {
    let event: WireEvent = serde_json::from_str(line.trim())?;

    let messages = match event {
        WireEvent::System { subtype } => {
            vec![StreamMessage::ignorable(match subtype {
                Some(sub) => format!("system:{sub}"),
                None => "system".to_string(),
            })]
        }
        WireEvent::Assistant { text, message } => {
            let mut out = Vec::new();
            if let Some(text) = text.filter(|t| !t.is_empty()) {
                out.push(assistant_text(text));
            }
            if let Some(content) = message.and_then(|m| m.content) {
                classify_content(content, &mut out);
            }
            out
        }
        WireEvent::User { message } => {
            let mut out = Vec::new();
            if let Some(WireContent::Blocks(blocks)) = message.and_then(|m| m.content) {
                for block in blocks {
                    if let WireBlock::ToolResult { tool_use_id, content, is_error } = block {
                        out.push(StreamMessage::ToolResult {
                            tool_use_id,
                            content: flatten_content(&content),
                            is_error,
                        });
                    }
                }
            }
            if out.is_empty() {
                out.push(StreamMessage::ignorable("user_echo"));
            }
            out
        }
        WireEvent::ToolUse { id, name, input } => vec![tool_use(id, name, input)],
        WireEvent::ToolResult { tool_use_id, content, is_error } => vec![StreamMessage::ToolResult {
            tool_use_id,
            content: flatten_content(&content),
            is_error,
        }],
        WireEvent::Result { result, is_error, total_cost_usd, session_id } => {
            match result.as_deref().filter(|_| is_error).and_then(rate_limit_from_text) {
                Some(signal) => vec![StreamMessage::RateLimit(signal)],
                None => vec![StreamMessage::FinalResult {
                    text: result,
                    is_error,
                    cost_usd: total_cost_usd,
                    engine_session_id: session_id,
                }],
            }
        }
        WireEvent::RateLimit { retry_after_secs, message } => {
            vec![StreamMessage::RateLimit(RateLimitSignal {
                retry_after: retry_after_secs
                    .filter(|s| s.is_finite() && *s >= 0.0)
                    .map(Duration::from_secs_f64),
                message: message.unwrap_or_else(|| "rate limited".to_string()),
            })]
        }
        WireEvent::Error { error, message } => {
            let text = message
                .or_else(|| {
                    error.as_ref().and_then(|e| {
                        e.get("message").and_then(Value::as_str).map(str::to_string)
                    })
                })
                .unwrap_or_default();
            let error_type = error
                .as_ref()
                .and_then(|e| e.get("type"))
                .and_then(Value::as_str)
                .unwrap_or_default();

            if error_type == "rate_limit_error" || error_type == "overloaded_error" {
                vec![StreamMessage::RateLimit(RateLimitSignal { retry_after: None, message: text })]
            } else if let Some(signal) = rate_limit_from_text(&text) {
                vec![StreamMessage::RateLimit(signal)]
            } else {
                warn!(error = %text, "engine reported an error");
                vec![StreamMessage::ignorable("error")]
            }
        }
        WireEvent::Unknown => {
            debug!(line = %preview(line), "unrecognized stream event");
            vec![StreamMessage::ignorable("unknown")]
        }
    };

    if messages.is_empty() {
        return Ok(vec![StreamMessage::ignorable("empty")]);
    }
    Ok(messages)
}

/// Assistant prose only counts as a limit notice when the whole message is one;
/// prose that merely discusses rate limits stays prose.
fn assistant_text(text: String) -> StreamMessage {
    let notice = text.trim_start().to_ascii_lowercase();
    let is_notice = notice.starts_with("claude ai usage limit reached") || notice.starts_with("usage limit reached");
    match rate_limit_from_text(&text).filter(|_| is_notice) {
        Some(signal) => StreamMessage::RateLimit(signal),
        None => StreamMessage::AssistantText { text },
    }
}

fn classify_content(content: WireContent, out: &mut Vec<StreamMessage>) {
    match content {
        WireContent::Text(text) if !text.is_empty() => out.push(assistant_text(text)),
        WireContent::Text(_) => {}
        WireContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    WireBlock::Text { text } if !text.is_empty() => out.push(assistant_text(text)),
                    WireBlock::ToolUse { id, name, input } => out.push(tool_use(id, name, input)),
                    WireBlock::ToolResult { tool_use_id, content, is_error } => {
                        out.push(StreamMessage::ToolResult {
                            tool_use_id,
                            content: flatten_content(&content),
                            is_error,
                        });
                    }
                    WireBlock::Text { .. } | WireBlock::Other => {}
                }
            }
        }
    }
}

fn tool_use(id: String, name: String, input: Value) -> StreamMessage {
    if name == ASK_USER_TOOL {
        if let Some(question) = parse_question(&id, &input) {
            return StreamMessage::InteractiveQuestion(question);
        }
        debug!(tool_call_id = %id, "question tool call without a usable question");
    }
    StreamMessage::ToolInvocation { id, name, input }
}

/// Accepts both `{"questions": [{...}]}` and a bare `{"question": ...}`.
fn parse_question(tool_call_id: &str, input: &Value) -> Option<PendingQuestion> {
    let q = input
        .get("questions")
        .and_then(Value::as_array)
        .and_then(|qs| qs.first())
        .unwrap_or(input);

    let question = q.get("question").and_then(Value::as_str)?.to_string();
    let options = q
        .get("options")
        .and_then(Value::as_array)
        .map(|opts| {
            opts.iter()
                .filter_map(|o| match o {
                    Value::String(label) => Some(QuestionOption { label: label.clone(), description: None }),
                    Value::Object(_) => o.get("label").and_then(Value::as_str).map(|label| QuestionOption {
                        label: label.to_string(),
                        description: o.get("description").and_then(Value::as_str).map(str::to_string),
                    }),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    let multi_select = q
        .get("multiSelect")
        .or_else(|| q.get("multi_select"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Some(PendingQuestion {
        tool_call_id: tool_call_id.to_string(),
        question,
        options,
        multi_select,
    })
}

fn flatten_content(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                _ => item.get("text").and_then(Value::as_str).map(str::to_string),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// Recognize usage-limit notices engines print as plain text.
///
/// A `|<unix-seconds>` suffix is read as the reset time.
fn rate_limit_from_text(text: &str) -> Option<RateLimitSignal> {
    let lower = text.to_ascii_lowercase();
    let is_limit = lower.contains("usage limit reached")
        || lower.contains("rate limit exceeded")
        || lower.contains("rate_limit_error")
        || lower.starts_with("429")
        || lower.contains("too many requests");
    if !is_limit {
        return None;
    }

    let retry_after = text
        .rsplit_once('|')
        .and_then(|(_, tail)| tail.trim().parse::<i64>().ok())
        .map(|reset_at| (reset_at - Utc::now().timestamp()).max(0))
        .and_then(|secs| u64::try_from(secs).ok())
        .map(Duration::from_secs);

    Some(RateLimitSignal {
        retry_after,
        message: text.to_string(),
    })
}
