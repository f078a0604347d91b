//! In-memory state of one running engine session.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    tool_answer_frame, user_frame, PendingQuestion, StreamMessage, TopicId, TranscriptRole,
    TranscriptTail,
};
use crate::domain::ports::SessionProcess;

/// Tool names whose input names a file the engine modified.
const FILE_EDIT_TOOLS: [&str; 4] = ["Edit", "Write", "MultiEdit", "NotebookEdit"];

/// How an inbound reply was delivered to the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyDelivery {
    /// Sent as a plain user turn
    UserMessage,
    /// Resolved a pending question; carries the tool-call id and the chosen answer
    QuestionAnswer { tool_call_id: String, answer: String },
}

#[derive(Debug)]
struct SessionState {
    transcript: TranscriptTail,
    pending_questions: HashMap<String, PendingQuestion>,
    question_order: Vec<String>,
    files_changed: BTreeSet<String>,
    final_text: Option<String>,
    last_text: Option<String>,
    cost_usd: f64,
}

/// A spawned engine process plus its routing state.
///
/// Owned by exactly one topic binding. Destroyed when the process exits or
/// is killed; never persisted.
pub struct LiveSession {
    topic_id: TopicId,
    task_id: Option<Uuid>,
    spawned_at: Instant,
    handoff_depth: usize,
    process: Arc<dyn SessionProcess>,
    state: Mutex<SessionState>,
    // One writer at a time so replies never interleave with other frames.
    writer: Mutex<()>,
}

impl LiveSession {
    pub fn new(
        topic_id: impl Into<TopicId>,
        task_id: Option<Uuid>,
        process: Arc<dyn SessionProcess>,
        transcript_entries: usize,
        handoff_depth: usize,
    ) -> Self {
        Self {
            topic_id: topic_id.into(),
            task_id,
            spawned_at: Instant::now(),
            handoff_depth,
            process,
            state: Mutex::new(SessionState {
                transcript: TranscriptTail::new(transcript_entries),
                pending_questions: HashMap::new(),
                question_order: Vec::new(),
                files_changed: BTreeSet::new(),
                final_text: None,
                last_text: None,
                cost_usd: 0.0,
            }),
            writer: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        self.process.id()
    }

    pub fn engine(&self) -> &str {
        self.process.engine()
    }

    pub fn topic_id(&self) -> &str {
        &self.topic_id
    }

    pub fn task_id(&self) -> Option<Uuid> {
        self.task_id
    }

    pub fn spawned_at(&self) -> Instant {
        self.spawned_at
    }

    /// Number of handoffs that led to this session; 0 for the first one.
    pub fn handoff_depth(&self) -> usize {
        self.handoff_depth
    }

    pub fn is_terminated(&self) -> bool {
        self.process.is_terminated()
    }

    /// Fold a classified message into the session state.
    pub async fn observe(&self, message: &StreamMessage) {
        let mut state = self.state.lock().await;
        match message {
            StreamMessage::AssistantText { text } => {
                state.transcript.push(TranscriptRole::Assistant, text);
                state.last_text = Some(text.clone());
            }
            StreamMessage::ToolInvocation { name, input, .. } => {
                if FILE_EDIT_TOOLS.contains(&name.as_str()) {
                    let path = input
                        .get("file_path")
                        .or_else(|| input.get("notebook_path"))
                        .and_then(serde_json::Value::as_str);
                    if let Some(path) = path {
                        state.files_changed.insert(path.to_string());
                    }
                }
                state.transcript.push(TranscriptRole::Tool, &format!("{name} {input}"));
            }
            StreamMessage::ToolResult { content, is_error, .. } => {
                if *is_error {
                    state.transcript.push(TranscriptRole::Tool, &format!("error: {content}"));
                }
            }
            StreamMessage::InteractiveQuestion(question) => {
                state.transcript.push(TranscriptRole::Assistant, &question.question);
                state.question_order.push(question.tool_call_id.clone());
                state
                    .pending_questions
                    .insert(question.tool_call_id.clone(), question.clone());
            }
            StreamMessage::FinalResult { text, cost_usd, .. } => {
                if let Some(text) = text {
                    state.final_text = Some(text.clone());
                }
                if let Some(cost) = cost_usd {
                    state.cost_usd += cost;
                }
            }
            StreamMessage::RateLimit(_) | StreamMessage::Ignorable { .. } => {}
        }
    }

    /// Deliver a human reply, answering the oldest pending question when the
    /// reply resolves one of its options.
    pub async fn reply(&self, text: &str) -> DomainResult<ReplyDelivery> {
        let _writer = self.writer.lock().await;

        let answer = {
            let mut state = self.state.lock().await;
            let oldest = state
                .question_order
                .iter()
                .find(|id| state.pending_questions.contains_key(*id))
                .cloned();
            let resolved = oldest.and_then(|id| {
                state
                    .pending_questions
                    .get(&id)
                    .and_then(|q| q.resolve_selection(text))
                    .map(|answer| (id, answer))
            });
            if let Some((id, _)) = &resolved {
                state.pending_questions.remove(id);
                state.question_order.retain(|q| q != id);
            }
            state.transcript.push(TranscriptRole::User, text);
            resolved
        };

        match answer {
            Some((tool_call_id, answer)) => {
                self.process.write(&tool_answer_frame(&tool_call_id, &answer)).await?;
                info!(session_id = %self.id(), tool_call_id = %tool_call_id, "question answered");
                Ok(ReplyDelivery::QuestionAnswer { tool_call_id, answer })
            }
            None => {
                self.process.write(&user_frame(text)).await?;
                debug!(session_id = %self.id(), "reply written to session");
                Ok(ReplyDelivery::UserMessage)
            }
        }
    }

    pub async fn terminate(&self) -> DomainResult<()> {
        self.process.terminate().await
    }

    pub async fn pending_questions(&self) -> Vec<PendingQuestion> {
        let state = self.state.lock().await;
        state
            .question_order
            .iter()
            .filter_map(|id| state.pending_questions.get(id).cloned())
            .collect()
    }

    pub async fn files_changed(&self) -> Vec<String> {
        self.state.lock().await.files_changed.iter().cloned().collect()
    }

    pub async fn cost_usd(&self) -> f64 {
        self.state.lock().await.cost_usd
    }

    /// Final-result text, falling back to the last assistant text.
    pub async fn summary(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.final_text.clone().or_else(|| state.last_text.clone())
    }

    pub async fn transcript_excerpt(&self, max_chars: usize) -> String {
        self.state.lock().await.transcript.render_excerpt(max_chars)
    }

    /// Copy the transcript into a replacement session so later handoffs keep context.
    pub async fn inherit_transcript(&self, previous: &LiveSession) {
        let entries: Vec<_> = previous.state.lock().await.transcript.entries().cloned().collect();
        let files: Vec<_> = previous.files_changed().await;
        let mut state = self.state.lock().await;
        for entry in entries {
            state.transcript.push(entry.role, &entry.text);
        }
        state.files_changed.extend(files);
    }
}

impl std::fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSession")
            .field("session_id", &self.id())
            .field("engine", &self.engine())
            .field("topic_id", &self.topic_id)
            .field("task_id", &self.task_id)
            .field("handoff_depth", &self.handoff_depth)
            .finish_non_exhaustive()
    }
}
