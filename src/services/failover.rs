//! Engine failover on rate limiting.
//!
//! Rate-limit signals are counted per session over a short window. Reaching
//! the signal threshold, or a single signal asking for a long wait, triggers
//! one handoff to the next engine in the machine's priority list. A session
//! that already has a handoff in flight ignores further signals, and a
//! replacement that is rate limited right after it starts escalates instead
//! of cycling.

use futures::stream::BoxStream;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{FailoverConfig, HandoffRecord, RateLimitSignal};
use crate::domain::ports::{ProcessExit, SessionSpawner, SpawnRequest, TaskStore};
use crate::services::session::LiveSession;
use crate::services::topic_router::TopicRouter;

/// Thresholds for failover decisions.
#[derive(Debug, Clone, Copy)]
pub struct FailoverPolicy {
    pub window: Duration,
    pub signal_threshold: u32,
    pub retry_delay_threshold: Duration,
    pub max_hops: usize,
    pub immediate_window: Duration,
    pub excerpt_chars: usize,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self::from(&FailoverConfig::default())
    }
}

impl From<&FailoverConfig> for FailoverPolicy {
    fn from(config: &FailoverConfig) -> Self {
        Self {
            window: Duration::from_secs(config.window_secs),
            signal_threshold: config.signal_threshold.max(1),
            retry_delay_threshold: Duration::from_secs(config.retry_delay_threshold_secs),
            max_hops: config.max_hops,
            immediate_window: Duration::from_secs(config.immediate_window_secs),
            excerpt_chars: config.excerpt_chars,
        }
    }
}

/// What to do about a rate-limit signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverDecision {
    /// Below threshold, or a handoff is already running
    Ignore,
    /// Hand the session off to the next engine
    Handoff { reason: String },
    /// Stop retrying and fail
    Escalate { reason: String },
}

#[derive(Debug, Default)]
struct SignalWindow {
    signals: VecDeque<Instant>,
    handoff_in_progress: bool,
}

/// Where a replacement session runs and what it was asked originally.
#[derive(Debug, Clone, Copy)]
pub struct HandoffContext<'a> {
    pub original_prompt: &'a str,
    pub workspace_path: &'a Path,
    pub permission_mode: &'a str,
}

/// Why a session is being replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementKind {
    /// Failover to another engine; counts as a hop and is recorded.
    Handoff,
    /// Same engine after the transport dropped; keeps the hop depth.
    Reconnect,
}

/// A replacement session ready to be pumped.
pub struct Replacement {
    pub session: Arc<LiveSession>,
    pub output: BoxStream<'static, std::io::Result<Vec<u8>>>,
    pub exit: oneshot::Receiver<ProcessExit>,
    /// Set for handoffs only.
    pub record: Option<HandoffRecord>,
}

/// Decides on and performs engine handoffs.
pub struct EngineFailoverController {
    policy: FailoverPolicy,
    windows: Mutex<HashMap<String, SignalWindow>>,
    spawner: Arc<dyn SessionSpawner>,
    router: TopicRouter,
    store: Option<Arc<dyn TaskStore>>,
    transcript_entries: usize,
}

impl EngineFailoverController {
    pub fn new(
        policy: FailoverPolicy,
        spawner: Arc<dyn SessionSpawner>,
        router: TopicRouter,
        store: Option<Arc<dyn TaskStore>>,
        transcript_entries: usize,
    ) -> Self {
        Self {
            policy,
            windows: Mutex::new(HashMap::new()),
            spawner,
            router,
            store,
            transcript_entries,
        }
    }

    pub fn policy(&self) -> &FailoverPolicy {
        &self.policy
    }

    /// Count a rate-limit signal for `session` and decide.
    pub async fn record_signal(&self, session: &LiveSession, signal: &RateLimitSignal) -> FailoverDecision {
        let mut windows = self.windows.lock().await;
        let window = windows.entry(session.id().to_string()).or_default();
        if window.handoff_in_progress {
            return FailoverDecision::Ignore;
        }

        let now = Instant::now();
        window.signals.push_back(now);
        while window
            .signals
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.policy.window)
        {
            window.signals.pop_front();
        }
        let count = window.signals.len();

        if session.handoff_depth() > 0 && session.spawned_at().elapsed() <= self.policy.immediate_window {
            window.handoff_in_progress = true;
            return FailoverDecision::Escalate {
                reason: format!(
                    "replacement engine {} was rate limited immediately: {}",
                    session.engine(),
                    signal.message
                ),
            };
        }

        let long_wait = signal
            .retry_after
            .is_some_and(|wait| wait > self.policy.retry_delay_threshold);
        if long_wait || count >= self.policy.signal_threshold as usize {
            window.handoff_in_progress = true;
            let reason = if long_wait {
                format!("rate limited on {} with retry after {:?}", session.engine(), signal.retry_after.unwrap_or_default())
            } else {
                format!("rate limited on {} ({count} signals)", session.engine())
            };
            return FailoverDecision::Handoff { reason };
        }

        FailoverDecision::Ignore
    }

    /// Forget a session's counters.
    pub async fn finish(&self, session_id: &str) {
        self.windows.lock().await.remove(session_id);
    }

    /// Next engine after `current` in `priority`, wrapping, skipping every
    /// engine already attempted in this chain. `None` once `max_hops`
    /// handoffs have been made or no untried engine is left.
    pub fn select_next_engine(&self, priority: &[String], current: &str, attempted: &[String]) -> Option<String> {
        select_next_engine(priority, current, attempted, self.policy.max_hops)
    }

    /// Replace `session` with a new one on `engine_to`.
    ///
    /// The topic stays claimed throughout. The old process is killed before
    /// the replacement is spawned; its prompt is prefixed with a handoff
    /// document built from the transcript tail. Only a
    /// [`ReplacementKind::Handoff`] raises the handoff depth and writes a
    /// [`HandoffRecord`].
    pub async fn hand_off(
        &self,
        session: &Arc<LiveSession>,
        engine_to: &str,
        reason: &str,
        kind: ReplacementKind,
        context: HandoffContext<'_>,
    ) -> DomainResult<Replacement> {
        let topic_id = session.topic_id().to_string();
        let excerpt = session.transcript_excerpt(self.policy.excerpt_chars).await;
        let document = handoff_document(session.engine(), reason, &excerpt);

        if let Err(e) = self.router.detach_for_handoff(&topic_id).await {
            warn!(topic_id = %topic_id, error = %e, "handoff detach skipped");
        }
        session.terminate().await?;
        self.finish(session.id()).await;

        let spawned = self
            .spawner
            .spawn(SpawnRequest {
                workspace_path: context.workspace_path.to_path_buf(),
                prompt: format!("{document}{}", context.original_prompt),
                engine: engine_to.to_string(),
                permission_mode: context.permission_mode.to_string(),
                task_id: session.task_id(),
                topic_id: topic_id.clone(),
            })
            .await?;

        let replacement = Arc::new(LiveSession::new(
            topic_id.clone(),
            session.task_id(),
            spawned.handle,
            self.transcript_entries,
            match kind {
                ReplacementKind::Handoff => session.handoff_depth() + 1,
                ReplacementKind::Reconnect => session.handoff_depth(),
            },
        ));
        replacement.inherit_transcript(session).await;
        self.router
            .attach(&topic_id, Arc::clone(&replacement))
            .await
            .map_err(|e| DomainError::ExecutionFailed(e.to_string()))?;

        let record = (kind == ReplacementKind::Handoff).then(|| {
            HandoffRecord::new(
                session.task_id(),
                topic_id.clone(),
                session.engine(),
                engine_to,
                reason,
                excerpt,
            )
        });
        if let (Some(store), Some(task_id)) = (&self.store, session.task_id()) {
            if let Some(record) = &record {
                if let Err(e) = store.record_handoff(record).await {
                    warn!(task_id = %task_id, error = %e, "failed to record handoff");
                }
            }
            if let Err(e) = store.update_session(task_id, replacement.id(), engine_to).await {
                warn!(task_id = %task_id, error = %e, "failed to update task session");
            }
        }

        info!(
            topic_id = %topic_id,
            engine_from = %session.engine(),
            engine_to = %engine_to,
            session_id = %replacement.id(),
            reason = %reason,
            kind = ?kind,
            "session replaced"
        );

        Ok(Replacement {
            session: replacement,
            output: spawned.output,
            exit: spawned.exit,
            record,
        })
    }
}

/// See [`EngineFailoverController::select_next_engine`].
pub fn select_next_engine(
    priority: &[String],
    current: &str,
    attempted: &[String],
    max_hops: usize,
) -> Option<String> {
    let hops_taken = attempted.len().saturating_sub(1);
    if hops_taken >= max_hops || priority.is_empty() {
        return None;
    }
    let start = priority.iter().position(|e| e == current).map_or(0, |i| i + 1);
    (0..priority.len())
        .map(|offset| &priority[(start + offset) % priority.len()])
        .find(|engine| engine.as_str() != current && !attempted.contains(engine))
        .cloned()
}

/// Render the context block that prefixes a replacement session's prompt.
pub fn handoff_document(engine_from: &str, reason: &str, excerpt: &str) -> String {
    let mut doc = String::from("[Session handoff]\n");
    doc.push_str(&format!(
        "The previous engine ({engine_from}) stopped: {reason}.\n\
         Continue the work below from where it left off. Do not repeat completed steps.\n"
    ));
    if !excerpt.is_empty() {
        doc.push_str("\nRecent transcript:\n");
        doc.push_str(excerpt);
        doc.push('\n');
    }
    doc.push_str("[End of handoff]\n\n");
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::chat::RecordingChatSender;
    use crate::adapters::substrates::{MockScript, MockSpawner};
    use crate::services::topic_router::TopicRouterConfig;
    use std::path::PathBuf;

    fn engines(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn signal(retry_after: Option<u64>) -> RateLimitSignal {
        RateLimitSignal {
            retry_after: retry_after.map(Duration::from_secs),
            message: "rate limited".into(),
        }
    }

    async fn controller_with_session(depth: usize) -> (EngineFailoverController, Arc<LiveSession>) {
        let spawner = Arc::new(MockSpawner::with_default_script(MockScript::lines(["{}"]).held_open()));
        let router = TopicRouter::new(Arc::new(RecordingChatSender::new()), TopicRouterConfig::default());
        let spawned = spawner
            .spawn(SpawnRequest {
                workspace_path: PathBuf::from("."),
                prompt: "p".into(),
                engine: "claude".into(),
                permission_mode: "acceptEdits".into(),
                task_id: None,
                topic_id: "t".into(),
            })
            .await
            .unwrap();
        let session = Arc::new(LiveSession::new("t", None, spawned.handle, 10, depth));
        let controller = EngineFailoverController::new(FailoverPolicy::default(), spawner, router, None, 10);
        (controller, session)
    }

    #[test]
    fn test_next_engine_wraps_and_skips_attempted() {
        let priority = engines(&["claude", "codex", "gemini"]);
        assert_eq!(select_next_engine(&priority, "claude", &engines(&["claude"]), 3), Some("codex".into()));
        assert_eq!(select_next_engine(&priority, "gemini", &engines(&["gemini"]), 3), Some("claude".into()));
        assert_eq!(
            select_next_engine(&priority, "codex", &engines(&["claude", "codex"]), 3),
            Some("gemini".into())
        );
        assert_eq!(select_next_engine(&priority, "gemini", &engines(&["claude", "codex", "gemini"]), 5), None);
    }

    #[test]
    fn test_next_engine_respects_hop_bound() {
        let priority = engines(&["a", "b", "c", "d"]);
        assert_eq!(select_next_engine(&priority, "b", &engines(&["a", "b"]), 1), None);
        assert_eq!(select_next_engine(&priority, "b", &engines(&["a", "b"]), 2), Some("c".into()));
    }

    #[test]
    fn test_unknown_current_engine_starts_at_front() {
        let priority = engines(&["claude", "codex"]);
        assert_eq!(select_next_engine(&priority, "local", &engines(&["local"]), 3), Some("claude".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_triggers_exactly_one_handoff() {
        let (controller, session) = controller_with_session(0).await;
        assert_eq!(controller.record_signal(&session, &signal(None)).await, FailoverDecision::Ignore);
        assert_eq!(controller.record_signal(&session, &signal(None)).await, FailoverDecision::Ignore);
        assert!(matches!(
            controller.record_signal(&session, &signal(None)).await,
            FailoverDecision::Handoff { .. }
        ));
        assert_eq!(controller.record_signal(&session, &signal(None)).await, FailoverDecision::Ignore);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signals_outside_window_expire() {
        let (controller, session) = controller_with_session(0).await;
        controller.record_signal(&session, &signal(None)).await;
        controller.record_signal(&session, &signal(None)).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(controller.record_signal(&session, &signal(None)).await, FailoverDecision::Ignore);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_retry_delay_hands_off_immediately() {
        let (controller, session) = controller_with_session(0).await;
        assert!(matches!(
            controller.record_signal(&session, &signal(Some(3600))).await,
            FailoverDecision::Handoff { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacement_limited_immediately_escalates() {
        let (controller, session) = controller_with_session(1).await;
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(
            controller.record_signal(&session, &signal(None)).await,
            FailoverDecision::Escalate { .. }
        ));
    }

    fn context() -> HandoffContext<'static> {
        HandoffContext {
            original_prompt: "Fix the build",
            workspace_path: Path::new("."),
            permission_mode: "acceptEdits",
        }
    }

    #[tokio::test]
    async fn test_reconnect_keeps_depth_and_writes_no_record() {
        let (controller, session) = controller_with_session(0).await;
        controller.router.begin_spawn("t").await.unwrap();
        controller.router.attach("t", Arc::clone(&session)).await.unwrap();

        let replacement = controller
            .hand_off(&session, "claude", "transport_lost", ReplacementKind::Reconnect, context())
            .await
            .unwrap();
        assert_eq!(replacement.session.handoff_depth(), 0);
        assert!(replacement.record.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_right_after_reconnect_does_not_escalate() {
        let (controller, session) = controller_with_session(0).await;
        controller.router.begin_spawn("t").await.unwrap();
        controller.router.attach("t", Arc::clone(&session)).await.unwrap();

        let replacement = controller
            .hand_off(&session, "claude", "transport_lost", ReplacementKind::Reconnect, context())
            .await
            .unwrap();
        assert_eq!(
            controller.record_signal(&replacement.session, &signal(None)).await,
            FailoverDecision::Ignore
        );
    }

    #[tokio::test]
    async fn test_handoff_raises_depth_and_records() {
        let (controller, session) = controller_with_session(0).await;
        controller.router.begin_spawn("t").await.unwrap();
        controller.router.attach("t", Arc::clone(&session)).await.unwrap();

        let replacement = controller
            .hand_off(&session, "codex", "rate limited", ReplacementKind::Handoff, context())
            .await
            .unwrap();
        assert_eq!(replacement.session.handoff_depth(), 1);
        let record = replacement.record.unwrap();
        assert_eq!(record.engine_from, "claude");
        assert_eq!(record.engine_to, "codex");
    }

    #[test]
    fn test_handoff_document_contains_excerpt() {
        let doc = handoff_document("claude", "rate limited", "[assistant] edited src/lib.rs");
        assert!(doc.contains("claude"));
        assert!(doc.contains("[assistant] edited src/lib.rs"));
        assert!(doc.ends_with("\n\n"));
    }
}
