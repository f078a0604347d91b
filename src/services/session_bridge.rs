//! Drives one topic's session from spawn to its final outcome.
//!
//! The bridge spawns an engine process, binds it to the topic, pumps its
//! output through the stream parser, and reacts to what it classifies:
//! assistant text and questions go to the topic, rate-limit signals go to the
//! failover controller, and a final result ends the session. Dropped
//! transports get a bounded number of reconnects on the same engine.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use futures::stream::{BoxStream, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{BindingState, CloseReason, StreamMessage, TopicId, TransportConfig};
use crate::domain::ports::{ProcessExit, SessionSpawner, SpawnRequest};
use crate::services::failover::{EngineFailoverController, FailoverDecision, HandoffContext, ReplacementKind};
use crate::services::session::LiveSession;
use crate::services::stream_parser::StreamProtocolParser;
use crate::services::topic_router::TopicRouter;

/// Reason recorded when the session's cost passes the task budget.
pub const BUDGET_EXCEEDED_REASON: &str = "budget_exceeded";

/// Reason recorded when reconnects after a dropped transport are exhausted.
pub const TRANSPORT_LOST_REASON: &str = "transport_lost";

/// How long to wait for an exit status once output has ended.
const EXIT_WAIT: Duration = Duration::from_secs(10);

type OutputStream = BoxStream<'static, std::io::Result<Vec<u8>>>;

/// Everything needed to run one session.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub topic_id: TopicId,
    pub task_id: Option<Uuid>,
    pub prompt: String,
    pub workspace_path: PathBuf,
    pub engine_priority: Vec<String>,
    pub permission_mode: String,
    pub budget_usd: Option<f64>,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    Completed { summary: Option<String> },
    Failed { reason: String },
    Cancelled,
}

/// Final state of a driven session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub end: SessionEnd,
    pub engine: String,
    pub session_id: String,
    pub files_changed: Vec<String>,
    pub cost_usd: f64,
    pub handoffs: usize,
}

/// A spawned and attached session that has not been pumped yet.
pub struct StartedSession {
    session: Arc<LiveSession>,
    output: OutputStream,
    exit: oneshot::Receiver<ProcessExit>,
    plan: SessionPlan,
}

impl StartedSession {
    pub fn session(&self) -> &Arc<LiveSession> {
        &self.session
    }
}

/// Why one pump over a session's output stopped.
enum PumpEnd {
    Finished { is_error: bool, text: Option<String> },
    BudgetExceeded { cost: f64 },
    Handoff { reason: String },
    Escalate { reason: String },
    TransportLost { error: String },
    Eof,
}

/// Spawns sessions and pumps their output.
pub struct SessionBridge {
    spawner: Arc<dyn SessionSpawner>,
    router: TopicRouter,
    failover: Arc<EngineFailoverController>,
    transport: TransportConfig,
    transcript_entries: usize,
}

impl SessionBridge {
    pub fn new(
        spawner: Arc<dyn SessionSpawner>,
        router: TopicRouter,
        failover: Arc<EngineFailoverController>,
        transport: TransportConfig,
        transcript_entries: usize,
    ) -> Self {
        Self {
            spawner,
            router,
            failover,
            transport,
            transcript_entries,
        }
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    /// Claim the topic, spawn the first supported engine, and attach it.
    pub async fn start(&self, plan: SessionPlan) -> DomainResult<StartedSession> {
        let engine = plan
            .engine_priority
            .iter()
            .find(|e| self.spawner.supports(e))
            .cloned()
            .ok_or_else(|| DomainError::UnknownEngine(plan.engine_priority.join(",")))?;

        self.router
            .begin_spawn(&plan.topic_id)
            .await
            .map_err(|e| DomainError::SpawnFailed(e.to_string()))?;

        let spawned = match self
            .spawner
            .spawn(SpawnRequest {
                workspace_path: plan.workspace_path.clone(),
                prompt: plan.prompt.clone(),
                engine: engine.clone(),
                permission_mode: plan.permission_mode.clone(),
                task_id: plan.task_id,
                topic_id: plan.topic_id.clone(),
            })
            .await
        {
            Ok(spawned) => spawned,
            Err(e) => {
                self.router.abort_spawn(&plan.topic_id).await;
                return Err(e);
            }
        };

        let session = Arc::new(LiveSession::new(
            plan.topic_id.clone(),
            plan.task_id,
            spawned.handle,
            self.transcript_entries,
            0,
        ));
        if let Err(e) = self.router.attach(&plan.topic_id, Arc::clone(&session)).await {
            let _ = session.terminate().await;
            self.router.abort_spawn(&plan.topic_id).await;
            return Err(DomainError::SpawnFailed(e.to_string()));
        }

        Ok(StartedSession {
            session,
            output: spawned.output,
            exit: spawned.exit,
            plan,
        })
    }

    /// Pump the session until it finishes, fails, or is cancelled.
    pub async fn drive(&self, started: StartedSession) -> SessionOutcome {
        let StartedSession {
            mut session,
            mut output,
            mut exit,
            plan,
        } = started;

        let mut attempted = vec![session.engine().to_string()];
        let mut prior_cost = 0.0;
        let mut handoffs = 0usize;
        let mut reconnects = 0u32;
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.transport.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(self.transport.max_backoff_ms))
            .with_max_elapsed_time(None)
            .build();

        let end = loop {
            let pumped = self.pump(&session, &mut output, prior_cost, plan.budget_usd).await;

            let (engine_to, reason, kind) = match pumped {
                PumpEnd::Finished { is_error: false, .. } => {
                    break SessionEnd::Completed { summary: session.summary().await };
                }
                PumpEnd::Finished { is_error: true, text } => {
                    break SessionEnd::Failed {
                        reason: text.unwrap_or_else(|| "engine reported an error".to_string()),
                    };
                }
                PumpEnd::BudgetExceeded { cost } => {
                    warn!(topic_id = %plan.topic_id, cost_usd = cost, budget_usd = ?plan.budget_usd, "budget exceeded");
                    break SessionEnd::Failed { reason: BUDGET_EXCEEDED_REASON.to_string() };
                }
                PumpEnd::Escalate { reason } => {
                    warn!(topic_id = %plan.topic_id, reason = %reason, "failover escalated");
                    break SessionEnd::Failed { reason };
                }
                PumpEnd::Handoff { reason } => {
                    match self.failover.select_next_engine(&plan.engine_priority, session.engine(), &attempted) {
                        Some(next) => {
                            self.router
                                .deliver(
                                    &plan.topic_id,
                                    session.id(),
                                    &format!("\n⚠️ {} is rate limited; handing off to {next}.\n", session.engine()),
                                )
                                .await;
                            (next, reason, ReplacementKind::Handoff)
                        }
                        None => {
                            break SessionEnd::Failed {
                                reason: format!("{reason}; no engine left to hand off to"),
                            };
                        }
                    }
                }
                PumpEnd::TransportLost { error } => {
                    if self.router.state(&plan.topic_id).await == BindingState::Closed {
                        break SessionEnd::Cancelled;
                    }
                    if reconnects >= self.transport.max_reconnects {
                        warn!(topic_id = %plan.topic_id, error = %error, reconnects, "transport lost, giving up");
                        break SessionEnd::Failed { reason: TRANSPORT_LOST_REASON.to_string() };
                    }
                    reconnects += 1;
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| Duration::from_millis(self.transport.max_backoff_ms));
                    warn!(
                        topic_id = %plan.topic_id,
                        error = %error,
                        attempt = reconnects,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "transport lost, reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                    (
                        session.engine().to_string(),
                        format!("{TRANSPORT_LOST_REASON}: {error}"),
                        ReplacementKind::Reconnect,
                    )
                }
                PumpEnd::Eof => {
                    if self.router.state(&plan.topic_id).await == BindingState::Closed {
                        break SessionEnd::Cancelled;
                    }
                    let status = tokio::time::timeout(EXIT_WAIT, &mut exit).await;
                    match status {
                        Ok(Ok(status)) if status.success() => {
                            break SessionEnd::Completed { summary: session.summary().await };
                        }
                        Ok(Ok(ProcessExit { code: Some(code) })) => {
                            break SessionEnd::Failed { reason: format!("engine exited with code {code}") };
                        }
                        Ok(Ok(ProcessExit { code: None })) => {
                            break SessionEnd::Failed { reason: "engine terminated by signal".to_string() };
                        }
                        Ok(Err(_)) | Err(_) => {
                            break SessionEnd::Failed { reason: "engine output ended without exit status".to_string() };
                        }
                    }
                }
            };

            // Replace the session, on a new engine or the same one after a transport drop.
            prior_cost += session.cost_usd().await;
            let context = HandoffContext {
                original_prompt: &plan.prompt,
                workspace_path: &plan.workspace_path,
                permission_mode: &plan.permission_mode,
            };
            match self.failover.hand_off(&session, &engine_to, &reason, kind, context).await {
                Ok(replacement) => {
                    if kind == ReplacementKind::Handoff {
                        if !attempted.contains(&engine_to) {
                            attempted.push(engine_to);
                        }
                        handoffs += 1;
                    }
                    session = replacement.session;
                    output = replacement.output;
                    exit = replacement.exit;
                }
                Err(e) => {
                    break SessionEnd::Failed {
                        reason: format!("handoff to {engine_to} failed: {e}"),
                    };
                }
            }
        };

        let close_reason = match &end {
            SessionEnd::Completed { .. } => CloseReason::Completed,
            SessionEnd::Failed { reason } => CloseReason::Failed(reason.clone()),
            SessionEnd::Cancelled => CloseReason::Cancelled,
        };
        self.router.close(&plan.topic_id, close_reason).await;
        if let Err(e) = session.terminate().await {
            debug!(session_id = %session.id(), error = %e, "terminate after close failed");
        }
        self.failover.finish(session.id()).await;

        let outcome = SessionOutcome {
            end,
            engine: session.engine().to_string(),
            session_id: session.id().to_string(),
            files_changed: session.files_changed().await,
            cost_usd: prior_cost + session.cost_usd().await,
            handoffs,
        };
        info!(
            topic_id = %plan.topic_id,
            session_id = %outcome.session_id,
            engine = %outcome.engine,
            end = ?outcome.end,
            handoffs,
            "session finished"
        );
        outcome
    }

    /// Spawn and drive in one call.
    pub async fn run(&self, plan: SessionPlan) -> DomainResult<SessionOutcome> {
        let started = self.start(plan).await?;
        Ok(self.drive(started).await)
    }

    async fn pump(
        &self,
        session: &Arc<LiveSession>,
        output: &mut OutputStream,
        prior_cost: f64,
        budget: Option<f64>,
    ) -> PumpEnd {
        let mut parser = StreamProtocolParser::new();
        loop {
            let messages = match output.next().await {
                Some(Ok(chunk)) => parser.feed(&chunk),
                Some(Err(e)) => return PumpEnd::TransportLost { error: e.to_string() },
                None => {
                    let tail = parser.finish();
                    for message in tail {
                        if let Some(end) = self.handle(session, message, prior_cost, budget).await {
                            return end;
                        }
                    }
                    if parser.malformed_count() > 0 {
                        debug!(session_id = %session.id(), malformed = parser.malformed_count(), "stream ended");
                    }
                    return PumpEnd::Eof;
                }
            };
            for message in messages {
                if let Some(end) = self.handle(session, message, prior_cost, budget).await {
                    return end;
                }
            }
        }
    }

    async fn handle(
        &self,
        session: &Arc<LiveSession>,
        message: StreamMessage,
        prior_cost: f64,
        budget: Option<f64>,
    ) -> Option<PumpEnd> {
        session.observe(&message).await;
        let topic_id = session.topic_id();

        match message {
            StreamMessage::AssistantText { text } => {
                self.router.deliver(topic_id, session.id(), &text).await;
                None
            }
            StreamMessage::InteractiveQuestion(question) => {
                let rendered = format!("\n{}\n", question.render());
                self.router.deliver(topic_id, session.id(), &rendered).await;
                None
            }
            StreamMessage::ToolInvocation { name, .. } => {
                debug!(session_id = %session.id(), tool = %name, "tool invoked");
                None
            }
            StreamMessage::FinalResult { is_error, text, .. } => {
                let cost = prior_cost + session.cost_usd().await;
                if budget.is_some_and(|b| cost > b) {
                    return Some(PumpEnd::BudgetExceeded { cost });
                }
                Some(PumpEnd::Finished { is_error, text })
            }
            StreamMessage::RateLimit(signal) => {
                info!(
                    session_id = %session.id(),
                    engine = %session.engine(),
                    retry_after = ?signal.retry_after,
                    "rate limit signal"
                );
                match self.failover.record_signal(session, &signal).await {
                    FailoverDecision::Ignore => None,
                    FailoverDecision::Handoff { reason } => Some(PumpEnd::Handoff { reason }),
                    FailoverDecision::Escalate { reason } => Some(PumpEnd::Escalate { reason }),
                }
            }
            StreamMessage::ToolResult { .. } | StreamMessage::Ignorable { .. } => None,
        }
    }
}
