//! Topic to session binding.
//!
//! The router is the single source of truth for whether a topic is driving a
//! session. Each topic has one binding whose state moves
//! `idle -> browsing -> spawning -> active -> closed`. Only an active binding
//! accepts inbound replies, and only output from the bound session reaches
//! the topic's outbound buffer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::errors::DomainError;
use crate::domain::models::{BindingState, CloseReason, RouterConfig, TopicId};
use crate::domain::ports::ChatSender;
use crate::services::outbound::{OutboundBuffer, OutboundConfig};
use crate::services::session::{LiveSession, ReplyDelivery};

/// Errors raised by binding transitions.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Topic {topic_id} is already {state}")]
    AlreadyBusy { topic_id: TopicId, state: BindingState },

    #[error("Topic {topic_id} is {state}, not spawning")]
    NotSpawning { topic_id: TopicId, state: BindingState },

    #[error("Topic {topic_id} has no active session ({state})")]
    NotActive { topic_id: TopicId, state: BindingState },

    #[error("Unknown topic: {0}")]
    UnknownTopic(TopicId),

    #[error("Session write failed: {0}")]
    Delivery(#[from] DomainError),
}

/// Timing and batching settings for the router.
#[derive(Debug, Clone, Copy)]
pub struct TopicRouterConfig {
    pub outbound: OutboundConfig,
    pub closed_grace: Duration,
    pub spawn_guard: Duration,
}

impl Default for TopicRouterConfig {
    fn default() -> Self {
        Self::from(&RouterConfig::default())
    }
}

impl From<&RouterConfig> for TopicRouterConfig {
    fn from(config: &RouterConfig) -> Self {
        Self {
            outbound: OutboundConfig::from(config),
            closed_grace: config.closed_grace(),
            spawn_guard: config.spawn_guard(),
        }
    }
}

struct Binding {
    state: BindingState,
    session: Option<Arc<LiveSession>>,
    outbound: Option<OutboundBuffer>,
    since: Instant,
    close_reason: Option<CloseReason>,
}

impl Binding {
    fn new(state: BindingState) -> Self {
        Self {
            state,
            session: None,
            outbound: None,
            since: Instant::now(),
            close_reason: None,
        }
    }

    fn enter(&mut self, state: BindingState) {
        self.state = state;
        self.since = Instant::now();
    }
}

/// Snapshot of one binding, for status output.
#[derive(Debug, Clone)]
pub struct BindingSnapshot {
    pub topic_id: TopicId,
    pub state: BindingState,
    pub session_id: Option<String>,
    pub engine: Option<String>,
    pub close_reason: Option<CloseReason>,
}

/// Maps topics to at most one live session each.
#[derive(Clone)]
pub struct TopicRouter {
    bindings: Arc<RwLock<HashMap<TopicId, Binding>>>,
    sender: Arc<dyn ChatSender>,
    config: TopicRouterConfig,
}

impl TopicRouter {
    pub fn new(sender: Arc<dyn ChatSender>, config: TopicRouterConfig) -> Self {
        Self {
            bindings: Arc::new(RwLock::new(HashMap::new())),
            sender,
            config,
        }
    }

    /// Current state of a topic; unknown topics are idle.
    pub async fn state(&self, topic_id: &str) -> BindingState {
        self.bindings
            .read()
            .await
            .get(topic_id)
            .map_or(BindingState::Idle, |b| b.state)
    }

    /// The session bound to an active topic.
    pub async fn session(&self, topic_id: &str) -> Option<Arc<LiveSession>> {
        let bindings = self.bindings.read().await;
        bindings
            .get(topic_id)
            .filter(|b| b.state == BindingState::Active)
            .and_then(|b| b.session.clone())
    }

    /// Start directory or target selection: idle/closed -> browsing.
    pub async fn begin_browse(&self, topic_id: &str) -> Result<(), RouterError> {
        let mut bindings = self.bindings.write().await;
        let binding = bindings
            .entry(topic_id.to_string())
            .or_insert_with(|| Binding::new(BindingState::Idle));
        match binding.state {
            BindingState::Idle | BindingState::Closed | BindingState::Browsing => {
                binding.enter(BindingState::Browsing);
                binding.session = None;
                Ok(())
            }
            state => Err(RouterError::AlreadyBusy { topic_id: topic_id.to_string(), state }),
        }
    }

    /// Claim the topic for a new session: idle/browsing/closed -> spawning.
    ///
    /// Rejects a topic that is already spawning or active, so two trigger
    /// paths firing for one user action spawn only once. A spawning claim
    /// older than the spawn guard is treated as abandoned.
    pub async fn begin_spawn(&self, topic_id: &str) -> Result<(), RouterError> {
        let mut bindings = self.bindings.write().await;
        let binding = bindings
            .entry(topic_id.to_string())
            .or_insert_with(|| Binding::new(BindingState::Idle));

        match binding.state {
            BindingState::Active => {
                return Err(RouterError::AlreadyBusy { topic_id: topic_id.to_string(), state: binding.state });
            }
            BindingState::Spawning if binding.since.elapsed() < self.config.spawn_guard => {
                return Err(RouterError::AlreadyBusy { topic_id: topic_id.to_string(), state: binding.state });
            }
            BindingState::Spawning => {
                warn!(topic_id = %topic_id, "abandoned spawn claim replaced");
            }
            BindingState::Idle | BindingState::Browsing | BindingState::Closed => {}
        }

        binding.enter(BindingState::Spawning);
        binding.session = None;
        binding.close_reason = None;
        debug!(topic_id = %topic_id, "spawn claimed");
        Ok(())
    }

    /// Release a spawn claim whose spawn failed: spawning -> idle.
    pub async fn abort_spawn(&self, topic_id: &str) {
        let mut bindings = self.bindings.write().await;
        if bindings.get(topic_id).is_some_and(|b| b.state == BindingState::Spawning) {
            bindings.remove(topic_id);
            debug!(topic_id = %topic_id, "spawn claim released");
        }
    }

    /// Bind a freshly spawned session: spawning -> active.
    pub async fn attach(&self, topic_id: &str, session: Arc<LiveSession>) -> Result<(), RouterError> {
        let mut bindings = self.bindings.write().await;
        let binding = bindings
            .get_mut(topic_id)
            .ok_or_else(|| RouterError::UnknownTopic(topic_id.to_string()))?;
        if binding.state != BindingState::Spawning {
            return Err(RouterError::NotSpawning { topic_id: topic_id.to_string(), state: binding.state });
        }

        if binding.outbound.is_none() {
            let (buffer, _flusher) = OutboundBuffer::spawn(topic_id, Arc::clone(&self.sender), self.config.outbound);
            binding.outbound = Some(buffer);
        }
        info!(
            topic_id = %topic_id,
            session_id = %session.id(),
            engine = %session.engine(),
            "session attached"
        );
        binding.session = Some(session);
        binding.enter(BindingState::Active);
        Ok(())
    }

    /// Write an inbound reply to the topic's session.
    pub async fn route_inbound(&self, topic_id: &str, text: &str) -> Result<ReplyDelivery, RouterError> {
        let session = {
            let bindings = self.bindings.read().await;
            match bindings.get(topic_id) {
                Some(b) if b.state == BindingState::Active => b.session.clone(),
                Some(b) => {
                    return Err(RouterError::NotActive { topic_id: topic_id.to_string(), state: b.state });
                }
                None => {
                    return Err(RouterError::NotActive { topic_id: topic_id.to_string(), state: BindingState::Idle });
                }
            }
        };
        let session = session.ok_or_else(|| RouterError::UnknownTopic(topic_id.to_string()))?;
        Ok(session.reply(text).await?)
    }

    /// Queue session output for the topic.
    ///
    /// Output is accepted only from the currently bound session of an active
    /// topic. Anything else, including residual output during the closed
    /// grace window, is dropped. Returns whether the text was accepted.
    pub async fn deliver(&self, topic_id: &str, session_id: &str, text: &str) -> bool {
        let bindings = self.bindings.read().await;
        let Some(binding) = bindings.get(topic_id) else {
            return false;
        };
        let bound = binding.session.as_ref().is_some_and(|s| s.id() == session_id);
        if binding.state != BindingState::Active || !bound {
            debug!(topic_id = %topic_id, session_id = %session_id, state = %binding.state, "output dropped");
            return false;
        }
        binding.outbound.as_ref().is_some_and(|o| o.push(text))
    }

    /// Wait until buffered output for the topic has been handed to the sender.
    pub async fn flush(&self, topic_id: &str) {
        let buffer = self.bindings.read().await.get(topic_id).and_then(|b| b.outbound.clone());
        if let Some(buffer) = buffer {
            buffer.flush().await;
        }
    }

    /// Close the topic's session: active/spawning -> closed.
    ///
    /// Flushes already accepted output, kills the process, and starts the
    /// grace window. Closing a topic that is not busy is a no-op.
    pub async fn close(&self, topic_id: &str, reason: CloseReason) -> Option<Arc<LiveSession>> {
        let (session, outbound) = {
            let mut bindings = self.bindings.write().await;
            let binding = bindings.get_mut(topic_id)?;
            if !binding.state.is_busy() {
                return None;
            }
            binding.enter(BindingState::Closed);
            binding.close_reason = Some(reason.clone());
            (binding.session.take(), binding.outbound.take())
        };

        if let Some(outbound) = outbound {
            outbound.flush().await;
        }
        if let Some(session) = &session {
            if let Err(e) = session.terminate().await {
                warn!(topic_id = %topic_id, session_id = %session.id(), error = %e, "terminate failed");
            }
            info!(topic_id = %topic_id, session_id = %session.id(), reason = %reason, "session closed");
        }
        session
    }

    /// Unbind the active session ahead of a handoff: active -> spawning.
    ///
    /// The topic stays claimed so no other path can spawn into it; the old
    /// session's residual output is dropped because it no longer matches.
    pub async fn detach_for_handoff(&self, topic_id: &str) -> Result<Arc<LiveSession>, RouterError> {
        let mut bindings = self.bindings.write().await;
        let binding = bindings
            .get_mut(topic_id)
            .ok_or_else(|| RouterError::UnknownTopic(topic_id.to_string()))?;
        if binding.state != BindingState::Active {
            return Err(RouterError::NotActive { topic_id: topic_id.to_string(), state: binding.state });
        }
        let session = binding
            .session
            .take()
            .ok_or_else(|| RouterError::UnknownTopic(topic_id.to_string()))?;
        binding.enter(BindingState::Spawning);
        Ok(session)
    }

    /// Return closed bindings past their grace window, and abandoned spawn
    /// claims, to idle. Returns the number of topics released.
    pub async fn sweep_closed(&self) -> usize {
        let grace = self.config.closed_grace;
        let guard = self.config.spawn_guard;
        let mut bindings = self.bindings.write().await;
        let before = bindings.len();
        bindings.retain(|topic_id, b| {
            let expired = match b.state {
                BindingState::Closed => b.since.elapsed() >= grace,
                BindingState::Spawning => b.session.is_none() && b.since.elapsed() >= guard,
                _ => false,
            };
            if expired {
                debug!(topic_id = %topic_id, state = %b.state, "binding released");
            }
            !expired
        });
        before - bindings.len()
    }

    pub async fn snapshot(&self) -> Vec<BindingSnapshot> {
        let bindings = self.bindings.read().await;
        let mut out: Vec<_> = bindings
            .iter()
            .map(|(topic_id, b)| BindingSnapshot {
                topic_id: topic_id.clone(),
                state: b.state,
                session_id: b.session.as_ref().map(|s| s.id().to_string()),
                engine: b.session.as_ref().map(|s| s.engine().to_string()),
                close_reason: b.close_reason.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.topic_id.cmp(&b.topic_id));
        out
    }

    pub async fn active_count(&self) -> usize {
        self.bindings
            .read()
            .await
            .values()
            .filter(|b| b.state == BindingState::Active)
            .count()
    }
}
