//! In-memory chat sender used by tests and dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::ChatSender;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMessage {
    pub topic_id: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// Captures every message it is asked to send.
#[derive(Clone, Default)]
pub struct RecordingChatSender {
    messages: Arc<RwLock<Vec<RecordedMessage>>>,
    fail_sends: Arc<std::sync::atomic::AtomicBool>,
}

impl RecordingChatSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail with a delivery error.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn messages(&self) -> Vec<RecordedMessage> {
        self.messages.read().await.clone()
    }

    /// Texts sent to one topic, in order.
    pub async fn texts_for(&self, topic_id: &str) -> Vec<String> {
        self.messages
            .read()
            .await
            .iter()
            .filter(|m| m.topic_id == topic_id)
            .map(|m| m.text.clone())
            .collect()
    }

    pub async fn clear(&self) {
        self.messages.write().await.clear();
    }
}

#[async_trait]
impl ChatSender for RecordingChatSender {
    async fn send(&self, topic_id: &str, text: &str) -> DomainResult<()> {
        if self.fail_sends.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DomainError::DeliveryFailed(format!("recording sender refused topic {topic_id}")));
        }
        self.messages.write().await.push(RecordedMessage {
            topic_id: topic_id.to_string(),
            text: text.to_string(),
            sent_at: Utc::now(),
        });
        Ok(())
    }
}
