//! Chat sender that POSTs messages to an HTTP webhook.

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::Client;
use serde::Serialize;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::ChatSender;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    topic_id: &'a str,
    text: &'a str,
}

/// Delivers `{topic_id, text}` JSON bodies, optionally rate limited.
pub struct WebhookChatSender {
    client: Client,
    url: String,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl WebhookChatSender {
    pub fn new(url: impl Into<String>, max_sends_per_second: Option<u32>) -> DomainResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DomainError::DeliveryFailed(format!("failed to build HTTP client: {e}")))?;

        let limiter = max_sends_per_second
            .and_then(NonZeroU32::new)
            .map(|rate| RateLimiter::direct(Quota::per_second(rate)));

        Ok(Self {
            client,
            url: url.into(),
            limiter,
        })
    }
}

#[async_trait]
impl ChatSender for WebhookChatSender {
    async fn send(&self, topic_id: &str, text: &str) -> DomainResult<()> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload { topic_id, text })
            .send()
            .await
            .map_err(|e| DomainError::DeliveryFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(topic_id = %topic_id, status = %status, "webhook rejected message");
            return Err(DomainError::DeliveryFailed(format!("webhook returned {status}: {body}")));
        }

        debug!(topic_id = %topic_id, "message delivered to webhook");
        Ok(())
    }
}
