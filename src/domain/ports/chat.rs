use async_trait::async_trait;

use crate::domain::errors::DomainResult;

/// Outbound delivery to the chat surface.
///
/// Implementations transmit `text` as-is; chunking to the platform's
/// maximum message size happens before this call.
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send(&self, topic_id: &str, text: &str) -> DomainResult<()>;
}
