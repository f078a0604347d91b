//! Inbound chat reply dispatch.

use std::time::Duration;
use tracing::{debug, info};

use crate::services::session::ReplyDelivery;
use crate::services::suppression::ChatterSuppressor;
use crate::services::topic_router::{RouterError, TopicRouter};

/// Routes human replies to sessions and arms suppression of the host's own
/// automatic reply to the same message.
#[derive(Clone)]
pub struct InboundDispatcher {
    router: TopicRouter,
    suppressor: ChatterSuppressor,
    ttl: Duration,
}

impl InboundDispatcher {
    pub fn new(router: TopicRouter, suppressor: ChatterSuppressor) -> Self {
        let ttl = suppressor.default_ttl();
        Self { router, suppressor, ttl }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Deliver `text` to the session bound to `topic_id`.
    ///
    /// Suppression is armed only when the reply reached a session; a rejected
    /// reply leaves the host free to answer it.
    pub async fn dispatch(&self, topic_id: &str, text: &str) -> Result<ReplyDelivery, RouterError> {
        match self.router.route_inbound(topic_id, text).await {
            Ok(delivery) => {
                self.suppressor.suppress_next(topic_id, self.ttl).await;
                info!(topic_id = %topic_id, delivery = ?delivery, "inbound reply routed");
                Ok(delivery)
            }
            Err(e) => {
                debug!(topic_id = %topic_id, error = %e, "inbound reply not routed");
                Err(e)
            }
        }
    }
}
