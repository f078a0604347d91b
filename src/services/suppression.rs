//! Duplicate automated reply suppression.
//!
//! The chat host generates its own reply to every inbound message and only the
//! final send can be intercepted. `ChatterSuppressor::suppress_next` arms a
//! single-use entry for a conversation key; [`SuppressingChatSender`] consumes
//! it atomically right before transmitting and drops that one message.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::domain::errors::DomainResult;
use crate::domain::ports::{ChatSender, SuppressionStore};

/// Process-local suppression registry.
#[derive(Default)]
pub struct InMemorySuppressionStore {
    entries: Mutex<HashMap<String, Instant>>,
}

impl InMemorySuppressionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SuppressionStore for InMemorySuppressionStore {
    async fn insert(&self, key: &str, ttl: Duration) {
        // Re-arming replaces the expiry; a key never has two live entries.
        self.entries.lock().await.insert(key.to_string(), Instant::now() + ttl);
    }

    async fn consume_if_present(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.remove(key) {
            Some(expires_at) => expires_at > Instant::now(),
            None => false,
        }
    }

    async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        before - entries.len()
    }

    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Front end over a [`SuppressionStore`], shared by every send path.
#[derive(Clone)]
pub struct ChatterSuppressor {
    store: Arc<dyn SuppressionStore>,
    default_ttl: Duration,
}

impl ChatterSuppressor {
    pub fn new(store: Arc<dyn SuppressionStore>, default_ttl: Duration) -> Self {
        Self { store, default_ttl }
    }

    /// In-memory registry with the given default TTL.
    pub fn in_memory(default_ttl: Duration) -> Self {
        Self::new(Arc::new(InMemorySuppressionStore::new()), default_ttl)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Drop the next send on `key` if it happens within `ttl`.
    pub async fn suppress_next(&self, key: &str, ttl: Duration) {
        self.store.insert(key, ttl).await;
        debug!(key = %key, ttl_secs = ttl.as_secs(), "next reply suppressed");
    }

    /// Atomically check and consume the entry for `key`.
    pub async fn consume_if_present(&self, key: &str) -> bool {
        self.store.consume_if_present(key).await
    }

    pub async fn evict_expired(&self) -> usize {
        self.store.evict_expired().await
    }

    pub async fn pending(&self) -> usize {
        self.store.len().await
    }

    /// Evict expired entries periodically until shutdown.
    pub fn start_evictor(&self, interval: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let suppressor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = suppressor.evict_expired().await;
                        if evicted > 0 {
                            debug!(evicted, "expired suppression entries evicted");
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("suppression evictor shutting down");
                        break;
                    }
                }
            }
        })
    }
}

/// Chat sender decorator that honours suppression entries.
pub struct SuppressingChatSender {
    inner: Arc<dyn ChatSender>,
    suppressor: ChatterSuppressor,
}

impl SuppressingChatSender {
    pub fn new(inner: Arc<dyn ChatSender>, suppressor: ChatterSuppressor) -> Self {
        Self { inner, suppressor }
    }

    /// The undecorated sender. Session output is delivered through it, so an
    /// armed entry can only be consumed by the host's own reply.
    pub fn passthrough(&self) -> Arc<dyn ChatSender> {
        Arc::clone(&self.inner)
    }
}

#[async_trait]
impl ChatSender for SuppressingChatSender {
    async fn send(&self, topic_id: &str, text: &str) -> DomainResult<()> {
        if self.suppressor.consume_if_present(topic_id).await {
            info!(topic_id = %topic_id, chars = text.chars().count(), "suppressed duplicate automated reply");
            return Ok(());
        }
        self.inner.send(topic_id, text).await
    }
}
