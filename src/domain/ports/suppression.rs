use async_trait::async_trait;
use std::time::Duration;

/// Storage for single-use suppression entries keyed by conversation.
///
/// A key has at most one live entry. Implementations may be process-local
/// or replicated; either way `consume_if_present` must be an atomic
/// check-and-delete.
#[async_trait]
pub trait SuppressionStore: Send + Sync {
    /// Insert or replace the entry for `key`, expiring after `ttl`.
    async fn insert(&self, key: &str, ttl: Duration);

    /// Remove the entry for `key` and return whether it was unexpired.
    async fn consume_if_present(&self, key: &str) -> bool;

    /// Drop expired entries, returning how many were removed.
    async fn evict_expired(&self) -> usize;

    /// Number of live entries.
    async fn len(&self) -> usize;
}
