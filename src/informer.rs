use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How often the default `Informer::synced` rechecks `has_synced`.
pub const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Watch-based local cache of some resource collection.
///
/// The registry never looks inside an informer: it only runs it and
/// asks whether the initial list was received.
#[async_trait]
pub trait Informer: Send + Sync + 'static {
    /// Watches the collection and keeps the cache up to date.
    /// Must return soon after `cancel` fires.
    async fn run(&self, cancel: CancellationToken);

    /// True once the cache has received the initial state.
    fn has_synced(&self) -> bool;

    /// Resolves once `has_synced` returns true.
    async fn synced(&self) {
        while !self.has_synced() {
            tokio::time::sleep(SYNC_POLL_INTERVAL).await;
        }
    }
}
