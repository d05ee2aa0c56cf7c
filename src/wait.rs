//! Waiting for informer caches to sync

use crate::{informer::Informer, key::InformerKey};
use futures::stream::{FuturesUnordered, StreamExt};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;

/// Waits until all given informers report sync or `cancel` fires.
///
/// Returns true if every informer has synced. When cancellation wins,
/// informers are checked once more, so an already-cancelled token
/// still yields true for caches which are ready.
///
/// Pending caches are logged every `log_interval`; zero disables it.
#[tracing::instrument(skip(informers, cancel, log_interval), fields(count = informers.len()))]
pub async fn wait_for_sync(
    informers: Vec<(InformerKey, Arc<dyn Informer>)>,
    cancel: &CancellationToken,
    log_interval: Duration,
) -> bool {
    if informers.is_empty() {
        return true;
    }
    let begin = Instant::now();
    let mut pending = informers
        .iter()
        .map(|(key, _)| key.clone())
        .collect::<HashSet<_>>();
    let mut syncs = informers
        .iter()
        .map(|(key, informer)| {
            let key = key.clone();
            let informer = informer.clone();
            async move {
                informer.synced().await;
                key
            }
        })
        .collect::<FuturesUnordered<_>>();
    let mut progress = if log_interval.is_zero() {
        None
    } else {
        Some(tokio::time::interval_at(begin + log_interval, log_interval))
    };

    loop {
        tokio::select! {
            biased;
            done = syncs.next() => match done {
                Some(key) => {
                    tracing::debug!(key = %key, elapsed = ?begin.elapsed(), "Cache synced");
                    pending.remove(&key);
                }
                None => {
                    tracing::info!(elapsed = ?begin.elapsed(), "All caches synced");
                    return true;
                }
            },
            _ = cancel.cancelled() => break,
            _ = tick(&mut progress) => {
                let pending = pending.iter().map(ToString::to_string).collect::<Vec<_>>();
                tracing::info!(pending = ?pending, elapsed = ?begin.elapsed(), "Still waiting for caches to sync");
            }
        }
    }

    let unsynced = informers
        .iter()
        .filter(|(_, informer)| !informer.has_synced())
        .map(|(key, _)| key.to_string())
        .collect::<Vec<_>>();
    if !unsynced.is_empty() {
        tracing::warn!(unsynced = ?unsynced, "Cancelled before caches synced");
        return false;
    }
    true
}

async fn tick(progress: &mut Option<Interval>) {
    match progress {
        Some(interval) => {
            interval.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}
