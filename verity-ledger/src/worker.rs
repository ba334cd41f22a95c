//! Background workers
//!
//! Two periodic tasks run alongside the ledger: the anchor worker publishes
//! checkpoints, and the lock sweeper (journaled backend only) rolls back
//! journal entries abandoned by crashed writers. Both shut down through a
//! watch channel.

use crate::{
    anchor::AnchorBuilder,
    journal::{DocumentStore, JournaledStore},
    metrics::Metrics,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to a running background worker
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal shutdown and wait for the worker to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// Spawn the periodic anchor worker
pub fn spawn_anchor_worker(builder: Arc<AnchorBuilder>, interval: Duration) -> WorkerHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = builder.record_anchor().await {
                        tracing::error!(error = %err, "Anchor attempt failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    tracing::debug!("Anchor worker stopping");
                    return;
                }
            }
        }
    });
    WorkerHandle { shutdown, handle }
}

/// Spawn the stale-lock sweeper for a journaled store
pub fn spawn_lock_sweeper<D: DocumentStore + 'static>(
    store: Arc<JournaledStore<D>>,
    interval: Duration,
    staleness: Duration,
    metrics: Arc<Metrics>,
) -> WorkerHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match store.sweep(staleness).await {
                        Ok(0) => {}
                        Ok(count) => {
                            metrics.sweeper_rollbacks.inc_by(count as u64);
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "Lock sweep failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    tracing::debug!("Lock sweeper stopping");
                    return;
                }
            }
        }
    });
    WorkerHandle { shutdown, handle }
}
