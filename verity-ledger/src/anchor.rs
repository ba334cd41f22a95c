//! Hash-chain anchors
//!
//! An anchor is a checkpoint proving the entire transaction log up to a
//! position: `full_ledger_hash` folds every transaction hash into a running
//! double-SHA-256 chain, so re-deriving it from the log detects any
//! tampering. Anchors are computed incrementally from the last committed
//! anchor and published through a pluggable [`AnchorRecorder`]; local state
//! is only advanced after the recorder confirms, which makes anchoring
//! resumable after a crash or a recorder outage.

use crate::{
    crypto::{self, double_hash},
    error::Result,
    metrics::Metrics,
    storage::{RocksStore, StorageEngine},
    types::ByteString,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A ledger checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAnchor {
    /// Hash of the last transaction the anchor covers
    pub position: ByteString,
    /// Cumulative double-SHA-256 over every transaction hash so far
    pub full_ledger_hash: ByteString,
    /// Number of transactions covered
    pub transaction_count: u64,
}

/// Destination for published anchors (external timestamping service,
/// another ledger, a log)
#[async_trait]
pub trait AnchorRecorder: Send + Sync {
    /// Publish one anchor; must not return `Ok` unless it is durable
    async fn record_anchor(&self, anchor: &LedgerAnchor) -> Result<()>;
}

/// Durable cursor of the last successfully recorded anchor
#[async_trait]
pub trait AnchorState: Send + Sync {
    /// The last committed anchor, if any
    async fn get_last_anchor(&self) -> Result<Option<LedgerAnchor>>;

    /// Commit a recorded anchor as the new cursor
    async fn commit_anchor(&self, anchor: &LedgerAnchor) -> Result<()>;
}

/// Recorder that only logs anchors, for deployments without an external sink
pub struct LogAnchorRecorder;

#[async_trait]
impl AnchorRecorder for LogAnchorRecorder {
    async fn record_anchor(&self, anchor: &LedgerAnchor) -> Result<()> {
        tracing::info!(
            position = %anchor.position,
            ledger_hash = %anchor.full_ledger_hash,
            transactions = anchor.transaction_count,
            "Anchor recorded"
        );
        Ok(())
    }
}

/// In-memory anchor state
#[derive(Default)]
pub struct MemoryAnchorState {
    last: Mutex<Option<LedgerAnchor>>,
}

impl MemoryAnchorState {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnchorState for MemoryAnchorState {
    async fn get_last_anchor(&self) -> Result<Option<LedgerAnchor>> {
        Ok(self.last.lock().clone())
    }

    async fn commit_anchor(&self, anchor: &LedgerAnchor) -> Result<()> {
        *self.last.lock() = Some(anchor.clone());
        Ok(())
    }
}

/// Anchor state persisted in the RocksDB anchors column family
pub struct RocksAnchorState {
    store: Arc<RocksStore>,
}

impl RocksAnchorState {
    /// Create over an open store
    pub fn new(store: Arc<RocksStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AnchorState for RocksAnchorState {
    async fn get_last_anchor(&self) -> Result<Option<LedgerAnchor>> {
        match self.store.last_anchor_bytes()? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn commit_anchor(&self, anchor: &LedgerAnchor) -> Result<()> {
        self.store
            .put_anchor_bytes(anchor.transaction_count, &bincode::serialize(anchor)?)
    }
}

/// Computes and publishes anchors over the transaction log
pub struct AnchorBuilder {
    storage: Arc<dyn StorageEngine>,
    recorder: Arc<dyn AnchorRecorder>,
    state: Arc<dyn AnchorState>,
    metrics: Arc<Metrics>,
}

impl AnchorBuilder {
    /// Create a builder
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        recorder: Arc<dyn AnchorRecorder>,
        state: Arc<dyn AnchorState>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            storage,
            recorder,
            state,
            metrics,
        }
    }

    /// Fold transactions since the last anchor into the next one
    ///
    /// Returns `None` when no new transactions exist. The chain starts from
    /// 32 zero bytes; each step is
    /// `cumulative = sha256d(cumulative || transaction_hash)`.
    pub async fn compute_next_anchor(&self) -> Result<Option<LedgerAnchor>> {
        let last = self.state.get_last_anchor().await?;
        let (cursor, mut cumulative, mut count) = match &last {
            Some(anchor) => (
                Some(anchor.position.clone()),
                anchor.full_ledger_hash.clone(),
                anchor.transaction_count,
            ),
            None => (None, ByteString::from([0u8; 32]), 0),
        };

        let transactions = self.storage.get_transactions(cursor.as_ref()).await?;
        if transactions.is_empty() {
            return Ok(None);
        }

        let mut position = ByteString::empty();
        for raw in &transactions {
            let transaction_hash = crypto::hash(raw);
            cumulative =
                ByteString::from(double_hash(cumulative.concat(&transaction_hash).as_slice()));
            count += 1;
            position = transaction_hash;
        }

        Ok(Some(LedgerAnchor {
            position,
            full_ledger_hash: cumulative,
            transaction_count: count,
        }))
    }

    /// Compute, publish and commit the next anchor
    ///
    /// State advances only after the recorder confirmed, so a recorder
    /// failure leaves the same transactions covered by the next attempt.
    pub async fn record_anchor(&self) -> Result<Option<LedgerAnchor>> {
        let Some(anchor) = self.compute_next_anchor().await? else {
            return Ok(None);
        };
        self.recorder.record_anchor(&anchor).await?;
        self.state.commit_anchor(&anchor).await?;
        self.metrics.anchors_recorded.inc();
        Ok(Some(anchor))
    }
}
