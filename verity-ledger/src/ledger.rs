//! Ledger facade
//!
//! [`Ledger::open`] wires the configured storage backend, the permission
//! providers, the validation pipeline, the anchor builder and the background
//! workers into one handle. Everything underneath stays reachable through
//! its own module for embedders that need custom wiring.

use crate::{
    anchor::{
        AnchorBuilder, AnchorRecorder, AnchorState, LedgerAnchor, LogAnchorRecorder,
        MemoryAnchorState, RocksAnchorState,
    },
    config::{Backend, Config},
    crypto::{Ed25519Verifier, SignatureEvidence},
    error::Result,
    journal::{JournaledStore, MemoryStore},
    metrics::Metrics,
    permissions::{
        OwnershipProvider, PermissionBasedValidator, PermissionResolver, PermissionsProvider,
        StaticAclProvider, StoredAclProvider,
    },
    storage::{get_record, RocksStore, StorageEngine},
    stream::transaction_stream,
    types::{ByteString, Record},
    validator::TransactionValidator,
    worker::{spawn_anchor_worker, spawn_lock_sweeper, WorkerHandle},
};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

/// A running ledger instance
pub struct Ledger {
    storage: Arc<dyn StorageEngine>,
    validator: Arc<TransactionValidator>,
    anchors: Arc<AnchorBuilder>,
    metrics: Arc<Metrics>,
    poll_interval: Duration,
    workers: Vec<WorkerHandle>,
}

impl Ledger {
    /// Open a ledger with anchors going to the log
    pub async fn open(config: Config) -> Result<Self> {
        Self::open_with_recorder(config, Arc::new(LogAnchorRecorder)).await
    }

    /// Open a ledger publishing anchors through the given recorder
    pub async fn open_with_recorder(
        config: Config,
        recorder: Arc<dyn AnchorRecorder>,
    ) -> Result<Self> {
        let metrics = Arc::new(Metrics::new()?);

        let (storage, anchor_state, journaled) = match config.backend {
            Backend::Rocks => {
                let store = Arc::new(RocksStore::open(&config)?);
                (
                    store.clone() as Arc<dyn StorageEngine>,
                    Arc::new(RocksAnchorState::new(store)) as Arc<dyn AnchorState>,
                    None,
                )
            }
            Backend::Memory => {
                let store = Arc::new(JournaledStore::new(MemoryStore::new()));
                (
                    store.clone() as Arc<dyn StorageEngine>,
                    Arc::new(MemoryAnchorState::new()) as Arc<dyn AnchorState>,
                    Some(store),
                )
            }
        };

        let providers: Vec<Arc<dyn PermissionsProvider>> = vec![
            Arc::new(StaticAclProvider::new(config.acl_entries()?)),
            Arc::new(OwnershipProvider),
            Arc::new(StoredAclProvider::new(storage.clone())),
        ];
        let policy = Arc::new(PermissionBasedValidator::new(PermissionResolver::new(
            providers,
        )));

        let validator = Arc::new(TransactionValidator::new(
            storage.clone(),
            policy,
            Arc::new(Ed25519Verifier),
            config.namespace_bytes(),
            config.validator.max_key_size,
            metrics.clone(),
        ));

        let anchors = Arc::new(AnchorBuilder::new(
            storage.clone(),
            recorder,
            anchor_state,
            metrics.clone(),
        ));

        let mut workers = Vec::new();
        if config.anchor.enabled {
            workers.push(spawn_anchor_worker(
                anchors.clone(),
                Duration::from_secs(config.anchor.interval_secs),
            ));
        }
        if let Some(store) = journaled {
            workers.push(spawn_lock_sweeper(
                store,
                Duration::from_secs(config.sweeper.interval_secs),
                Duration::from_secs(config.sweeper.staleness_secs),
                metrics.clone(),
            ));
        }

        tracing::info!(
            namespace = %config.namespace,
            backend = ?config.backend,
            "Ledger opened"
        );

        Ok(Self {
            storage,
            validator,
            anchors,
            metrics,
            poll_interval: Duration::from_millis(config.stream.poll_interval_ms),
            workers,
        })
    }

    /// Validate and commit a mutation; returns the transaction hash
    pub async fn post_transaction(
        &self,
        raw_mutation: &ByteString,
        evidence: &[SignatureEvidence],
    ) -> Result<ByteString> {
        self.validator.post_transaction(raw_mutation, evidence).await
    }

    /// Current state of the given record keys
    pub async fn get_records(&self, keys: &[ByteString]) -> Result<Vec<Record>> {
        self.storage.get_records(keys).await
    }

    /// Current state of one record
    pub async fn get_record(&self, key: &ByteString) -> Result<Record> {
        get_record(self.storage.as_ref(), key).await
    }

    /// Hash of the most recently committed transaction
    pub async fn get_last_transaction(&self) -> Result<Option<ByteString>> {
        self.storage.get_last_transaction().await
    }

    /// Ordered transaction feed starting strictly after `from`
    pub fn subscribe(&self, from: Option<ByteString>) -> ReceiverStream<Result<ByteString>> {
        transaction_stream(self.storage.clone(), from, self.poll_interval)
    }

    /// Compute, publish and commit the next anchor now
    pub async fn record_anchor(&self) -> Result<Option<LedgerAnchor>> {
        self.anchors.record_anchor().await
    }

    /// Ledger metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Stop background workers and release the ledger
    pub async fn shutdown(self) {
        for worker in self.workers {
            worker.stop().await;
        }
        tracing::info!("Ledger shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AclEntryConfig;
    use crate::crypto::KeyPair;
    use crate::path::{encode_balance, LedgerPath, RecordKey};
    use crate::permissions::{PermissionSet, StringPattern};
    use crate::types::Mutation;

    fn test_config(signer: &KeyPair) -> Config {
        let mut config = Config::default();
        config.backend = Backend::Memory;
        config.anchor.enabled = false;
        config.acl.push(AclEntryConfig {
            path: "/".to_string(),
            subjects: vec![signer.identity()],
            recursive: true,
            record_name: StringPattern::All,
            permissions: PermissionSet::permit_all(),
        });
        config
    }

    fn account_record(account: &str, balance: i64, version: ByteString) -> Record {
        let key = RecordKey::account(
            LedgerPath::parse(account).unwrap(),
            &LedgerPath::parse("/gold/").unwrap(),
        );
        Record::new(key.to_binary(), Some(encode_balance(balance)), version)
    }

    async fn post(ledger: &Ledger, signer: &KeyPair, records: Vec<Record>) -> Result<ByteString> {
        let raw = Mutation::new(
            ByteString::new(b"main".to_vec()),
            records,
            ByteString::empty(),
        )
        .unwrap()
        .serialize()
        .unwrap();
        let evidence = vec![signer.sign_mutation(&raw)];
        ledger.post_transaction(&raw, &evidence).await
    }

    #[tokio::test]
    async fn test_open_post_read_anchor_shutdown() {
        let signer = KeyPair::generate();
        let ledger = Ledger::open(test_config(&signer)).await.unwrap();

        post(
            &ledger,
            &signer,
            vec![
                account_record("/issuer/", -150, ByteString::empty()),
                account_record("/x/", 150, ByteString::empty()),
            ],
        )
        .await
        .unwrap();

        let x_key = RecordKey::account(
            LedgerPath::parse("/x/").unwrap(),
            &LedgerPath::parse("/gold/").unwrap(),
        )
        .to_binary();
        let record = ledger.get_record(&x_key).await.unwrap();
        assert_eq!(record.value, Some(encode_balance(150)));

        let anchor = ledger.record_anchor().await.unwrap().unwrap();
        assert_eq!(anchor.transaction_count, 1);
        assert!(ledger.record_anchor().await.unwrap().is_none());

        assert!(ledger.get_last_transaction().await.unwrap().is_some());
        assert_eq!(ledger.metrics().transactions_committed.get(), 1);

        ledger.shutdown().await;
    }

    #[tokio::test]
    async fn test_subscription_follows_commits() {
        use tokio_stream::StreamExt;

        let signer = KeyPair::generate();
        let mut config = test_config(&signer);
        config.stream.poll_interval_ms = 10;
        let ledger = Ledger::open(config).await.unwrap();

        let mut stream = ledger.subscribe(None);
        post(
            &ledger,
            &signer,
            vec![
                account_record("/issuer/", -10, ByteString::empty()),
                account_record("/x/", 10, ByteString::empty()),
            ],
        )
        .await
        .unwrap();

        let raw = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            Some(crate::crypto::hash(&raw)),
            ledger.get_last_transaction().await.unwrap()
        );

        ledger.shutdown().await;
    }
}
