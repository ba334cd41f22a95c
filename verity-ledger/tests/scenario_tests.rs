//! End-to-end scenarios through the public [`Ledger`] facade.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use verity_ledger::anchor::{AnchorRecorder, LedgerAnchor};
use verity_ledger::config::AclEntryConfig;
use verity_ledger::crypto;
use verity_ledger::path::{decode_balance, encode_balance};
use verity_ledger::permissions::{PermissionSet, StringPattern};
use verity_ledger::{
    Backend, ByteString, Config, Error, KeyPair, Ledger, LedgerPath, Mutation, Record, RecordKey,
    Result, ValidationReason,
};

fn test_config(signer: &KeyPair) -> Config {
    let mut config = Config::default();
    config.backend = Backend::Memory;
    config.anchor.enabled = false;
    config.stream.poll_interval_ms = 10;
    config.acl.push(AclEntryConfig {
        path: "/".to_string(),
        subjects: vec![signer.identity()],
        recursive: true,
        record_name: StringPattern::All,
        permissions: PermissionSet::permit_all(),
    });
    config
}

fn gold() -> LedgerPath {
    LedgerPath::parse("/gold/").unwrap()
}

fn account_key(account: &str) -> ByteString {
    RecordKey::account(LedgerPath::parse(account).unwrap(), &gold()).to_binary()
}

fn account_record(account: &str, balance: i64, version: ByteString) -> Record {
    Record::new(account_key(account), Some(encode_balance(balance)), version)
}

fn encode_mutation(records: Vec<Record>) -> ByteString {
    Mutation::new(ByteString::new(b"main".to_vec()), records, ByteString::empty())
        .unwrap()
        .serialize()
        .unwrap()
}

async fn post(ledger: &Ledger, signer: &KeyPair, records: Vec<Record>) -> Result<ByteString> {
    let raw = encode_mutation(records);
    let evidence = vec![signer.sign_mutation(&raw)];
    ledger.post_transaction(&raw, &evidence).await
}

async fn balance_of(ledger: &Ledger, account: &str) -> i64 {
    let record = ledger.get_record(&account_key(account)).await.unwrap();
    decode_balance(&record.value.unwrap()).unwrap()
}

#[tokio::test]
async fn transfer_between_accounts() {
    let signer = KeyPair::generate();
    let ledger = Ledger::open(test_config(&signer)).await.unwrap();

    // Issue 150 units of /gold/ to /x/.
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

    let x_version = ledger.get_record(&account_key("/x/")).await.unwrap().version;

    // Transfer 100 from /x/ to /y/.
    let hash = post(
        &ledger,
        &signer,
        vec![
            account_record("/x/", 50, x_version),
            account_record("/y/", 100, ByteString::empty()),
        ],
    )
    .await
    .unwrap();
    assert_eq!(hash.len(), 32);

    assert_eq!(balance_of(&ledger, "/x/").await, 50);
    assert_eq!(balance_of(&ledger, "/y/").await, 100);
    assert_eq!(balance_of(&ledger, "/issuer/").await, -150);

    ledger.shutdown().await;
}

#[tokio::test]
async fn stale_transfer_is_rejected_and_changes_nothing() {
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
    let x_version = ledger.get_record(&account_key("/x/")).await.unwrap().version;

    let transfer = vec![
        account_record("/x/", 50, x_version),
        account_record("/y/", 100, ByteString::empty()),
    ];
    post(&ledger, &signer, transfer.clone()).await.unwrap();

    // Resubmitting the same transfer reuses stale versions.
    let err = post(&ledger, &signer, transfer).await.unwrap_err();
    assert_eq!(
        err.reason(),
        Some(&ValidationReason::OptimisticConcurrency)
    );

    // First transfer stands; nothing was double-applied.
    assert_eq!(balance_of(&ledger, "/x/").await, 50);
    assert_eq!(balance_of(&ledger, "/y/").await, 100);

    ledger.shutdown().await;
}

#[tokio::test]
async fn unbalanced_transfer_is_rejected_and_changes_nothing() {
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
    let x_version = ledger.get_record(&account_key("/x/")).await.unwrap().version;

    // Debit 100 but credit only 90.
    let err = post(
        &ledger,
        &signer,
        vec![
            account_record("/x/", 50, x_version),
            account_record("/y/", 90, ByteString::empty()),
        ],
    )
    .await
    .unwrap_err();
    assert_eq!(
        err.reason(),
        Some(&ValidationReason::UnbalancedTransaction)
    );

    assert_eq!(balance_of(&ledger, "/x/").await, 150);
    let y = ledger.get_record(&account_key("/y/")).await.unwrap();
    assert!(y.version.is_empty());

    ledger.shutdown().await;
}

#[tokio::test]
async fn unauthorized_signer_cannot_move_funds() {
    let signer = KeyPair::generate();
    let intruder = KeyPair::generate();
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
    let x_version = ledger.get_record(&account_key("/x/")).await.unwrap().version;

    // Valid signature, but the intruder holds no grants anywhere.
    let err = post(
        &ledger,
        &intruder,
        vec![
            account_record("/x/", 50, x_version),
            account_record("/y/", 100, ByteString::empty()),
        ],
    )
    .await
    .unwrap_err();
    assert_eq!(
        err.reason(),
        Some(&ValidationReason::AccountModificationUnauthorized)
    );
    assert_eq!(balance_of(&ledger, "/x/").await, 150);

    ledger.shutdown().await;
}

#[derive(Default)]
struct CapturingRecorder {
    anchors: Mutex<Vec<LedgerAnchor>>,
}

#[async_trait]
impl AnchorRecorder for CapturingRecorder {
    async fn record_anchor(&self, anchor: &LedgerAnchor) -> Result<()> {
        self.anchors.lock().push(anchor.clone());
        Ok(())
    }
}

#[tokio::test]
async fn anchors_cover_the_whole_log_incrementally() {
    let signer = KeyPair::generate();
    let recorder = Arc::new(CapturingRecorder::default());
    let ledger = Ledger::open_with_recorder(test_config(&signer), recorder.clone())
        .await
        .unwrap();

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
    let first = ledger.record_anchor().await.unwrap().unwrap();
    assert_eq!(first.transaction_count, 1);

    let x_version = ledger.get_record(&account_key("/x/")).await.unwrap().version;
    post(
        &ledger,
        &signer,
        vec![
            account_record("/x/", 50, x_version),
            account_record("/y/", 100, ByteString::empty()),
        ],
    )
    .await
    .unwrap();
    let second = ledger.record_anchor().await.unwrap().unwrap();
    assert_eq!(second.transaction_count, 2);
    assert_ne!(first.full_ledger_hash, second.full_ledger_hash);
    assert_eq!(
        Some(second.position.clone()),
        ledger.get_last_transaction().await.unwrap()
    );

    // Caught up.
    assert!(ledger.record_anchor().await.unwrap().is_none());
    assert_eq!(recorder.anchors.lock().len(), 2);

    ledger.shutdown().await;
}

#[tokio::test]
async fn subscription_streams_transactions_in_order() {
    let signer = KeyPair::generate();
    let ledger = Ledger::open(test_config(&signer)).await.unwrap();

    let first_hash = post(
        &ledger,
        &signer,
        vec![
            account_record("/issuer/", -150, ByteString::empty()),
            account_record("/x/", 150, ByteString::empty()),
        ],
    )
    .await
    .unwrap();

    let mut stream = ledger.subscribe(None);
    let raw = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(crypto::hash(&raw), first_hash);

    // A commit after subscribing arrives next, in order.
    let x_version = ledger.get_record(&account_key("/x/")).await.unwrap().version;
    let second_hash = post(
        &ledger,
        &signer,
        vec![
            account_record("/x/", 50, x_version),
            account_record("/y/", 100, ByteString::empty()),
        ],
    )
    .await
    .unwrap();
    let raw = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(crypto::hash(&raw), second_hash);

    ledger.shutdown().await;
}

#[tokio::test]
async fn rejected_signature_never_reaches_storage() {
    let signer = KeyPair::generate();
    let ledger = Ledger::open(test_config(&signer)).await.unwrap();

    let raw = encode_mutation(vec![account_record("/x/", 0, ByteString::empty())]);
    let mut evidence = vec![signer.sign_mutation(&raw)];
    evidence[0].signature = ByteString::new(vec![0u8; 64]);

    let err = ledger.post_transaction(&raw, &evidence).await.unwrap_err();
    assert!(matches!(err, Error::TransactionInvalid { .. }));
    assert_eq!(err.reason(), Some(&ValidationReason::InvalidSignature));
    assert!(ledger.get_last_transaction().await.unwrap().is_none());

    ledger.shutdown().await;
}
