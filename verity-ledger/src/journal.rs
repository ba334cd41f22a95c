//! Lock/journal commit protocol for backends without multi-document transactions
//!
//! A [`DocumentStore`] only guarantees per-document atomic compare-and-swap.
//! [`JournaledStore`] layers the full [`StorageEngine`] contract on top with
//! a write-ahead journal holding one entry per commit batch:
//!
//! ```text
//! Pending ──finalize──► Committed ──publish+release──► (journal entry deleted)
//!    │
//!    └──rollback/sweep──► pre-images restored, inserts deleted, entry deleted
//! ```
//!
//! The whole batch is validated against a read overlay before anything is
//! touched, so later transactions in a batch observe earlier ones. The
//! pre-images of every record about to change, the keys about to be created
//! and the encoded transactions themselves are then journaled under a unique
//! lock token. Locks are acquired by conditionally stamping each existing
//! target record with that token; every subsequent write is guarded by
//! "current lock token == mine". Log entries are published only once the
//! entry reaches `Committed`, so readers and the anchor builder never observe
//! a transaction that may still be rolled back. Rollback is idempotent and
//! re-entrant: it may run twice for the same batch (failing caller plus
//! sweeper) without corrupting state.

use crate::{
    crypto,
    error::{Error, Result},
    types::{ByteString, Mutation, Record, Transaction},
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::storage::StorageEngine;

/// Advisory lock stamped onto a record while a commit is in flight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLock {
    /// Unique token owned by one commit attempt
    pub token: ByteString,
    /// Acquisition time (milliseconds since Unix epoch)
    pub locked_at: i64,
}

/// One document in the backing store: record state plus an optional lock
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDocument {
    /// Current value
    pub value: ByteString,
    /// Hash of the mutation that last wrote the record
    pub version: ByteString,
    /// In-flight commit lock, if any
    pub lock: Option<RecordLock>,
}

impl RecordDocument {
    fn lock_token(&self) -> Option<&ByteString> {
        self.lock.as_ref().map(|l| &l.token)
    }
}

/// Saved state of a record before a pending batch touched it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreImage {
    /// Record key
    pub key: ByteString,
    /// Value before the batch
    pub value: ByteString,
    /// Version before the batch
    pub version: ByteString,
}

/// Commit state of a journal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalState {
    /// Records may be partially mutated; recovery must undo
    Pending,
    /// All record mutations applied; recovery must publish the log entries
    /// and finish releasing locks
    Committed,
}

/// Write-ahead journal entry for one pending commit batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Token stamped on every record the batch locks; also the journal key
    pub lock_token: ByteString,
    /// Lock timestamp, drives staleness sweeping
    pub locked_at: i64,
    /// Pre-images of every existing record about to change
    pub pre_images: Vec<PreImage>,
    /// Keys about to be newly created
    pub created_keys: Vec<ByteString>,
    /// Reserved log position and encoded transaction, in commit order;
    /// written to the log at finalization
    pub log_entries: Vec<(u64, ByteString)>,
    /// State machine position
    pub state: JournalState,
}

/// Minimal per-document-atomic backend
///
/// Every method is individually atomic; nothing spans documents. That is the
/// whole premise the journaled engine exists to compensate for.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one document
    async fn get_document(&self, key: &ByteString) -> Result<Option<RecordDocument>>;

    /// Insert a document iff the key does not exist; `false` on collision
    async fn insert_document(&self, key: &ByteString, document: RecordDocument) -> Result<bool>;

    /// Replace a document iff its version and lock token match expectations
    ///
    /// `expected_lock == None` requires the document to be unlocked.
    async fn replace_document(
        &self,
        key: &ByteString,
        expected_version: &ByteString,
        expected_lock: Option<&ByteString>,
        document: RecordDocument,
    ) -> Result<bool>;

    /// Delete a document iff it is locked with the given token
    async fn delete_document(&self, key: &ByteString, lock_token: &ByteString) -> Result<bool>;

    /// Upsert a journal entry keyed by its lock token
    async fn put_journal_entry(&self, entry: &JournalEntry) -> Result<()>;

    /// Fetch a journal entry
    async fn get_journal_entry(&self, lock_token: &ByteString) -> Result<Option<JournalEntry>>;

    /// Delete a journal entry; succeeds when already gone
    async fn delete_journal_entry(&self, lock_token: &ByteString) -> Result<()>;

    /// Journal entries locked at or before `cutoff`
    async fn stale_journal_entries(&self, cutoff: i64) -> Result<Vec<JournalEntry>>;

    /// Reserve the next monotone log position
    async fn reserve_log_position(&self) -> Result<u64>;

    /// Write a log entry at a reserved position; idempotent
    async fn put_log_entry(&self, position: u64, raw: &ByteString) -> Result<()>;

    /// Log entries strictly after `position`, in order
    async fn log_entries_after(&self, position: Option<u64>) -> Result<Vec<(u64, ByteString)>>;

    /// Highest log entry, if any
    async fn last_log_entry(&self) -> Result<Option<(u64, ByteString)>>;

    /// Position of a transaction hash in the log
    async fn log_position_of(&self, transaction_hash: &ByteString) -> Result<Option<u64>>;
}

/// Storage engine emulating atomic multi-record commits over a [`DocumentStore`]
pub struct JournaledStore<D> {
    store: D,
}

impl<D: DocumentStore> JournaledStore<D> {
    /// Wrap a document store
    pub fn new(store: D) -> Self {
        Self { store }
    }

    /// The underlying document store
    pub fn document_store(&self) -> &D {
        &self.store
    }

    /// Validate, journal and apply one batch through the lock protocol
    ///
    /// On success every record mutation is applied but still locked and
    /// journaled, and nothing is in the log yet; the caller finalizes, or
    /// the batch is eventually swept back.
    async fn apply_batch(&self, transactions: &[ByteString]) -> Result<JournalEntry> {
        let lock_token = ByteString::new(Uuid::new_v4().as_bytes().to_vec());
        let locked_at = Utc::now().timestamp_millis();

        // Validate the whole batch against a read overlay before touching
        // anything; later transactions in the batch observe earlier ones.
        let mut originals: HashMap<ByteString, Option<RecordDocument>> = HashMap::new();
        let mut batch_versions: HashMap<ByteString, ByteString> = HashMap::new();
        let mut written: HashSet<ByteString> = HashSet::new();
        let mut pre_images = Vec::new();
        let mut created_keys = Vec::new();
        let mut writes: Vec<(Record, ByteString)> = Vec::new();

        for raw in transactions {
            let transaction = Transaction::deserialize(raw)?;
            let mutation = Mutation::deserialize(&transaction.mutation)?;
            let mutation_hash = crypto::hash(&transaction.mutation);

            for record in &mutation.records {
                if !originals.contains_key(&record.key) {
                    let document = self.store.get_document(&record.key).await?;
                    if let Some(doc) = &document {
                        // A live lock means another commit is in flight.
                        if doc.lock.is_some() {
                            return Err(Error::ConcurrentMutation(Box::new(record.clone())));
                        }
                    }
                    originals.insert(record.key.clone(), document);
                }
                let original = &originals[&record.key];
                let current = batch_versions.get(&record.key).cloned().unwrap_or_else(|| {
                    original
                        .as_ref()
                        .map(|doc| doc.version.clone())
                        .unwrap_or_default()
                });
                if current != record.version {
                    return Err(Error::ConcurrentMutation(Box::new(record.clone())));
                }

                if record.value.is_some() {
                    if written.insert(record.key.clone()) {
                        match original {
                            Some(doc) => pre_images.push(PreImage {
                                key: record.key.clone(),
                                value: doc.value.clone(),
                                version: doc.version.clone(),
                            }),
                            None => created_keys.push(record.key.clone()),
                        }
                    }
                    batch_versions.insert(record.key.clone(), mutation_hash.clone());
                    writes.push((record.clone(), mutation_hash.clone()));
                }
            }
        }

        let mut entry = JournalEntry {
            lock_token: lock_token.clone(),
            locked_at,
            pre_images,
            created_keys,
            log_entries: Vec::new(),
            state: JournalState::Pending,
        };
        self.store.put_journal_entry(&entry).await?;

        // Acquire per-record locks on every existing target.
        for pre in &entry.pre_images {
            let locked = RecordDocument {
                value: pre.value.clone(),
                version: pre.version.clone(),
                lock: Some(RecordLock {
                    token: lock_token.clone(),
                    locked_at,
                }),
            };
            if !self
                .store
                .replace_document(&pre.key, &pre.version, None, locked)
                .await?
            {
                return self.abort_batch(&lock_token, record_for(&writes, &pre.key)).await;
            }
        }

        // Apply the writes, each guarded by our lock token.
        for (record, version) in &writes {
            let Some(value) = &record.value else {
                continue;
            };
            let updated = RecordDocument {
                value: value.clone(),
                version: version.clone(),
                lock: Some(RecordLock {
                    token: lock_token.clone(),
                    locked_at,
                }),
            };
            let ok = match self.store.get_document(&record.key).await? {
                Some(doc) => {
                    self.store
                        .replace_document(&record.key, &doc.version, Some(&lock_token), updated)
                        .await?
                }
                None => self.store.insert_document(&record.key, updated).await?,
            };
            if !ok {
                return self.abort_batch(&lock_token, record.clone()).await;
            }
        }

        // Reserve and journal the log slots; the log itself is only written
        // at finalization, so nothing pending is ever visible to readers.
        for raw in transactions {
            let position = self.store.reserve_log_position().await?;
            entry.log_entries.push((position, raw.clone()));
        }
        self.store.put_journal_entry(&entry).await?;

        tracing::debug!(
            batch = %lock_token,
            transactions = transactions.len(),
            "Batch applied, pending finalize"
        );
        Ok(entry)
    }

    async fn abort_batch(
        &self,
        lock_token: &ByteString,
        record: Record,
    ) -> Result<JournalEntry> {
        if let Err(err) = self.rollback(lock_token).await {
            tracing::error!(
                batch = %lock_token,
                error = %err,
                "Batch rollback failed; sweeper will retry"
            );
        }
        Err(Error::ConcurrentMutation(Box::new(record)))
    }

    /// Publish the batch's log entries, release locks and retire the entry
    async fn finalize(&self, lock_token: &ByteString) -> Result<()> {
        let Some(mut entry) = self.store.get_journal_entry(lock_token).await? else {
            return Ok(());
        };

        // Flip the state first: a crash after this point must complete the
        // publication and release, never undo applied record mutations.
        entry.state = JournalState::Committed;
        self.store.put_journal_entry(&entry).await?;

        self.complete(&entry).await
    }

    /// Write the log entries of a committed batch and release its locks
    async fn complete(&self, entry: &JournalEntry) -> Result<()> {
        for (position, raw) in &entry.log_entries {
            self.store.put_log_entry(*position, raw).await?;
        }
        self.release_locks(entry).await?;
        self.store.delete_journal_entry(&entry.lock_token).await
    }

    async fn release_locks(&self, entry: &JournalEntry) -> Result<()> {
        let keys = entry
            .pre_images
            .iter()
            .map(|p| &p.key)
            .chain(entry.created_keys.iter());
        for key in keys {
            if let Some(doc) = self.store.get_document(key).await? {
                if doc.lock_token() == Some(&entry.lock_token) {
                    let unlocked = RecordDocument {
                        value: doc.value.clone(),
                        version: doc.version.clone(),
                        lock: None,
                    };
                    self.store
                        .replace_document(key, &doc.version, Some(&entry.lock_token), unlocked)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Undo a pending batch, or finish publishing a committed one
    ///
    /// Idempotent and safely re-entrant: a missing journal entry is a no-op,
    /// and every restore is conditional on the batch's lock token, so
    /// concurrent invocations (failing caller plus sweeper) cannot
    /// double-apply.
    pub async fn rollback(&self, lock_token: &ByteString) -> Result<()> {
        let Some(entry) = self.store.get_journal_entry(lock_token).await? else {
            return Ok(());
        };

        if entry.state == JournalState::Committed {
            // The record mutations are durable; only log publication or lock
            // release was cut short.
            return self.complete(&entry).await;
        }

        // Restore pre-images of records we stamped. Pending batches never
        // wrote the log, so there is nothing to remove from it.
        for pre in &entry.pre_images {
            if let Some(doc) = self.store.get_document(&pre.key).await? {
                if doc.lock_token() == Some(&entry.lock_token) {
                    let restored = RecordDocument {
                        value: pre.value.clone(),
                        version: pre.version.clone(),
                        lock: None,
                    };
                    self.store
                        .replace_document(&pre.key, &doc.version, Some(&entry.lock_token), restored)
                        .await?;
                }
            }
        }

        // Remove records this batch created.
        for key in &entry.created_keys {
            if let Some(doc) = self.store.get_document(key).await? {
                if doc.lock_token() == Some(&entry.lock_token) {
                    self.store.delete_document(key, &entry.lock_token).await?;
                }
            }
        }

        self.store.delete_journal_entry(lock_token).await?;
        tracing::debug!(batch = %lock_token, "Batch rolled back");
        Ok(())
    }

    /// Resolve journal entries older than `staleness`
    ///
    /// Run periodically by the lock sweeper; tolerates running concurrently
    /// with itself and with normal commits. Returns the number of entries
    /// resolved.
    pub async fn sweep(&self, staleness: Duration) -> Result<usize> {
        let cutoff = Utc::now().timestamp_millis() - staleness.as_millis() as i64;
        let entries = self.store.stale_journal_entries(cutoff).await?;
        let count = entries.len();
        for entry in entries {
            tracing::warn!(
                batch = %entry.lock_token,
                locked_at = entry.locked_at,
                state = ?entry.state,
                "Sweeping stale journal entry"
            );
            self.rollback(&entry.lock_token).await?;
        }
        Ok(count)
    }
}

fn record_for(writes: &[(Record, ByteString)], key: &ByteString) -> Record {
    writes
        .iter()
        .map(|(record, _)| record)
        .find(|r| &r.key == key)
        .cloned()
        .unwrap_or_else(|| Record::new(key.clone(), None, ByteString::empty()))
}

#[async_trait]
impl<D: DocumentStore> StorageEngine for JournaledStore<D> {
    async fn add_transactions(&self, transactions: &[ByteString]) -> Result<()> {
        if transactions.is_empty() {
            return Ok(());
        }
        let entry = self.apply_batch(transactions).await?;
        self.finalize(&entry.lock_token).await
    }

    async fn get_records(&self, keys: &[ByteString]) -> Result<Vec<Record>> {
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let record = match self.store.get_document(key).await? {
                Some(doc) => Record::new(key.clone(), Some(doc.value), doc.version),
                None => Record::new(key.clone(), Some(ByteString::empty()), ByteString::empty()),
            };
            records.push(record);
        }
        Ok(records)
    }

    async fn get_last_transaction(&self) -> Result<Option<ByteString>> {
        Ok(self
            .store
            .last_log_entry()
            .await?
            .map(|(_, raw)| crypto::hash(&raw)))
    }

    async fn get_transactions(&self, from: Option<&ByteString>) -> Result<Vec<ByteString>> {
        let position = match from {
            Some(hash) => match self.store.log_position_of(hash).await? {
                Some(position) => Some(position),
                None => return Ok(Vec::new()),
            },
            None => None,
        };
        Ok(self
            .store
            .log_entries_after(position)
            .await?
            .into_iter()
            .map(|(_, raw)| raw)
            .collect())
    }
}

/// In-memory document store
///
/// Per-entry atomicity comes from DashMap's entry locking; nothing spans
/// entries, which makes this the reference backend for the journal protocol.
#[derive(Default)]
pub struct MemoryStore {
    documents: DashMap<ByteString, RecordDocument>,
    journal: DashMap<ByteString, JournalEntry>,
    log: RwLock<BTreeMap<u64, ByteString>>,
    log_index: DashMap<ByteString, u64>,
    next_position: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live journal entries (diagnostics/tests)
    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }

    /// Number of stored record documents (diagnostics/tests)
    pub fn document_len(&self) -> usize {
        self.documents.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_document(&self, key: &ByteString) -> Result<Option<RecordDocument>> {
        Ok(self.documents.get(key).map(|doc| doc.clone()))
    }

    async fn insert_document(&self, key: &ByteString, document: RecordDocument) -> Result<bool> {
        match self.documents.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(document);
                Ok(true)
            }
        }
    }

    async fn replace_document(
        &self,
        key: &ByteString,
        expected_version: &ByteString,
        expected_lock: Option<&ByteString>,
        document: RecordDocument,
    ) -> Result<bool> {
        let Some(mut current) = self.documents.get_mut(key) else {
            return Ok(false);
        };
        if &current.version != expected_version || current.lock_token() != expected_lock {
            return Ok(false);
        }
        *current = document;
        Ok(true)
    }

    async fn delete_document(&self, key: &ByteString, lock_token: &ByteString) -> Result<bool> {
        Ok(self
            .documents
            .remove_if(key, |_, doc| doc.lock_token() == Some(lock_token))
            .is_some())
    }

    async fn put_journal_entry(&self, entry: &JournalEntry) -> Result<()> {
        self.journal.insert(entry.lock_token.clone(), entry.clone());
        Ok(())
    }

    async fn get_journal_entry(&self, lock_token: &ByteString) -> Result<Option<JournalEntry>> {
        Ok(self.journal.get(lock_token).map(|e| e.clone()))
    }

    async fn delete_journal_entry(&self, lock_token: &ByteString) -> Result<()> {
        self.journal.remove(lock_token);
        Ok(())
    }

    async fn stale_journal_entries(&self, cutoff: i64) -> Result<Vec<JournalEntry>> {
        Ok(self
            .journal
            .iter()
            .filter(|entry| entry.locked_at <= cutoff)
            .map(|entry| entry.clone())
            .collect())
    }

    async fn reserve_log_position(&self) -> Result<u64> {
        Ok(self.next_position.fetch_add(1, Ordering::SeqCst))
    }

    async fn put_log_entry(&self, position: u64, raw: &ByteString) -> Result<()> {
        self.log.write().insert(position, raw.clone());
        self.log_index.insert(crypto::hash(raw), position);
        Ok(())
    }

    async fn log_entries_after(&self, position: Option<u64>) -> Result<Vec<(u64, ByteString)>> {
        let log = self.log.read();
        let entries = match position {
            Some(position) => log
                .range(position + 1..)
                .map(|(p, raw)| (*p, raw.clone()))
                .collect(),
            None => log.iter().map(|(p, raw)| (*p, raw.clone())).collect(),
        };
        Ok(entries)
    }

    async fn last_log_entry(&self) -> Result<Option<(u64, ByteString)>> {
        Ok(self
            .log
            .read()
            .iter()
            .next_back()
            .map(|(p, raw)| (*p, raw.clone())))
    }

    async fn log_position_of(&self, transaction_hash: &ByteString) -> Result<Option<u64>> {
        Ok(self.log_index.get(transaction_hash).map(|p| *p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::encode_balance;
    use crate::storage::get_record;

    fn account_key(account: &str, asset: &str) -> ByteString {
        use crate::path::{LedgerPath, RecordKey};
        RecordKey::account(
            LedgerPath::parse(account).unwrap(),
            &LedgerPath::parse(asset).unwrap(),
        )
        .to_binary()
    }

    fn encode_transaction(records: Vec<Record>) -> ByteString {
        let mutation =
            Mutation::new(ByteString::new(b"test".to_vec()), records, ByteString::empty())
                .unwrap();
        Transaction::new(mutation.serialize().unwrap(), 0, ByteString::empty())
            .serialize()
            .unwrap()
    }

    fn mutation_hash(raw: &ByteString) -> ByteString {
        crypto::hash(&Transaction::deserialize(raw).unwrap().mutation)
    }

    fn snapshot(store: &MemoryStore) -> Vec<(ByteString, RecordDocument)> {
        let mut docs: Vec<_> = store
            .documents
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        docs.sort_by(|a, b| a.0.cmp(&b.0));
        docs
    }

    #[tokio::test]
    async fn test_commit_releases_locks_and_journal() {
        let engine = JournaledStore::new(MemoryStore::new());
        let key = account_key("/alice/", "/asset/gold/");

        let raw = encode_transaction(vec![Record::new(
            key.clone(),
            Some(encode_balance(100)),
            ByteString::empty(),
        )]);
        engine.add_transactions(&[raw.clone()]).await.unwrap();

        let doc = engine
            .document_store()
            .get_document(&key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.value, encode_balance(100));
        assert!(doc.lock.is_none());
        assert_eq!(engine.document_store().journal_len(), 0);
        assert_eq!(
            engine.get_last_transaction().await.unwrap(),
            Some(crypto::hash(&raw))
        );
    }

    #[tokio::test]
    async fn test_stale_version_rejected() {
        let engine = JournaledStore::new(MemoryStore::new());
        let key = account_key("/alice/", "/asset/gold/");

        let first = encode_transaction(vec![Record::new(
            key.clone(),
            Some(encode_balance(100)),
            ByteString::empty(),
        )]);
        engine.add_transactions(&[first]).await.unwrap();

        let stale = encode_transaction(vec![Record::new(
            key.clone(),
            Some(encode_balance(50)),
            ByteString::empty(),
        )]);
        let err = engine.add_transactions(&[stale]).await.unwrap_err();
        match err {
            Error::ConcurrentMutation(record) => assert_eq!(record.key, key),
            other => panic!("expected concurrency error, got {other:?}"),
        }

        // The failed attempt leaves no journal entry and no lock.
        assert_eq!(engine.document_store().journal_len(), 0);
        let doc = engine
            .document_store()
            .get_document(&key)
            .await
            .unwrap()
            .unwrap();
        assert!(doc.lock.is_none());
        assert_eq!(doc.value, encode_balance(100));
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_no_trace() {
        let engine = JournaledStore::new(MemoryStore::new());
        let key_a = account_key("/alice/", "/asset/gold/");
        let key_b = account_key("/bob/", "/asset/gold/");

        let good = encode_transaction(vec![Record::new(
            key_a.clone(),
            Some(encode_balance(100)),
            ByteString::empty(),
        )]);
        let bad = encode_transaction(vec![Record::new(
            key_b.clone(),
            Some(encode_balance(100)),
            ByteString::new(vec![1; 32]),
        )]);

        assert!(engine.add_transactions(&[good, bad]).await.is_err());

        // All-or-nothing: no record, no log entry, no journal entry.
        assert!(engine
            .document_store()
            .get_document(&key_a)
            .await
            .unwrap()
            .is_none());
        assert!(engine.get_transactions(None).await.unwrap().is_empty());
        assert_eq!(engine.document_store().journal_len(), 0);
    }

    #[tokio::test]
    async fn test_batch_later_transaction_sees_earlier() {
        let engine = JournaledStore::new(MemoryStore::new());
        let key = account_key("/alice/", "/asset/gold/");

        let first = encode_transaction(vec![Record::new(
            key.clone(),
            Some(encode_balance(100)),
            ByteString::empty(),
        )]);
        // The second transaction updates the record the first one created,
        // inside the same batch.
        let second = encode_transaction(vec![Record::new(
            key.clone(),
            Some(encode_balance(40)),
            mutation_hash(&first),
        )]);

        engine
            .add_transactions(&[first, second.clone()])
            .await
            .unwrap();

        let doc = engine
            .document_store()
            .get_document(&key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.value, encode_balance(40));
        assert_eq!(doc.version, mutation_hash(&second));
        assert!(doc.lock.is_none());
        assert_eq!(engine.get_transactions(None).await.unwrap().len(), 2);
        assert_eq!(engine.document_store().journal_len(), 0);
    }

    #[tokio::test]
    async fn test_pending_batch_is_invisible_in_log() {
        let engine = JournaledStore::new(MemoryStore::new());
        let key = account_key("/alice/", "/asset/gold/");

        let raw = encode_transaction(vec![Record::new(
            key.clone(),
            Some(encode_balance(100)),
            ByteString::empty(),
        )]);
        let entry = engine
            .apply_batch(std::slice::from_ref(&raw))
            .await
            .unwrap();

        // Applied but not finalized: the record is written (and locked), yet
        // nothing shows up in the log.
        assert!(engine.get_transactions(None).await.unwrap().is_empty());
        assert!(engine.get_last_transaction().await.unwrap().is_none());

        engine.finalize(&entry.lock_token).await.unwrap();
        assert_eq!(
            engine.get_last_transaction().await.unwrap(),
            Some(crypto::hash(&raw))
        );
    }

    #[tokio::test]
    async fn test_rollback_restores_pre_images() {
        let engine = JournaledStore::new(MemoryStore::new());
        let key = account_key("/alice/", "/asset/gold/");

        let first = encode_transaction(vec![Record::new(
            key.clone(),
            Some(encode_balance(100)),
            ByteString::empty(),
        )]);
        engine.add_transactions(&[first.clone()]).await.unwrap();
        let version = mutation_hash(&first);

        // Apply a second batch but do not finalize (simulated crash between
        // apply and publication).
        let second = encode_transaction(vec![Record::new(
            key.clone(),
            Some(encode_balance(40)),
            version.clone(),
        )]);
        let entry = engine
            .apply_batch(std::slice::from_ref(&second))
            .await
            .unwrap();

        engine.rollback(&entry.lock_token).await.unwrap();

        let record = get_record(&engine, &key).await.unwrap();
        assert_eq!(record.value, Some(encode_balance(100)));
        assert_eq!(record.version, version);
        // The rolled-back batch never reached the log.
        assert_eq!(engine.get_transactions(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_is_idempotent() {
        let engine = JournaledStore::new(MemoryStore::new());
        let key = account_key("/alice/", "/asset/gold/");

        let raw = encode_transaction(vec![Record::new(
            key.clone(),
            Some(encode_balance(100)),
            ByteString::empty(),
        )]);
        let entry = engine
            .apply_batch(std::slice::from_ref(&raw))
            .await
            .unwrap();

        engine.rollback(&entry.lock_token).await.unwrap();
        let after_once = snapshot(engine.document_store());

        engine.rollback(&entry.lock_token).await.unwrap();
        let after_twice = snapshot(engine.document_store());

        assert_eq!(after_once, after_twice);
        assert!(after_once.is_empty()); // created record was deleted
        assert_eq!(engine.document_store().journal_len(), 0);
    }

    #[tokio::test]
    async fn test_sweep_rolls_back_stale_pending_entry() {
        let engine = JournaledStore::new(MemoryStore::new());
        let key = account_key("/alice/", "/asset/gold/");

        let raw = encode_transaction(vec![Record::new(
            key.clone(),
            Some(encode_balance(100)),
            ByteString::empty(),
        )]);
        engine
            .apply_batch(std::slice::from_ref(&raw))
            .await
            .unwrap();
        assert_eq!(engine.document_store().journal_len(), 1);

        // Zero staleness: everything currently pending is stale.
        let swept = engine.sweep(Duration::from_millis(0)).await.unwrap();
        assert_eq!(swept, 1);
        assert!(engine
            .document_store()
            .get_document(&key)
            .await
            .unwrap()
            .is_none());
        assert!(engine.get_transactions(None).await.unwrap().is_empty());

        // Nothing left to sweep; safe to run again.
        assert_eq!(engine.sweep(Duration::from_millis(0)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_completes_committed_entry() {
        let engine = JournaledStore::new(MemoryStore::new());
        let key = account_key("/alice/", "/asset/gold/");

        let raw = encode_transaction(vec![Record::new(
            key.clone(),
            Some(encode_balance(100)),
            ByteString::empty(),
        )]);
        let mut entry = engine
            .apply_batch(std::slice::from_ref(&raw))
            .await
            .unwrap();

        // Simulate a crash right after the state flip to Committed.
        entry.state = JournalState::Committed;
        engine
            .document_store()
            .put_journal_entry(&entry)
            .await
            .unwrap();

        engine.sweep(Duration::from_millis(0)).await.unwrap();

        // The mutation survives; log publication and lock release were
        // completed, not undone.
        let doc = engine
            .document_store()
            .get_document(&key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.value, encode_balance(100));
        assert!(doc.lock.is_none());
        assert_eq!(engine.document_store().journal_len(), 0);
        assert_eq!(
            engine.get_last_transaction().await.unwrap(),
            Some(crypto::hash(&raw))
        );
    }

    #[tokio::test]
    async fn test_locked_record_rejects_concurrent_writer() {
        let engine = JournaledStore::new(MemoryStore::new());
        let key = account_key("/alice/", "/asset/gold/");

        let first = encode_transaction(vec![Record::new(
            key.clone(),
            Some(encode_balance(100)),
            ByteString::empty(),
        )]);
        engine.add_transactions(&[first.clone()]).await.unwrap();
        let version = mutation_hash(&first);

        // Hold a lock, as a concurrent in-flight commit would.
        let second = encode_transaction(vec![Record::new(
            key.clone(),
            Some(encode_balance(40)),
            version.clone(),
        )]);
        let pending = engine
            .apply_batch(std::slice::from_ref(&second))
            .await
            .unwrap();

        let competing = encode_transaction(vec![Record::new(
            key.clone(),
            Some(encode_balance(10)),
            version,
        )]);
        assert!(matches!(
            engine.add_transactions(&[competing]).await.unwrap_err(),
            Error::ConcurrentMutation(_)
        ));

        engine.rollback(&pending.lock_token).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_cas_semantics() {
        let store = MemoryStore::new();
        let key = ByteString::new(b"k".to_vec());
        let doc = RecordDocument {
            value: ByteString::new(vec![1]),
            version: ByteString::new(vec![2]),
            lock: None,
        };

        assert!(store.insert_document(&key, doc.clone()).await.unwrap());
        assert!(!store.insert_document(&key, doc.clone()).await.unwrap());

        // Version mismatch
        let wrong = ByteString::new(vec![9]);
        assert!(!store
            .replace_document(&key, &wrong, None, doc.clone())
            .await
            .unwrap());

        // Lock expectation mismatch
        let token = ByteString::new(vec![7]);
        assert!(!store
            .replace_document(&key, &doc.version, Some(&token), doc.clone())
            .await
            .unwrap());

        // Matching CAS
        assert!(store
            .replace_document(&key, &doc.version, None, doc.clone())
            .await
            .unwrap());

        // Delete requires the lock token
        assert!(!store.delete_document(&key, &token).await.unwrap());
    }
}
