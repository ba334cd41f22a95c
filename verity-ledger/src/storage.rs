//! Storage engine contract and the RocksDB backend
//!
//! # Column Families
//!
//! - `records` - current record state (key: record key, value: value+version)
//! - `transactions` - append-only transaction log (key: sequence number)
//! - `txindex` - transaction hash → sequence number
//! - `anchors` - anchor checkpoints (key: transaction count)
//!
//! RocksDB provides native multi-record atomicity through `WriteBatch`:
//! a whole `add_transactions` batch is validated against a pending overlay
//! under a single writer lock and committed in one write. Backends without
//! that primitive use the journaled engine in [`crate::journal`] instead.

use crate::{
    crypto,
    error::{Error, Result},
    types::{ByteString, Mutation, Record, Transaction},
    Config,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Column family names
const CF_RECORDS: &str = "records";
const CF_TRANSACTIONS: &str = "transactions";
const CF_TXINDEX: &str = "txindex";
const CF_ANCHORS: &str = "anchors";

/// Durable, versioned key→(value, version) map plus an ordered transaction log
///
/// Implementations commit each batch all-or-nothing: a version conflict on
/// any record aborts every transaction in the call and surfaces the
/// offending record through [`Error::ConcurrentMutation`].
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Atomically commit a batch of encoded transactions, in order
    async fn add_transactions(&self, transactions: &[ByteString]) -> Result<()>;

    /// Current state of the given record keys
    ///
    /// Unknown keys yield a record with an empty value and empty version, so
    /// "must not yet exist" is expressed as an empty-version match.
    async fn get_records(&self, keys: &[ByteString]) -> Result<Vec<Record>>;

    /// Hash of the most recently appended transaction
    async fn get_last_transaction(&self) -> Result<Option<ByteString>>;

    /// All encoded transactions strictly after `from`, in log order
    ///
    /// `None` replays the log from the beginning.
    async fn get_transactions(&self, from: Option<&ByteString>) -> Result<Vec<ByteString>>;
}

/// Convenience: current state of a single record
pub async fn get_record(engine: &dyn StorageEngine, key: &ByteString) -> Result<Record> {
    let mut records = engine.get_records(std::slice::from_ref(key)).await?;
    records
        .pop()
        .ok_or_else(|| Error::Storage("empty get_records result".to_string()))
}

/// Stored row: the durable side of a record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct StoredRecord {
    value: ByteString,
    version: ByteString,
}

/// RocksDB-backed storage engine (native-transaction backend)
pub struct RocksStore {
    db: Arc<DB>,
    /// Single writer: commits validate against a pending overlay and must not
    /// interleave. Readers are unaffected.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create the database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        // Universal compaction for the append-heavy transaction log
        db_opts.set_compaction_style(DBCompactionStyle::Universal);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_RECORDS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_transactions()),
            ColumnFamilyDescriptor::new(CF_TXINDEX, Self::cf_options_txindex()),
            ColumnFamilyDescriptor::new(CF_ANCHORS, Self::cf_options_anchors()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = %path.display(), "Opened ledger RocksDB");

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options_records() -> Options {
        let mut opts = Options::default();
        // Record state is read on every validation pass, favor speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_transactions() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_txindex() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false); // 10 bits per key
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_anchors() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {name} not found")))
    }

    fn read_record(&self, key: &ByteString) -> Result<StoredRecord> {
        let cf = self.cf_handle(CF_RECORDS)?;
        match self.db.get_cf(cf, key.as_slice())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(StoredRecord::default()),
        }
    }

    fn next_sequence(&self) -> Result<u64> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        let mut iter = self.db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                let seq = decode_sequence(&key)?;
                Ok(seq + 1)
            }
            None => Ok(0),
        }
    }

    fn sequence_of(&self, tx_hash: &ByteString) -> Result<Option<u64>> {
        let cf = self.cf_handle(CF_TXINDEX)?;
        match self.db.get_cf(cf, tx_hash.as_slice())? {
            Some(bytes) => Ok(Some(decode_sequence(&bytes)?)),
            None => Ok(None),
        }
    }

    // Anchor state (queried by highest transaction count)

    /// Latest committed anchor, if any
    pub fn last_anchor_bytes(&self) -> Result<Option<Vec<u8>>> {
        let cf = self.cf_handle(CF_ANCHORS)?;
        let mut iter = self.db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(item) => Ok(Some(item?.1.to_vec())),
            None => Ok(None),
        }
    }

    /// Append an anchor checkpoint keyed by its transaction count
    pub fn put_anchor_bytes(&self, transaction_count: u64, bytes: &[u8]) -> Result<()> {
        let cf = self.cf_handle(CF_ANCHORS)?;
        self.db
            .put_cf(cf, transaction_count.to_be_bytes(), bytes)?;
        Ok(())
    }
}

fn decode_sequence(bytes: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Storage("malformed transaction sequence key".to_string()))?;
    Ok(u64::from_be_bytes(bytes))
}

#[async_trait]
impl StorageEngine for RocksStore {
    async fn add_transactions(&self, transactions: &[ByteString]) -> Result<()> {
        let _guard = self.write_lock.lock();

        let cf_records = self.cf_handle(CF_RECORDS)?;
        let cf_transactions = self.cf_handle(CF_TRANSACTIONS)?;
        let cf_txindex = self.cf_handle(CF_TXINDEX)?;

        let mut batch = WriteBatch::default();
        // Later transactions in the batch must observe earlier ones.
        let mut overlay: HashMap<ByteString, StoredRecord> = HashMap::new();
        let mut sequence = self.next_sequence()?;

        for raw in transactions {
            let transaction = Transaction::deserialize(raw)?;
            let mutation = Mutation::deserialize(&transaction.mutation)?;
            let mutation_hash = crypto::hash(&transaction.mutation);

            for record in &mutation.records {
                let current = match overlay.get(&record.key) {
                    Some(stored) => stored.clone(),
                    None => self.read_record(&record.key)?,
                };

                // One comparison covers all three cases: read-only version
                // check, compare-and-swap update, and must-not-exist insert
                // (empty version against the empty default row).
                if current.version != record.version {
                    return Err(Error::ConcurrentMutation(Box::new(record.clone())));
                }

                if let Some(value) = &record.value {
                    let updated = StoredRecord {
                        value: value.clone(),
                        version: mutation_hash.clone(),
                    };
                    batch.put_cf(cf_records, record.key.as_slice(), bincode::serialize(&updated)?);
                    overlay.insert(record.key.clone(), updated);
                }
            }

            let tx_hash = crypto::hash(raw);
            batch.put_cf(cf_transactions, sequence.to_be_bytes(), raw.as_slice());
            batch.put_cf(cf_txindex, tx_hash.as_slice(), sequence.to_be_bytes());

            tracing::debug!(
                transaction = %tx_hash,
                sequence,
                records = mutation.records.len(),
                "Transaction staged"
            );
            sequence += 1;
        }

        // Atomic commit of the whole batch
        self.db.write(batch)?;
        Ok(())
    }

    async fn get_records(&self, keys: &[ByteString]) -> Result<Vec<Record>> {
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let stored = self.read_record(key)?;
            records.push(Record::new(key.clone(), Some(stored.value), stored.version));
        }
        Ok(records)
    }

    async fn get_last_transaction(&self) -> Result<Option<ByteString>> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        let mut iter = self.db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (_, raw) = item?;
                Ok(Some(crypto::hash(&ByteString::new(raw.to_vec()))))
            }
            None => Ok(None),
        }
    }

    async fn get_transactions(&self, from: Option<&ByteString>) -> Result<Vec<ByteString>> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;

        let start = match from {
            Some(hash) => match self.sequence_of(hash)? {
                Some(seq) => seq + 1,
                // Unknown cursor: nothing after a position we never saw.
                None => return Ok(Vec::new()),
            },
            None => 0,
        };

        let start_key = start.to_be_bytes();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));

        let mut transactions = Vec::new();
        for item in iter {
            let (_, raw) = item?;
            transactions.push(ByteString::new(raw.to_vec()));
        }
        Ok(transactions)
    }
}
