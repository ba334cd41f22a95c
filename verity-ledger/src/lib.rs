//! Verity: an append-only, cryptographically verifiable ledger
//!
//! Records are versioned key/value pairs committed through atomic,
//! optimistically-locked transactions. On top of the versioned store sit:
//!
//! - a validation pipeline enforcing signatures, per-asset zero-sum balance
//!   conservation and pluggable policy ([`validator`])
//! - hierarchical tri-state permissions resolved along ledger paths
//!   ([`permissions`])
//! - hash-chain anchors checkpointing the whole transaction log
//!   ([`anchor`])
//! - ordered transaction subscriptions ([`stream`])
//!
//! Two storage backends implement the same [`storage::StorageEngine`]
//! contract: RocksDB with native batch atomicity, and a lock/journal engine
//! ([`journal`]) for stores that only offer per-document compare-and-swap.
//!
//! [`Ledger::open`] wires a complete instance from a [`Config`].

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod anchor;
pub mod config;
pub mod crypto;
pub mod error;
pub mod journal;
pub mod ledger;
pub mod metrics;
pub mod path;
pub mod permissions;
pub mod storage;
pub mod stream;
pub mod types;
pub mod validator;
pub mod worker;

pub use anchor::LedgerAnchor;
pub use config::{Backend, Config};
pub use crypto::{KeyPair, SignatureEvidence};
pub use error::{Error, Result, ValidationReason};
pub use ledger::Ledger;
pub use path::{AccountKey, AccountStatus, LedgerPath, RecordKey, RecordType};
pub use types::{ByteString, Mutation, Record, Transaction};
