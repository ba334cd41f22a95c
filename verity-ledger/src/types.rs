//! Core value types for the ledger
//!
//! All types are immutable value objects designed for:
//! - Deterministic serialization (bincode) feeding content hashes
//! - Byte-wise equality and ordering
//! - Construction-time shape validation (duplicate keys, hex form)

use crate::error::{Error, Result, ValidationReason};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Immutable ordered byte sequence
///
/// The universal currency for keys, values, versions and hashes. Equality is
/// byte-wise; the text form is lowercase hex and round-trips exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteString(#[serde(with = "serde_bytes")] Vec<u8>);

impl ByteString {
    /// Create from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The empty byte sequence
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Parse from a hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| Error::invalid(ValidationReason::InvalidRecord, e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Raw bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Byte length
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if zero-length
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Concatenation, allocating a new sequence
    pub fn concat(&self, other: &ByteString) -> ByteString {
        let mut bytes = Vec::with_capacity(self.0.len() + other.0.len());
        bytes.extend_from_slice(&self.0);
        bytes.extend_from_slice(&other.0);
        ByteString(bytes)
    }
}

impl fmt::Display for ByteString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<Vec<u8>> for ByteString {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for ByteString {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<[u8; 32]> for ByteString {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes.to_vec())
    }
}

/// A single key-versioned entry inside a mutation
///
/// `value == None` marks a read-only version-check entry: it participates in
/// concurrency validation but writes nothing. An empty `version` means the
/// record must not yet exist; otherwise the version must equal the hash of
/// the mutation that last wrote the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Record key (canonical encoding, see [`crate::path::RecordKey`])
    pub key: ByteString,

    /// New value, or `None` for a version check
    pub value: Option<ByteString>,

    /// Optimistic-concurrency token
    pub version: ByteString,
}

impl Record {
    /// Create a record
    pub fn new(key: ByteString, value: Option<ByteString>, version: ByteString) -> Self {
        Self {
            key,
            value,
            version,
        }
    }

    /// True if this record only checks the current version
    pub fn is_version_check(&self) -> bool {
        self.value.is_none()
    }
}

/// A proposed set of record changes sharing one namespace
///
/// Record keys must be unique within a mutation; insertion order is
/// significant because it feeds the deterministic serialization hashed into
/// the mutation hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    /// Ledger namespace this mutation targets
    pub namespace: ByteString,

    /// Ordered records
    pub records: Vec<Record>,

    /// Opaque client metadata
    pub metadata: ByteString,
}

impl Mutation {
    /// Create a mutation, rejecting duplicate record keys
    pub fn new(
        namespace: ByteString,
        records: Vec<Record>,
        metadata: ByteString,
    ) -> Result<Self> {
        Self::check_unique_keys(&records)?;
        Ok(Self {
            namespace,
            records,
            metadata,
        })
    }

    /// Canonical encoding
    pub fn serialize(&self) -> Result<ByteString> {
        Ok(ByteString::new(bincode::serialize(self)?))
    }

    /// Decode and shape-check a mutation
    ///
    /// Duplicate keys are rejected here, before any interpretation.
    pub fn deserialize(bytes: &ByteString) -> Result<Self> {
        let mutation: Mutation = bincode::deserialize(bytes.as_slice()).map_err(|e| {
            Error::invalid(ValidationReason::InvalidMutation, e.to_string())
        })?;
        Self::check_unique_keys(&mutation.records)?;
        Ok(mutation)
    }

    fn check_unique_keys(records: &[Record]) -> Result<()> {
        let mut seen = HashSet::with_capacity(records.len());
        for record in records {
            if !seen.insert(&record.key) {
                return Err(Error::invalid(
                    ValidationReason::InvalidMutation,
                    format!("duplicate record key {}", record.key),
                ));
            }
        }
        Ok(())
    }
}

/// A mutation plus timestamp and authentication metadata, as persisted
///
/// The mutation is carried in its raw encoded form so that
/// `mutation_hash = sha256(mutation)` is stable regardless of how the
/// transaction itself is framed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Raw encoded mutation
    pub mutation: ByteString,

    /// Commit timestamp (milliseconds since Unix epoch)
    pub timestamp: i64,

    /// Authentication evidence recorded alongside the mutation
    pub transaction_metadata: ByteString,
}

impl Transaction {
    /// Create a transaction
    pub fn new(mutation: ByteString, timestamp: i64, transaction_metadata: ByteString) -> Self {
        Self {
            mutation,
            timestamp,
            transaction_metadata,
        }
    }

    /// Canonical encoding
    pub fn serialize(&self) -> Result<ByteString> {
        Ok(ByteString::new(bincode::serialize(self)?))
    }

    /// Decode a persisted transaction
    pub fn deserialize(bytes: &ByteString) -> Result<Self> {
        Ok(bincode::deserialize(bytes.as_slice())?)
    }
}
