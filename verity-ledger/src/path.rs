//! Ledger paths and canonical record keys
//!
//! A [`LedgerPath`] is a `/`-delimited sequence of validated segments with an
//! explicit directory/leaf distinction (trailing slash). A [`RecordKey`] is
//! the canonical text encoding `"{path}:{ACC|DATA}:{name}"`; parsing rejects
//! any input whose re-serialization is not byte-for-byte identical to the
//! input. Canonical-form enforcement is a security property: two distinct
//! encodings must never address the same record.

use crate::error::{Error, Result, ValidationReason};
use crate::types::{ByteString, Record};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Punctuation allowed in path segments, alongside ASCII alphanumerics
const SEGMENT_PUNCTUATION: &str = "$-_.+!*'(),";

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || SEGMENT_PUNCTUATION.contains(c))
}

/// A validated, ordered path into the ledger hierarchy
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LedgerPath {
    segments: Vec<String>,
    is_directory: bool,
}

impl LedgerPath {
    /// The root directory `/`
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
            is_directory: true,
        }
    }

    /// Build a path from segments, validating each
    pub fn from_segments<S: AsRef<str>>(segments: &[S], is_directory: bool) -> Result<Self> {
        let mut validated = Vec::with_capacity(segments.len());
        for segment in segments {
            let segment = segment.as_ref();
            if !is_valid_segment(segment) {
                return Err(Error::invalid(
                    ValidationReason::InvalidPath,
                    format!("invalid path segment {segment:?}"),
                ));
            }
            validated.push(segment.to_string());
        }
        if validated.is_empty() && !is_directory {
            return Err(Error::invalid(
                ValidationReason::InvalidPath,
                "the root path is always a directory",
            ));
        }
        Ok(Self {
            segments: validated,
            is_directory,
        })
    }

    /// Parse a rendered path; round-trips with [`fmt::Display`]
    pub fn parse(value: &str) -> Result<Self> {
        let Some(rest) = value.strip_prefix('/') else {
            return Err(Error::invalid(
                ValidationReason::InvalidPath,
                format!("path must start with '/': {value:?}"),
            ));
        };

        if rest.is_empty() {
            return Ok(Self::root());
        }

        let (body, is_directory) = match rest.strip_suffix('/') {
            Some(body) => (body, true),
            None => (rest, false),
        };

        let segments: Vec<&str> = body.split('/').collect();
        Self::from_segments(&segments, is_directory)
    }

    /// Path segments in order
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True if the path carries a trailing slash
    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// Directory formed by the first `count` segments
    pub fn prefix(&self, count: usize) -> LedgerPath {
        LedgerPath {
            segments: self.segments[..count.min(self.segments.len())].to_vec(),
            is_directory: true,
        }
    }

    /// True if `self` is an ancestor of `other` (non-reflexive)
    pub fn is_strict_parent_of(&self, other: &LedgerPath) -> bool {
        self.segments.len() < other.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// True if `self` is an ancestor of `other` or equal to it
    pub fn is_parent_of(&self, other: &LedgerPath) -> bool {
        self.segments.len() <= other.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }
}

impl fmt::Display for LedgerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/")?;
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{segment}")?;
        }
        if self.is_directory && !self.segments.is_empty() {
            write!(f, "/")?;
        }
        Ok(())
    }
}

impl Serialize for LedgerPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LedgerPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        LedgerPath::parse(&value).map_err(serde::de::Error::custom)
    }
}

/// The two classes of ledger records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    /// Balance-bearing account record
    Account,
    /// Free-form data record
    Data,
}

impl RecordType {
    /// Canonical tag used in key encodings
    pub fn tag(&self) -> &'static str {
        match self {
            RecordType::Account => "ACC",
            RecordType::Data => "DATA",
        }
    }

    /// Parse a canonical tag
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "ACC" => Some(RecordType::Account),
            "DATA" => Some(RecordType::Data),
            _ => None,
        }
    }
}

/// Structured form of a record key
///
/// Rendered as `"{path}:{ACC|DATA}:{name}"` (UTF-8). For account keys the
/// name is the asset path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    /// Record class
    pub record_type: RecordType,
    /// Path the record lives under
    pub path: LedgerPath,
    /// Record name; for accounts, the rendered asset path
    pub name: String,
}

impl RecordKey {
    /// Create a key
    pub fn new(record_type: RecordType, path: LedgerPath, name: impl Into<String>) -> Self {
        Self {
            record_type,
            path,
            name: name.into(),
        }
    }

    /// Account key for `(account, asset)`
    pub fn account(account: LedgerPath, asset: &LedgerPath) -> Self {
        Self::new(RecordType::Account, account, asset.to_string())
    }

    /// Canonical byte encoding
    pub fn to_binary(&self) -> ByteString {
        ByteString::new(self.to_string().into_bytes())
    }

    /// Parse a canonical key encoding
    ///
    /// Fails with `NonCanonicalSerialization` when the re-rendered key does
    /// not byte-for-byte equal the input.
    pub fn parse(bytes: &ByteString) -> Result<Self> {
        let text = std::str::from_utf8(bytes.as_slice()).map_err(|_| {
            Error::invalid(ValidationReason::InvalidRecord, "record key is not UTF-8")
        })?;

        let mut parts = text.splitn(3, ':');
        let (path_part, tag_part, name_part) = match (parts.next(), parts.next(), parts.next()) {
            (Some(p), Some(t), Some(n)) => (p, t, n),
            _ => {
                return Err(Error::invalid(
                    ValidationReason::InvalidRecord,
                    format!("malformed record key {text:?}"),
                ))
            }
        };

        let path = LedgerPath::parse(path_part)?;
        let record_type = RecordType::from_tag(tag_part).ok_or_else(|| {
            Error::invalid(
                ValidationReason::InvalidRecord,
                format!("unknown record type tag {tag_part:?}"),
            )
        })?;

        if record_type == RecordType::Account {
            // The name of an account record is the asset path.
            LedgerPath::parse(name_part)?;
        }

        let key = Self::new(record_type, path, name_part);
        if key.to_string().as_bytes() != bytes.as_slice() {
            return Err(Error::invalid(
                ValidationReason::NonCanonicalSerialization,
                format!("record key {text:?} is not in canonical form"),
            ));
        }
        Ok(key)
    }

    /// Asset path of an account key
    pub fn asset_path(&self) -> Result<LedgerPath> {
        LedgerPath::parse(&self.name)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.path, self.record_type.tag(), self.name)
    }
}

/// Identity of an account: who holds which asset
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountKey {
    /// Account holder path
    pub account: LedgerPath,
    /// Asset path
    pub asset: LedgerPath,
}

impl AccountKey {
    /// Create an account key
    pub fn new(account: LedgerPath, asset: LedgerPath) -> Self {
        Self { account, asset }
    }

    /// Canonical record key for this account
    pub fn record_key(&self) -> RecordKey {
        RecordKey::account(self.account.clone(), &self.asset)
    }
}

/// Computed balance state of one account record
///
/// Not stored: derived per request from an Account-typed record whose value
/// is either empty (balance 0) or an 8-byte big-endian signed integer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountStatus {
    /// Account identity
    pub account_key: AccountKey,
    /// Balance in indivisible units
    pub balance: i64,
    /// Version of the backing record
    pub version: ByteString,
}

impl AccountStatus {
    /// Interpret a stored or mutated account record
    pub fn from_record(key: &RecordKey, record: &Record) -> Result<Self> {
        debug_assert_eq!(key.record_type, RecordType::Account);
        let value = record.value.as_ref().ok_or_else(|| {
            Error::invalid(
                ValidationReason::InvalidRecord,
                "account record carries no value",
            )
        })?;

        let account_key = AccountKey::new(key.path.clone(), key.asset_path()?);
        Ok(Self {
            account_key,
            balance: decode_balance(value)?,
            version: record.version.clone(),
        })
    }
}

/// Decode a balance value: empty means zero, otherwise 8-byte big-endian
pub fn decode_balance(value: &ByteString) -> Result<i64> {
    if value.is_empty() {
        return Ok(0);
    }
    let bytes: [u8; 8] = value.as_slice().try_into().map_err(|_| {
        Error::invalid(
            ValidationReason::InvalidRecord,
            format!("account balance must be 0 or 8 bytes, got {}", value.len()),
        )
    })?;
    Ok(i64::from_be_bytes(bytes))
}

/// Encode a balance as 8-byte big-endian two's complement
pub fn encode_balance(balance: i64) -> ByteString {
    ByteString::new(balance.to_be_bytes().to_vec())
}
