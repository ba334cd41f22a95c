//! Ledger configuration
//!
//! Loaded from a TOML file, then optionally overridden by `VERITY_*`
//! environment variables. Defaults are suitable for local development.

use crate::error::{Error, Result};
use crate::path::LedgerPath;
use crate::permissions::{Acl, PermissionSet, StringPattern};
use crate::types::ByteString;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// RocksDB, durable, native batch atomicity
    #[default]
    Rocks,
    /// In-memory document store through the journaled engine
    Memory,
}

/// RocksDB tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDbConfig {
    /// Memtable size in megabytes
    pub write_buffer_size_mb: usize,
    /// Number of memtables kept in memory
    pub max_write_buffer_number: i32,
    /// SST target file size in megabytes
    pub target_file_size_mb: u64,
    /// Background compaction/flush threads
    pub max_background_jobs: i32,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            target_file_size_mb: 64,
            max_background_jobs: 4,
        }
    }
}

/// Transaction validation limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Maximum record key length in bytes
    pub max_key_size: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self { max_key_size: 512 }
    }
}

/// Anchor worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorConfig {
    /// Whether the periodic anchor worker runs
    pub enabled: bool,
    /// Seconds between anchor attempts
    pub interval_secs: u64,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
        }
    }
}

/// Stale-lock sweeper settings (journaled backend only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Seconds between sweeps
    pub interval_secs: u64,
    /// Age in seconds after which a pending journal entry is considered dead
    pub staleness_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            staleness_secs: 60,
        }
    }
}

/// Transaction stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Milliseconds between log polls when caught up
    pub poll_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
        }
    }
}

/// One configured ACL entry, anchored at a ledger path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclEntryConfig {
    /// Path the entry applies at
    pub path: String,
    /// Identities the entry applies to
    pub subjects: Vec<String>,
    /// Whether the entry also covers descendant paths
    #[serde(default)]
    pub recursive: bool,
    /// Which record names the entry covers
    #[serde(default)]
    pub record_name: StringPattern,
    /// Granted or denied permissions
    #[serde(default)]
    pub permissions: PermissionSet,
}

/// Top-level ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for the RocksDB backend
    pub data_dir: PathBuf,
    /// Ledger namespace; every posted mutation must carry it
    pub namespace: String,
    /// Storage backend
    pub backend: Backend,
    /// RocksDB tuning
    pub rocksdb: RocksDbConfig,
    /// Validation limits
    pub validator: ValidatorConfig,
    /// Anchor worker
    pub anchor: AnchorConfig,
    /// Stale-lock sweeper
    pub sweeper: SweeperConfig,
    /// Transaction stream polling
    pub stream: StreamConfig,
    /// Static ACL entries
    pub acl: Vec<AclEntryConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            namespace: "main".to_string(),
            backend: Backend::default(),
            rocksdb: RocksDbConfig::default(),
            validator: ValidatorConfig::default(),
            anchor: AnchorConfig::default(),
            sweeper: SweeperConfig::default(),
            stream: StreamConfig::default(),
            acl: Vec::new(),
        }
    }
}

impl Config {
    /// Load from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| Error::Config(format!("parse {path}: {e}")))
    }

    /// Default configuration with `VERITY_*` environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        if let Ok(value) = std::env::var("VERITY_DATA_DIR") {
            config.data_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("VERITY_NAMESPACE") {
            config.namespace = value;
        }
        if let Ok(value) = std::env::var("VERITY_BACKEND") {
            config.backend = match value.as_str() {
                "rocks" => Backend::Rocks,
                "memory" => Backend::Memory,
                other => {
                    return Err(Error::Config(format!("unknown backend {other:?}")));
                }
            };
        }
        if let Ok(value) = std::env::var("VERITY_ANCHOR_INTERVAL_SECS") {
            config.anchor.interval_secs = value
                .parse()
                .map_err(|e| Error::Config(format!("VERITY_ANCHOR_INTERVAL_SECS: {e}")))?;
        }
        Ok(config)
    }

    /// Namespace as ledger bytes
    pub fn namespace_bytes(&self) -> ByteString {
        ByteString::new(self.namespace.clone().into_bytes())
    }

    /// Parse the configured ACL entries into resolver form
    pub fn acl_entries(&self) -> Result<Vec<(LedgerPath, Acl)>> {
        self.acl
            .iter()
            .map(|entry| {
                let path = LedgerPath::parse(&entry.path)
                    .map_err(|e| Error::Config(format!("acl path {:?}: {e}", entry.path)))?;
                if !path.is_directory() {
                    return Err(Error::Config(format!(
                        "acl path {:?} must be a directory",
                        entry.path
                    )));
                }
                Ok((
                    path,
                    Acl {
                        subjects: entry.subjects.clone(),
                        recursive: entry.recursive,
                        record_name: entry.record_name.clone(),
                        permissions: entry.permissions,
                    },
                ))
            })
            .collect()
    }
}
