//! Hierarchical tri-state permission resolution
//!
//! Every permission is [`Access::Unset`], [`Access::Permit`] or
//! [`Access::Deny`]. Providers answer per path level; the resolver walks the
//! hierarchy from the root to the target path and folds levels together with
//! [`PermissionSet::add_level`]. Two laws govern the algebra:
//!
//! - within one level, `Deny` beats `Permit` beats `Unset`
//! - across levels, a parent `Deny` is final; otherwise the deeper level
//!   wins unless it is `Unset`
//!
//! [`PermissionBasedValidator`] turns resolved permissions into accept/reject
//! decisions for account and data writes.

use crate::{
    crypto::SignatureEvidence,
    error::{Error, Result, ValidationReason},
    path::{LedgerPath, RecordKey, RecordType},
    storage::{get_record, StorageEngine},
    types::Mutation,
    validator::{MutationValidator, ParsedMutation},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Tri-state access level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    /// No opinion
    #[default]
    Unset,
    /// Explicitly granted
    Permit,
    /// Explicitly denied
    Deny,
}

impl Access {
    /// Merge two opinions at the same level: `Deny` dominates, then `Permit`
    pub fn combine(self, other: Access) -> Access {
        match (self, other) {
            (Access::Deny, _) | (_, Access::Deny) => Access::Deny,
            (Access::Permit, _) | (_, Access::Permit) => Access::Permit,
            (Access::Unset, Access::Unset) => Access::Unset,
        }
    }

    /// Layer a deeper level over this one: a parent `Deny` is final,
    /// otherwise the child wins unless it has no opinion
    pub fn add_level(self, child: Access) -> Access {
        match (self, child) {
            (Access::Deny, _) => Access::Deny,
            (parent, Access::Unset) => parent,
            (_, child) => child,
        }
    }

    /// True only for an explicit `Permit`
    pub fn is_permitted(self) -> bool {
        self == Access::Permit
    }
}

/// The five permissions governing record access
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    /// May drive an account balance below zero (asset issuance)
    #[serde(default)]
    pub account_negative: Access,
    /// May decrease an account balance
    #[serde(default)]
    pub account_spend: Access,
    /// May write account records at all
    #[serde(default)]
    pub account_modify: Access,
    /// May create account records that do not yet exist
    #[serde(default)]
    pub account_create: Access,
    /// May write data records
    #[serde(default)]
    pub data_modify: Access,
}

impl PermissionSet {
    /// All five permissions unset
    pub fn unset() -> Self {
        Self::default()
    }

    /// All five permissions granted
    pub fn permit_all() -> Self {
        Self::uniform(Access::Permit)
    }

    /// All five permissions denied
    pub fn deny_all() -> Self {
        Self::uniform(Access::Deny)
    }

    fn uniform(access: Access) -> Self {
        Self {
            account_negative: access,
            account_spend: access,
            account_modify: access,
            account_create: access,
            data_modify: access,
        }
    }

    /// Field-wise [`Access::combine`]
    pub fn combine(&self, other: &PermissionSet) -> PermissionSet {
        PermissionSet {
            account_negative: self.account_negative.combine(other.account_negative),
            account_spend: self.account_spend.combine(other.account_spend),
            account_modify: self.account_modify.combine(other.account_modify),
            account_create: self.account_create.combine(other.account_create),
            data_modify: self.data_modify.combine(other.data_modify),
        }
    }

    /// Field-wise [`Access::add_level`], `self` being the shallower level
    pub fn add_level(&self, child: &PermissionSet) -> PermissionSet {
        PermissionSet {
            account_negative: self.account_negative.add_level(child.account_negative),
            account_spend: self.account_spend.add_level(child.account_spend),
            account_modify: self.account_modify.add_level(child.account_modify),
            account_create: self.account_create.add_level(child.account_create),
            data_modify: self.data_modify.add_level(child.data_modify),
        }
    }
}

/// Record-name matcher used by ACL entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StringPattern {
    /// Matches any record name
    #[default]
    All,
    /// Matches one exact name
    Exact(String),
    /// Matches names starting with the given prefix
    Prefix(String),
}

impl StringPattern {
    /// Test a record name against the pattern
    pub fn matches(&self, name: &str) -> bool {
        match self {
            StringPattern::All => true,
            StringPattern::Exact(expected) => name == expected,
            StringPattern::Prefix(prefix) => name.starts_with(prefix),
        }
    }
}

/// One access-control entry, applying at the path level where it is attached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    /// Identities the entry applies to
    pub subjects: Vec<String>,
    /// Whether the entry also applies to descendant paths
    #[serde(default)]
    pub recursive: bool,
    /// Which record names the entry covers
    #[serde(default)]
    pub record_name: StringPattern,
    /// Granted or denied permissions
    #[serde(default)]
    pub permissions: PermissionSet,
}

impl Acl {
    fn applies(&self, identities: &[String], recursive_only: bool, record_name: &str) -> bool {
        (self.recursive || !recursive_only)
            && self.record_name.matches(record_name)
            && self
                .subjects
                .iter()
                .any(|subject| identities.iter().any(|identity| identity == subject))
    }
}

/// Source of permission opinions for one path level
///
/// `recursive_only` is true when `path` is a strict ancestor of the record's
/// path; in that case only entries marked recursive may contribute.
#[async_trait]
pub trait PermissionsProvider: Send + Sync {
    /// Permissions granted to `identities` at `path` for `record_name`
    async fn permissions(
        &self,
        identities: &[String],
        path: &LedgerPath,
        recursive_only: bool,
        record_name: &str,
    ) -> Result<PermissionSet>;
}

/// Provider backed by a fixed list of configured ACL entries
pub struct StaticAclProvider {
    entries: Vec<(LedgerPath, Acl)>,
}

impl StaticAclProvider {
    /// Create from `(path, entry)` pairs
    pub fn new(entries: Vec<(LedgerPath, Acl)>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl PermissionsProvider for StaticAclProvider {
    async fn permissions(
        &self,
        identities: &[String],
        path: &LedgerPath,
        recursive_only: bool,
        record_name: &str,
    ) -> Result<PermissionSet> {
        let mut set = PermissionSet::unset();
        for (entry_path, acl) in &self.entries {
            if entry_path == path && acl.applies(identities, recursive_only, record_name) {
                set = set.combine(&acl.permissions);
            }
        }
        Ok(set)
    }
}

/// Provider granting signers control over the subtree named after them
///
/// A path whose first segment equals a signer identity (hex public key) is
/// owned by that signer: spend, modify, create and data writes are permitted
/// there. Issuing (negative balances) is never granted by ownership.
pub struct OwnershipProvider;

#[async_trait]
impl PermissionsProvider for OwnershipProvider {
    async fn permissions(
        &self,
        identities: &[String],
        path: &LedgerPath,
        _recursive_only: bool,
        _record_name: &str,
    ) -> Result<PermissionSet> {
        let owned = path
            .segments()
            .first()
            .is_some_and(|first| identities.iter().any(|identity| identity == first));
        if !owned {
            return Ok(PermissionSet::unset());
        }
        Ok(PermissionSet {
            account_negative: Access::Unset,
            account_spend: Access::Permit,
            account_modify: Access::Permit,
            account_create: Access::Permit,
            data_modify: Access::Permit,
        })
    }
}

/// Name of the data record holding per-path ACL entries
pub const ACL_RECORD_NAME: &str = "acl";

/// Provider reading ACL entries from `{path}:DATA:acl` records
///
/// The record value is a JSON array of [`Acl`] entries. A missing record
/// contributes nothing; a malformed one is logged and treated as empty so a
/// bad ACL write cannot brick the subtree it governs.
pub struct StoredAclProvider {
    storage: Arc<dyn StorageEngine>,
}

impl StoredAclProvider {
    /// Create a provider reading from the given storage engine
    pub fn new(storage: Arc<dyn StorageEngine>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl PermissionsProvider for StoredAclProvider {
    async fn permissions(
        &self,
        identities: &[String],
        path: &LedgerPath,
        recursive_only: bool,
        record_name: &str,
    ) -> Result<PermissionSet> {
        let key = RecordKey::new(RecordType::Data, path.clone(), ACL_RECORD_NAME).to_binary();
        let record = get_record(self.storage.as_ref(), &key).await?;
        let Some(value) = record.value.filter(|v| !v.is_empty()) else {
            return Ok(PermissionSet::unset());
        };

        let entries: Vec<Acl> = match serde_json::from_slice(value.as_slice()) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "Ignoring malformed ACL record");
                return Ok(PermissionSet::unset());
            }
        };

        let mut set = PermissionSet::unset();
        for acl in &entries {
            if acl.applies(identities, recursive_only, record_name) {
                set = set.combine(&acl.permissions);
            }
        }
        Ok(set)
    }
}

/// Walks the path hierarchy and folds provider opinions into a decision
pub struct PermissionResolver {
    providers: Vec<Arc<dyn PermissionsProvider>>,
}

impl PermissionResolver {
    /// Create a resolver over a set of providers
    pub fn new(providers: Vec<Arc<dyn PermissionsProvider>>) -> Self {
        Self { providers }
    }

    /// Resolve the effective permissions for `identities` on
    /// `(path, record_name)`
    ///
    /// Levels are visited root-first; at each level all providers are
    /// combined, then the level is layered over the accumulated result.
    pub async fn resolve(
        &self,
        identities: &[String],
        path: &LedgerPath,
        record_name: &str,
    ) -> Result<PermissionSet> {
        let depth = path.segments().len();
        let mut resolved = PermissionSet::unset();
        for level in 0..=depth {
            let level_path = path.prefix(level);
            let recursive_only = level < depth;
            let mut level_set = PermissionSet::unset();
            for provider in &self.providers {
                let opinion = provider
                    .permissions(identities, &level_path, recursive_only, record_name)
                    .await?;
                level_set = level_set.combine(&opinion);
            }
            resolved = resolved.add_level(&level_set);
        }
        Ok(resolved)
    }
}

/// Mutation validator enforcing the resolved permission set
pub struct PermissionBasedValidator {
    resolver: PermissionResolver,
}

impl PermissionBasedValidator {
    /// Create a validator over a resolver
    pub fn new(resolver: PermissionResolver) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl MutationValidator for PermissionBasedValidator {
    async fn validate(
        &self,
        mutation: &ParsedMutation,
        evidence: &[SignatureEvidence],
    ) -> Result<Vec<Mutation>> {
        let identities: Vec<String> = evidence.iter().map(|e| e.identity()).collect();

        for change in &mutation.account_changes {
            let account = &change.status.account_key;
            let permissions = self
                .resolver
                .resolve(&identities, &account.account, &account.asset.to_string())
                .await?;

            if !permissions.account_modify.is_permitted() {
                return Err(Error::invalid(
                    ValidationReason::AccountModificationUnauthorized,
                    format!("cannot modify account {}", account.record_key()),
                ));
            }
            if change.previous_version.is_empty() && !permissions.account_create.is_permitted() {
                return Err(Error::invalid(
                    ValidationReason::AccountCreationUnauthorized,
                    format!("cannot create account {}", account.record_key()),
                ));
            }
            if change.delta < 0 && !permissions.account_spend.is_permitted() {
                return Err(Error::invalid(
                    ValidationReason::CannotSpendFromAccount,
                    format!("cannot spend from account {}", account.record_key()),
                ));
            }
            if change.status.balance < 0 && !permissions.account_negative.is_permitted() {
                return Err(Error::invalid(
                    ValidationReason::CannotIssueAsset,
                    format!("cannot issue from account {}", account.record_key()),
                ));
            }
        }

        for (key, _) in &mutation.data_writes {
            let permissions = self
                .resolver
                .resolve(&identities, &key.path, &key.name)
                .await?;
            if !permissions.data_modify.is_permitted() {
                return Err(Error::invalid(
                    ValidationReason::CannotModifyData,
                    format!("cannot modify data record {key}"),
                ));
            }
        }

        Ok(Vec::new())
    }
}
