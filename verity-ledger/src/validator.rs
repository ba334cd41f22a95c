//! Transaction validation pipeline
//!
//! [`TransactionValidator::post_transaction`] is the single write path into
//! the ledger. It decodes and shape-checks the mutation, verifies signature
//! evidence, interprets account records and enforces per-asset zero-sum,
//! delegates policy to a pluggable [`MutationValidator`], then commits the
//! transaction (plus any validator follow-ups) as one atomic batch.
//!
//! Rejections carry a stable [`ValidationReason`] code; a version conflict
//! detected here or at commit time surfaces as `OptimisticConcurrency` and is
//! retryable after re-reading the conflicting records.

use crate::{
    crypto::{self, SignatureEvidence, SignatureVerifier},
    error::{Error, Result, ValidationReason},
    metrics::Metrics,
    path::{decode_balance, AccountStatus, RecordKey, RecordType},
    storage::{get_record, StorageEngine},
    types::{ByteString, Mutation, Transaction},
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

/// One account record write, interpreted against current storage state
#[derive(Debug, Clone)]
pub struct AccountChange {
    /// Resulting account state; `version` is the claimed previous version
    pub status: AccountStatus,
    /// Balance delta against the current stored balance
    pub delta: i64,
    /// Version of the record as currently stored (empty for creation)
    pub previous_version: ByteString,
}

/// A mutation interpreted into account and data writes
///
/// Version-check records carry no value and need no policy decision; they are
/// enforced by the storage engine at commit time.
#[derive(Debug, Clone, Default)]
pub struct ParsedMutation {
    /// Account record writes with computed deltas
    pub account_changes: Vec<AccountChange>,
    /// Data record writes as `(key, new value)`
    pub data_writes: Vec<(RecordKey, ByteString)>,
}

/// Pluggable policy decision over a parsed mutation
///
/// Returns follow-up mutations to commit atomically with the validated one,
/// or an empty list. Follow-ups are shape- and balance-checked but do not
/// re-enter policy validation.
#[async_trait]
pub trait MutationValidator: Send + Sync {
    /// Accept, reject, or extend the mutation
    async fn validate(
        &self,
        mutation: &ParsedMutation,
        evidence: &[SignatureEvidence],
    ) -> Result<Vec<Mutation>>;
}

/// Encode signature evidence for the transaction metadata field
pub fn encode_evidence(evidence: &[SignatureEvidence]) -> Result<ByteString> {
    Ok(ByteString::new(bincode::serialize(evidence)?))
}

/// Decode signature evidence from transaction metadata
pub fn decode_evidence(metadata: &ByteString) -> Result<Vec<SignatureEvidence>> {
    if metadata.is_empty() {
        return Ok(Vec::new());
    }
    Ok(bincode::deserialize(metadata.as_slice())?)
}

/// The ledger write path
pub struct TransactionValidator {
    storage: Arc<dyn StorageEngine>,
    validator: Arc<dyn MutationValidator>,
    verifier: Arc<dyn SignatureVerifier>,
    namespace: ByteString,
    max_key_size: usize,
    metrics: Arc<Metrics>,
}

impl TransactionValidator {
    /// Create a validator over a storage engine and policy validator
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        validator: Arc<dyn MutationValidator>,
        verifier: Arc<dyn SignatureVerifier>,
        namespace: ByteString,
        max_key_size: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            storage,
            validator,
            verifier,
            namespace,
            max_key_size,
            metrics,
        }
    }

    /// Validate and commit one mutation; returns the transaction hash
    pub async fn post_transaction(
        &self,
        raw_mutation: &ByteString,
        evidence: &[SignatureEvidence],
    ) -> Result<ByteString> {
        let timer = self.metrics.post_duration.start_timer();
        let result = self.post_inner(raw_mutation, evidence).await;
        timer.observe_duration();

        match &result {
            Ok(hash) => {
                self.metrics.transactions_committed.inc();
                tracing::info!(transaction = %hash, "Transaction committed");
            }
            Err(err) => {
                let reason = err
                    .reason()
                    .map(|r| r.code().to_string())
                    .unwrap_or_else(|| "InternalError".to_string());
                if reason == ValidationReason::OptimisticConcurrency.code() {
                    self.metrics.concurrency_conflicts.inc();
                }
                self.metrics
                    .transactions_rejected
                    .with_label_values(&[reason.as_str()])
                    .inc();
                tracing::warn!(reason, error = %err, "Transaction rejected");
            }
        }
        result
    }

    async fn post_inner(
        &self,
        raw_mutation: &ByteString,
        evidence: &[SignatureEvidence],
    ) -> Result<ByteString> {
        let mutation = Mutation::deserialize(raw_mutation)?;
        self.check_namespace(&mutation)?;
        if mutation.records.is_empty() {
            return Err(Error::invalid(
                ValidationReason::InvalidMutation,
                "mutation contains no records",
            ));
        }

        let parsed = self.parse_mutation(&mutation).await?;
        self.verify_evidence(raw_mutation, evidence)?;
        let follow_ups = self.validator.validate(&parsed, evidence).await?;

        let timestamp = Utc::now().timestamp_millis();
        let transaction = Transaction::new(
            raw_mutation.clone(),
            timestamp,
            encode_evidence(evidence)?,
        );
        let raw_transaction = transaction.serialize()?;

        let mut batch = vec![raw_transaction.clone()];
        for follow_up in &follow_ups {
            self.check_namespace(follow_up)?;
            let raw = follow_up.serialize()?;
            // Follow-ups obey the same balance rules as the primary mutation.
            self.parse_mutation(follow_up).await?;
            batch.push(
                Transaction::new(raw, timestamp, ByteString::empty()).serialize()?,
            );
        }

        // A commit-time version conflict surfaces to clients as a stable
        // OptimisticConcurrency rejection, same as one caught during parsing.
        match self.storage.add_transactions(&batch).await {
            Ok(()) => {}
            Err(Error::ConcurrentMutation(record)) => {
                return Err(Error::invalid(
                    ValidationReason::OptimisticConcurrency,
                    format!("record {} was modified concurrently", record.key),
                ));
            }
            Err(err) => return Err(err),
        }
        Ok(crypto::hash(&raw_transaction))
    }

    fn check_namespace(&self, mutation: &Mutation) -> Result<()> {
        if mutation.namespace != self.namespace {
            return Err(Error::invalid(
                ValidationReason::InvalidNamespace,
                format!(
                    "mutation namespace {} does not match ledger namespace {}",
                    mutation.namespace, self.namespace
                ),
            ));
        }
        Ok(())
    }

    fn verify_evidence(
        &self,
        raw_mutation: &ByteString,
        evidence: &[SignatureEvidence],
    ) -> Result<()> {
        let digest = crypto::hash(raw_mutation);
        for item in evidence {
            if !self
                .verifier
                .verify(&item.public_key, digest.as_slice(), &item.signature)
            {
                return Err(Error::invalid(
                    ValidationReason::InvalidSignature,
                    format!("signature verification failed for {}", item.identity()),
                ));
            }
        }
        Ok(())
    }

    /// Interpret record writes and enforce the per-asset zero-sum rule
    async fn parse_mutation(&self, mutation: &Mutation) -> Result<ParsedMutation> {
        let mut parsed = ParsedMutation::default();

        for record in &mutation.records {
            if record.key.len() > self.max_key_size {
                return Err(Error::invalid(
                    ValidationReason::InvalidMutation,
                    format!(
                        "record key length {} exceeds maximum {}",
                        record.key.len(),
                        self.max_key_size
                    ),
                ));
            }
            let key = RecordKey::parse(&record.key)?;

            let Some(value) = &record.value else {
                // Version-check only; enforced by the storage engine.
                continue;
            };

            match key.record_type {
                RecordType::Account => {
                    let current = get_record(self.storage.as_ref(), &record.key).await?;
                    if current.version != record.version {
                        return Err(Error::invalid(
                            ValidationReason::OptimisticConcurrency,
                            format!("record {key} was modified since it was read"),
                        ));
                    }
                    let previous_balance =
                        decode_balance(&current.value.clone().unwrap_or_default())?;
                    let status = AccountStatus::from_record(&key, record)?;
                    let delta = status
                        .balance
                        .checked_sub(previous_balance)
                        .ok_or_else(|| {
                            Error::invalid(
                                ValidationReason::UnbalancedTransaction,
                                format!("balance delta overflow on {key}"),
                            )
                        })?;
                    parsed.account_changes.push(AccountChange {
                        status,
                        delta,
                        previous_version: current.version,
                    });
                }
                RecordType::Data => {
                    parsed.data_writes.push((key, value.clone()));
                }
            }
        }

        self.check_zero_sum(&parsed)?;
        Ok(parsed)
    }

    fn check_zero_sum(&self, parsed: &ParsedMutation) -> Result<()> {
        let mut totals: HashMap<String, i128> = HashMap::new();
        for change in &parsed.account_changes {
            let asset = change.status.account_key.asset.to_string();
            *totals.entry(asset).or_insert(0) += i128::from(change.delta);
        }
        for (asset, total) in totals {
            if total != 0 {
                return Err(Error::invalid(
                    ValidationReason::UnbalancedTransaction,
                    format!("asset {asset} deltas sum to {total}, expected 0"),
                ));
            }
        }
        Ok(())
    }
}
