//! Attestation receipts, anchor jobs, and the records around them
//!
//! Pure data access over a [`StorageBackend`]. Key namespaces:
//!
//! | prefix                  | value                                 |
//! |-------------------------|---------------------------------------|
//! | `receipt:{id}`          | [`AttestRecord`]                      |
//! | `commit:{commitment}`   | receipt id                            |
//! | `target:{type}:{id}`    | receipt ids, oldest first             |
//! | `scope:{scope}`         | receipt ids in hash-chain order       |
//! | `job:{id}`              | [`AnchorJob`] (with TTL)              |
//! | `batch:{root}`          | [`BatchManifest`]                     |
//! | `diag:{receipt_id}`     | [`DiagnosticEntry`] list, newest last |
//!
//! Every backend call is bounded by `StoreConfig::op_timeout`.

use chrono::{DateTime, Utc};
use notary_core::{AnchorJob, AnchorVia, AttestRecord, Hash, NewReceipt, ReceiptMode, TargetRef};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{StorageBackend, StorageError, StorageExt};

const RECEIPT_PREFIX: &str = "receipt:";
const COMMIT_PREFIX: &str = "commit:";
const TARGET_PREFIX: &str = "target:";
const SCOPE_PREFIX: &str = "scope:";
const JOB_PREFIX: &str = "job:";
const BATCH_PREFIX: &str = "batch:";
const DIAG_PREFIX: &str = "diag:";

/// Diagnostic entries kept per receipt
pub const MAX_DIAGNOSTICS: usize = 20;

/// Store settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Lifetime of an anchor job record
    pub job_ttl: Duration,
    /// Upper bound on any single backend call
    pub op_timeout: Duration,
    /// Receipts not anchored within this window become expirable
    pub receipt_window: Option<Duration>,
    pub policy_version: String,
    pub default_chain: String,
    /// Chains a submission may name; empty accepts any
    pub accepted_chains: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            job_ttl: Duration::from_secs(24 * 60 * 60),
            op_timeout: Duration::from_secs(5),
            receipt_window: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            policy_version: "v1".to_string(),
            default_chain: "simulated".to_string(),
            accepted_chains: vec!["simulated".to_string()],
        }
    }
}

/// Input to [`AttestationStore::submit`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// Content commitment; a random one is generated when absent
    pub initiator_commit: Option<String>,
    pub counter_commit: Option<String>,
    pub chain_scope: Option<String>,
    pub target: Option<TargetRef>,
    pub chain: Option<String>,
}

/// What a submitter gets back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub id: String,
    pub mode: ReceiptMode,
    pub received_at: DateTime<Utc>,
    pub policy_version: String,
}

/// A freshly stored receipt and its anchor job
#[derive(Debug, Clone)]
pub struct Submitted {
    pub record: AttestRecord,
    pub job: AnchorJob,
}

impl Submitted {
    pub fn response(&self) -> SubmitResponse {
        SubmitResponse {
            id: self.record.id.clone(),
            mode: self.record.mode,
            received_at: self.record.received_at,
            policy_version: self.record.policy_version.clone(),
        }
    }
}

/// One receipt's slot in an anchored batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub receipt_id: String,
    pub leaf_hash: Hash,
    pub index: u64,
    pub proof: Vec<Hash>,
}

/// The complete proof set of a submitted batch, written before any receipt
/// is updated so an interrupted write loop can be finished later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchManifest {
    pub merkle_root: Hash,
    pub tx_hash: String,
    pub chain: String,
    pub entries: Vec<ManifestEntry>,
    pub anchored_at: DateTime<Utc>,
    pub completed: bool,
    #[serde(default)]
    pub via: AnchorVia,
}

/// A recorded failure for one receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticEntry {
    pub receipt_id: String,
    pub at: DateTime<Utc>,
    /// Where it failed, e.g. `sweep`, `anchor`, `dead_letter`
    pub stage: String,
    pub message: String,
    pub attempts: u32,
}

/// Receipt and job persistence
#[derive(Debug)]
pub struct AttestationStore {
    backend: Arc<dyn StorageBackend>,
    config: StoreConfig,
    // serializes scope head reads with the append that follows
    scope_guard: Mutex<()>,
}

impl AttestationStore {
    pub fn new(backend: Arc<dyn StorageBackend>, config: StoreConfig) -> Self {
        Self {
            backend,
            config,
            scope_guard: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn timed<T, F>(&self, op: &str, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        match tokio::time::timeout(self.config.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, timeout_ms = self.config.op_timeout.as_millis() as u64, "Store call timed out");
                Err(StorageError::Timeout(op.to_string()))
            }
        }
    }

    async fn read<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        self.timed(key, self.backend.get::<T>(key)).await
    }

    async fn write<T: Serialize + Send + Sync>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        self.timed(key, self.backend.set(key, value)).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.timed(prefix, self.backend.list_keys(prefix)).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        self.timed(key, self.backend.delete(key)).await
    }

    // ----- submission -------------------------------------------------------

    /// Create a pending receipt, its indexes, scope link, and anchor job
    pub async fn submit(&self, req: SubmitRequest) -> Result<Submitted, StorageError> {
        let initiator_commit = match req.initiator_commit {
            Some(c) if c.trim().is_empty() => {
                return Err(StorageError::Invalid("initiator commitment is empty".into()))
            }
            Some(c) => c,
            None => hex::encode(rand::random::<[u8; 32]>()),
        };
        if let Some(target) = &req.target {
            if target.target_type.is_empty() || target.target_type.contains(':') {
                return Err(StorageError::Invalid(format!(
                    "invalid target type '{}'",
                    target.target_type
                )));
            }
        }

        let commit_key = format!("{COMMIT_PREFIX}{initiator_commit}");
        if self.read::<String>(&commit_key).await?.is_some() {
            return Err(StorageError::AlreadyExists(format!(
                "commitment {initiator_commit}"
            )));
        }

        let received_at = Utc::now();
        let expires_at = self
            .config
            .receipt_window
            .and_then(|w| chrono::Duration::from_std(w).ok())
            .map(|w| received_at + w);
        let chain = req.chain.unwrap_or_else(|| self.config.default_chain.clone());
        if !self.config.accepted_chains.is_empty() && !self.config.accepted_chains.contains(&chain) {
            return Err(StorageError::Invalid(format!("unknown chain '{chain}'")));
        }

        let mut params = NewReceipt {
            id: Uuid::new_v4().to_string(),
            initiator_commit,
            counter_commit: req.counter_commit,
            received_at,
            policy_version: self.config.policy_version.clone(),
            previous_hash: None,
            chain_scope: req.chain_scope,
            expires_at,
            target: req.target,
            chain: chain.clone(),
        };

        let record = match params.chain_scope.clone() {
            Some(scope) => {
                let _guard = self.scope_guard.lock().await;
                let scope_key = format!("{SCOPE_PREFIX}{scope}");
                let mut ids: Vec<String> = self.read(&scope_key).await?.unwrap_or_default();
                if let Some(head_id) = ids.last() {
                    let head = self
                        .get(head_id)
                        .await?
                        .ok_or_else(|| StorageError::NotFound(format!("scope head {head_id}")))?;
                    params.previous_hash = Some(head.record_hash);
                }
                let record = AttestRecord::new(params);
                self.put_record(&record).await?;
                ids.push(record.id.clone());
                self.write(&scope_key, &ids).await?;
                record
            }
            None => {
                let record = AttestRecord::new(params);
                self.put_record(&record).await?;
                record
            }
        };

        self.write(&commit_key, &record.id).await?;
        if let Some(target) = &record.target {
            let target_key = format!("{TARGET_PREFIX}{}:{}", target.target_type, target.id);
            let mut ids: Vec<String> = self.read(&target_key).await?.unwrap_or_default();
            ids.push(record.id.clone());
            self.write(&target_key, &ids).await?;
        }

        let job = AnchorJob::new(record.id.clone(), chain);
        self.put_job(&job).await?;

        info!(
            receipt_id = %record.id,
            chain = %record.chain,
            scoped = record.chain_scope.is_some(),
            "Attestation submitted"
        );
        Ok(Submitted { record, job })
    }

    /// Attach the counterparty commitment: pending -> confirmed
    pub async fn confirm(&self, id: &str, counter_commit: String) -> Result<AttestRecord, StorageError> {
        let mut record = self
            .get(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("receipt {id}")))?;
        record
            .confirm(counter_commit)
            .map_err(|e| StorageError::Invalid(e.to_string()))?;
        self.put_record(&record).await?;
        debug!(receipt_id = %id, "Receipt confirmed");
        Ok(record)
    }

    // ----- receipts ---------------------------------------------------------

    pub async fn get(&self, id: &str) -> Result<Option<AttestRecord>, StorageError> {
        self.read(&format!("{RECEIPT_PREFIX}{id}")).await
    }

    /// Overwrite a receipt in a single write
    pub async fn put_record(&self, record: &AttestRecord) -> Result<(), StorageError> {
        self.write(&format!("{RECEIPT_PREFIX}{}", record.id), record)
            .await
    }

    pub async fn find_by_commit(&self, commitment: &str) -> Result<Option<AttestRecord>, StorageError> {
        match self
            .read::<String>(&format!("{COMMIT_PREFIX}{commitment}"))
            .await?
        {
            Some(id) => self.get(&id).await,
            None => Ok(None),
        }
    }

    /// Resolve a receipt id or an initiator commitment
    pub async fn locate(&self, hash: &str) -> Result<Option<AttestRecord>, StorageError> {
        let hash = hash.trim();
        if hash.is_empty() {
            return Ok(None);
        }
        if let Some(record) = self.get(hash).await? {
            return Ok(Some(record));
        }
        self.find_by_commit(hash).await
    }

    /// Most recent receipt about a target
    pub async fn find_by_target(
        &self,
        target_type: &str,
        target_id: &str,
    ) -> Result<Option<AttestRecord>, StorageError> {
        let ids: Vec<String> = self
            .read(&format!("{TARGET_PREFIX}{target_type}:{target_id}"))
            .await?
            .unwrap_or_default();
        match ids.last() {
            Some(id) => self.get(id).await,
            None => Ok(None),
        }
    }

    /// Receipts of a scope in hash-chain order
    pub async fn scope_records(&self, scope: &str) -> Result<Vec<AttestRecord>, StorageError> {
        let ids: Vec<String> = self
            .read(&format!("{SCOPE_PREFIX}{scope}"))
            .await?
            .unwrap_or_default();
        let mut records = Vec::with_capacity(ids.len());
        for id in &ids {
            let record = self
                .get(id)
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("receipt {id} in scope {scope}")))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Receipts whose mode is one of `modes`
    pub async fn receipts_in_modes(&self, modes: &[ReceiptMode]) -> Result<Vec<AttestRecord>, StorageError> {
        let mut out = Vec::new();
        for key in self.keys(RECEIPT_PREFIX).await? {
            if let Some(record) = self.read::<AttestRecord>(&key).await? {
                if modes.contains(&record.mode) {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    // ----- anchor jobs ------------------------------------------------------

    pub async fn put_job(&self, job: &AnchorJob) -> Result<(), StorageError> {
        let key = format!("{JOB_PREFIX}{}", job.id);
        self.timed(
            &key,
            self.backend.set_with_ttl(&key, job, self.config.job_ttl),
        )
        .await
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<AnchorJob>, StorageError> {
        self.read(&format!("{JOB_PREFIX}{id}")).await
    }

    /// Oldest live jobs first, at most `limit`
    pub async fn list_jobs(&self, limit: usize) -> Result<Vec<AnchorJob>, StorageError> {
        let mut jobs = Vec::new();
        for key in self.keys(JOB_PREFIX).await? {
            // a job may expire or be deleted between list and read
            if let Some(job) = self.read::<AnchorJob>(&key).await? {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    pub async fn delete_job(&self, id: &str) -> Result<bool, StorageError> {
        self.remove(&format!("{JOB_PREFIX}{id}")).await
    }

    /// Whether any live job still points at `receipt_id`
    pub async fn has_job_for_receipt(&self, receipt_id: &str) -> Result<bool, StorageError> {
        for key in self.keys(JOB_PREFIX).await? {
            if let Some(job) = self.read::<AnchorJob>(&key).await? {
                if job.receipt_id == receipt_id {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Drop every job that points at `receipt_id`
    pub async fn delete_jobs_for_receipt(&self, receipt_id: &str) -> Result<usize, StorageError> {
        let mut removed = 0;
        for key in self.keys(JOB_PREFIX).await? {
            if let Some(job) = self.read::<AnchorJob>(&key).await? {
                if job.receipt_id == receipt_id && self.remove(&key).await? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    // ----- batch manifests --------------------------------------------------

    pub async fn put_manifest(&self, manifest: &BatchManifest) -> Result<(), StorageError> {
        self.write(&format!("{BATCH_PREFIX}{}", manifest.merkle_root), manifest)
            .await
    }

    pub async fn get_manifest(&self, root: &Hash) -> Result<Option<BatchManifest>, StorageError> {
        self.read(&format!("{BATCH_PREFIX}{root}")).await
    }

    pub async fn incomplete_manifests(&self) -> Result<Vec<BatchManifest>, StorageError> {
        let mut out = Vec::new();
        for key in self.keys(BATCH_PREFIX).await? {
            if let Some(manifest) = self.read::<BatchManifest>(&key).await? {
                if !manifest.completed {
                    out.push(manifest);
                }
            }
        }
        out.sort_by_key(|m| m.anchored_at);
        Ok(out)
    }

    // ----- diagnostics ------------------------------------------------------

    pub async fn record_diagnostic(&self, entry: DiagnosticEntry) -> Result<(), StorageError> {
        let key = format!("{DIAG_PREFIX}{}", entry.receipt_id);
        let mut entries: Vec<DiagnosticEntry> = self.read(&key).await?.unwrap_or_default();
        entries.push(entry);
        if entries.len() > MAX_DIAGNOSTICS {
            let excess = entries.len() - MAX_DIAGNOSTICS;
            entries.drain(..excess);
        }
        self.write(&key, &entries).await
    }

    pub async fn diagnostics(&self, receipt_id: &str) -> Result<Vec<DiagnosticEntry>, StorageError> {
        Ok(self
            .read(&format!("{DIAG_PREFIX}{receipt_id}"))
            .await?
            .unwrap_or_default())
    }

    /// Reclaim space held by expired keys (lapsed jobs, stale lock records)
    pub async fn purge_expired(&self) -> Result<u64, StorageError> {
        self.timed("purge_expired", self.backend.purge_expired()).await
    }

    pub async fn is_healthy(&self) -> bool {
        matches!(
            tokio::time::timeout(self.config.op_timeout, self.backend.is_healthy()).await,
            Ok(true)
        )
    }
}
