//! Periodic anchoring sweep
//!
//! Every tick runs under the sweep lock. A tick that cannot get the lock
//! does nothing and waits for the next one.

use chrono::Utc;
use notary_core::{AnchorJob, AttestRecord};
use notary_persist::{AttestationStore, DiagnosticEntry, StorageError};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::expiry::expire_overdue;
use crate::lock::{LockError, SweepLock};
use crate::orchestrator::{AnchorOrchestrator, OrchestratorError};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    /// Jobs read per tick
    pub batch_size: usize,
    /// Failed sweeps before a job is abandoned
    pub max_attempts: u32,
    /// Identity used when acquiring the lock
    pub holder: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 100,
            max_attempts: 5,
            holder: "scheduler".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// The lock was held by someone else; nothing ran
    pub contended: bool,
    pub resumed: usize,
    pub anchored: usize,
    /// Jobs dropped because their receipt was anchored, terminal or gone
    pub dropped: usize,
    pub failed: usize,
    pub abandoned: usize,
    /// Receipts that changed while their batch was in flight; their jobs stay queued
    pub requeued: usize,
    pub expired: usize,
    /// Expired keys physically removed from the backend
    pub purged: u64,
    pub batches: usize,
}

pub struct Scheduler {
    store: Arc<AttestationStore>,
    orchestrator: Arc<AnchorOrchestrator>,
    lock: SweepLock,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<AnchorOrchestrator>,
        lock: SweepLock,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store: orchestrator.store().clone(),
            orchestrator,
            lock,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Tick on `config.interval` until `shutdown` resolves
    pub async fn run_until<F: Future<Output = ()>>(&self, shutdown: F) {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.config.interval.as_secs(), holder = %self.config.holder, "Scheduler started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Sweep failed");
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }

    pub fn store(&self) -> &Arc<AttestationStore> {
        &self.store
    }

    /// One sweep
    pub async fn tick(&self) -> Result<SweepReport, SchedulerError> {
        self.tick_as(&self.config.holder).await
    }

    /// One sweep, taking the lock under `holder`
    pub async fn tick_as(&self, holder: &str) -> Result<SweepReport, SchedulerError> {
        let grant = match self.lock.acquire(holder).await {
            Ok(grant) => grant,
            Err(LockError::Contention { holder, expires_at }) => {
                debug!(holder = %holder, expires_at = %expires_at, "Sweep skipped: lock held");
                return Ok(SweepReport {
                    contended: true,
                    ..Default::default()
                });
            }
            Err(e) => return Err(e.into()),
        };

        let result = self.sweep().await;

        if let Err(e) = self.lock.release(&grant.token).await {
            warn!(error = %e, "Failed to release sweep lock");
        }

        let report = result?;
        if report.anchored + report.failed + report.resumed + report.requeued + report.expired > 0 {
            info!(
                holder,
                anchored = report.anchored,
                failed = report.failed,
                abandoned = report.abandoned,
                requeued = report.requeued,
                resumed = report.resumed,
                expired = report.expired,
                batches = report.batches,
                "Sweep finished"
            );
        }
        Ok(report)
    }

    async fn sweep(&self) -> Result<SweepReport, StorageError> {
        let mut report = SweepReport::default();

        for manifest in self.store.incomplete_manifests().await? {
            let root = manifest.merkle_root;
            match self.orchestrator.resume_batch(manifest).await {
                Ok(outcome) => {
                    report.resumed += outcome.receipt_ids.len();
                    report.requeued += outcome.requeued.len();
                }
                Err(e) => warn!(root = %root, error = %e, "Failed to resume batch"),
            }
        }

        let jobs = self.store.list_jobs(self.config.batch_size).await?;
        let mut groups: BTreeMap<String, Vec<(AnchorJob, AttestRecord)>> = BTreeMap::new();
        for job in jobs {
            match self.store.get(&job.receipt_id).await? {
                Some(record) if record.mode.is_anchorable() && !record.is_anchored() => {
                    groups.entry(record.chain.clone()).or_default().push((job, record));
                }
                other => {
                    debug!(
                        job_id = %job.id,
                        receipt_id = %job.receipt_id,
                        mode = ?other.map(|r| r.mode),
                        "Dropping anchor job"
                    );
                    self.store.delete_job(&job.id).await?;
                    report.dropped += 1;
                }
            }
        }

        for (chain, entries) in groups {
            report.batches += 1;
            if let Err(e) = self.run_group(&chain, entries, &mut report).await {
                warn!(chain = %chain, error = %e, "Sweep group aborted");
            }
        }

        match expire_overdue(&self.store, Utc::now()).await {
            Ok(expired) => report.expired = expired.len(),
            Err(e) => warn!(error = %e, "Expiry pass failed"),
        }
        match self.store.purge_expired().await {
            Ok(purged) => report.purged = purged,
            Err(e) => warn!(error = %e, "Purge of expired keys failed"),
        }
        Ok(report)
    }

    async fn run_group(
        &self,
        chain: &str,
        entries: Vec<(AnchorJob, AttestRecord)>,
        report: &mut SweepReport,
    ) -> Result<(), StorageError> {
        let mut records: Vec<AttestRecord> = Vec::with_capacity(entries.len());
        for (_, record) in &entries {
            // one receipt may have several jobs after redelivery
            if !records.iter().any(|r| r.id == record.id) {
                records.push(record.clone());
            }
        }

        match self.orchestrator.anchor_batch(records).await {
            Ok(outcome) => {
                report.anchored += outcome.receipt_ids.len();
                report.requeued += outcome.requeued.len();
                for (job, _) in &entries {
                    if outcome.requeued.contains(&job.receipt_id) {
                        debug!(job_id = %job.id, receipt_id = %job.receipt_id, "Keeping job for the next batch");
                        continue;
                    }
                    self.store.delete_job(&job.id).await?;
                }
            }
            Err(e) => {
                warn!(chain, jobs = entries.len(), error = %e, "Batch failed");
                for (job, _) in entries {
                    if self.record_failure(job, &e).await? {
                        report.abandoned += 1;
                    }
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Bump attempts and write a diagnostic. Returns true when the job was abandoned.
    async fn record_failure(
        &self,
        mut job: AnchorJob,
        error: &OrchestratorError,
    ) -> Result<bool, StorageError> {
        job.attempts += 1;
        let abandon = !error.is_retryable() || job.attempts >= self.config.max_attempts;

        let message = if abandon {
            format!("abandoned after {} attempt(s): {error}", job.attempts)
        } else {
            error.to_string()
        };
        self.store
            .record_diagnostic(DiagnosticEntry {
                receipt_id: job.receipt_id.clone(),
                at: Utc::now(),
                stage: "sweep".to_string(),
                message,
                attempts: job.attempts,
            })
            .await?;

        if abandon {
            warn!(job_id = %job.id, receipt_id = %job.receipt_id, attempts = job.attempts, "Abandoning anchor job");
            self.store.delete_job(&job.id).await?;
        } else {
            self.store.put_job(&job).await?;
        }
        Ok(abandon)
    }
}
