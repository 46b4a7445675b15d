//! Anchor job messages and their queue consumer
//!
//! Delivery is at-least-once, so the handler checks the receipt's mode
//! before doing anything: an anchored receipt acknowledges the message
//! without touching the chain.
//!
//! A message does not anchor its receipt alone. It triggers a sweep under
//! the shared lock, so receipts queued together land in one batch and one
//! transaction.

use async_trait::async_trait;
use chrono::Utc;
use notary_core::AnchorJob;
use notary_persist::{AttestationStore, DiagnosticEntry};
use notary_queue::{
    BackoffStrategy, DeadLetterSink, Job, JobEntry, JobResult, QueueBackend, QueueError, WorkerPool,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::scheduler::Scheduler;

/// Job type the worker pool dispatches on
pub const ANCHOR_JOB_TYPE: &str = "anchor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "anchor")]
    Anchor,
}

/// `{type: "anchor", id, receiptId, attempts}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorJobMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub id: String,
    pub receipt_id: String,
    #[serde(default)]
    pub attempts: u32,
}

impl AnchorJobMessage {
    pub fn from_job(job: &AnchorJob) -> Self {
        Self {
            kind: MessageKind::Anchor,
            id: job.id.clone(),
            receipt_id: job.receipt_id.clone(),
            attempts: job.attempts,
        }
    }
}

/// Publish an anchor message on the queue named after the job's chain
pub async fn enqueue_anchor<B: QueueBackend + ?Sized>(
    queue: &B,
    job: &AnchorJob,
) -> Result<Uuid, QueueError> {
    let payload = serde_json::to_value(AnchorJobMessage::from_job(job))?;
    let id = queue.enqueue(&job.chain, ANCHOR_JOB_TYPE, payload, None).await?;
    debug!(message_id = %id, receipt_id = %job.receipt_id, chain = %job.chain, "Anchor message enqueued");
    Ok(id)
}

/// Runs a sweep on behalf of the receipt named by one message
pub struct AnchorHandler {
    scheduler: Arc<Scheduler>,
    holder: String,
    max_retries: u32,
    backoff: BackoffStrategy,
}

impl std::fmt::Debug for AnchorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnchorHandler")
            .field("holder", &self.holder)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl AnchorHandler {
    pub fn new(scheduler: Arc<Scheduler>, holder: impl Into<String>, max_retries: u32) -> Self {
        Self {
            scheduler,
            holder: holder.into(),
            max_retries: max_retries.max(1),
            backoff: BackoffStrategy::Exponential {
                initial_secs: 2,
                multiplier: 2.0,
                max_secs: 300,
            },
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Register the `anchor` job type on a worker pool
    pub fn register<B: QueueBackend + ?Sized + 'static>(self: &Arc<Self>, pool: &WorkerPool<B>) {
        let handler = self.clone();
        pool.register_job_factory(ANCHOR_JOB_TYPE, move |payload| {
            let message: AnchorJobMessage = serde_json::from_value(payload)?;
            Ok(Box::new(AnchorJobRun {
                message,
                handler: handler.clone(),
            }) as Box<dyn Job>)
        });
    }

    pub async fn handle(&self, message: &AnchorJobMessage) -> JobResult {
        let store = self.scheduler.store();
        let record = match store.get(&message.receipt_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return JobResult::Fatal(format!("receipt {} not found", message.receipt_id)),
            Err(e) if e.is_retryable() => return JobResult::Retry(e.to_string()),
            Err(e) => return JobResult::Fatal(e.to_string()),
        };

        if record.is_anchored() {
            debug!(receipt_id = %record.id, "Anchor message for anchored receipt");
            return JobResult::Success(Some(json!({
                "receiptId": record.id,
                "txHash": record.tx_hash,
                "alreadyAnchored": true,
            })));
        }
        if !record.mode.is_anchorable() {
            return JobResult::Fatal(format!("receipt {} is {}", record.id, record.mode));
        }

        let report = match self.scheduler.tick_as(&self.holder).await {
            Ok(report) if report.contended => return JobResult::Retry("sweep lock held".to_string()),
            Ok(report) => report,
            Err(e) => return JobResult::Retry(e.to_string()),
        };

        let record = match store.get(&message.receipt_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return JobResult::Fatal(format!("receipt {} not found", message.receipt_id)),
            Err(e) => return JobResult::Retry(e.to_string()),
        };
        if record.is_anchored() {
            info!(
                receipt_id = %record.id,
                tx_hash = ?record.tx_hash,
                batch_anchored = report.anchored,
                "Anchor message processed"
            );
            return JobResult::Success(Some(json!({
                "receiptId": record.id,
                "txHash": record.tx_hash,
                "merkleRoot": record.final_proof.as_ref().map(|p| p.merkle_root),
                "batchAnchored": report.anchored,
            })));
        }
        if !record.mode.is_anchorable() {
            return JobResult::Fatal(format!("receipt {} is {}", record.id, record.mode));
        }

        // still queued: outside this sweep's window, requeued, or retryable failure
        match store.has_job_for_receipt(&record.id).await {
            Ok(true) => JobResult::Retry(format!("receipt {} not anchored yet", record.id)),
            Ok(false) => JobResult::Fatal(format!(
                "anchor job for receipt {} was abandoned",
                record.id
            )),
            Err(e) => JobResult::Retry(e.to_string()),
        }
    }
}

#[derive(Debug)]
struct AnchorJobRun {
    message: AnchorJobMessage,
    handler: Arc<AnchorHandler>,
}

#[async_trait]
impl Job for AnchorJobRun {
    fn name(&self) -> &str {
        ANCHOR_JOB_TYPE
    }

    async fn execute(&mut self) -> JobResult {
        self.handler.handle(&self.message).await
    }

    fn max_retries(&self) -> u32 {
        self.handler.max_retries
    }

    fn backoff_strategy(&self) -> BackoffStrategy {
        self.handler.backoff
    }
}

/// Writes dead-lettered anchor messages to the diagnostic store
#[derive(Debug)]
pub struct DiagnosticSink {
    store: Arc<AttestationStore>,
}

impl DiagnosticSink {
    pub fn new(store: Arc<AttestationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DeadLetterSink for DiagnosticSink {
    async fn dead_letter(&self, entry: &JobEntry, reason: &str) {
        let receipt_id = match serde_json::from_value::<AnchorJobMessage>(entry.payload.clone()) {
            Ok(message) => message.receipt_id,
            Err(_) => format!("message:{}", entry.id),
        };
        let diagnostic = DiagnosticEntry {
            receipt_id: receipt_id.clone(),
            at: Utc::now(),
            stage: "dead_letter".to_string(),
            message: reason.to_string(),
            attempts: entry.attempts + 1,
        };
        if let Err(e) = self.store.record_diagnostic(diagnostic).await {
            warn!(receipt_id = %receipt_id, error = %e, "Failed to record dead letter");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnchorMode, DirectConfig};
    use crate::lock::{LockConfig, SweepLock};
    use crate::orchestrator::AnchorOrchestrator;
    use crate::scheduler::SchedulerConfig;
    use notary_anchor::{ChainConfig, ChainProviders, SigningKey, SimulatedChain};
    use notary_persist::{MemoryBackend, StoreConfig, SubmitRequest};
    use notary_queue::{JobStatus, MemoryQueue, WorkerConfig};

    struct Fixture {
        store: Arc<AttestationStore>,
        chain: Arc<SimulatedChain>,
        lock: SweepLock,
        handler: Arc<AnchorHandler>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(AttestationStore::new(
            Arc::new(MemoryBackend::new()),
            StoreConfig::default(),
        ));
        let chain = Arc::new(SimulatedChain::new(ChainConfig::default()));
        let mut providers = ChainProviders::default();
        providers.insert(chain.clone());
        let orchestrator = Arc::new(
            AnchorOrchestrator::new(
                store.clone(),
                providers,
                &AnchorMode::Direct(DirectConfig {
                    signing_key: SigningKey::new([5u8; 32]),
                }),
            )
            .unwrap(),
        );
        let lock = SweepLock::spawn(LockConfig::default(), None);
        let scheduler = Arc::new(Scheduler::new(
            orchestrator,
            lock.clone(),
            SchedulerConfig {
                batch_size: 10,
                max_attempts: 2,
                ..Default::default()
            },
        ));
        let handler = Arc::new(AnchorHandler::new(scheduler, "worker-1", 3));
        Fixture {
            store,
            chain,
            lock,
            handler,
        }
    }

    #[test]
    fn test_message_wire_shape() {
        let message = AnchorJobMessage {
            kind: MessageKind::Anchor,
            id: "j1".into(),
            receipt_id: "r1".into(),
            attempts: 2,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({"type": "anchor", "id": "j1", "receiptId": "r1", "attempts": 2})
        );
        let wrong: Result<AnchorJobMessage, _> =
            serde_json::from_value(json!({"type": "refund", "id": "j1", "receiptId": "r1"}));
        assert!(wrong.is_err());
    }

    #[tokio::test]
    async fn test_handler_anchors_then_acknowledges_redelivery() {
        let fx = fixture();
        let submitted = fx.store.submit(SubmitRequest::default()).await.unwrap();
        let message = AnchorJobMessage::from_job(&submitted.job);

        assert!(matches!(fx.handler.handle(&message).await, JobResult::Success(_)));
        let anchored = fx.store.get(&submitted.record.id).await.unwrap().unwrap();
        assert!(anchored.is_anchored());
        assert!(fx.store.list_jobs(10).await.unwrap().is_empty());

        match fx.handler.handle(&message).await {
            JobResult::Success(Some(value)) => {
                assert_eq!(value["alreadyAnchored"], true);
                assert_eq!(value["txHash"], json!(anchored.tx_hash));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fx.chain.submission_count(), 1);
        assert!(!fx.lock.status().await.unwrap().locked);
    }

    #[tokio::test]
    async fn test_handler_retries_on_contention_and_fails_on_missing() {
        let fx = fixture();
        let submitted = fx.store.submit(SubmitRequest::default()).await.unwrap();
        let message = AnchorJobMessage::from_job(&submitted.job);

        let grant = fx.lock.acquire("scheduler").await.unwrap();
        assert!(matches!(fx.handler.handle(&message).await, JobResult::Retry(_)));
        fx.lock.release(&grant.token).await.unwrap();
        assert_eq!(fx.chain.submission_count(), 0);

        let missing = AnchorJobMessage {
            receipt_id: "nope".into(),
            ..message
        };
        assert!(matches!(fx.handler.handle(&missing).await, JobResult::Fatal(_)));
    }

    #[tokio::test]
    async fn test_handler_retries_while_job_pending_and_fails_once_abandoned() {
        let fx = fixture();
        let submitted = fx.store.submit(SubmitRequest::default()).await.unwrap();
        let message = AnchorJobMessage::from_job(&submitted.job);

        fx.chain
            .fail_next_submission(notary_anchor::ChainErrorKind::Retryable);
        assert!(matches!(fx.handler.handle(&message).await, JobResult::Retry(_)));
        assert!(fx.store.has_job_for_receipt(&submitted.record.id).await.unwrap());

        // second failure reaches max_attempts and the sweep drops the job
        fx.chain
            .fail_next_submission(notary_anchor::ChainErrorKind::Retryable);
        assert!(matches!(fx.handler.handle(&message).await, JobResult::Fatal(_)));
        assert!(!fx.store.has_job_for_receipt(&submitted.record.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_queued_receipts_share_one_root_and_one_transaction() {
        let fx = fixture();
        let queue = Arc::new(MemoryQueue::new());
        let pool = WorkerPool::new_with_arc(queue.clone(), WorkerConfig::default());
        fx.handler.register(&pool);

        let mut receipts = Vec::new();
        let mut messages = Vec::new();
        for i in 0..4 {
            let submitted = fx
                .store
                .submit(SubmitRequest {
                    initiator_commit: Some(format!("queued-{i}")),
                    ..Default::default()
                })
                .await
                .unwrap();
            messages.push(enqueue_anchor(queue.as_ref(), &submitted.job).await.unwrap());
            receipts.push(submitted.record.id);
        }

        while pool.process_next().await.unwrap() {}

        assert_eq!(fx.chain.submission_count(), 1);
        let mut roots = Vec::new();
        for id in &receipts {
            let record = fx.store.get(id).await.unwrap().unwrap();
            assert!(record.is_anchored());
            roots.push(record.final_proof.unwrap().merkle_root);
        }
        roots.dedup();
        assert_eq!(roots.len(), 1);
        for id in messages {
            assert_eq!(queue.get_job(id).await.unwrap().status, JobStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_worker_pool_consumes_and_dead_letters() {
        let fx = fixture();
        let queue = Arc::new(MemoryQueue::new());
        let pool = WorkerPool::new_with_arc(queue.clone(), WorkerConfig::default())
            .with_dead_letter_sink(Arc::new(DiagnosticSink::new(fx.store.clone())));
        fx.handler.register(&pool);

        let submitted = fx.store.submit(SubmitRequest::default()).await.unwrap();
        let message_id = enqueue_anchor(queue.as_ref(), &submitted.job).await.unwrap();
        assert!(pool.process_next().await.unwrap());
        let done = queue.get_job(message_id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(fx.store.get(&submitted.record.id).await.unwrap().unwrap().is_anchored());

        // a message for a receipt that does not exist goes straight to dead letter
        let orphan = AnchorJob::new("ghost", "simulated");
        enqueue_anchor(queue.as_ref(), &orphan).await.unwrap();
        assert!(pool.process_next().await.unwrap());
        let diagnostics = fx.store.diagnostics("ghost").await.unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].stage, "dead_letter");
        assert_eq!(queue.dead_letters().await.unwrap().len(), 1);
    }
}
