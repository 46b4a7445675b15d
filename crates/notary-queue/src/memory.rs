//! In-memory queue implementation with run-at scheduling

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::backend::{QueueBackend, QueueError};
use crate::job::{JobEntry, JobStatus};

/// Heap entry: earliest run_at first, then insertion order
#[derive(Debug, Clone, Eq, PartialEq)]
struct PriorityEntry {
    run_at: DateTime<Utc>,
    seq: u64,
    id: Uuid,
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<Uuid, JobEntry>,
    queue: BinaryHeap<PriorityEntry>,
}

#[derive(Debug, Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    seq: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// Number of jobs not yet completed or dead-lettered
    pub async fn pending_len(&self) -> usize {
        self.inner
            .lock()
            .await
            .jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Running))
            .count()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(
        &self,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        delay_secs: Option<u64>,
    ) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let run_at = now + Duration::seconds(delay_secs.unwrap_or(0) as i64);

        let entry = JobEntry {
            id,
            queue: queue.to_string(),
            job_type: job_type.to_string(),
            payload,
            status: JobStatus::Pending,
            created_at: now,
            run_at,
            attempts: 0,
            last_error: None,
            result: None,
        };

        let seq = self.next_seq();
        let mut inner = self.inner.lock().await;
        inner.jobs.insert(id, entry);
        inner.queue.push(PriorityEntry { run_at, seq, id });

        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<JobEntry>, QueueError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        while let Some(head) = inner.queue.peek() {
            if head.run_at > now {
                break;
            }
            let Some(head) = inner.queue.pop() else {
                break;
            };
            if let Some(job) = inner.jobs.get_mut(&head.id) {
                // Stale heap entries for jobs already handled are skipped
                if job.status == JobStatus::Pending && job.run_at == head.run_at {
                    job.status = JobStatus::Running;
                    return Ok(Some(job.clone()));
                }
            }
        }

        Ok(None)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
        delay_secs: Option<u64>,
    ) -> Result<(), QueueError> {
        let seq = self.next_seq();
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get_mut(&id).ok_or(QueueError::NotFound)?;

        job.status = status;
        job.last_error = error;

        if let JobStatus::Failed(retry_count) = status {
            job.attempts += 1;
            let backoff_secs = delay_secs.unwrap_or_else(|| 2_u64.pow(retry_count.min(6)));
            let run_at = Utc::now() + Duration::seconds(backoff_secs as i64);
            job.run_at = run_at;
            job.status = JobStatus::Pending;

            tracing::debug!(
                job_id = %id,
                retry_count = retry_count,
                delay_secs = backoff_secs,
                "Re-queuing job with backoff"
            );

            inner.queue.push(PriorityEntry { run_at, seq, id });
        }

        Ok(())
    }

    async fn get_status(&self, id: Uuid) -> Result<JobStatus, QueueError> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .get(&id)
            .map(|j| j.status)
            .ok_or(QueueError::NotFound)
    }

    async fn get_job(&self, id: Uuid) -> Result<JobEntry, QueueError> {
        let inner = self.inner.lock().await;
        inner.jobs.get(&id).cloned().ok_or(QueueError::NotFound)
    }

    async fn set_result(&self, id: Uuid, result: serde_json::Value) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get_mut(&id).ok_or(QueueError::NotFound)?;
        job.result = Some(result);
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<JobEntry>, QueueError> {
        let inner = self.inner.lock().await;
        let mut dead: Vec<JobEntry> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::DeadLetter)
            .cloned()
            .collect();
        dead.sort_by_key(|j| j.created_at);
        Ok(dead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_enqueue_dequeue() {
        let queue = MemoryQueue::new();
        let payload = json!({ "receiptId": "r-1" });

        let id = queue
            .enqueue("sim", "anchor", payload.clone(), None)
            .await
            .unwrap();

        let status = queue.get_status(id).await.unwrap();
        assert_eq!(status, JobStatus::Pending);

        let job = queue.dequeue().await.unwrap().expect("Should have job");
        assert_eq!(job.id, id);
        assert_eq!(job.job_type, "anchor");
        assert_eq!(job.status, JobStatus::Running);

        let empty = queue.dequeue().await.unwrap();
        assert!(empty.is_none());
    }

    #[tokio::test]
    async fn test_failed_job_is_requeued_with_attempt_count() {
        let queue = MemoryQueue::new();
        let id = queue.enqueue("sim", "anchor", json!({}), None).await.unwrap();
        queue.dequeue().await.unwrap().unwrap();

        queue
            .update_status(id, JobStatus::Failed(1), Some("rpc down".into()), Some(0))
            .await
            .unwrap();

        let job = queue.dequeue().await.unwrap().expect("requeued");
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("rpc down"));
    }

    #[tokio::test]
    async fn test_dead_letters_listed() {
        let queue = MemoryQueue::new();
        let id = queue.enqueue("sim", "anchor", json!({}), None).await.unwrap();
        queue.dequeue().await.unwrap().unwrap();
        queue
            .update_status(id, JobStatus::DeadLetter, Some("bad key".into()), None)
            .await
            .unwrap();

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_job_update_is_not_found() {
        let queue = MemoryQueue::new();
        let err = queue
            .update_status(Uuid::new_v4(), JobStatus::Completed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotFound));
    }
}
