//! Durable queue behaviour on a real SQLite file

use notary_persist::{SqliteBackend, SqliteQueueBackend};
use notary_queue::{JobStatus, QueueBackend};
use serde_json::json;

async fn queue() -> (SqliteQueueBackend, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("queue.db").display());
    let backend = SqliteBackend::new(&url).await.expect("sqlite");
    (SqliteQueueBackend::new(backend.pool().clone()), dir)
}

#[tokio::test]
async fn test_enqueue_dequeue_round() -> Result<(), Box<dyn std::error::Error>> {
    let (queue, _dir) = queue().await;

    let job_id = queue
        .enqueue("simulated", "anchor", json!({"receiptId": "r-1"}), None)
        .await?;

    let job = queue.dequeue().await?.expect("job should be ready");
    assert_eq!(job.id, job_id);
    assert_eq!(job.queue, "simulated");
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.payload["receiptId"], "r-1");

    // claimed jobs are not handed out twice
    assert!(queue.dequeue().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_retry_increments_attempts_and_delays() -> Result<(), Box<dyn std::error::Error>> {
    let (queue, _dir) = queue().await;
    let id = queue.enqueue("simulated", "anchor", json!({}), None).await?;
    queue.dequeue().await?.expect("ready");

    queue
        .update_status(id, JobStatus::Failed(1), Some("rpc timeout".into()), Some(30))
        .await?;
    assert!(queue.dequeue().await?.is_none(), "delayed by backoff");

    let job = queue.get_job(id).await?;
    assert_eq!(job.attempts, 1);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.last_error.as_deref(), Some("rpc timeout"));
    Ok(())
}

#[tokio::test]
async fn test_dead_letter_and_result() -> Result<(), Box<dyn std::error::Error>> {
    let (queue, _dir) = queue().await;
    let ok = queue.enqueue("simulated", "anchor", json!({}), None).await?;
    let bad = queue.enqueue("simulated", "anchor", json!({}), None).await?;
    queue.dequeue().await?;
    queue.dequeue().await?;

    queue.set_result(ok, json!({"txHash": "0xabc"})).await?;
    queue.update_status(ok, JobStatus::Completed, None, None).await?;
    queue
        .update_status(bad, JobStatus::DeadLetter, Some("fatal".into()), None)
        .await?;

    assert_eq!(queue.get_job(ok).await?.result, Some(json!({"txHash": "0xabc"})));
    let dead = queue.dead_letters().await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, bad);
    Ok(())
}

#[tokio::test]
async fn test_stale_running_jobs_requeued() -> Result<(), Box<dyn std::error::Error>> {
    let (queue, _dir) = queue().await;
    let id = queue.enqueue("simulated", "anchor", json!({}), None).await?;
    queue.dequeue().await?;

    assert_eq!(queue.requeue_stale(std::time::Duration::ZERO).await?, 1);
    assert_eq!(queue.dequeue().await?.map(|j| j.id), Some(id));
    Ok(())
}
