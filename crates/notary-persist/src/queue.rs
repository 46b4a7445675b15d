//! Durable anchor-job queue on SQLite

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use notary_queue::{JobEntry, JobStatus, QueueBackend, QueueError};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Durable queue backend using SQLite. Delivery is at-least-once: a job
/// claimed by a worker that crashes stays `running` until `requeue_stale`.
/// While a job is `running`, `run_at` holds the claim time.
#[derive(Debug, Clone)]
pub struct SqliteQueueBackend {
    pool: SqlitePool,
}

impl SqliteQueueBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Return jobs stuck in `running` for longer than `older_than` to the queue
    pub async fn requeue_stale(&self, older_than: std::time::Duration) -> Result<u64, QueueError> {
        let cutoff = Utc::now().timestamp_millis() - older_than.as_millis() as i64;
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', locked_by = NULL WHERE status = 'running' AND run_at <= ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(result.rows_affected())
    }
}

fn backend_err(e: sqlx::Error) -> QueueError {
    QueueError::Backend(e.to_string())
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>, QueueError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| QueueError::Backend(format!("invalid timestamp {ms}")))
}

fn parse_status(status: &str, attempts: u32) -> Result<JobStatus, QueueError> {
    match status {
        "pending" => Ok(JobStatus::Pending),
        "running" => Ok(JobStatus::Running),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed(attempts)),
        "dead_letter" => Ok(JobStatus::DeadLetter),
        other => Err(QueueError::Backend(format!("Invalid status in DB: {other}"))),
    }
}

fn row_to_entry(row: &SqliteRow) -> Result<JobEntry, QueueError> {
    let id_str: String = row.try_get("id").map_err(backend_err)?;
    let id = Uuid::parse_str(&id_str).map_err(|_| QueueError::Backend("Invalid UUID".into()))?;
    let payload: String = row.try_get("payload").map_err(backend_err)?;
    let attempts: i64 = row.try_get("attempts").map_err(backend_err)?;
    let status: String = row.try_get("status").map_err(backend_err)?;
    let result: Option<String> = row.try_get("result").map_err(backend_err)?;

    Ok(JobEntry {
        id,
        queue: row.try_get("queue").map_err(backend_err)?,
        job_type: row.try_get("job_type").map_err(backend_err)?,
        payload: serde_json::from_str(&payload)?,
        status: parse_status(&status, attempts as u32)?,
        created_at: millis_to_utc(row.try_get("created_at").map_err(backend_err)?)?,
        run_at: millis_to_utc(row.try_get("run_at").map_err(backend_err)?)?,
        attempts: attempts as u32,
        last_error: row.try_get("last_error").map_err(backend_err)?,
        result: result.map(|s| serde_json::from_str(&s)).transpose()?,
    })
}

const COLUMNS: &str =
    "id, queue, job_type, payload, status, run_at, created_at, attempts, last_error, result";

#[async_trait]
impl QueueBackend for SqliteQueueBackend {
    async fn enqueue(
        &self,
        queue: &str,
        job_type: &str,
        payload: Value,
        delay_secs: Option<u64>,
    ) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        let now = Utc::now().timestamp_millis();
        let run_at = now + delay_secs.unwrap_or(0) as i64 * 1000;

        sqlx::query(
            "INSERT INTO jobs (id, queue, job_type, payload, status, run_at, created_at) VALUES (?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(id.to_string())
        .bind(queue)
        .bind(job_type)
        .bind(serde_json::to_string(&payload)?)
        .bind(run_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<JobEntry>, QueueError> {
        let worker_id = Uuid::new_v4().to_string();
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'running', locked_by = ?, run_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'pending' AND run_at <= ?
                ORDER BY run_at ASC, created_at ASC
                LIMIT 1
            )
            RETURNING {COLUMNS}
            "#
        );

        let now = Utc::now().timestamp_millis();
        let row = sqlx::query(&sql)
            .bind(worker_id)
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;

        row.as_ref().map(row_to_entry).transpose()
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
        delay_secs: Option<u64>,
    ) -> Result<(), QueueError> {
        let outcome = if let JobStatus::Failed(_) = status {
            let run_at = Utc::now().timestamp_millis() + delay_secs.unwrap_or(60) as i64 * 1000;
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'pending', last_error = ?, locked_by = NULL,
                    attempts = attempts + 1, run_at = ?
                WHERE id = ?
                "#,
            )
            .bind(error)
            .bind(run_at)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
        } else {
            sqlx::query("UPDATE jobs SET status = ?, last_error = ?, locked_by = NULL WHERE id = ?")
                .bind(status.as_str())
                .bind(error)
                .bind(id.to_string())
                .execute(&self.pool)
                .await
        };

        if outcome.map_err(backend_err)?.rows_affected() == 0 {
            return Err(QueueError::NotFound);
        }
        Ok(())
    }

    async fn get_status(&self, id: Uuid) -> Result<JobStatus, QueueError> {
        Ok(self.get_job(id).await?.status)
    }

    async fn get_job(&self, id: Uuid) -> Result<JobEntry, QueueError> {
        let sql = format!("SELECT {COLUMNS} FROM jobs WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?
            .ok_or(QueueError::NotFound)?;
        row_to_entry(&row)
    }

    async fn set_result(&self, id: Uuid, result: Value) -> Result<(), QueueError> {
        let affected = sqlx::query("UPDATE jobs SET result = ? WHERE id = ?")
            .bind(serde_json::to_string(&result)?)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend_err)?
            .rows_affected();
        if affected == 0 {
            return Err(QueueError::NotFound);
        }
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<JobEntry>, QueueError> {
        let sql = format!("SELECT {COLUMNS} FROM jobs WHERE status = 'dead_letter' ORDER BY created_at");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(row_to_entry).collect()
    }
}
