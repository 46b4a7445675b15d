//! Job definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;
use uuid::Uuid;

/// Job Identifier
pub type JobId = Uuid;

/// Job Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting in queue
    Pending,
    /// Currently being processed
    Running,
    /// Successfully completed
    Completed,
    /// Failed (with retry count)
    Failed(u32),
    /// Permanently failed after max retries
    DeadLetter,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed(_) => "failed",
            JobStatus::DeadLetter => "dead_letter",
        }
    }
}

/// Generic Job Trait
#[async_trait::async_trait]
pub trait Job: Send + Sync + Debug {
    /// Job name/type
    fn name(&self) -> &str;

    /// Execute the job
    async fn execute(&mut self) -> JobResult;

    /// Attempts allowed before the message is dead-lettered
    fn max_retries(&self) -> u32 {
        3
    }

    /// Backoff strategy
    fn backoff_strategy(&self) -> BackoffStrategy {
        BackoffStrategy::Exponential {
            initial_secs: 1,
            multiplier: 2.0,
            max_secs: 300,
        }
    }
}

/// Result of job execution
#[derive(Debug)]
pub enum JobResult {
    /// Job succeeded, optionally with a result payload
    Success(Option<serde_json::Value>),
    /// Job failed but should retry
    Retry(String),
    /// Job failed permanently
    Fatal(String),
}

/// Retry backoff strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum BackoffStrategy {
    Constant {
        secs: u64,
    },
    Exponential {
        initial_secs: u64,
        multiplier: f64,
        max_secs: u64,
    },
}

impl BackoffStrategy {
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Constant { secs } => Duration::from_secs(*secs),
            Self::Exponential {
                initial_secs,
                multiplier,
                max_secs,
            } => {
                let exp = attempt.min(32) as i32;
                let secs = (*initial_secs as f64 * multiplier.powi(exp)).min(*max_secs as f64);
                Duration::from_secs(secs as u64)
            }
        }
    }
}

/// A persisted job entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    pub id: JobId,
    /// Logical queue the message belongs to (the anchor chain for anchor jobs)
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_is_capped() {
        let strategy = BackoffStrategy::Exponential {
            initial_secs: 1,
            multiplier: 2.0,
            max_secs: 60,
        };
        assert_eq!(strategy.delay(3), Duration::from_secs(8));
        assert_eq!(strategy.delay(10), Duration::from_secs(60));
        assert_eq!(strategy.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_status_names() {
        assert_eq!(JobStatus::Failed(2).as_str(), "failed");
        assert_eq!(JobStatus::DeadLetter.as_str(), "dead_letter");
    }
}
