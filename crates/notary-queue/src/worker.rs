//! Worker Pool for processing jobs

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::backend::{QueueBackend, QueueError};
use crate::job::{Job, JobEntry, JobResult, JobStatus};

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub max_concurrency: usize,
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Receives messages that will not be retried again
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, entry: &JobEntry, reason: &str);
}

type JobFactory =
    Box<dyn Fn(serde_json::Value) -> Result<Box<dyn Job>, serde_json::Error> + Send + Sync>;

#[derive(Default)]
struct JobRegistry {
    factories: RwLock<HashMap<String, JobFactory>>,
}

impl JobRegistry {
    fn build(&self, entry: &JobEntry) -> Option<Result<Box<dyn Job>, serde_json::Error>> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        factories
            .get(&entry.job_type)
            .map(|f| f(entry.payload.clone()))
    }

    fn insert(&self, name: &str, factory: JobFactory) {
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), factory);
    }
}

pub struct WorkerPool<B: QueueBackend + ?Sized> {
    pub backend: Arc<B>,
    config: WorkerConfig,
    registry: Arc<JobRegistry>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
}

impl<B: QueueBackend + 'static> WorkerPool<B> {
    pub fn new(backend: B, config: WorkerConfig) -> Self {
        Self::new_with_arc(Arc::new(backend), config)
    }
}

impl<B: QueueBackend + ?Sized + 'static> WorkerPool<B> {
    /// Create new worker pool from existing Arc backend (supports dyn dispatch)
    pub fn new_with_arc(backend: Arc<B>, config: WorkerConfig) -> Self {
        Self {
            backend,
            config,
            registry: Arc::new(JobRegistry::default()),
            dead_letter: None,
        }
    }

    /// Forward dead-lettered messages to a sink
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    /// Register a job type handler
    pub fn register_job_type<J: Job + DeserializeOwned + 'static>(&self, name: &str) {
        self.registry.insert(
            name,
            Box::new(|payload: serde_json::Value| {
                let job: J = serde_json::from_value(payload)?;
                Ok(Box::new(job) as Box<dyn Job>)
            }),
        );
    }

    /// Register a custom factory (for jobs with injected dependencies)
    pub fn register_job_factory<F>(&self, name: &str, factory: F)
    where
        F: Fn(serde_json::Value) -> Result<Box<dyn Job>, serde_json::Error> + Send + Sync + 'static,
    {
        self.registry.insert(name, Box::new(factory));
    }

    /// Dequeue and process a single job inline. Returns false when nothing was ready.
    pub async fn process_next(&self) -> Result<bool, QueueError> {
        match self.backend.dequeue().await? {
            Some(entry) => {
                process_entry(
                    self.backend.clone(),
                    self.registry.clone(),
                    self.dead_letter.clone(),
                    entry,
                )
                .await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn start(&self) {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run the polling loop until `shutdown` resolves. In-flight jobs are not awaited.
    pub async fn run_until<F: Future<Output = ()>>(&self, shutdown: F) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        tokio::pin!(shutdown);

        info!(
            "Worker pool started with concurrency {}",
            self.config.max_concurrency
        );

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.backend.dequeue().await {
                Ok(Some(entry)) => {
                    let backend = self.backend.clone();
                    let registry = self.registry.clone();
                    let sink = self.dead_letter.clone();
                    tokio::spawn(async move {
                        process_entry(backend, registry, sink, entry).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!("Queue error: {}", e);
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!("Worker pool stopped");
    }
}

async fn process_entry<B: QueueBackend + ?Sized>(
    backend: Arc<B>,
    registry: Arc<JobRegistry>,
    sink: Option<Arc<dyn DeadLetterSink>>,
    entry: JobEntry,
) {
    let mut job = match registry.build(&entry) {
        Some(Ok(job)) => job,
        Some(Err(e)) => {
            error!(job_id = %entry.id, error = %e, "Job payload deserialization failed");
            dead_letter(&*backend, sink.as_deref(), &entry, e.to_string()).await;
            return;
        }
        None => {
            warn!("No handler registered for job type: {}", entry.job_type);
            dead_letter(
                &*backend,
                sink.as_deref(),
                &entry,
                format!("No handler for {}", entry.job_type),
            )
            .await;
            return;
        }
    };

    debug!(job_id = %entry.id, job_type = %entry.job_type, attempt = entry.attempts + 1, "Processing job");

    match job.execute().await {
        JobResult::Success(value) => {
            if let Some(val) = value {
                if let Err(e) = backend.set_result(entry.id, val).await {
                    warn!(job_id = %entry.id, error = %e, "Failed to store job result");
                }
            }
            if let Err(e) = backend
                .update_status(entry.id, JobStatus::Completed, None, None)
                .await
            {
                error!(job_id = %entry.id, error = %e, "Failed to ack job");
            }
        }
        JobResult::Retry(reason) => {
            let attempt = entry.attempts + 1;
            if attempt >= job.max_retries() {
                warn!(job_id = %entry.id, attempts = attempt, reason = %reason, "Retries exhausted");
                dead_letter(&*backend, sink.as_deref(), &entry, reason).await;
                return;
            }

            let delay_secs = job.backoff_strategy().delay(entry.attempts).as_secs();
            info!(
                job_id = %entry.id,
                attempt = attempt,
                delay_secs = delay_secs,
                "Job failed, scheduling retry with backoff"
            );
            if let Err(e) = backend
                .update_status(
                    entry.id,
                    JobStatus::Failed(attempt),
                    Some(reason),
                    Some(delay_secs),
                )
                .await
            {
                error!(job_id = %entry.id, error = %e, "Failed to requeue job");
            }
        }
        JobResult::Fatal(reason) => {
            warn!(job_id = %entry.id, reason = %reason, "Job failed permanently");
            dead_letter(&*backend, sink.as_deref(), &entry, reason).await;
        }
    }
}

async fn dead_letter<B: QueueBackend + ?Sized>(
    backend: &B,
    sink: Option<&dyn DeadLetterSink>,
    entry: &JobEntry,
    reason: String,
) {
    if let Some(sink) = sink {
        sink.dead_letter(entry, &reason).await;
    }
    if let Err(e) = backend
        .update_status(entry.id, JobStatus::DeadLetter, Some(reason), None)
        .await
    {
        error!(job_id = %entry.id, error = %e, "Failed to dead-letter job");
    }
}
