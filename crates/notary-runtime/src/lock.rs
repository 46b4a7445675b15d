//! Sweep lock actor
//!
//! A named lock owned by a single task. Acquire, release, status and expiry
//! are messages handled one at a time, so checking for a holder and
//! recording a new one cannot interleave with another acquire.

use chrono::{DateTime, Utc};
use notary_persist::{StorageBackend, StorageExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const LOCK_PREFIX: &str = "lock:";

/// Lock settings
#[derive(Debug, Clone)]
pub struct LockConfig {
    pub name: String,
    /// Lifetime of a grant; the lock frees itself after this
    pub ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            name: "anchor-sweep".to_string(),
            ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("lock held by {holder} until {expires_at}")]
    Contention {
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("release token does not match the current holder")]
    NotHolder,

    #[error("lock service stopped")]
    Closed,
}

/// A successful acquire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockGrant {
    pub granted: bool,
    pub holder: String,
    /// Required to release
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Read-only view of the lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_ms: Option<u64>,
}

/// What gets mirrored to storage under `lock:{name}`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct LockRecord {
    holder: String,
    token: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    #[serde(skip)]
    deadline: Instant,
}

impl LockRecord {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

enum Command {
    Acquire {
        holder: String,
        reply: oneshot::Sender<Result<LockGrant, LockError>>,
    },
    Release {
        token: String,
        reply: oneshot::Sender<Result<bool, LockError>>,
    },
    Status {
        reply: oneshot::Sender<LockStatus>,
    },
    Expire {
        token: String,
    },
}

/// Handle to a running lock actor. Cheap to clone.
#[derive(Clone)]
pub struct SweepLock {
    name: Arc<str>,
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for SweepLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepLock").field("name", &self.name).finish()
    }
}

impl SweepLock {
    /// Spawn the actor. Must be called inside a tokio runtime.
    pub fn spawn(config: LockConfig, backend: Option<Arc<dyn StorageBackend>>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let actor = LockActor {
            name: config.name.clone(),
            ttl: config.ttl,
            record: None,
            backend,
            tx: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx));
        Self {
            name: Arc::from(config.name),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn acquire(&self, holder: &str) -> Result<LockGrant, LockError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Acquire {
            holder: holder.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| LockError::Closed)?
    }

    /// Release a grant. `Ok(false)` when nothing was held.
    pub async fn release(&self, token: &str) -> Result<bool, LockError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Release {
            token: token.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| LockError::Closed)?
    }

    pub async fn status(&self) -> Result<LockStatus, LockError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply }).await?;
        rx.await.map_err(|_| LockError::Closed)
    }

    async fn send(&self, cmd: Command) -> Result<(), LockError> {
        self.tx.send(cmd).await.map_err(|_| LockError::Closed)
    }
}

struct LockActor {
    name: String,
    ttl: Duration,
    record: Option<LockRecord>,
    backend: Option<Arc<dyn StorageBackend>>,
    // weak so the actor stops once every handle is dropped
    tx: mpsc::WeakSender<Command>,
}

impl LockActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        debug!(lock = %self.name, "Lock actor started");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Acquire { holder, reply } => {
                    let result = self.acquire(holder).await;
                    let _ = reply.send(result);
                }
                Command::Release { token, reply } => {
                    let result = self.release(&token).await;
                    let _ = reply.send(result);
                }
                Command::Status { reply } => {
                    let _ = reply.send(self.status());
                }
                Command::Expire { token } => self.expire(&token).await,
            }
        }
        debug!(lock = %self.name, "Lock actor stopped");
    }

    async fn acquire(&mut self, holder: String) -> Result<LockGrant, LockError> {
        let now = Instant::now();
        if let Some(current) = &self.record {
            if !current.is_expired(now) {
                debug!(lock = %self.name, holder = %current.holder, requested_by = %holder, "Lock contention");
                return Err(LockError::Contention {
                    holder: current.holder.clone(),
                    expires_at: current.expires_at,
                });
            }
        }

        let acquired_at = Utc::now();
        let expires_at = acquired_at
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::seconds(300));
        let record = LockRecord {
            holder: holder.clone(),
            token: Uuid::new_v4().to_string(),
            acquired_at,
            expires_at,
            deadline: now + self.ttl,
        };

        self.mirror(Some(&record)).await;
        self.schedule_expiry(&record);

        let grant = LockGrant {
            granted: true,
            holder,
            token: record.token.clone(),
            acquired_at,
            expires_at,
        };
        info!(lock = %self.name, holder = %grant.holder, expires_at = %expires_at, "Lock acquired");
        self.record = Some(record);
        Ok(grant)
    }

    async fn release(&mut self, token: &str) -> Result<bool, LockError> {
        match &self.record {
            None => Ok(false),
            Some(current) if current.is_expired(Instant::now()) => {
                self.record = None;
                self.mirror(None).await;
                Ok(false)
            }
            Some(current) if current.token != token => Err(LockError::NotHolder),
            Some(current) => {
                info!(lock = %self.name, holder = %current.holder, "Lock released");
                self.record = None;
                self.mirror(None).await;
                Ok(true)
            }
        }
    }

    fn status(&self) -> LockStatus {
        let now = Instant::now();
        match &self.record {
            Some(current) if !current.is_expired(now) => LockStatus {
                locked: true,
                holder: Some(current.holder.clone()),
                remaining_ms: Some(current.deadline.saturating_duration_since(now).as_millis() as u64),
            },
            _ => LockStatus {
                locked: false,
                holder: None,
                remaining_ms: None,
            },
        }
    }

    /// Clear the record only if it is still the grant the trigger was set for
    async fn expire(&mut self, token: &str) {
        let still_same = self
            .record
            .as_ref()
            .is_some_and(|r| r.token == token && r.is_expired(Instant::now()));
        if still_same {
            if let Some(record) = self.record.take() {
                warn!(lock = %self.name, holder = %record.holder, "Lock expired without release");
            }
            self.mirror(None).await;
        }
    }

    fn schedule_expiry(&self, record: &LockRecord) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let token = record.token.clone();
        let deadline = record.deadline;
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(Command::Expire { token }).await;
        });
    }

    async fn mirror(&self, record: Option<&LockRecord>) {
        let Some(backend) = &self.backend else {
            return;
        };
        let key = format!("{LOCK_PREFIX}{}", self.name);
        let result = match record {
            Some(record) => backend.set_with_ttl(&key, record, self.ttl).await,
            None => backend.delete(&key).await.map(|_| ()),
        };
        if let Err(e) = result {
            warn!(lock = %self.name, error = %e, "Failed to mirror lock record");
        }
    }
}
