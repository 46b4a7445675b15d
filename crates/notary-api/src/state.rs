//! Application State
//!
//! Shared handles for the store, verifier, sweep lock and anchor queue.

use notary_persist::AttestationStore;
use notary_queue::QueueBackend;
use notary_runtime::{SweepLock, VerificationService};
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    store: Arc<AttestationStore>,
    verifier: Arc<VerificationService>,
    lock: SweepLock,
    queue: Option<Arc<dyn QueueBackend>>,
    internal_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        store: Arc<AttestationStore>,
        verifier: Arc<VerificationService>,
        lock: SweepLock,
    ) -> Self {
        Self {
            store,
            verifier,
            lock,
            queue: None,
            internal_token: None,
        }
    }

    /// Also publish anchor messages for the worker pool on submit
    pub fn with_queue(mut self, queue: Arc<dyn QueueBackend>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Serve `/internal/*` to callers presenting this bearer token
    pub fn with_internal_token(mut self, token: impl Into<String>) -> Self {
        self.internal_token = Some(Arc::from(token.into()));
        self
    }

    pub fn store(&self) -> &Arc<AttestationStore> {
        &self.store
    }

    pub fn verifier(&self) -> &VerificationService {
        &self.verifier
    }

    pub fn lock(&self) -> &SweepLock {
        &self.lock
    }

    pub fn queue(&self) -> Option<&Arc<dyn QueueBackend>> {
        self.queue.as_ref()
    }

    pub fn internal_token(&self) -> Option<&str> {
        self.internal_token.as_deref()
    }
}
