//! Notary Server - standalone entry point
//!
//! Loads configuration once, then runs the HTTP API, the anchoring
//! scheduler and the anchor job workers until Ctrl+C or SIGTERM.
//!
//! Configuration comes from an optional TOML file (`NOTARY_CONFIG`,
//! default `notary.toml`) overlaid with `NOTARY__SECTION__KEY` variables.

use anyhow::{Context, Result};
use notary_anchor::ProviderRegistry;
use notary_api::{AppState, NotaryServer, ServerConfig};
use notary_persist::{AttestationStore, MemoryBackend, SqliteBackend, SqliteQueueBackend, StorageBackend};
use notary_queue::{MemoryQueue, QueueBackend, WorkerPool};
use notary_runtime::{
    AnchorHandler, AnchorOrchestrator, DiagnosticSink, NotaryConfig, Scheduler, SweepLock,
    VerificationService,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    notary_api::init_tracing();

    let path = std::env::var("NOTARY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("notary.toml"));
    let config = NotaryConfig::load(Some(&path)).context("invalid configuration")?;

    tracing::info!(
        anchor_mode = config.anchor.as_str(),
        chains = config.chains.len(),
        storage = if config.storage.is_memory() { "memory" } else { "sqlite" },
        "Starting notary server"
    );

    // Storage and queue share one SQLite pool when persistent
    let (backend, queue): (Arc<dyn StorageBackend>, Arc<dyn QueueBackend>) =
        if config.storage.is_memory() {
            tracing::warn!("Using in-memory storage; receipts are lost on restart");
            (Arc::new(MemoryBackend::new()), Arc::new(MemoryQueue::new()))
        } else {
            let db = SqliteBackend::new(&config.storage.url)
                .await
                .context("failed to open database")?;
            let queue = SqliteQueueBackend::new(db.pool().clone());
            (Arc::new(db), Arc::new(queue))
        };

    let store = Arc::new(AttestationStore::new(backend.clone(), config.storage.store.clone()));
    let providers = ProviderRegistry::with_defaults()
        .build_all(&config.chains)
        .context("failed to build chain providers")?;

    let orchestrator = Arc::new(
        AnchorOrchestrator::new(store.clone(), providers.clone(), &config.anchor)
            .context("failed to configure anchoring")?
            .with_status_timeout(config.status_timeout),
    );
    let lock = SweepLock::spawn(config.lock.clone(), Some(backend));
    let verifier = Arc::new(VerificationService::new(
        store.clone(),
        providers,
        config.verify.clone(),
    ));

    // Dropping the sender also stops the background tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    // The interval loop and the queue workers run the same sweep
    let scheduler = Arc::new(Scheduler::new(orchestrator, lock.clone(), config.scheduler.clone()));
    if config.scheduler_enabled {
        let scheduler = scheduler.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            scheduler.run_until(stopped(rx)).await;
        }));
    }

    let mut state = AppState::new(store.clone(), verifier, lock);
    match &config.server.internal_token {
        Some(token) => state = state.with_internal_token(token.clone()),
        None => tracing::info!("No internal token configured; /internal routes disabled"),
    }
    if config.worker_enabled {
        let pool = WorkerPool::new_with_arc(queue.clone(), config.worker.clone())
            .with_dead_letter_sink(Arc::new(DiagnosticSink::new(store.clone())));
        let handler = Arc::new(AnchorHandler::new(
            scheduler,
            format!("{}-worker", config.scheduler.holder),
            config.scheduler.max_attempts,
        ));
        handler.register(&pool);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            pool.run_until(stopped(rx)).await;
        }));
        state = state.with_queue(queue);
    }
    drop(shutdown_rx);

    let server = NotaryServer::new(ServerConfig::from_settings(&config.server)?, state);
    let served = server
        .run_until(async move {
            notary_api::shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await;

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Background task panicked");
        }
    }

    served.map_err(|e| {
        tracing::error!("Server error during execution: {}", e);
        e
    })?;
    Ok(())
}

/// Resolves once shutdown is signalled or the sender is gone
async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
