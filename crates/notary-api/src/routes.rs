//! API routes for attestation, verification and the sweep lock

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use notary_core::ChainCheck;
use notary_persist::{SubmitRequest, SubmitResponse};
use notary_runtime::{enqueue_anchor, LockGrant, LockStatus, ProofCheck, ProofRequest, VerificationResult};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::middleware::internal_auth_middleware;
use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub components: ComponentHealth,
}

#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub storage: ComponentStatus,
    pub lock: ComponentStatus,
}

#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl ComponentStatus {
    fn from_flag(healthy: bool, latency_ms: Option<u64>) -> Self {
        Self {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            latency_ms,
        }
    }
}

/// Storage round trip plus a lock actor ping. 503 when either is down.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();
    let storage_ok = state.store().is_healthy().await;
    let latency = start.elapsed().as_millis() as u64;
    let lock_ok = state.lock().status().await.is_ok();

    let healthy = storage_ok && lock_ok;
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now(),
            components: ComponentHealth {
                storage: ComponentStatus::from_flag(storage_ok, Some(latency)),
                lock: ComponentStatus::from_flag(lock_ok, None),
            },
        }),
    )
}

/// Store a pending receipt and queue it for anchoring
pub async fn submit_attestation(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let submitted = state.store().submit(req).await?;

    // the job record is already stored, so the sweep still finds it if this fails
    if let Some(queue) = state.queue() {
        if let Err(e) = enqueue_anchor(queue.as_ref(), &submitted.job).await {
            tracing::warn!(
                receipt_id = %submitted.record.id,
                error = %e,
                "Failed to publish anchor message"
            );
        }
    }

    tracing::info!(receipt_id = %submitted.record.id, chain = %submitted.job.chain, "Attestation submitted");
    Ok((StatusCode::CREATED, Json(submitted.response())))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub counter_commit: String,
}

pub async fn confirm_attestation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ConfirmRequest>,
) -> ApiResult<Json<SubmitResponse>> {
    if req.counter_commit.trim().is_empty() {
        return Err(ApiError::Validation("counterCommit must not be empty".into()));
    }
    let record = state.store().confirm(&id, req.counter_commit).await?;
    Ok(Json(SubmitResponse {
        id: record.id,
        mode: record.mode,
        received_at: record.received_at,
        policy_version: record.policy_version,
    }))
}

/// Look up by commitment or receipt id
pub async fn verify_by_hash(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<Json<VerificationResult>> {
    Ok(Json(state.verifier().verify_by_hash(&hash).await?))
}

pub async fn verify_by_target(
    State(state): State<AppState>,
    Path((target_type, target_id)): Path<(String, String)>,
) -> ApiResult<Json<VerificationResult>> {
    Ok(Json(
        state
            .verifier()
            .verify_by_target(&target_type, &target_id)
            .await?,
    ))
}

pub async fn verify_proof(
    State(state): State<AppState>,
    Json(req): Json<ProofRequest>,
) -> Json<ProofCheck> {
    Json(state.verifier().verify_proof(&req))
}

pub async fn verify_chain(
    State(state): State<AppState>,
    Path(scope): Path<String>,
) -> ApiResult<Json<ChainCheck>> {
    Ok(Json(state.verifier().verify_hash_chain(&scope).await?))
}

#[derive(Debug, Deserialize)]
pub struct AcquireRequest {
    pub holder: String,
}

pub async fn acquire_lock(
    State(state): State<AppState>,
    Json(req): Json<AcquireRequest>,
) -> ApiResult<Json<LockGrant>> {
    if req.holder.trim().is_empty() {
        return Err(ApiError::Validation("holder must not be empty".into()));
    }
    Ok(Json(state.lock().acquire(&req.holder).await?))
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub released: bool,
}

/// `released: false` when the lock was already free
pub async fn release_lock(
    State(state): State<AppState>,
    Json(req): Json<ReleaseRequest>,
) -> ApiResult<Json<ReleaseResponse>> {
    let released = state.lock().release(&req.token).await?;
    Ok(Json(ReleaseResponse { released }))
}

pub async fn lock_status(State(state): State<AppState>) -> ApiResult<Json<LockStatus>> {
    Ok(Json(state.lock().status().await?))
}

/// Sweep lock routes, for operators and external sweepers. They answer 404
/// unless an internal token is configured.
fn internal_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/internal/lock/acquire", post(acquire_lock))
        .route("/internal/lock/release", post(release_lock))
        .route("/internal/lock/status", get(lock_status))
        .route_layer(middleware::from_fn_with_state(state, internal_auth_middleware))
}

/// Build API router
pub fn api_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        // Attestations
        .route("/api/v1/attestations", post(submit_attestation))
        .route("/api/v1/attestations/{id}/confirm", post(confirm_attestation))
        // Verification
        .route("/api/v1/verify/proof", post(verify_proof))
        .route("/api/v1/verify/{hash}", get(verify_by_hash))
        .route("/api/v1/verify/{target_type}/{target_id}", get(verify_by_target))
        .route("/api/v1/chains/{scope}/verify", get(verify_chain));

    public
        .merge(internal_router(state.clone()))
        .with_state(state)
}
