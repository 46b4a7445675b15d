//! API error types with HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use notary_anchor::ChainError;
use notary_persist::StorageError;
use notary_queue::QueueError;
use notary_runtime::{LockError, OrchestratorError};
use serde::Serialize;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Someone else holds the sweep lock
    #[error("Lock held by {holder} until {expires_at}")]
    LockContention {
        holder: String,
        expires_at: DateTime<Utc>,
    },

    /// Chain call failed in a way that will not fix itself
    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut details = None;
        let (status, code, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                msg.clone(),
            ),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            ApiError::LockContention { holder, expires_at } => {
                details = Some(serde_json::json!({
                    "holder": holder,
                    "expiresAt": expires_at,
                }));
                (StatusCode::CONFLICT, "LOCK_CONTENTION", self.to_string())
            }
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "CHAIN_ERROR", msg.clone()),
            ApiError::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                msg.clone(),
            ),
            ApiError::Internal(msg) => {
                // not exposed to clients
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(msg) => ApiError::NotFound(msg),
            StorageError::AlreadyExists(msg) => ApiError::Conflict(msg),
            StorageError::Invalid(msg) => ApiError::Validation(msg),
            StorageError::Timeout(msg) | StorageError::Connection(msg) => {
                ApiError::ServiceUnavailable(msg)
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<LockError> for ApiError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Contention { holder, expires_at } => {
                ApiError::LockContention { holder, expires_at }
            }
            LockError::NotHolder => ApiError::Forbidden(e.to_string()),
            LockError::Closed => ApiError::ServiceUnavailable(e.to_string()),
        }
    }
}

impl From<ChainError> for ApiError {
    fn from(e: ChainError) -> Self {
        if e.is_retryable() {
            ApiError::ServiceUnavailable(e.to_string())
        } else {
            ApiError::BadGateway(e.to_string())
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::Validation(msg) => ApiError::Validation(msg),
            OrchestratorError::NotFound(msg) => ApiError::NotFound(msg),
            OrchestratorError::Chain(e) => e.into(),
            OrchestratorError::Storage(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        ApiError::ServiceUnavailable(format!("queue: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_error_response() {
        let response = ApiError::NotFound("receipt r-1".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_lock_contention_is_409_with_holder() {
        let err: ApiError = LockError::Contention {
            holder: "sweeper-a".into(),
            expires_at: Utc::now(),
        }
        .into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "LOCK_CONTENTION");
        assert_eq!(json["error"]["details"]["holder"], "sweeper-a");
    }

    #[test]
    fn test_storage_mapping() {
        assert!(matches!(
            ApiError::from(StorageError::Invalid("bad".into())),
            ApiError::Validation(_)
        ));
        assert!(matches!(
            ApiError::from(StorageError::Timeout("slow".into())),
            ApiError::ServiceUnavailable(_)
        ));
    }
}
