//! HTTP server with graceful shutdown

use axum::{middleware, Router};
use notary_runtime::ServerSettings;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::signal;
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::middleware::{
    body_limit_layer, cors_layer, request_id_middleware, timeout_layer, tracing_middleware,
};
use crate::routes::api_router;
use crate::state::AppState;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Request timeout
    pub timeout: Duration,
    /// Max request body size (bytes)
    pub max_body_size: usize,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            timeout: Duration::from_secs(30),
            max_body_size: 64 * 1024,
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &ServerSettings) -> Result<Self, ApiError> {
        let ip: IpAddr = settings.host.parse().map_err(|_| {
            ApiError::Validation(format!("server.host '{}' is not an IP address", settings.host))
        })?;
        Ok(Self {
            addr: SocketAddr::new(ip, settings.port),
            timeout: settings.timeout,
            max_body_size: settings.max_body_bytes,
            cors_origins: settings.cors_origins.clone(),
        })
    }
}

pub struct NotaryServer {
    config: ServerConfig,
    state: AppState,
}

impl NotaryServer {
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Routes with the middleware stack applied
    pub fn router(&self) -> Router {
        api_router(self.state.clone())
            .layer(body_limit_layer(self.config.max_body_size))
            .layer(timeout_layer(self.config.timeout))
            .layer(cors_layer(&self.config.cors_origins))
            .layer(middleware::from_fn(tracing_middleware))
            .layer(TraceLayer::new_for_http())
            // outermost, so the id is set before tracing runs
            .layer(middleware::from_fn(request_id_middleware))
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ApiError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let addr = self.config.addr;

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ApiError::Internal(format!("bind {addr}: {e}")))?;
        tracing::info!(%addr, "Notary API listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ApiError::Internal(format!("Server error: {e}")))?;

        tracing::info!("Server shutdown complete");
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Initialize tracing subscriber
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,notary_runtime=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.addr.port(), 8080);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_from_settings() {
        let settings = ServerSettings {
            host: "127.0.0.1".into(),
            port: 9090,
            timeout: Duration::from_secs(5),
            max_body_bytes: 4096,
            cors_origins: vec!["https://app.example".into()],
            internal_token: None,
        };
        let config = ServerConfig::from_settings(&settings).unwrap();
        assert_eq!(config.addr, "127.0.0.1:9090".parse().unwrap());
        assert_eq!(config.max_body_size, 4096);

        let bad = ServerSettings {
            host: "not-an-ip".into(),
            ..settings
        };
        assert!(ServerConfig::from_settings(&bad).is_err());
    }
}
