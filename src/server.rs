use crate::api;
use crate::config::AppConfig;
use crate::ids::{IdAllocator, IdError};
use anyhow::Context;
use axum::Router;
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// A fresh allocator per request, so concurrent requests share nothing.
    pub fn id_allocator(&self) -> Result<IdAllocator, IdError> {
        match self.config.id_base {
            Some(base) => IdAllocator::with_base(base),
            None => Ok(IdAllocator::from_clock()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/api/generate", post(api::generate))
        .route("/healthz", get(api::health))
        .layer(TraceLayer::new_for_http());
    if state.config.enable_cors {
        router = router.layer(CorsLayer::permissive());
    }
    router.with_state(state)
}

pub async fn run(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(?err, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}
