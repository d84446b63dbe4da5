//! Health check endpoint
//!
//! Reports whether the store answers and which optional collaborators are
//! wired. An unreachable store turns the response into a 503.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use tracing::warn;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub module: &'static str,
    pub version: &'static str,
    pub build: &'static str,
    pub store: StoreHealth,
    /// Audio submissions can be transcribed
    pub analyzer: bool,
    /// Sign-in callbacks can merge history
    pub auth_exchange: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StoreHealth {
    Reachable,
    Unreachable { error: String },
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let store = match state.store.health_check().await {
        Ok(()) => StoreHealth::Reachable,
        Err(e) => {
            warn!(error = %e, "Store health check failed");
            StoreHealth::Unreachable {
                error: e.to_string(),
            }
        }
    };

    let (code, status) = match store {
        StoreHealth::Reachable => (StatusCode::OK, "ok"),
        StoreHealth::Unreachable { .. } => (StatusCode::SERVICE_UNAVAILABLE, "degraded"),
    };

    (
        code,
        Json(HealthResponse {
            status,
            module: "parley-server",
            version: env!("CARGO_PKG_VERSION"),
            build: env!("GIT_HASH"),
            store,
            analyzer: state.analyzer.is_some(),
            auth_exchange: state.exchange.is_some(),
        }),
    )
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
