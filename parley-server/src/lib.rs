//! parley-server library - chat backend
//!
//! Accepts audio over a WebSocket, answers with correlated transcription and
//! reply frames, persists the conversation, and hosts the OAuth callback
//! that folds anonymous history into the signed-in user.

use axum::Router;
use parley_common::MessageStore;
use parley_session::MergeCoordinator;
use std::sync::Arc;

pub mod analyzer;
pub mod api;
pub mod exchange;

use analyzer::Analyzer;
use exchange::CodeExchange;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MessageStore>,
    /// Absent when no model API key is configured
    pub analyzer: Option<Arc<dyn Analyzer>>,
    pub exchange: Option<Arc<dyn CodeExchange>>,
    pub merger: Arc<MergeCoordinator>,
    /// Redirect target after the auth callback
    pub allowed_origin: String,
}

impl AppState {
    pub fn new(store: Arc<dyn MessageStore>, allowed_origin: impl Into<String>) -> Self {
        let merger = Arc::new(MergeCoordinator::new(store.clone(), Default::default()));
        Self {
            store,
            analyzer: None,
            exchange: None,
            merger,
            allowed_origin: allowed_origin.into(),
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_exchange(mut self, exchange: Arc<dyn CodeExchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::http::{HeaderValue, Method};
    use axum::routing::get;
    use tower_http::cors::CorsLayer;
    use tower_http::trace::TraceLayer;

    let cors = match state.allowed_origin.parse::<HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET])
            .allow_credentials(true),
        Err(_) => {
            tracing::warn!(origin = %state.allowed_origin, "Unusable allowed origin, CORS disabled");
            CorsLayer::new()
        }
    };

    let api = Router::new()
        .route("/ws", get(api::ws_handler))
        .route("/auth/callback", get(api::auth_callback))
        .route("/api/messages", get(api::list_messages))
        .route("/api/messages/events", get(api::message_events));

    Router::new()
        .merge(api)
        .merge(api::health_routes())
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
