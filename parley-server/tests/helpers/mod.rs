//! Test Helper Utilities
//!
//! Stub collaborators and app setup for parley-server integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use parley_common::db::{init_memory_database, SqliteStore};
use parley_common::events::EventBus;
use parley_common::UserId;
use parley_server::analyzer::{Analyzer, AnalyzerError};
use parley_server::exchange::{CodeExchange, ExchangeError};
use parley_server::AppState;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub const ORIGIN: &str = "http://localhost:3000";

/// Echoes the audio bytes back as the transcription
///
/// Audio listed in `gates` waits for its `Notify` before transcribing.
#[derive(Default)]
pub struct StubAnalyzer {
    gates: Mutex<HashMap<Vec<u8>, Arc<Notify>>>,
    pub fail_replies: bool,
}

impl StubAnalyzer {
    /// Transcribes and analyses, but every reply fails
    pub fn failing_replies() -> Self {
        Self {
            fail_replies: true,
            ..Self::default()
        }
    }

    pub fn gate(&self, audio: &[u8]) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(audio.to_vec(), notify.clone());
        notify
    }
}

#[async_trait]
impl Analyzer for StubAnalyzer {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, AnalyzerError> {
        let gate = self.gates.lock().unwrap().get(audio).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(format!("[calm] {}", String::from_utf8_lossy(audio)))
    }

    async fn analyse(&self, transcription: &str) -> Result<String, AnalyzerError> {
        Ok(format!("Communication Tip: nice pacing in '{}'", transcription))
    }

    async fn reply(&self, transcription: &str) -> Result<String, AnalyzerError> {
        if self.fail_replies {
            return Err(AnalyzerError::ApiError(503, "overloaded".into()));
        }
        Ok(format!("You said {}", transcription))
    }
}

/// Maps codes to user ids; unknown codes are rejected
pub struct StubExchange {
    users: HashMap<String, String>,
}

impl StubExchange {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        Self {
            users: pairs
                .iter()
                .map(|(code, user)| (code.to_string(), user.to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl CodeExchange for StubExchange {
    async fn exchange(&self, code: &str) -> Result<UserId, ExchangeError> {
        match self.users.get(code) {
            Some(user) => UserId::new(user.clone()).map_err(|e| ExchangeError::ParseError(e.to_string())),
            None => Err(ExchangeError::ApiError(400, "invalid_grant".into())),
        }
    }
}

pub async fn setup_store() -> Arc<SqliteStore> {
    let pool = init_memory_database()
        .await
        .expect("Should create in-memory database");
    Arc::new(SqliteStore::new(pool, EventBus::new(64)))
}

pub fn setup_state(store: Arc<SqliteStore>) -> AppState {
    AppState::new(store, ORIGIN)
}

/// Serve the router on an ephemeral port
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Should bind test listener");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, parley_server::build_router(state))
            .await
            .unwrap();
    });
    addr
}

pub async fn extract_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("Should read body");
    serde_json::from_slice(&bytes).expect("Should parse JSON")
}

pub fn user(id: &str) -> UserId {
    UserId::new(id).unwrap()
}
