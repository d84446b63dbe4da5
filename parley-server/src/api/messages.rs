//! Message history and live insert feed
//!
//! Both endpoints take the owners to show as query parameters:
//! `?anonymous=<uuid>&user=<id>`, at least one of them.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::Stream;
use parley_common::{AnonymousId, FeedError, Message, OwnerFilter, OwnerRef, UserId};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub anonymous: Option<String>,
    pub user: Option<String>,
}

impl OwnerQuery {
    fn filter(&self) -> Result<OwnerFilter, MessagesError> {
        let mut owners = Vec::new();
        if let Some(user) = self.user.as_deref() {
            let user = UserId::new(user).map_err(|e| MessagesError::InvalidOwner(e.to_string()))?;
            owners.push(OwnerRef::User(user));
        }
        if let Some(anonymous) = self.anonymous.as_deref() {
            let anonymous = anonymous
                .parse::<AnonymousId>()
                .map_err(|e| MessagesError::InvalidOwner(e.to_string()))?;
            owners.push(OwnerRef::Anonymous(anonymous));
        }
        OwnerFilter::any_of(owners).map_err(|_| MessagesError::MissingOwner)
    }
}

/// GET /api/messages
///
/// History ascending by creation time, insertion order breaking ties.
pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<Vec<Message>>, MessagesError> {
    let filter = query.filter()?;
    let rows = state
        .store
        .select(&filter)
        .await
        .map_err(|e| MessagesError::StoreError(e.to_string()))?;
    debug!(count = rows.len(), "Listed messages");
    Ok(Json(rows))
}

/// GET /api/messages/events
///
/// One `MessageInserted` event per new row matching the owners. The stream
/// ends if the subscriber falls behind; clients reload history and
/// reconnect.
pub async fn message_events(
    State(state): State<AppState>,
    Query(query): Query<OwnerQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, MessagesError> {
    let filter = query.filter()?;
    let mut feed = state
        .store
        .subscribe(filter)
        .await
        .map_err(|e| MessagesError::StoreError(e.to_string()))?;
    info!("New SSE client connected to message feed");

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("ConnectionStatus").data("connected"));

        loop {
            match feed.next().await {
                Ok(message) => match Event::default().event("MessageInserted").json_data(&message) {
                    Ok(event) => yield Ok(event),
                    Err(e) => warn!(error = %e, "Failed to encode message event"),
                },
                Err(FeedError::Lagged(skipped)) => {
                    warn!(skipped, "SSE client lagged, closing feed");
                    yield Ok(Event::default().event("Lagged").data(skipped.to_string()));
                    break;
                }
                Err(FeedError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    ))
}

#[derive(Debug)]
pub enum MessagesError {
    MissingOwner,
    InvalidOwner(String),
    StoreError(String),
}

impl IntoResponse for MessagesError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            MessagesError::MissingOwner => (
                StatusCode::BAD_REQUEST,
                "At least one of 'anonymous' or 'user' is required".to_string(),
            ),
            MessagesError::InvalidOwner(msg) => {
                (StatusCode::BAD_REQUEST, format!("Invalid owner: {}", msg))
            }
            MessagesError::StoreError(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("Store error: {}", msg))
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
