//! OAuth redirect callback
//!
//! The provider sends the browser here with an authorization code and the
//! anonymous token that started the sign-in. The code is exchanged for a
//! user id, anonymous history is merged, and the browser goes back to the
//! app. Every outcome redirects; failures are logged and the client's
//! merge coordinator retries.

use axum::{
    extract::{Query, State},
    response::Redirect,
};
use parley_common::AnonymousId;
use parley_session::auth::TEMP_USER_ID_PARAM;
use serde::Deserialize;
use tracing::{info, warn};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub temp_user_id: Option<String>,
}

/// GET /auth/callback?code=..&temp_user_id=..
pub async fn auth_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Redirect {
    let target = Redirect::to(&state.allowed_origin);

    let Some(code) = query.code.filter(|c| !c.is_empty()) else {
        warn!("Auth callback without a code");
        return target;
    };
    let Some(exchange) = state.exchange.as_ref() else {
        warn!("Auth callback received but no code exchange is configured");
        return target;
    };

    let user_id = match exchange.exchange(&code).await {
        Ok(user_id) => user_id,
        Err(e) => {
            warn!(error = %e, "Code exchange failed");
            return target;
        }
    };

    let anonymous_id = query.temp_user_id.as_deref().and_then(|raw| {
        raw.parse::<AnonymousId>()
            .map_err(|e| warn!(param = TEMP_USER_ID_PARAM, error = %e, "Ignoring invalid anonymous token"))
            .ok()
    });

    match state.merger.merge_if_needed(anonymous_id.as_ref(), &user_id).await {
        Ok(status) => info!(user = %user_id, ?status, "Sign-in callback complete"),
        Err(e) => warn!(user = %user_id, error = %e, "Merge during callback failed"),
    }

    target
}
