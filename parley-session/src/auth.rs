//! Auth provider collaborator
//!
//! The session never talks to an identity provider itself. It reads the
//! current session at startup, follows state changes, and forwards sign-in
//! and sign-out requests.

use async_trait::async_trait;
use parley_common::UserId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;

/// Query parameter carrying the anonymous token through the OAuth redirect
pub const TEMP_USER_ID_PARAM: &str = "temp_user_id";

/// Signed-in session as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub user_id: UserId,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuthEvent {
    SignedIn(AuthSession),
    SignedOut,
}

#[async_trait]
pub trait AuthClient: Send + Sync {
    /// Session restored from a previous sign-in or a completed redirect
    async fn get_session(&self) -> Result<Option<AuthSession>>;

    /// Stream of sign-in and sign-out transitions
    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthEvent>;

    /// Start a provider sign-in; `extra_params` travel to the redirect callback
    async fn sign_in_with_oauth(
        &self,
        provider: &str,
        redirect_target: &str,
        extra_params: &[(String, String)],
    ) -> Result<()>;

    async fn sign_out(&self) -> Result<()>;
}
