//! Device identity: anonymous token plus optional authenticated user
//!
//! The anonymous token is minted once per device profile and survives
//! restarts. Signing out rotates it, so history that was merged into a user
//! never reappears under the anonymous identity.

use parley_common::{AnonymousId, OwnerFilter, OwnerRef, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::storage::{LocalStorage, ANONYMOUS_ID_KEY, QUOTA_COUNTER_KEY};

/// Who the session currently acts as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub anonymous_id: AnonymousId,
    pub user_id: Option<UserId>,
}

impl Identity {
    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_none()
    }

    /// Owner new messages are attributed to
    pub fn owner(&self) -> OwnerRef {
        match &self.user_id {
            Some(user_id) => OwnerRef::User(user_id.clone()),
            None => OwnerRef::Anonymous(self.anonymous_id),
        }
    }

    /// Owners whose history is visible
    ///
    /// `unmerged` is an anonymous token whose merge into the user has not
    /// succeeded yet; its rows stay visible alongside the user's.
    pub fn visible_filter(&self, unmerged: Option<&AnonymousId>) -> OwnerFilter {
        let owner = self.owner();
        match (&self.user_id, unmerged) {
            (Some(_), Some(anonymous_id)) => {
                OwnerFilter::any_of([owner.clone(), OwnerRef::Anonymous(*anonymous_id)])
                    .unwrap_or_else(|_| OwnerFilter::single(owner))
            }
            _ => OwnerFilter::single(owner),
        }
    }
}

/// Whether the anonymous token will survive a restart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persistence {
    Durable,
    /// Storage failed; the token lives only as long as this process
    SessionScoped,
}

pub struct IdentityStore {
    storage: Arc<dyn LocalStorage>,
    anonymous_id: AnonymousId,
    user_id: Option<UserId>,
    persistence: Persistence,
    degraded_reason: Option<String>,
}

impl IdentityStore {
    /// Read the stored token, minting and persisting one if absent
    pub fn load(storage: Arc<dyn LocalStorage>) -> Self {
        let mut store = Self {
            storage,
            anonymous_id: AnonymousId::generate(),
            user_id: None,
            persistence: Persistence::SessionScoped,
            degraded_reason: None,
        };

        match store.storage.get(ANONYMOUS_ID_KEY) {
            Ok(Some(raw)) => match raw.parse::<AnonymousId>() {
                Ok(anonymous_id) => {
                    debug!("Loaded anonymous id {}", anonymous_id);
                    store.anonymous_id = anonymous_id;
                    store.persistence = Persistence::Durable;
                }
                Err(e) => {
                    warn!("Stored anonymous id is unreadable, minting a new one: {}", e);
                    store.persist_anonymous_id();
                }
            },
            Ok(None) => {
                info!("Minted anonymous id {}", store.anonymous_id);
                store.persist_anonymous_id();
            }
            Err(e) => store.degrade(e.to_string()),
        }

        store
    }

    /// The device's anonymous token. Repeated calls return the same value.
    pub fn ensure_anonymous_id(&self) -> AnonymousId {
        self.anonymous_id
    }

    pub fn current_identity(&self) -> Identity {
        Identity {
            anonymous_id: self.anonymous_id,
            user_id: self.user_id.clone(),
        }
    }

    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    /// Why persistence degraded, if it did
    pub fn degraded_reason(&self) -> Option<&str> {
        self.degraded_reason.as_deref()
    }

    /// Record a successful sign-in
    ///
    /// Returns false when the identity was already authenticated as
    /// `user_id`, so repeated auth events do not trigger a second merge.
    pub fn on_authenticated(&mut self, user_id: UserId) -> bool {
        if self.user_id.as_ref() == Some(&user_id) {
            debug!("Already authenticated as {}", user_id);
            return false;
        }
        info!("Authenticated as {} (anonymous id {})", user_id, self.anonymous_id);
        self.user_id = Some(user_id);
        true
    }

    /// Drop the user and rotate the anonymous token
    ///
    /// Clears the persisted quota counter along with the old token. Returns
    /// the new identity, or None when nobody was signed in.
    pub fn on_signed_out(&mut self) -> Option<Identity> {
        let previous = self.user_id.take()?;

        let retired = self.anonymous_id;
        self.anonymous_id = AnonymousId::generate();
        info!(
            "Signed out {}; rotated anonymous id {} -> {}",
            previous, retired, self.anonymous_id
        );

        self.persist_anonymous_id();
        if let Err(e) = self.storage.remove(QUOTA_COUNTER_KEY) {
            warn!("Failed to clear quota counter: {}", e);
        }

        Some(self.current_identity())
    }

    fn persist_anonymous_id(&mut self) {
        match self
            .storage
            .set(ANONYMOUS_ID_KEY, &self.anonymous_id.to_string())
        {
            Ok(()) => {
                self.persistence = Persistence::Durable;
                self.degraded_reason = None;
            }
            Err(e) => self.degrade(e.to_string()),
        }
    }

    fn degrade(&mut self, reason: String) {
        warn!(
            "Anonymous id {} is session-scoped, storage failed: {}",
            self.anonymous_id, reason
        );
        self.persistence = Persistence::SessionScoped;
        self.degraded_reason = Some(reason);
    }
}
