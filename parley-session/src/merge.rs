//! Reassigns anonymous history to the authenticated user
//!
//! The store does the move atomically and records it write-once, so calling
//! this again for the same pair is harmless. Transient store failures are
//! retried with exponential backoff.

use parley_common::{AnonymousId, MergeOutcome, MessageStore, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MergeStatus {
    /// No anonymous token to merge
    Skipped,
    Merged { moved: u64 },
    /// Token was merged earlier; `user_id` is where its history went
    AlreadyMerged { user_id: UserId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (attempt counts from 1)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

pub struct MergeCoordinator {
    store: Arc<dyn MessageStore>,
    policy: RetryPolicy,
}

impl MergeCoordinator {
    pub fn new(store: Arc<dyn MessageStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Single merge attempt
    pub async fn merge_if_needed(
        &self,
        anonymous_id: Option<&AnonymousId>,
        user_id: &UserId,
    ) -> Result<MergeStatus> {
        let Some(anonymous_id) = anonymous_id else {
            debug!("No anonymous id for {}, skipping merge", user_id);
            return Ok(MergeStatus::Skipped);
        };

        let outcome = self
            .store
            .reassign_ownership(anonymous_id, user_id)
            .await
            .map_err(|e| SessionError::MergeFailed {
                anonymous_id: *anonymous_id,
                user_id: user_id.clone(),
                reason: e.to_string(),
            })?;

        match outcome {
            MergeOutcome::Merged { moved } => {
                info!("Merged {} messages from {} into {}", moved, anonymous_id, user_id);
                Ok(MergeStatus::Merged { moved })
            }
            MergeOutcome::AlreadyMerged { user_id: owner } => {
                if owner != *user_id {
                    warn!(
                        "Anonymous id {} was already merged into {}; leaving history with that user",
                        anonymous_id, owner
                    );
                } else {
                    debug!("Anonymous id {} already merged into {}", anonymous_id, owner);
                }
                Ok(MergeStatus::AlreadyMerged { user_id: owner })
            }
        }
    }

    /// Merge with up to `max_attempts` tries, backing off between them
    pub async fn merge_with_retry(
        &self,
        anonymous_id: Option<&AnonymousId>,
        user_id: &UserId,
    ) -> Result<MergeStatus> {
        let mut attempt = 1;
        loop {
            match self.merge_if_needed(anonymous_id, user_id).await {
                Ok(status) => return Ok(status),
                Err(e) if attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        "Merge attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, self.policy.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
