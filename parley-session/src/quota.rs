//! Advisory submission quota for anonymous sessions
//!
//! The gate never blocks a submission. It counts anonymous submissions and
//! signals once, when the last free one is used, that the user should be
//! asked to sign in.

use parley_common::AnonymousId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::identity::Identity;
use crate::storage::{LocalStorage, QUOTA_COUNTER_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Remaining {
    Limited(u32),
    Unlimited,
}

/// Outcome of recording one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub remaining: Remaining,
    /// True exactly once, on the transition from one remaining to none
    pub prompt_auth: bool,
}

/// Persisted count, tagged with the token it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct QuotaCounter {
    anonymous_id: AnonymousId,
    count: u32,
}

pub struct QuotaGate {
    storage: Arc<dyn LocalStorage>,
    limit: u32,
    counter: Option<QuotaCounter>,
}

impl QuotaGate {
    pub fn new(storage: Arc<dyn LocalStorage>, limit: u32) -> Self {
        let counter = match storage.get(QUOTA_COUNTER_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw)
                .map_err(|e| warn!("Discarding unreadable quota counter: {}", e))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read quota counter: {}", e);
                None
            }
        };
        Self {
            storage,
            limit,
            counter,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn remaining(&self, identity: &Identity) -> Remaining {
        if !identity.is_anonymous() {
            return Remaining::Unlimited;
        }
        Remaining::Limited(self.limit.saturating_sub(self.count_for(&identity.anonymous_id)))
    }

    /// Count one submission made as `identity`
    pub fn record_submission(&mut self, identity: &Identity) -> QuotaStatus {
        if !identity.is_anonymous() {
            return QuotaStatus {
                remaining: Remaining::Unlimited,
                prompt_auth: false,
            };
        }

        let before = self.limit.saturating_sub(self.count_for(&identity.anonymous_id));
        let count = self.count_for(&identity.anonymous_id).saturating_add(1);
        self.counter = Some(QuotaCounter {
            anonymous_id: identity.anonymous_id,
            count,
        });
        self.persist();

        let after = self.limit.saturating_sub(count);
        debug!("Anonymous submission {} of {}", count, self.limit);

        QuotaStatus {
            remaining: Remaining::Limited(after),
            prompt_auth: before == 1 && after == 0,
        }
    }

    /// Start counting from zero for `anonymous_id`
    pub fn reset(&mut self, anonymous_id: AnonymousId) {
        self.counter = Some(QuotaCounter {
            anonymous_id,
            count: 0,
        });
        self.persist();
    }

    // A counter recorded for another token counts as zero
    fn count_for(&self, anonymous_id: &AnonymousId) -> u32 {
        match &self.counter {
            Some(counter) if counter.anonymous_id == *anonymous_id => counter.count,
            _ => 0,
        }
    }

    fn persist(&self) {
        let Some(counter) = &self.counter else {
            return;
        };
        let result = serde_json::to_string(counter)
            .map_err(|e| e.to_string())
            .and_then(|raw| {
                self.storage
                    .set(QUOTA_COUNTER_KEY, &raw)
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = result {
            warn!("Failed to persist quota counter: {}", e);
        }
    }
}
