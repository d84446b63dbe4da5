//! Persistence collaborator
//!
//! The message store is reachable only through [`MessageStore`]: a history
//! query, an insert-only live feed, and the idempotent ownership
//! reassignment used by merges.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::events::ParleyEvent;
use crate::message::Message;
use crate::owner::{AnonymousId, OwnerFilter, UserId};
use crate::Result;

/// Write-once record of a completed merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub anonymous_id: AnonymousId,
    pub user_id: UserId,
    pub merged_at: DateTime<Utc>,
}

/// Result of `reassign_ownership`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// Rows moved and a merge record written
    Merged { moved: u64 },
    /// A merge record already existed; nothing changed
    AlreadyMerged { user_id: UserId },
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Messages whose owner matches `filter`, ascending by `created_at`
    /// with insertion order as tie-break
    async fn select(&self, filter: &OwnerFilter) -> Result<Vec<Message>>;

    /// Live feed of messages inserted after this call whose owner matches `filter`
    async fn subscribe(&self, filter: OwnerFilter) -> Result<InsertFeed>;

    /// Persist a new message and publish it on the live feed
    async fn insert(&self, message: Message) -> Result<()>;

    /// Atomically move every message owned by `anonymous_id` to `user_id`
    /// and record the merge. Repeating the call is a no-op.
    async fn reassign_ownership(
        &self,
        anonymous_id: &AnonymousId,
        user_id: &UserId,
    ) -> Result<MergeOutcome>;

    /// Merge record for a token, if it has already been merged
    async fn find_merge(&self, anonymous_id: &AnonymousId) -> Result<Option<MergeRecord>>;

    /// Best-effort reachability probe
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Why a live feed stopped producing messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    /// Receiver fell behind and inserts were dropped
    #[error("live feed lagged, {0} events dropped")]
    Lagged(u64),
    /// Store side went away
    #[error("live feed closed")]
    Closed,
}

/// Insert-only feed filtered to a set of owners
///
/// `next` is cancel-safe and may be used inside `tokio::select!`.
pub struct InsertFeed {
    rx: broadcast::Receiver<ParleyEvent>,
    filter: OwnerFilter,
}

impl InsertFeed {
    pub fn new(rx: broadcast::Receiver<ParleyEvent>, filter: OwnerFilter) -> Self {
        Self { rx, filter }
    }

    pub fn filter(&self) -> &OwnerFilter {
        &self.filter
    }

    /// Wait for the next matching insert
    pub async fn next(&mut self) -> std::result::Result<Message, FeedError> {
        loop {
            match self.rx.recv().await {
                Ok(ParleyEvent::MessageInserted { message, .. }) => {
                    if self.filter.matches(&message.owner) {
                        return Ok(message);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Err(FeedError::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(FeedError::Closed),
            }
        }
    }
}
