//! In-process message store
//!
//! Backs tests and embedded use. Same semantics as the SQLite store:
//! insertion order breaks `created_at` ties, merges are write-once.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use super::{InsertFeed, MergeOutcome, MergeRecord, MessageStore};
use crate::events::{EventBus, ParleyEvent};
use crate::message::Message;
use crate::owner::{AnonymousId, OwnerFilter, OwnerRef, UserId};
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    rows: Vec<Message>,
    merges: HashMap<AnonymousId, MergeRecord>,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    bus: EventBus,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_bus(EventBus::new(256))
    }

    pub fn with_bus(bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            bus,
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Merge record for a token, if one was written
    pub fn merge_record(&self, anonymous_id: &AnonymousId) -> Option<MergeRecord> {
        self.lock().ok()?.merges.get(anonymous_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Internal("memory store lock poisoned".to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn select(&self, filter: &OwnerFilter) -> Result<Vec<Message>> {
        let inner = self.lock()?;
        let mut rows: Vec<Message> = inner
            .rows
            .iter()
            .filter(|m| filter.matches(&m.owner))
            .cloned()
            .collect();
        // stable sort keeps insertion order for equal timestamps
        rows.sort_by_key(|m| m.created_at);
        Ok(rows)
    }

    async fn subscribe(&self, filter: OwnerFilter) -> Result<InsertFeed> {
        Ok(InsertFeed::new(self.bus.subscribe(), filter))
    }

    async fn insert(&self, message: Message) -> Result<()> {
        message.validate()?;
        {
            let mut inner = self.lock()?;
            if inner.rows.iter().any(|m| m.id == message.id) {
                return Err(Error::InvalidInput(format!(
                    "Message {} already exists",
                    message.id
                )));
            }
            inner.rows.push(message.clone());
        }
        debug!(message_id = %message.id, owner = %message.owner, "Inserted message");
        self.bus.emit_lossy(ParleyEvent::MessageInserted {
            message,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn find_merge(&self, anonymous_id: &AnonymousId) -> Result<Option<MergeRecord>> {
        Ok(self.lock()?.merges.get(anonymous_id).cloned())
    }

    async fn reassign_ownership(
        &self,
        anonymous_id: &AnonymousId,
        user_id: &UserId,
    ) -> Result<MergeOutcome> {
        let moved = {
            let mut inner = self.lock()?;
            if let Some(record) = inner.merges.get(anonymous_id) {
                return Ok(MergeOutcome::AlreadyMerged {
                    user_id: record.user_id.clone(),
                });
            }

            let from = OwnerRef::Anonymous(*anonymous_id);
            let mut moved = 0u64;
            for row in inner.rows.iter_mut().filter(|m| m.owner == from) {
                row.owner = OwnerRef::User(user_id.clone());
                moved += 1;
            }
            inner.merges.insert(
                *anonymous_id,
                MergeRecord {
                    anonymous_id: *anonymous_id,
                    user_id: user_id.clone(),
                    merged_at: Utc::now(),
                },
            );
            moved
        };

        info!(%anonymous_id, %user_id, moved, "Reassigned anonymous history");
        self.bus.emit_lossy(ParleyEvent::OwnershipReassigned {
            anonymous_id: *anonymous_id,
            user_id: user_id.clone(),
            moved,
            timestamp: Utc::now(),
        });
        Ok(MergeOutcome::Merged { moved })
    }
}
