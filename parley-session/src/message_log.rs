//! Ordered view of the conversation
//!
//! Entries come from two places: optimistic local inserts made at submit
//! time, and confirmed rows from the store (snapshot or live feed). A
//! confirmed row that matches a local entry by id, or by correlation handle
//! and kind, replaces it in place. Order is `created_at` ascending with
//! arrival order as tie-break, and an entry keeps its slot when replaced.

use chrono::{DateTime, Utc};
use parley_common::{
    CorrelationHandle, InsertFeed, Message, MessageId, MessageKind, MessageStore, OwnerFilter,
};
use tracing::{debug, warn};

use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local,
    Confirmed,
}

#[derive(Debug, Clone)]
struct Entry {
    key: (DateTime<Utc>, u64),
    origin: Origin,
    message: Message,
}

/// What `apply_confirmed` did with a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Replaced,
    Ignored,
}

#[derive(Debug, Default)]
pub struct MessageLog {
    entries: Vec<Entry>,
    next_seq: u64,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Messages in display order
    pub fn view(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.entries
            .iter()
            .find(|e| e.message.id == *id)
            .map(|e| &e.message)
    }

    pub fn find(&self, handle: &CorrelationHandle, kind: MessageKind) -> Option<&Message> {
        self.position_by_handle(handle, kind)
            .map(|i| &self.entries[i].message)
    }

    /// Optimistic insert made by this session
    pub fn insert_local(&mut self, message: Message) -> Result<()> {
        message.validate()?;
        if self.get(&message.id).is_some() {
            return Err(SessionError::Store(parley_common::Error::InvalidInput(format!(
                "Message {} is already in the log",
                message.id
            ))));
        }
        self.insert_sorted(Origin::Local, message);
        Ok(())
    }

    /// Apply a row confirmed by the store
    pub fn apply_confirmed(&mut self, message: Message) -> Applied {
        if let Err(e) = message.validate() {
            warn!("Ignoring invalid confirmed row: {}", e);
            return Applied::Ignored;
        }

        let position = self.position_by_id(&message.id).or_else(|| {
            message
                .handle
                .and_then(|h| self.position_local_by_handle(&h, message.kind()))
        });

        let Some(i) = position else {
            self.insert_sorted(Origin::Confirmed, message);
            return Applied::Inserted;
        };

        let entry = &mut self.entries[i];
        if entry.message.status.is_terminal() && message.is_pending() {
            debug!(message_id = %entry.message.id, "Ignoring stale pending row for terminal message");
            return Applied::Ignored;
        }
        if entry.origin == Origin::Confirmed && entry.message == message {
            return Applied::Ignored;
        }

        debug!(
            local_id = %entry.message.id,
            confirmed_id = %message.id,
            "Confirmed row replaces entry"
        );
        entry.message = message;
        entry.origin = Origin::Confirmed;
        Applied::Replaced
    }

    /// Replace all confirmed entries with a fresh snapshot
    ///
    /// Local entries survive and are reconciled against the new rows.
    pub fn load_snapshot(&mut self, rows: Vec<Message>) {
        self.entries.retain(|e| e.origin == Origin::Local);
        for row in rows {
            self.apply_confirmed(row);
        }
    }

    /// Mutate the still-pending entry for `(handle, kind)`
    ///
    /// Returns the entry's id, or None if there is no such entry or it has
    /// already reached a terminal status.
    pub fn patch_pending(
        &mut self,
        handle: &CorrelationHandle,
        kind: MessageKind,
        patch: impl FnOnce(&mut Message),
    ) -> Option<MessageId> {
        let i = self.position_by_handle(handle, kind)?;
        let message = &mut self.entries[i].message;
        if !message.is_pending() {
            return None;
        }
        patch(message);
        Some(message.id)
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let i = self.position_by_id(id)?;
        Some(self.entries.remove(i).message)
    }

    /// Drop every unconfirmed entry, returning how many were removed
    pub fn clear_local(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.origin == Origin::Confirmed);
        before - self.entries.len()
    }

    fn insert_sorted(&mut self, origin: Origin, message: Message) {
        let key = (message.created_at, self.next_seq);
        self.next_seq += 1;
        let at = self.entries.partition_point(|e| e.key <= key);
        self.entries.insert(
            at,
            Entry {
                key,
                origin,
                message,
            },
        );
    }

    fn position_by_id(&self, id: &MessageId) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id == *id)
    }

    fn position_by_handle(&self, handle: &CorrelationHandle, kind: MessageKind) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.message.handle.as_ref() == Some(handle) && e.message.kind() == kind)
    }

    fn position_local_by_handle(
        &self,
        handle: &CorrelationHandle,
        kind: MessageKind,
    ) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.origin == Origin::Local
                && e.message.handle.as_ref() == Some(handle)
                && e.message.kind() == kind
        })
    }
}

/// History visible under `filter`
pub async fn snapshot(store: &dyn MessageStore, filter: &OwnerFilter) -> Result<Vec<Message>> {
    Ok(store.select(filter).await?)
}

/// Live inserts visible under `filter`
pub async fn subscribe(store: &dyn MessageStore, filter: OwnerFilter) -> Result<InsertFeed> {
    Ok(store.subscribe(filter).await?)
}

/// Open a feed, then read the snapshot
///
/// Subscribing first means a row inserted between the two calls shows up
/// in both, never in neither; `apply_confirmed` drops the duplicate.
pub async fn resync(
    store: &dyn MessageStore,
    filter: OwnerFilter,
) -> Result<(InsertFeed, Vec<Message>)> {
    let feed = subscribe(store, filter.clone())
        .await
        .map_err(|e| SessionError::SubscriptionLost(e.to_string()))?;
    let rows = snapshot(store, &filter)
        .await
        .map_err(|e| SessionError::SubscriptionLost(e.to_string()))?;
    Ok((feed, rows))
}
