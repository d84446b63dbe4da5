//! # Parley Common Library
//!
//! Shared code for the Parley session engine and backend:
//! - Message and ownership model
//! - WebSocket wire frames
//! - Store events (ParleyEvent) and EventBus
//! - The persistence collaborator trait with in-memory and SQLite stores
//! - Configuration loading

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod events;
pub mod message;
pub mod owner;
pub mod store;
pub mod wire;

pub use error::{Error, Result};
pub use message::{CorrelationHandle, Message, MessageContent, MessageId, MessageKind, MessageStatus};
pub use owner::{AnonymousId, OwnerFilter, OwnerRef, UserId};
pub use store::{FeedError, InsertFeed, MergeOutcome, MergeRecord, MemoryStore, MessageStore};
