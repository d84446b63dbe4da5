//! Error types for parley-session
//!
//! Failures on the asynchronous result path never reach the caller as
//! errors; they resolve into a message's status. The variants here are what
//! the session logs, reports as notices, or returns from submission-time
//! calls.

use parley_common::{AnonymousId, CorrelationHandle, MessageId, UserId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    /// Anonymous token could not be persisted; a session-scoped one is in use
    #[error("Identity persistence degraded: {0}")]
    IdentityPersistenceDegraded(String),

    /// Reassigning anonymous history failed; retryable
    #[error("Merge of {anonymous_id} into {user_id} failed: {reason}")]
    MergeFailed {
        anonymous_id: AnonymousId,
        user_id: UserId,
        reason: String,
    },

    /// Audio could not be handed to the transport
    #[error("Transport submit failed: {0}")]
    TransportSubmitFailed(String),

    /// Result for a handle that is unknown, expired or abandoned
    #[error("No pending request for handle {0}")]
    ResultCorrelationMiss(CorrelationHandle),

    /// Live feed dropped or could not be established
    #[error("Subscription lost: {0}")]
    SubscriptionLost(String),

    #[error("Message not found: {0}")]
    UnknownMessage(MessageId),

    /// Retry requested for a message that is not in the error state
    #[error("Message {0} cannot be retried")]
    NotRetryable(MessageId),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Session closed")]
    SessionClosed,

    #[error(transparent)]
    Store(#[from] parley_common::Error),
}

/// Convenience Result type using SessionError
pub type Result<T> = std::result::Result<T, SessionError>;
