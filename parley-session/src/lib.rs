//! # Parley Session
//!
//! Client-side engine that keeps a chat conversation consistent while the
//! user moves from an anonymous identity to a signed-in one:
//! - [`IdentityStore`] persists the anonymous token and tracks sign-in
//! - [`MergeCoordinator`] moves anonymous history to the user exactly once
//! - [`MessageLog`] merges snapshot, live inserts and optimistic entries
//! - [`PendingRequestTracker`] joins out-of-band results to submissions
//! - [`QuotaGate`] advises sign-in after a few anonymous submissions
//!
//! [`Session`] ties them together behind a single reconciliation task.

pub mod auth;
pub mod config;
pub mod error;
pub mod identity;
pub mod merge;
pub mod message_log;
pub mod pending;
pub mod quota;
pub mod session;
pub mod storage;
pub mod transport;

pub use auth::{AuthClient, AuthEvent, AuthSession};
pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use identity::{Identity, IdentityStore, Persistence};
pub use merge::{MergeCoordinator, MergeStatus, RetryPolicy};
pub use message_log::{Applied, MessageLog};
pub use pending::{AudioSubmission, PendingRequestTracker, Stage};
pub use quota::{QuotaGate, QuotaStatus, Remaining};
pub use session::{MessageView, Session, SessionDeps, SessionHandle, SessionNotice, SubmitReceipt};
pub use storage::{FileStorage, LocalStorage, MemoryStorage, StorageError};
pub use transport::{ConnectionStatus, Transport, TransportError, WsTransport};
