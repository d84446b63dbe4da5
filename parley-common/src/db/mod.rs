//! SQLite persistence

pub mod init;
pub mod messages;

pub use init::*;
pub use messages::SqliteStore;
