//! HTTP API handlers for parley-server

pub mod callback;
pub mod health;
pub mod messages;
pub mod ws;

pub use callback::auth_callback;
pub use health::health_routes;
pub use messages::{list_messages, message_events};
pub use ws::ws_handler;
