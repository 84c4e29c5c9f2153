//! Event broadcasting over WebSocket
//!
//! Connected clients receive detection results and throughput samples and
//! control tracking with JSON commands.

pub mod handlers;
pub mod hub;
pub mod protocol;
pub mod server;

pub use handlers::{CommandHandler, ModelSelection, Reply};
pub use hub::{EventHub, Subscription, SubscriberWriteError};
pub use protocol::{Command, ConfigReply, Event};
pub use server::{EventServer, EventServerError};
