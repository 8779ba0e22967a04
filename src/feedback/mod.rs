//! Feedback tracking engine: classification, storage, queries and maintenance jobs.

pub mod classifier;
pub mod commands;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod query;
pub mod reminders;
pub mod report;
pub mod scheduler;
pub mod store;
pub mod telegram;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests;

pub use classifier::{Author, InboundMessage, RepliedMessage};
pub use dispatch::{CommandContext, CommandDispatcher, Response};
pub use error::{BotError, StorageError, TransportError};
pub use gate::{AuthorizationGate, Role};
pub use query::QueryEngine;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{EventStore, StorageLocation};
pub use telegram::TelegramClient;
pub use transport::Transport;
