//! Error taxonomy shared by the store, the query engine and the dispatcher.

use thiserror::Error;

/// Failure talking to the event store. Always treated as transient.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The connection lock was poisoned by a panicking holder.
    #[error("storage connection unavailable")]
    Unavailable,
}

/// Failure sending to or querying the chat transport.
#[derive(Debug, Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// Why a permission check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    /// The group was never authorized by the owner. Commands there are ignored.
    GroupNotAuthorized,
    /// The group is authorized but the actor lacks the required role.
    InsufficientRole,
}

/// Errors surfaced by interactive operations.
#[derive(Debug, Error)]
pub enum BotError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("permission denied: {0:?}")]
    PermissionDenied(Denial),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("no target user given")]
    NoTarget,
}

impl BotError {
    /// The reply shown in chat, or `None` when the failure should stay silent.
    pub fn user_message(&self) -> Option<String> {
        match self {
            Self::Storage(_) => Some("⚠️ Storage is unavailable right now, try again later.".into()),
            Self::PermissionDenied(Denial::GroupNotAuthorized) => None,
            Self::PermissionDenied(Denial::InsufficientRole) => {
                Some("❌ You must be an admin to use this command.".into())
            }
            Self::InvalidArgument(usage) => Some(format!("❌ {usage}")),
            Self::UserNotFound(who) => Some(format!("❌ Could not find user {who} in this group.")),
            Self::NoTarget => Some(
                "Usage: reply with /check (or type /check @username or user_id).\nTip: I also accept raw '/!' text."
                    .into(),
            ),
        }
    }
}

pub type BotResult<T> = Result<T, BotError>;
