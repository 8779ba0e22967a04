//! Capabilities the engine needs from the chat transport.

use async_trait::async_trait;

use crate::feedback::error::TransportError;

/// Outbound messaging plus the membership lookups the engine delegates.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send HTML text to a chat, optionally as a reply. Returns the new message id.
    async fn send_text(
        &self,
        chat_id: i64,
        html: &str,
        reply_to: Option<i64>,
    ) -> Result<i64, TransportError>;

    /// Whether the user is an administrator or the creator of the group.
    async fn is_group_admin(&self, group_id: i64, user_id: i64) -> Result<bool, TransportError>;

    /// Resolve a `@username` (given without `@`) to a user id within a group.
    async fn resolve_username(
        &self,
        group_id: i64,
        username: &str,
    ) -> Result<Option<i64>, TransportError>;
}
