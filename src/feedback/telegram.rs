//! Telegram transport using teloxide.

use async_trait::async_trait;
use teloxide::adaptors::Throttle;
use teloxide::adaptors::throttle::Limits;
use teloxide::prelude::*;
use teloxide::types::{
    ChatMemberKind, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ParseMode,
    ReplyParameters, User,
};
use tracing::{info, warn};

use crate::feedback::classifier::{Author, sender_author};
use crate::feedback::dispatch::{CANCEL_CLEAR, CONFIRM_CLEAR};
use crate::feedback::error::TransportError;
use crate::feedback::transport::Transport;

/// Bot handle whose requests are queued to stay within Telegram's flood limits.
pub type ThrottledBot = Throttle<Bot>;

/// Build the throttled bot. Must be called inside a tokio runtime.
pub fn throttled_bot(token: &str) -> ThrottledBot {
    Bot::new(token).throttle(Limits::default())
}

/// Author of a Telegram message, `None` when it was sent on behalf of a chat.
pub fn message_author(msg: &Message) -> Option<Author> {
    sender_author(msg.from.as_ref().map(user_author), msg.sender_chat.is_some())
}

fn user_author(user: &User) -> Author {
    Author {
        user_id: user.id.0 as i64,
        username: user.username.clone(),
        display_name: user.full_name(),
    }
}

/// Telegram API client.
pub struct TelegramClient {
    bot: ThrottledBot,
}

impl TelegramClient {
    pub fn new(bot: ThrottledBot) -> Self {
        Self { bot }
    }

    /// Send the cleardb prompt with Yes/Cancel buttons.
    pub async fn send_clear_prompt(
        &self,
        chat_id: i64,
        html: &str,
        reply_to_message_id: Option<i64>,
    ) -> Result<i64, TransportError> {
        let keyboard = InlineKeyboardMarkup::new(vec![vec![
            InlineKeyboardButton::callback("✅ Yes, clear everything", CONFIRM_CLEAR),
            InlineKeyboardButton::callback("❌ Cancel", CANCEL_CLEAR),
        ]]);

        let mut request = self
            .bot
            .send_message(ChatId(chat_id), html)
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard);

        if let Some(msg_id) = reply_to_message_id {
            request = request.reply_parameters(ReplyParameters::new(MessageId(msg_id as i32)));
        }

        request
            .await
            .map(|msg| msg.id.0 as i64)
            .map_err(|e| failed("send confirmation prompt", e))
    }

    /// Replace the text of an earlier message, dropping its buttons.
    pub async fn edit_text(&self, chat_id: i64, message_id: i64, html: &str) -> Result<(), TransportError> {
        self.bot
            .edit_message_text(ChatId(chat_id), MessageId(message_id as i32), html)
            .parse_mode(ParseMode::Html)
            .await
            .map(|_| ())
            .map_err(|e| failed("edit message", e))
    }
}

fn failed(what: &str, e: teloxide::RequestError) -> TransportError {
    let msg = format!("Failed to {what}: {e}");
    warn!("{}", msg);
    TransportError(msg)
}

#[async_trait]
impl Transport for TelegramClient {
    async fn send_text(
        &self,
        chat_id: i64,
        html: &str,
        reply_to: Option<i64>,
    ) -> Result<i64, TransportError> {
        let mut request = self
            .bot
            .send_message(ChatId(chat_id), html)
            .parse_mode(ParseMode::Html);

        if let Some(msg_id) = reply_to {
            request = request.reply_parameters(ReplyParameters::new(MessageId(msg_id as i32)));
        }

        request.await.map(|msg| msg.id.0 as i64).map_err(|e| failed("send", e))
    }

    async fn is_group_admin(&self, group_id: i64, user_id: i64) -> Result<bool, TransportError> {
        let member = self
            .bot
            .get_chat_member(ChatId(group_id), UserId(user_id as u64))
            .await
            .map_err(|e| failed("get chat member", e))?;

        Ok(matches!(
            member.kind,
            ChatMemberKind::Owner(_) | ChatMemberKind::Administrator(_)
        ))
    }

    /// The Bot API cannot look up arbitrary usernames, so only the
    /// administrator list is searched. Callers fall back to stored usernames.
    async fn resolve_username(
        &self,
        group_id: i64,
        username: &str,
    ) -> Result<Option<i64>, TransportError> {
        let admins = self
            .bot
            .get_chat_administrators(ChatId(group_id))
            .await
            .map_err(|e| failed("get chat admins", e))?;

        let found = admins.iter().find(|m| {
            m.user
                .username
                .as_deref()
                .is_some_and(|u| u.eq_ignore_ascii_case(username))
        });
        if let Some(member) = found {
            info!("Resolved @{} to {} via admin list", username, member.user.id);
        }
        Ok(found.map(|m| m.user.id.0 as i64))
    }
}
