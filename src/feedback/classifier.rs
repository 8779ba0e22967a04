//! Decides whether an inbound group message is a feedback event.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::feedback::error::StorageError;
use crate::feedback::report::message_link;
use crate::feedback::store::{EventStore, MediaRef, NewFeedback};

/// `#feedback` as a whole hashtag, any case.
static FEEDBACK_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:^|[^\w#])#feedback(?:$|[^\w])").unwrap());

/// Sender of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub user_id: i64,
    pub username: Option<String>,
    pub display_name: String,
}

/// The message an inbound message replies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepliedMessage {
    pub message_id: i64,
    pub has_media: bool,
    /// `None` for anonymous admins and channel posts.
    pub author: Option<Author>,
}

/// Transport-neutral view of an inbound group message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub message_id: i64,
    pub group_id: i64,
    /// Public username of the group, used for message links.
    pub group_username: Option<String>,
    /// Message text or media caption.
    pub text: Option<String>,
    pub has_media: bool,
    pub author: Option<Author>,
    pub reply_to: Option<RepliedMessage>,
}

/// Author of a message as seen by the engine.
///
/// Messages sent on behalf of a chat (anonymous admins, linked channels)
/// carry a placeholder user, so they count as having no author.
pub fn sender_author(from: Option<Author>, sent_as_chat: bool) -> Option<Author> {
    if sent_as_chat { None } else { from }
}

/// True if the text carries the `#feedback` hashtag.
pub fn has_feedback_tag(text: &str) -> bool {
    FEEDBACK_TAG.is_match(text)
}

/// Classify a message. `None` means it is not a feedback event.
///
/// The recorded user is the author of the media message. When the tag is a
/// reply to someone else's media, that someone is the subject; the tagger is
/// only used when the media author is unknown.
pub fn classify(
    msg: &InboundMessage,
    group_authorized: bool,
    now: DateTime<Utc>,
) -> Option<NewFeedback> {
    if !group_authorized {
        return None;
    }
    if !msg.text.as_deref().is_some_and(has_feedback_tag) {
        return None;
    }

    let (media_id, media_author) = if msg.has_media {
        (msg.message_id, msg.author.as_ref())
    } else {
        match &msg.reply_to {
            Some(reply) if reply.has_media => {
                (reply.message_id, reply.author.as_ref().or(msg.author.as_ref()))
            }
            _ => return None,
        }
    };
    let author = media_author?;

    Some(NewFeedback {
        group_id: msg.group_id,
        user_id: author.user_id,
        username: author.username.clone(),
        display_name: author.display_name.clone(),
        media_ref: MediaRef {
            message_id: media_id,
            link: message_link(msg.group_username.as_deref(), msg.group_id, media_id),
        },
        created_at: now,
    })
}

/// Classify and persist. Returns the stored entry id and the draft if recorded.
pub fn record_feedback(
    store: &EventStore,
    msg: &InboundMessage,
    now: DateTime<Utc>,
) -> Result<Option<(i64, NewFeedback)>, StorageError> {
    if !msg.text.as_deref().is_some_and(has_feedback_tag) {
        return Ok(None);
    }
    let authorized = store.is_authorized(msg.group_id)?;
    match classify(msg, authorized, now) {
        Some(draft) => {
            let id = store.save(&draft)?;
            Ok(Some((id, draft)))
        }
        None => Ok(None),
    }
}
