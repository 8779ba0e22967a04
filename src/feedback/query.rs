//! Time-windowed questions over the event store.
//!
//! Every window is half-open: `[now - days, now)`.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::feedback::error::{BotError, BotResult};
use crate::feedback::gate::{AuthorizationGate, Role};
use crate::feedback::store::{EventStore, FeedbackEntry};
use crate::feedback::transport::Transport;

/// Default window of a quick check and of `fb_user`.
pub const QUICK_CHECK_DAYS: u32 = 3;

/// Default window of `fb_stats`.
pub const DEFAULT_STATS_DAYS: u32 = 3;

/// Largest accepted window.
pub const MAX_DAYS: u32 = 365;

/// A reference to a user as typed by an admin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserRef {
    Id(i64),
    /// Username without the leading `@`.
    Handle(String),
}

impl UserRef {
    /// Parse `123` or `@name`. Anything else is rejected.
    pub fn parse_strict(arg: &str) -> Option<Self> {
        let arg = arg.trim();
        if let Some(handle) = arg.strip_prefix('@') {
            return (!handle.is_empty()).then(|| Self::Handle(handle.to_string()));
        }
        arg.parse::<i64>().ok().map(Self::Id)
    }

    /// Like [`parse_strict`](Self::parse_strict) but a bare word is taken as a username.
    pub fn parse_loose(arg: &str) -> Option<Self> {
        let arg = arg.trim();
        if arg.is_empty() {
            return None;
        }
        Self::parse_strict(arg).or_else(|| {
            arg.chars()
                .all(|c| c.is_alphanumeric() || c == '_')
                .then(|| Self::Handle(arg.to_string()))
        })
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Id(id) => format!("ID {id}"),
            Self::Handle(h) => format!("@{h}"),
        }
    }
}

/// A resolved user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub user_id: i64,
    pub username: Option<String>,
}

impl Subject {
    pub fn describe(&self) -> String {
        match &self.username {
            Some(u) => format!("@{u}"),
            None => format!("ID {}", self.user_id),
        }
    }
}

/// Where a quick check may find its target, in priority order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSources {
    /// Author of the message the command replies to.
    pub reply: Option<Subject>,
    /// First `@mention` or text mention in the command.
    pub mention: Option<UserRef>,
    /// First bare argument.
    pub argument: Option<String>,
}

/// Result of `stats`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackStats {
    pub days: u32,
    pub entries: Vec<FeedbackEntry>,
    pub unique_user_count: usize,
}

/// Result of `user_history` and `quick_check`.
#[derive(Debug, Clone, PartialEq)]
pub struct History {
    pub subject: Subject,
    pub days: u32,
    pub entries: Vec<FeedbackEntry>,
}

/// Parse a `days` argument. Missing means `default`.
pub fn parse_days(raw: Option<&str>, default: u32) -> BotResult<u32> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.trim().parse::<u32>() {
        Ok(days) if (1..=MAX_DAYS).contains(&days) => Ok(days),
        _ => Err(BotError::InvalidArgument(format!(
            "Days must be a whole number between 1 and {MAX_DAYS}, got '{raw}'."
        ))),
    }
}

fn window_start(now: DateTime<Utc>, days: u32) -> BotResult<DateTime<Utc>> {
    if days == 0 || days > MAX_DAYS {
        return Err(BotError::InvalidArgument(format!(
            "Days must be between 1 and {MAX_DAYS}."
        )));
    }
    Ok(now - Duration::days(i64::from(days)))
}

/// Answers admin queries. Every operation requires the admin role.
pub struct QueryEngine {
    store: Arc<EventStore>,
    gate: Arc<AuthorizationGate>,
    transport: Arc<dyn Transport>,
}

impl QueryEngine {
    pub fn new(
        store: Arc<EventStore>,
        gate: Arc<AuthorizationGate>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self { store, gate, transport }
    }

    /// All entries of the window plus the number of distinct senders.
    pub async fn stats(
        &self,
        actor_id: i64,
        group_id: i64,
        days: u32,
        now: DateTime<Utc>,
    ) -> BotResult<FeedbackStats> {
        self.gate.require(actor_id, group_id, Role::Admin).await?;
        let since = window_start(now, days)?;

        let entries: Vec<_> = self
            .store
            .list_since(group_id, since)?
            .into_iter()
            .filter(|e| e.created_at < now)
            .collect();
        let unique_user_count = entries.iter().map(|e| e.user_id).collect::<HashSet<_>>().len();

        info!(
            "Stats for group {} ({} days): {} entries, {} senders",
            group_id,
            days,
            entries.len(),
            unique_user_count
        );
        Ok(FeedbackStats { days, entries, unique_user_count })
    }

    /// Feedback of one user within the window.
    pub async fn user_history(
        &self,
        actor_id: i64,
        group_id: i64,
        user: &UserRef,
        days: u32,
        now: DateTime<Utc>,
    ) -> BotResult<History> {
        self.gate.require(actor_id, group_id, Role::Admin).await?;
        let subject = self.resolve(group_id, user).await?;
        self.history(group_id, subject, days, now)
    }

    /// Three-day lookup of the first target found in `sources`.
    pub async fn quick_check(
        &self,
        actor_id: i64,
        group_id: i64,
        sources: &TargetSources,
        now: DateTime<Utc>,
    ) -> BotResult<History> {
        self.gate.require(actor_id, group_id, Role::Admin).await?;

        let subject = if let Some(reply) = &sources.reply {
            reply.clone()
        } else if let Some(mention) = &sources.mention {
            self.resolve(group_id, mention).await?
        } else if let Some(user) = sources.argument.as_deref().and_then(UserRef::parse_loose) {
            self.resolve(group_id, &user).await?
        } else {
            return Err(BotError::NoTarget);
        };

        self.history(group_id, subject, QUICK_CHECK_DAYS, now)
    }

    fn history(
        &self,
        group_id: i64,
        subject: Subject,
        days: u32,
        now: DateTime<Utc>,
    ) -> BotResult<History> {
        let since = window_start(now, days)?;
        let entries = self
            .store
            .list_for_user(group_id, subject.user_id, since)?
            .into_iter()
            .filter(|e| e.created_at < now)
            .collect();
        Ok(History { subject, days, entries })
    }

    /// Turn a user reference into an id, asking the transport first and
    /// falling back to usernames recorded in the group's feedback.
    async fn resolve(&self, group_id: i64, user: &UserRef) -> BotResult<Subject> {
        let handle = match user {
            UserRef::Id(id) => {
                return Ok(Subject { user_id: *id, username: None });
            }
            UserRef::Handle(handle) => handle,
        };

        match self.transport.resolve_username(group_id, handle).await {
            Ok(Some(user_id)) => {
                return Ok(Subject { user_id, username: Some(handle.clone()) });
            }
            Ok(None) => {}
            Err(e) => warn!("Username lookup for @{} failed: {}", handle, e),
        }

        match self.store.find_user_by_username(group_id, handle)? {
            Some(user_id) => Ok(Subject { user_id, username: Some(handle.clone()) }),
            None => Err(BotError::UserNotFound(user.describe())),
        }
    }
}
