//! Maps commands and tagged messages onto the engine and turns every outcome
//! into a reply. Nothing here returns an error to the transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::feedback::classifier::{InboundMessage, record_feedback};
use crate::feedback::commands::{CommandKind, ParsedCommand};
use crate::feedback::error::{BotError, BotResult, Denial};
use crate::feedback::gate::{AuthorizationGate, Decision, Role};
use crate::feedback::query::{
    DEFAULT_STATS_DAYS, QUICK_CHECK_DAYS, QueryEngine, Subject, TargetSources, UserRef, parse_days,
};
use crate::feedback::reminders::describe_interval;
use crate::feedback::report::{MAX_MESSAGE_CHARS, paginate, render_history, render_stats};
use crate::feedback::store::EventStore;

pub const WELCOME: &str = "👋 Welcome! I keep track of #feedback posts in authorized groups.";

/// Callback data of the cleardb confirmation buttons.
pub const CONFIRM_CLEAR: &str = "confirm_clear";
pub const CANCEL_CLEAR: &str = "cancel_clear";

/// How long a cleardb prompt stays valid.
const CONFIRMATION_TTL_MINUTES: i64 = 5;

/// Who sent a command and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    pub chat_id: i64,
    pub is_group: bool,
    pub chat_title: String,
    pub actor_id: i64,
    /// Author of the message the command replies to.
    pub reply_author: Option<Subject>,
    /// First mention in the command text.
    pub mention: Option<UserRef>,
}

/// What to send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Silent,
    /// One or more HTML messages, in order.
    Messages(Vec<String>),
    /// A cleardb prompt that needs Yes/Cancel buttons.
    ConfirmClear(String),
}

impl Response {
    fn text(text: impl Into<String>) -> Self {
        Self::Messages(vec![text.into()])
    }

    fn paged(text: &str) -> Self {
        Self::Messages(paginate(text, MAX_MESSAGE_CHARS))
    }

    fn from_error(err: &BotError) -> Self {
        err.user_message().map(Self::text).unwrap_or(Self::Silent)
    }
}

/// A button press on a cleardb prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearAction {
    Confirm,
    Cancel,
}

impl ClearAction {
    pub fn from_callback_data(data: &str) -> Option<Self> {
        match data {
            CONFIRM_CLEAR => Some(Self::Confirm),
            CANCEL_CLEAR => Some(Self::Cancel),
            _ => None,
        }
    }
}

/// Answer to a button press: a short toast and/or a replacement prompt text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackReply {
    pub toast: Option<String>,
    pub edit: Option<String>,
}

#[derive(Debug, Clone)]
struct PendingClear {
    requested_by: i64,
    requested_at: DateTime<Utc>,
}

pub struct CommandDispatcher {
    store: Arc<EventStore>,
    gate: Arc<AuthorizationGate>,
    queries: QueryEngine,
    reminder_interval: Duration,
    pending_clears: Mutex<HashMap<i64, PendingClear>>,
}

impl CommandDispatcher {
    pub fn new(
        store: Arc<EventStore>,
        gate: Arc<AuthorizationGate>,
        queries: QueryEngine,
        reminder_interval: Duration,
    ) -> Self {
        Self {
            store,
            gate,
            queries,
            reminder_interval,
            pending_clears: Mutex::new(HashMap::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<i64, PendingClear>> {
        self.pending_clears.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a tagged message if it qualifies, replying with an acknowledgement.
    pub fn handle_message(&self, msg: &InboundMessage, now: DateTime<Utc>) -> Response {
        match record_feedback(&self.store, msg, now) {
            Ok(Some((id, entry))) => {
                info!(
                    "📝 Feedback #{} recorded in {} for user {} (msg {})",
                    id, entry.group_id, entry.user_id, entry.media_ref.message_id
                );
                Response::text("✅ Thanks! Your feedback has been recorded.")
            }
            Ok(None) => Response::Silent,
            Err(e) => {
                warn!("Failed to record feedback in {}: {}", msg.group_id, e);
                Response::from_error(&BotError::Storage(e))
            }
        }
    }

    /// Run a command. Failures become replies (or silence).
    pub async fn handle_command(
        &self,
        cmd: &ParsedCommand,
        ctx: &CommandContext,
        now: DateTime<Utc>,
    ) -> Response {
        match self.execute(cmd, ctx, now).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    BotError::Storage(inner) => warn!("{:?} failed in {}: {}", cmd.kind, ctx.chat_id, inner),
                    BotError::PermissionDenied(Denial::GroupNotAuthorized) => {}
                    other => info!("{:?} by {} rejected: {}", cmd.kind, ctx.actor_id, other),
                }
                Response::from_error(&e)
            }
        }
    }

    async fn execute(
        &self,
        cmd: &ParsedCommand,
        ctx: &CommandContext,
        now: DateTime<Utc>,
    ) -> BotResult<Response> {
        match cmd.kind {
            CommandKind::Start => self.start(ctx),
            CommandKind::AddGroup => self.add_group(ctx, now).await,
            CommandKind::FbStats => {
                let days = self.admin_arg(ctx, parse_days(cmd.arg(0), DEFAULT_STATS_DAYS)).await?;
                let stats = self.queries.stats(ctx.actor_id, ctx.chat_id, days, now).await?;
                Ok(Response::paged(&render_stats(&stats)))
            }
            CommandKind::FbUser => {
                let (user, days) = self.admin_arg(ctx, parse_user_args(cmd)).await?;
                let history = self
                    .queries
                    .user_history(ctx.actor_id, ctx.chat_id, &user, days, now)
                    .await?;
                Ok(Response::paged(&render_history(&history.subject, &history.entries, history.days)))
            }
            CommandKind::Check => {
                let sources = TargetSources {
                    reply: ctx.reply_author.clone(),
                    mention: ctx.mention.clone(),
                    argument: cmd.arg(0).map(str::to_string),
                };
                let history = self.queries.quick_check(ctx.actor_id, ctx.chat_id, &sources, now).await?;
                Ok(Response::paged(&render_history(&history.subject, &history.entries, history.days)))
            }
            CommandKind::AddReminder => {
                self.gate.require(ctx.actor_id, ctx.chat_id, Role::Admin).await?;
                if cmd.raw_args.is_empty() {
                    return Err(BotError::InvalidArgument("Usage: /addreminder <text>".into()));
                }
                self.store.upsert_reminder(ctx.chat_id, &cmd.raw_args, self.reminder_interval, now)?;
                info!("⏰ Reminder set in {} by {}", ctx.chat_id, ctx.actor_id);
                Ok(Response::text(format!(
                    "✅ Reminder saved. I'll send it every {} in this group.",
                    describe_interval(self.reminder_interval)
                )))
            }
            CommandKind::RemoveReminder => {
                self.gate.require(ctx.actor_id, ctx.chat_id, Role::Admin).await?;
                if self.store.deactivate_reminder(ctx.chat_id)? {
                    info!("Reminder removed in {} by {}", ctx.chat_id, ctx.actor_id);
                    Ok(Response::text("🗑 Reminder removed for this group."))
                } else {
                    Ok(Response::text("ℹ️ There is no active reminder in this group."))
                }
            }
            CommandKind::ClearDb => {
                self.gate.require(ctx.actor_id, ctx.chat_id, Role::Admin).await?;
                self.pending().insert(
                    ctx.chat_id,
                    PendingClear { requested_by: ctx.actor_id, requested_at: now },
                );
                Ok(Response::ConfirmClear(
                    "⚠️ Are you sure you want to delete <b>all stored feedback data</b> of this group? \
                     This action cannot be undone."
                        .to_string(),
                ))
            }
        }
    }

    fn start(&self, ctx: &CommandContext) -> BotResult<Response> {
        if ctx.is_group && !self.store.is_authorized(ctx.chat_id)? {
            return Ok(Response::text(
                "🚫 This group is not authorized. Ask the owner to run /addgroup here.",
            ));
        }
        Ok(Response::text(WELCOME))
    }

    async fn add_group(&self, ctx: &CommandContext, now: DateTime<Utc>) -> BotResult<Response> {
        if !ctx.is_group {
            return Ok(Response::text("❌ Run this inside a group you want to authorize."));
        }
        if self.gate.evaluate(ctx.actor_id, ctx.chat_id, Role::Owner).await? != Decision::Granted {
            return Ok(Response::text("❌ Only the owner can authorize groups for this bot."));
        }
        let group = self.store.authorize(ctx.chat_id, &ctx.chat_title, now)?;
        info!("✅ Group {} ({}) authorized", group.group_id, group.title);
        Ok(Response::text("✅ This group has been authorized. Feedback tracking is now active."))
    }

    /// Check the admin role before reporting an argument problem, so that
    /// unauthorized groups and non-admins never see usage hints.
    async fn admin_arg<T>(&self, ctx: &CommandContext, parsed: BotResult<T>) -> BotResult<T> {
        if parsed.is_err() {
            self.gate.require(ctx.actor_id, ctx.chat_id, Role::Admin).await?;
        }
        parsed
    }

    /// A press on the cleardb prompt. Only admins of the group may answer it,
    /// and only while the prompt is fresh.
    pub async fn handle_clear_callback(
        &self,
        action: ClearAction,
        actor_id: i64,
        group_id: i64,
        now: DateTime<Utc>,
    ) -> CallbackReply {
        match self.gate.authorize(actor_id, group_id, Role::Admin).await {
            Ok(true) => {}
            Ok(false) => {
                return CallbackReply { toast: Some("Not allowed.".into()), edit: None };
            }
            Err(e) => {
                warn!("Permission check for cleardb in {} failed: {}", group_id, e);
                return CallbackReply { toast: Some("Try again later.".into()), edit: None };
            }
        }

        let pending = self.pending().remove(&group_id);
        let fresh = pending
            .as_ref()
            .is_some_and(|p| now - p.requested_at <= Duration::minutes(CONFIRMATION_TTL_MINUTES));

        match action {
            ClearAction::Cancel => CallbackReply {
                toast: None,
                edit: Some("❌ Operation cancelled.".into()),
            },
            ClearAction::Confirm if !fresh => CallbackReply {
                toast: None,
                edit: Some("⌛ This confirmation has expired. Run /cleardb again.".into()),
            },
            ClearAction::Confirm => match self.store.wipe(group_id) {
                Ok(deleted) => {
                    if let Some(p) = pending {
                        info!(
                            "cleardb in {} requested by {} confirmed by {}",
                            group_id, p.requested_by, actor_id
                        );
                    }
                    CallbackReply {
                        toast: None,
                        edit: Some(format!(
                            "🗑 All feedback data of this group has been cleared ({deleted} entries)."
                        )),
                    }
                }
                Err(e) => {
                    warn!("cleardb in {} failed: {}", group_id, e);
                    // Keep the prompt and its buttons so the admin can retry.
                    if let Some(p) = pending {
                        self.pending().insert(group_id, p);
                    }
                    CallbackReply {
                        toast: BotError::Storage(e).user_message(),
                        edit: None,
                    }
                }
            },
        }
    }
}

fn parse_user_args(cmd: &ParsedCommand) -> BotResult<(UserRef, u32)> {
    let target = cmd
        .arg(0)
        .ok_or_else(|| BotError::InvalidArgument("Usage: /fb_user <user_id|@username> [days]".into()))?;
    let user = UserRef::parse_strict(target).ok_or_else(|| {
        BotError::InvalidArgument("Invalid identifier. Provide a numeric ID or @username.".into())
    })?;
    let days = parse_days(cmd.arg(1), QUICK_CHECK_DAYS)?;
    Ok((user, days))
}
