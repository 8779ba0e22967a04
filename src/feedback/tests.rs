//! End-to-end scenarios across classifier, store, queries, dispatcher and scheduler.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::feedback::classifier::{Author, InboundMessage, RepliedMessage, record_feedback};
use crate::feedback::commands::parse_command;
use crate::feedback::dispatch::{ClearAction, CommandContext, CommandDispatcher, Response};
use crate::feedback::error::{BotError, Denial};
use crate::feedback::gate::{AuthorizationGate, Role};
use crate::feedback::query::{QueryEngine, Subject, TargetSources, UserRef};
use crate::feedback::scheduler::{
    JobKind, JobOutcome, Scheduler, SchedulerConfig, broadcast_reminders, cleanup,
};
use crate::feedback::store::{EventStore, MediaRef, NewFeedback};
use crate::feedback::testing::FakeTransport;
use crate::feedback::transport::Transport;

const OWNER: i64 = 1;
const ADMIN: i64 = 10;
const MEMBER: i64 = 20;
const GROUP: i64 = -1001234567890;
const OTHER_GROUP: i64 = -1009876543210;

struct Harness {
    store: Arc<EventStore>,
    transport: Arc<FakeTransport>,
    gate: Arc<AuthorizationGate>,
    dispatcher: CommandDispatcher,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
}

fn harness() -> Harness {
    let store = Arc::new(EventStore::in_memory().unwrap());
    let transport = Arc::new(
        FakeTransport::default()
            .with_admin(GROUP, ADMIN)
            .with_admin(OTHER_GROUP, ADMIN),
    );
    let dyn_transport: Arc<dyn Transport> = transport.clone();
    let gate = Arc::new(AuthorizationGate::new(OWNER, store.clone(), dyn_transport.clone()));
    let queries = QueryEngine::new(store.clone(), gate.clone(), dyn_transport);
    let dispatcher = CommandDispatcher::new(store.clone(), gate.clone(), queries, Duration::hours(2));
    Harness { store, transport, gate, dispatcher }
}

fn authorized() -> Harness {
    let h = harness();
    h.store.authorize(GROUP, "Design crit", t0()).unwrap();
    h
}

fn author(user_id: i64, username: &str) -> Author {
    Author {
        user_id,
        username: Some(username.to_string()),
        display_name: username.to_uppercase(),
    }
}

fn message(id: i64, text: &str, has_media: bool, from: Author) -> InboundMessage {
    InboundMessage {
        message_id: id,
        group_id: GROUP,
        group_username: None,
        text: Some(text.to_string()),
        has_media,
        author: Some(from),
        reply_to: None,
    }
}

fn entry(group_id: i64, user_id: i64, username: &str, at: DateTime<Utc>) -> NewFeedback {
    NewFeedback {
        group_id,
        user_id,
        username: Some(username.to_string()),
        display_name: username.to_string(),
        media_ref: MediaRef { message_id: 1, link: "https://t.me/c/1/1".into() },
        created_at: at,
    }
}

fn ctx(chat_id: i64, actor_id: i64) -> CommandContext {
    CommandContext {
        chat_id,
        is_group: true,
        chat_title: "Design crit".into(),
        actor_id,
        reply_author: None,
        mention: None,
    }
}

async fn run(h: &Harness, text: &str, ctx: &CommandContext, now: DateTime<Utc>) -> Response {
    let cmd = parse_command(text, Some("feedbackbot")).unwrap();
    h.dispatcher.handle_command(&cmd, ctx, now).await
}

fn first_text(response: &Response) -> &str {
    match response {
        Response::Messages(pages) => &pages[0],
        Response::ConfirmClear(text) => text,
        Response::Silent => panic!("expected a reply, got silence"),
    }
}

// ==================== CLASSIFICATION ====================

#[test]
fn test_tagged_photo_records_sender() {
    let h = authorized();
    let msg = message(77, "#feedback on my poster", true, author(MEMBER, "alice"));

    let (_, recorded) = record_feedback(&h.store, &msg, t0()).unwrap().unwrap();
    assert_eq!(recorded.user_id, MEMBER);
    assert_eq!(recorded.media_ref.message_id, 77);
    assert_eq!(recorded.media_ref.link, "https://t.me/c/1234567890/77");

    let stored = h.store.list_since(GROUP, t0() - Duration::days(1)).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].username.as_deref(), Some("alice"));
}

#[test]
fn test_tagged_reply_records_media_author() {
    let h = authorized();
    let mut msg = message(90, "#feedback", false, author(MEMBER + 1, "bob"));
    msg.reply_to = Some(RepliedMessage {
        message_id: 88,
        has_media: true,
        author: Some(author(MEMBER, "alice")),
    });

    let (_, recorded) = record_feedback(&h.store, &msg, t0()).unwrap().unwrap();
    assert_eq!(recorded.user_id, MEMBER);
    assert_eq!(recorded.media_ref.message_id, 88);
}

#[test]
fn test_reply_to_anonymous_media_falls_back_to_tagger() {
    let h = authorized();
    let mut msg = message(90, "#feedback", false, author(MEMBER + 1, "bob"));
    msg.reply_to = Some(RepliedMessage { message_id: 88, has_media: true, author: None });

    let (_, recorded) = record_feedback(&h.store, &msg, t0()).unwrap().unwrap();
    assert_eq!(recorded.user_id, MEMBER + 1);
}

#[test]
fn test_non_qualifying_messages_are_ignored() {
    let h = authorized();

    let text_only = message(1, "#feedback please", false, author(MEMBER, "alice"));
    assert!(record_feedback(&h.store, &text_only, t0()).unwrap().is_none());

    let mut reply_to_text = message(2, "#feedback", false, author(MEMBER, "alice"));
    reply_to_text.reply_to = Some(RepliedMessage {
        message_id: 1,
        has_media: false,
        author: Some(author(MEMBER + 1, "bob")),
    });
    assert!(record_feedback(&h.store, &reply_to_text, t0()).unwrap().is_none());

    let untagged = message(3, "nice photo", true, author(MEMBER, "alice"));
    assert!(record_feedback(&h.store, &untagged, t0()).unwrap().is_none());

    let mut elsewhere = message(4, "#feedback", true, author(MEMBER, "alice"));
    elsewhere.group_id = OTHER_GROUP;
    assert!(record_feedback(&h.store, &elsewhere, t0()).unwrap().is_none());

    assert!(h.store.list_since(GROUP, t0() - Duration::days(1)).unwrap().is_empty());
}

#[test]
fn test_recorded_feedback_is_acknowledged() {
    let h = authorized();
    let msg = message(5, "#feedback", true, author(MEMBER, "alice"));
    let response = h.dispatcher.handle_message(&msg, t0());
    assert!(first_text(&response).contains("recorded"));

    let plain = message(6, "hello", true, author(MEMBER, "alice"));
    assert_eq!(h.dispatcher.handle_message(&plain, t0()), Response::Silent);
}

// ==================== QUERIES ====================

#[tokio::test]
async fn test_stats_counts_unique_senders() {
    let h = authorized();
    for (i, user) in [MEMBER, MEMBER, MEMBER + 1, MEMBER, MEMBER + 1].into_iter().enumerate() {
        let at = t0() - Duration::hours(i as i64 + 1);
        h.store.save(&entry(GROUP, user, "u", at)).unwrap();
    }
    // Outside the window on both ends.
    h.store.save(&entry(GROUP, MEMBER + 2, "old", t0() - Duration::days(4))).unwrap();
    h.store.save(&entry(GROUP, MEMBER + 3, "now", t0())).unwrap();

    let response = run(&h, "/fb_stats 3", &ctx(GROUP, ADMIN), t0()).await;
    let report = first_text(&response);
    assert!(report.contains("Total unique senders:</b> 2"), "{report}");
    assert!(report.contains("5. "));
    assert!(!report.contains("6. "));
}

#[tokio::test]
async fn test_stats_empty_window() {
    let h = authorized();
    let response = run(&h, "/fb_stats", &ctx(GROUP, ADMIN), t0()).await;
    assert_eq!(first_text(&response), "📊 No feedback found in the last 3 days.");
}

#[tokio::test]
async fn test_invalid_days_argument() {
    let h = authorized();
    let response = run(&h, "/fb_stats abc", &ctx(GROUP, ADMIN), t0()).await;
    assert!(first_text(&response).contains("between 1 and 365"));

    // Non-admins never see usage hints.
    let response = run(&h, "/fb_stats abc", &ctx(GROUP, MEMBER), t0()).await;
    assert!(first_text(&response).contains("admin"));
}

#[tokio::test]
async fn test_fb_user_by_id_and_username() {
    let h = authorized();
    h.store.save(&entry(GROUP, MEMBER, "alice", t0() - Duration::days(1))).unwrap();
    h.store.save(&entry(GROUP, MEMBER + 1, "bob", t0() - Duration::days(1))).unwrap();

    let by_id = run(&h, &format!("/fb_user {MEMBER} 7"), &ctx(GROUP, ADMIN), t0()).await;
    assert!(first_text(&by_id).contains("alice"));
    assert!(!first_text(&by_id).contains("bob"));

    let by_name = run(&h, "/fb_user @Alice", &ctx(GROUP, ADMIN), t0()).await;
    assert!(first_text(&by_name).contains(&format!("<code>{MEMBER}</code>")));

    let unknown = run(&h, "/fb_user @carol", &ctx(GROUP, ADMIN), t0()).await;
    assert_eq!(first_text(&unknown), "❌ Could not find user @carol in this group.");

    let missing = run(&h, "/fb_user", &ctx(GROUP, ADMIN), t0()).await;
    assert!(first_text(&missing).contains("Usage"));
}

#[tokio::test]
async fn test_quick_check_target_priority() {
    let h = authorized();
    let transport = Arc::new(FakeTransport::default().with_username(GROUP, "bob", MEMBER + 1));
    let queries = QueryEngine::new(h.store.clone(), h.gate.clone(), transport);
    h.store.save(&entry(GROUP, MEMBER, "alice", t0() - Duration::hours(5))).unwrap();
    h.store.save(&entry(GROUP, MEMBER + 1, "bob", t0() - Duration::hours(5))).unwrap();

    let all = TargetSources {
        reply: Some(Subject { user_id: MEMBER, username: Some("alice".into()) }),
        mention: Some(UserRef::Handle("bob".into())),
        argument: Some("@bob".into()),
    };
    let history = queries.quick_check(OWNER, GROUP, &all, t0()).await.unwrap();
    assert_eq!(history.subject.user_id, MEMBER);
    assert_eq!(history.days, 3);

    let mention_and_arg = TargetSources { reply: None, ..all.clone() };
    let history = queries.quick_check(OWNER, GROUP, &mention_and_arg, t0()).await.unwrap();
    assert_eq!(history.subject.user_id, MEMBER + 1);

    let bare_word = TargetSources { argument: Some("alice".into()), ..TargetSources::default() };
    let history = queries.quick_check(OWNER, GROUP, &bare_word, t0()).await.unwrap();
    assert_eq!(history.subject.user_id, MEMBER);
    assert_eq!(history.entries.len(), 1);

    let err = queries.quick_check(OWNER, GROUP, &TargetSources::default(), t0()).await.unwrap_err();
    assert!(matches!(err, BotError::NoTarget));
}

#[tokio::test]
async fn test_quick_check_without_feedback() {
    let h = authorized();
    let mut context = ctx(GROUP, ADMIN);
    context.reply_author = Some(Subject { user_id: 555, username: None });

    let response = run(&h, "/!", &context, t0()).await;
    assert_eq!(first_text(&response), "❌ No feedback was received from ID 555 in the last 3 days.");

    let response = run(&h, "/check", &ctx(GROUP, ADMIN), t0()).await;
    assert!(first_text(&response).starts_with("Usage: reply with /check"));
}

#[tokio::test]
async fn test_lookup_failure_falls_back_to_store() {
    let h = authorized();
    h.transport.set_fail_lookups(true);
    h.store.save(&entry(GROUP, MEMBER, "alice", t0() - Duration::hours(1))).unwrap();

    // The admin check fails too, so only the owner gets through.
    let response = run(&h, "/check @alice", &ctx(GROUP, OWNER), t0()).await;
    assert!(first_text(&response).contains("Feedback history"));
    let response = run(&h, "/check @alice", &ctx(GROUP, ADMIN), t0()).await;
    assert!(first_text(&response).contains("must be an admin"));
}

// ==================== PERMISSIONS ====================

#[tokio::test]
async fn test_member_is_rejected_from_admin_commands() {
    let h = authorized();
    for text in ["/fb_stats", "/fb_user 5", "/check @alice", "/addreminder hi", "/removereminder", "/cleardb"] {
        let response = run(&h, text, &ctx(GROUP, MEMBER), t0()).await;
        assert_eq!(first_text(&response), "❌ You must be an admin to use this command.", "{text}");
    }
    assert!(h.store.get_reminder(GROUP).unwrap().is_none());
}

#[tokio::test]
async fn test_unauthorized_group_stays_silent() {
    let h = harness();
    for text in ["/fb_stats", "/check @alice", "/cleardb"] {
        let response = run(&h, text, &ctx(GROUP, ADMIN), t0()).await;
        assert_eq!(response, Response::Silent, "{text}");
    }
    let response = run(&h, "/start", &ctx(GROUP, ADMIN), t0()).await;
    assert!(first_text(&response).contains("/addgroup"));
}

#[tokio::test]
async fn test_owner_authorizes_group() {
    let h = harness();

    let response = run(&h, "/addgroup", &ctx(GROUP, ADMIN), t0()).await;
    assert!(first_text(&response).contains("Only the owner"));
    assert!(!h.store.is_authorized(GROUP).unwrap());

    let response = run(&h, "/addgroup", &ctx(GROUP, OWNER), t0()).await;
    assert!(first_text(&response).contains("authorized"));
    assert!(h.store.is_authorized(GROUP).unwrap());
    assert!(h.gate.authorize(ADMIN, GROUP, Role::Admin).await.unwrap());

    let mut private = ctx(OWNER, OWNER);
    private.is_group = false;
    let response = run(&h, "/addgroup", &private, t0()).await;
    assert!(first_text(&response).contains("inside a group"));
}

#[tokio::test]
async fn test_gate_denial_reasons() {
    let h = harness();
    let err = h.gate.require(OWNER, GROUP, Role::Member).await.unwrap_err();
    assert!(matches!(err, BotError::PermissionDenied(Denial::GroupNotAuthorized)));

    h.store.authorize(GROUP, "g", t0()).unwrap();
    assert!(h.gate.authorize(MEMBER, GROUP, Role::Member).await.unwrap());
    assert!(h.gate.authorize(OWNER, GROUP, Role::Admin).await.unwrap());
    let err = h.gate.require(MEMBER, GROUP, Role::Admin).await.unwrap_err();
    assert!(matches!(err, BotError::PermissionDenied(Denial::InsufficientRole)));
}

// ==================== CLEARDB ====================

#[tokio::test]
async fn test_cleardb_requires_confirmation() {
    let h = authorized();
    h.store.authorize(OTHER_GROUP, "Other", t0()).unwrap();
    h.store.save(&entry(GROUP, MEMBER, "alice", t0() - Duration::hours(1))).unwrap();
    h.store.save(&entry(GROUP, MEMBER, "alice", t0() - Duration::hours(2))).unwrap();
    h.store.save(&entry(OTHER_GROUP, MEMBER, "alice", t0() - Duration::hours(1))).unwrap();
    let since = t0() - Duration::days(1);

    let prompt = run(&h, "/cleardb", &ctx(GROUP, ADMIN), t0()).await;
    assert!(matches!(prompt, Response::ConfirmClear(_)));
    assert_eq!(h.store.list_since(GROUP, since).unwrap().len(), 2);

    let reply = h.dispatcher.handle_clear_callback(ClearAction::Cancel, ADMIN, GROUP, t0()).await;
    assert_eq!(reply.edit.as_deref(), Some("❌ Operation cancelled."));
    assert_eq!(h.store.list_since(GROUP, since).unwrap().len(), 2);

    // The cancelled prompt cannot be confirmed afterwards.
    let reply = h.dispatcher.handle_clear_callback(ClearAction::Confirm, ADMIN, GROUP, t0()).await;
    assert!(reply.edit.unwrap().contains("expired"));
    assert_eq!(h.store.list_since(GROUP, since).unwrap().len(), 2);

    run(&h, "/cleardb", &ctx(GROUP, ADMIN), t0()).await;
    let reply = h
        .dispatcher
        .handle_clear_callback(ClearAction::Confirm, ADMIN, GROUP, t0() + Duration::minutes(1))
        .await;
    assert!(reply.edit.unwrap().contains("(2 entries)"));
    assert!(h.store.list_since(GROUP, since).unwrap().is_empty());
    assert_eq!(h.store.list_since(OTHER_GROUP, since).unwrap().len(), 1);
}

#[tokio::test]
async fn test_cleardb_prompt_expires_and_rejects_members() {
    let h = authorized();
    h.store.save(&entry(GROUP, MEMBER, "alice", t0() - Duration::hours(1))).unwrap();
    run(&h, "/cleardb", &ctx(GROUP, ADMIN), t0()).await;

    let reply = h.dispatcher.handle_clear_callback(ClearAction::Confirm, MEMBER, GROUP, t0()).await;
    assert_eq!(reply.toast.as_deref(), Some("Not allowed."));
    assert!(reply.edit.is_none());

    let late = t0() + Duration::minutes(6);
    let reply = h.dispatcher.handle_clear_callback(ClearAction::Confirm, ADMIN, GROUP, late).await;
    assert!(reply.edit.unwrap().contains("expired"));
    assert_eq!(h.store.list_since(GROUP, t0() - Duration::days(1)).unwrap().len(), 1);
}

#[tokio::test]
async fn test_cleardb_survives_storage_failure() {
    let h = authorized();
    h.store.save(&entry(GROUP, MEMBER, "alice", t0() - Duration::hours(1))).unwrap();
    run(&h, "/cleardb", &ctx(GROUP, ADMIN), t0()).await;

    h.store.set_feedback_offline(true);
    let reply = h.dispatcher.handle_clear_callback(ClearAction::Confirm, ADMIN, GROUP, t0()).await;
    assert!(reply.toast.unwrap().contains("try again later"));
    assert!(reply.edit.is_none());

    // The same prompt still works once storage is back.
    h.store.set_feedback_offline(false);
    let reply = h.dispatcher.handle_clear_callback(ClearAction::Confirm, ADMIN, GROUP, t0()).await;
    assert!(reply.edit.unwrap().contains("(1 entries)"));
    assert!(h.store.list_since(GROUP, t0() - Duration::days(1)).unwrap().is_empty());
}

// ==================== MAINTENANCE ====================

#[test]
fn test_cleanup_is_idempotent() {
    let h = authorized();
    h.store.save(&entry(GROUP, MEMBER, "old", t0() - Duration::days(6))).unwrap();
    h.store.save(&entry(GROUP, MEMBER, "edge", t0() - Duration::days(5))).unwrap();
    h.store.save(&entry(GROUP, MEMBER, "new", t0() - Duration::days(1))).unwrap();

    assert_eq!(cleanup(&h.store, Duration::days(5), t0()).unwrap(), 1);
    assert_eq!(cleanup(&h.store, Duration::days(5), t0()).unwrap(), 0);
    assert_eq!(h.store.list_since(GROUP, t0() - Duration::days(30)).unwrap().len(), 2);
}

#[tokio::test]
async fn test_reminder_fires_once_per_interval() {
    let h = authorized();
    let response = run(&h, "/addreminder Post your <b>work</b>", &ctx(GROUP, ADMIN), t0()).await;
    assert!(first_text(&response).contains("every 2 hours"));

    let transport = h.transport.as_ref();
    assert_eq!(broadcast_reminders(&h.store, transport, t0() + Duration::hours(1)).await.unwrap(), 0);

    let fire = t0() + Duration::hours(2);
    assert_eq!(broadcast_reminders(&h.store, transport, fire).await.unwrap(), 1);
    assert_eq!(broadcast_reminders(&h.store, transport, fire).await.unwrap(), 0);

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].chat_id, GROUP);
    assert_eq!(sent[0].text, "⏰ Reminder: Post your &lt;b&gt;work&lt;/b&gt;");

    let reminder = h.store.get_reminder(GROUP).unwrap().unwrap();
    assert_eq!(reminder.next_fire_at, t0() + Duration::hours(4));
}

#[tokio::test]
async fn test_removed_reminder_stops() {
    let h = authorized();
    run(&h, "/addreminder hello", &ctx(GROUP, ADMIN), t0()).await;

    let response = run(&h, "/removereminder", &ctx(GROUP, ADMIN), t0()).await;
    assert!(first_text(&response).contains("removed"));
    let response = run(&h, "/removereminder", &ctx(GROUP, ADMIN), t0()).await;
    assert!(first_text(&response).contains("no active reminder"));

    let later = t0() + Duration::hours(3);
    assert_eq!(broadcast_reminders(&h.store, h.transport.as_ref(), later).await.unwrap(), 0);
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn test_failed_reminder_send_is_not_retried() {
    let h = authorized();
    h.store.upsert_reminder(GROUP, "hi", Duration::hours(2), t0()).unwrap();
    h.transport.set_fail_sends(true);

    let fire = t0() + Duration::hours(2);
    assert_eq!(broadcast_reminders(&h.store, h.transport.as_ref(), fire).await.unwrap(), 0);
    h.transport.set_fail_sends(false);
    assert_eq!(broadcast_reminders(&h.store, h.transport.as_ref(), fire).await.unwrap(), 0);
    assert_eq!(
        h.store.get_reminder(GROUP).unwrap().unwrap().next_fire_at,
        t0() + Duration::hours(4)
    );
}

#[tokio::test]
async fn test_scheduler_survives_panicking_job() {
    let h = authorized();
    h.store.upsert_reminder(GROUP, "hi", Duration::hours(2), t0()).unwrap();
    h.transport.set_panic_sends(true);
    let scheduler = Arc::new(Scheduler::new(
        SchedulerConfig::default(),
        h.store.clone(),
        h.transport.clone(),
    ));

    let outcome = scheduler.run_once(JobKind::Reminders, t0() + Duration::hours(2)).await;
    assert!(matches!(outcome, JobOutcome::Failed(_)));

    assert_eq!(scheduler.run_once(JobKind::Heartbeat, t0()).await, JobOutcome::Completed(0));
    h.store.save(&entry(GROUP, MEMBER, "old", t0() - Duration::days(10))).unwrap();
    assert_eq!(scheduler.run_once(JobKind::Cleanup, t0()).await, JobOutcome::Completed(1));

    let status = scheduler.status();
    let reminders = &status[&JobKind::Reminders];
    assert!(!reminders.running);
    assert_eq!((reminders.runs, reminders.failures), (1, 1));
    assert!(reminders.last_error.is_some());
    assert_eq!(status[&JobKind::Heartbeat].failures, 0);
    assert!(status[&JobKind::Cleanup].last_success.is_some());
}
