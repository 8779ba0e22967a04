use std::sync::Arc;

use chrono::Utc;
use teloxide::prelude::*;
use teloxide::types::MessageEntityKind;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use feedback_bot::config::Config;
use feedback_bot::feedback::commands::parse_command;
use feedback_bot::feedback::dispatch::ClearAction;
use feedback_bot::feedback::query::{Subject, UserRef};
use feedback_bot::feedback::telegram::{ThrottledBot, message_author, throttled_bot};
use feedback_bot::feedback::{
    AuthorizationGate, CommandContext, CommandDispatcher, EventStore, InboundMessage,
    QueryEngine, RepliedMessage, Response, Scheduler, TelegramClient, Transport,
};
use feedback_bot::{health, telegram_log};

struct App {
    dispatcher: CommandDispatcher,
    telegram: Arc<TelegramClient>,
    bot_username: Option<String>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    let bot = throttled_bot(&config.bot_token);

    // Setup logging
    if let Err(e) = std::fs::create_dir_all(&config.log_dir) {
        eprintln!("Failed to create log dir {:?}: {e}", config.log_dir);
    }
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "feedback-bot.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let registry = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        );

    if let Some(log_chat_id) = config.log_chat_id {
        let tg_layer = telegram_log::TelegramLogLayer::new(bot.clone(), log_chat_id);
        registry.with(tg_layer).init();
    } else {
        registry.init();
    }

    info!("🚀 Starting feedback bot...");
    info!("Owner ID: {}", config.owner_id);

    let store = match EventStore::open(&config.storage) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open store {:?}: {e}", config.storage);
            std::process::exit(1);
        }
    };

    let telegram = Arc::new(TelegramClient::new(bot.clone()));
    let transport: Arc<dyn Transport> = telegram.clone();
    let gate = Arc::new(AuthorizationGate::new(config.owner_id, store.clone(), transport.clone()));
    let queries = QueryEngine::new(store.clone(), gate.clone(), transport.clone());
    let dispatcher = CommandDispatcher::new(store.clone(), gate, queries, config.reminder_interval);

    let scheduler = Arc::new(Scheduler::new(config.scheduler.clone(), store, transport));
    let scheduler_handle = scheduler.start();

    let port = config.port;
    let health_scheduler = scheduler.clone();
    tokio::spawn(async move {
        if let Err(e) = health::serve(port, health_scheduler).await {
            error!("Health endpoint stopped: {e}");
        }
    });

    let bot_username = match bot.get_me().await {
        Ok(me) => {
            info!("Bot user ID: {}, username: @{}", me.id, me.username());
            Some(me.username().to_string())
        }
        Err(e) => {
            warn!("Failed to get bot info: {e}");
            None
        }
    };

    let app = Arc::new(App { dispatcher, telegram, bot_username });

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![app])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Dispatcher stopped, shutting down");
    scheduler_handle.shutdown().await;
}

async fn handle_message(msg: Message, app: Arc<App>) -> ResponseResult<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let author = message_author(&msg);
    let is_group = msg.chat.is_group() || msg.chat.is_supergroup();
    let text = msg.text().or(msg.caption()).unwrap_or_default();
    let now = Utc::now();

    if let Some(cmd) = parse_command(text, app.bot_username.as_deref()) {
        let ctx = CommandContext {
            chat_id: msg.chat.id.0,
            is_group,
            chat_title: msg.chat.title().unwrap_or_default().to_string(),
            actor_id: user.id.0 as i64,
            reply_author: msg
                .reply_to_message()
                .and_then(message_author)
                .map(|a| Subject { user_id: a.user_id, username: a.username }),
            mention: first_mention(&msg),
        };
        info!("Command {:?} from {} in {}", cmd.kind, ctx.actor_id, ctx.chat_id);
        let response = app.dispatcher.handle_command(&cmd, &ctx, now).await;
        send_response(&app, msg.chat.id.0, msg.id.0 as i64, response).await;
        return Ok(());
    }

    if !is_group {
        return Ok(());
    }

    let inbound = InboundMessage {
        message_id: msg.id.0 as i64,
        group_id: msg.chat.id.0,
        group_username: msg.chat.username().map(str::to_string),
        text: (!text.is_empty()).then(|| text.to_string()),
        has_media: has_media(&msg),
        author,
        reply_to: msg.reply_to_message().map(|reply| RepliedMessage {
            message_id: reply.id.0 as i64,
            has_media: has_media(reply),
            author: message_author(reply),
        }),
    };
    let response = app.dispatcher.handle_message(&inbound, now);
    send_response(&app, inbound.group_id, inbound.message_id, response).await;
    Ok(())
}

async fn handle_callback(bot: ThrottledBot, q: CallbackQuery, app: Arc<App>) -> ResponseResult<()> {
    let action = q.data.as_deref().and_then(ClearAction::from_callback_data);
    let target = q.message.as_ref().map(|m| (m.chat().id.0, m.id().0 as i64));

    let (Some(action), Some((chat_id, message_id))) = (action, target) else {
        if let Err(e) = bot.answer_callback_query(q.id.clone()).await {
            warn!("Failed to answer callback: {e}");
        }
        return Ok(());
    };

    let reply = app
        .dispatcher
        .handle_clear_callback(action, q.from.id.0 as i64, chat_id, Utc::now())
        .await;

    let mut answer = bot.answer_callback_query(q.id.clone());
    if let Some(toast) = reply.toast {
        answer = answer.text(toast);
    }
    if let Err(e) = answer.await {
        warn!("Failed to answer callback: {e}");
    }
    if let Some(text) = reply.edit {
        // Failures are logged by the client.
        let _ = app.telegram.edit_text(chat_id, message_id, &text).await;
    }
    Ok(())
}

async fn send_response(app: &App, chat_id: i64, reply_to: i64, response: Response) {
    match response {
        Response::Silent => {}
        Response::Messages(pages) => {
            for (i, page) in pages.iter().enumerate() {
                let reply = (i == 0).then_some(reply_to);
                if app.telegram.send_text(chat_id, page, reply).await.is_err() {
                    break;
                }
            }
        }
        Response::ConfirmClear(prompt) => {
            let _ = app.telegram.send_clear_prompt(chat_id, &prompt, Some(reply_to)).await;
        }
    }
}

fn has_media(msg: &Message) -> bool {
    msg.photo().is_some()
        || msg.video().is_some()
        || msg.document().is_some()
        || msg.animation().is_some()
}

/// First `@mention` or text mention in the message.
fn first_mention(msg: &Message) -> Option<UserRef> {
    let entities = msg.parse_entities().or_else(|| msg.parse_caption_entities())?;
    entities.iter().find_map(|entity| match entity.kind() {
        MessageEntityKind::Mention => {
            Some(UserRef::Handle(entity.text().trim_start_matches('@').to_string()))
        }
        MessageEntityKind::TextMention { user } => Some(UserRef::Id(user.id.0 as i64)),
        _ => None,
    })
}
