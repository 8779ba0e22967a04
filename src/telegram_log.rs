//! Forwards WARN and ERROR events to an operator chat.

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ChatId;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use crate::feedback::report::MAX_MESSAGE_CHARS;
use crate::feedback::telegram::ThrottledBot;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const MAX_BUFFERED: usize = 20;

pub struct TelegramLogLayer {
    tx: mpsc::UnboundedSender<String>,
}

impl TelegramLogLayer {
    /// Must be called inside a tokio runtime.
    pub fn new(bot: ThrottledBot, chat_id: i64) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let chat_id = ChatId(chat_id);

        tokio::spawn(async move {
            let mut buffer: Vec<String> = Vec::new();
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);

            loop {
                tokio::select! {
                    line = rx.recv() => match line {
                        Some(line) => {
                            buffer.push(line);
                            if buffer.len() >= MAX_BUFFERED {
                                flush(&bot, chat_id, &mut buffer).await;
                            }
                        }
                        None => {
                            flush(&bot, chat_id, &mut buffer).await;
                            break;
                        }
                    },
                    _ = interval.tick() => flush(&bot, chat_id, &mut buffer).await,
                }
            }
        });

        Self { tx }
    }
}

async fn flush(bot: &ThrottledBot, chat_id: ChatId, buffer: &mut Vec<String>) {
    if buffer.is_empty() {
        return;
    }
    let text = truncate(&buffer.join("\n"), MAX_MESSAGE_CHARS);
    buffer.clear();
    // Logging a failure here would feed back into this layer.
    if let Err(e) = bot.send_message(chat_id, text).await {
        eprintln!("Failed to send log to Telegram: {e}");
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

/// The line sent for an event of `level`, or `None` if it is not forwarded.
fn format_line(level: Level, target: &str, message: &str) -> Option<String> {
    let prefix = match level {
        Level::ERROR => "❌",
        Level::WARN => "⚠️",
        _ => return None,
    };
    Some(format!("{prefix} [{target}] {message}"))
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message.insert_str(0, &format!("{:?}", value));
        } else {
            self.message.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

impl<S: Subscriber> Layer<S> for TelegramLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = *metadata.level();
        if level > Level::WARN {
            return;
        }
        // Transport errors from teloxide itself would loop back here.
        if metadata.target().starts_with("teloxide") {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        if let Some(line) = format_line(level, metadata.target(), visitor.message.trim())
            && self.tx.send(line).is_err()
        {
            eprintln!("Log channel closed, message dropped");
        }
    }
}
