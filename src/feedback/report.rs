//! HTML rendering of query results for Telegram.

use crate::feedback::query::{FeedbackStats, Subject};
use crate::feedback::store::FeedbackEntry;

/// Telegram rejects messages longer than 4096 characters; leave headroom.
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Escape text for Telegram's HTML parse mode.
pub fn escape_html(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '&' => result.push_str("&amp;"),
            '"' => result.push_str("&quot;"),
            _ => result.push(c),
        }
    }
    result
}

/// Link to a message: public groups by username, private ones by internal id.
pub fn message_link(group_username: Option<&str>, group_id: i64, message_id: i64) -> String {
    if let Some(username) = group_username.filter(|u| !u.is_empty()) {
        return format!("https://t.me/{username}/{message_id}");
    }
    let id = group_id.to_string();
    let internal = id
        .strip_prefix("-100")
        .unwrap_or_else(|| id.trim_start_matches('-'));
    format!("https://t.me/c/{internal}/{message_id}")
}

fn handle(username: Option<&str>) -> String {
    match username {
        Some(u) => format!("@{}", escape_html(u)),
        None => "-".to_string(),
    }
}

fn date(entry: &FeedbackEntry) -> String {
    entry.created_at.format("%Y-%m-%d %H:%M UTC").to_string()
}

/// Group report for `fb_stats`.
pub fn render_stats(stats: &FeedbackStats) -> String {
    if stats.entries.is_empty() {
        return format!("📊 No feedback found in the last {} days.", stats.days);
    }

    let mut lines = vec![
        format!("<b>📊 Feedback Report (Last {} days)</b>", stats.days),
        format!("<b>Total unique senders:</b> {}", stats.unique_user_count),
        String::new(),
    ];
    for (i, entry) in stats.entries.iter().enumerate() {
        lines.push(format!(
            "{}. <b>{}</b> ({}, ID: <code>{}</code>)\n   Date: {}\n   Link: {}",
            i + 1,
            escape_html(&entry.display_name),
            handle(entry.username.as_deref()),
            entry.user_id,
            date(entry),
            entry.media_ref.link,
        ));
    }
    lines.join("\n")
}

/// Per-user history for `fb_user` and quick checks.
pub fn render_history(subject: &Subject, entries: &[FeedbackEntry], days: u32) -> String {
    let Some(head) = entries.last() else {
        return format!(
            "❌ No feedback was received from {} in the last {} days.",
            escape_html(&subject.describe()),
            days
        );
    };

    let mut lines = vec![
        format!(
            "<b>📌 Feedback history for {} ({}, ID: <code>{}</code>), last {} days</b>",
            escape_html(&head.display_name),
            handle(head.username.as_deref()),
            head.user_id,
            days
        ),
        String::new(),
    ];
    for (i, entry) in entries.iter().enumerate() {
        lines.push(format!("{}. Date: {}\n   Link: {}", i + 1, date(entry), entry.media_ref.link));
    }
    lines.join("\n")
}

/// Split a report into messages no longer than `max_chars`, breaking between lines.
///
/// A single line longer than the limit is cut at a char boundary.
pub fn paginate(text: &str, max_chars: usize) -> Vec<String> {
    let mut pages = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0;

    for line in text.split('\n') {
        let line_chars = line.chars().count();
        let needed = if current.is_empty() { line_chars } else { line_chars + 1 };

        if current_chars + needed > max_chars && !current.is_empty() {
            pages.push(std::mem::take(&mut current));
            current_chars = 0;
        }

        if line_chars > max_chars {
            let chars: Vec<char> = line.chars().collect();
            for chunk in chars.chunks(max_chars) {
                pages.push(chunk.iter().collect());
            }
            continue;
        }

        if !current.is_empty() {
            current.push('\n');
            current_chars += 1;
        }
        current.push_str(line);
        current_chars += line_chars;
    }

    if !current.is_empty() {
        pages.push(current);
    }
    pages
}
