//! Recognizes bot commands in message text, including the `/!` alias for `/check`.

use std::sync::LazyLock;

use regex::Regex;

static COMMAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^/(\w+)(?:@(\w+))?(?:\s+(.*))?$").unwrap());

/// `/!` is not a valid Telegram command name, so it is matched as plain text.
static BANG_CHECK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)^/!(?:\s+(.*))?$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Start,
    AddGroup,
    FbStats,
    FbUser,
    Check,
    AddReminder,
    RemoveReminder,
    ClearDb,
}

impl CommandKind {
    fn from_name(name: &str) -> Option<Self> {
        let kind = match name.to_ascii_lowercase().as_str() {
            "start" => Self::Start,
            "addgroup" => Self::AddGroup,
            "fb_stats" => Self::FbStats,
            "fb_user" => Self::FbUser,
            "check" => Self::Check,
            "addreminder" => Self::AddReminder,
            "removereminder" => Self::RemoveReminder,
            "cleardb" => Self::ClearDb,
            _ => return None,
        };
        Some(kind)
    }
}

/// A command with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub kind: CommandKind,
    /// Everything after the command name, trimmed.
    pub raw_args: String,
}

impl ParsedCommand {
    /// The `idx`-th whitespace-separated argument.
    pub fn arg(&self, idx: usize) -> Option<&str> {
        self.raw_args.split_whitespace().nth(idx)
    }
}

/// Parse a command. Commands addressed to another bot (`/cmd@otherbot`) are ignored.
pub fn parse_command(text: &str, bot_username: Option<&str>) -> Option<ParsedCommand> {
    let text = text.trim();

    if let Some(caps) = BANG_CHECK.captures(text) {
        return Some(ParsedCommand {
            kind: CommandKind::Check,
            raw_args: caps.get(1).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
        });
    }

    let caps = COMMAND.captures(text)?;
    if let (Some(target), Some(me)) = (caps.get(2), bot_username)
        && !target.as_str().eq_ignore_ascii_case(me)
    {
        return None;
    }

    let kind = CommandKind::from_name(caps.get(1)?.as_str())?;
    Some(ParsedCommand {
        kind,
        raw_args: caps.get(3).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
    })
}
