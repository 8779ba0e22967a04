//! Per-group repeating reminders.

use chrono::{DateTime, Duration, Utc};

/// Longest accepted interval, for reminders and scheduler settings alike.
pub const MAX_INTERVAL_DAYS: i64 = 365;

/// The reminder of one group. At most one exists per group.
#[derive(Debug, Clone, PartialEq)]
pub struct ReminderState {
    pub group_id: i64,
    pub text: String,
    pub interval: Duration,
    pub next_fire_at: DateTime<Utc>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl ReminderState {
    /// A fresh active reminder. The first broadcast is one interval after creation.
    pub fn new(group_id: i64, text: &str, interval: Duration, now: DateTime<Utc>) -> Self {
        Self {
            group_id,
            text: text.trim().to_string(),
            interval,
            next_fire_at: advance(now, interval),
            active: true,
            created_at: now,
        }
    }

    /// When the reminder fires next if it fires at `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        advance(now, self.interval)
    }
}

/// `now + interval`, saturating at the latest representable time.
fn advance(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    now.checked_add_signed(interval).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Parse an interval such as "90s", "10m", "2h", "1d". A bare number means seconds.
/// Intervals longer than [`MAX_INTERVAL_DAYS`] are rejected.
pub fn parse_interval(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty interval".to_string());
    }

    // Find where the number ends and unit begins
    let unit_start = input.find(|c: char| !c.is_ascii_digit()).unwrap_or(input.len());
    if unit_start == 0 {
        return Err(format!("Invalid number in '{}'", input));
    }

    let num: i64 = input[..unit_start]
        .parse()
        .map_err(|_| format!("Invalid number in '{}'", input))?;
    if num == 0 {
        return Err(format!("Interval '{}' must be positive", input));
    }

    let unit = input[unit_start..].trim();
    let duration = match unit {
        "" | "s" | "sec" | "secs" | "second" | "seconds" => Duration::try_seconds(num),
        "m" | "min" | "mins" | "minute" | "minutes" => Duration::try_minutes(num),
        "h" | "hr" | "hrs" | "hour" | "hours" => Duration::try_hours(num),
        "d" | "day" | "days" => Duration::try_days(num),
        _ => return Err(format!("Unknown unit '{}'. Use s/m/h/d", unit)),
    };
    duration
        .filter(|d| *d <= Duration::days(MAX_INTERVAL_DAYS))
        .ok_or_else(|| format!("Interval '{}' exceeds {} days", input, MAX_INTERVAL_DAYS))
}

/// Human-readable interval for chat replies.
pub fn describe_interval(interval: Duration) -> String {
    let secs = interval.num_seconds();
    if secs % 3600 == 0 {
        let hours = secs / 3600;
        if hours == 1 { "hour".to_string() } else { format!("{hours} hours") }
    } else if secs % 60 == 0 {
        format!("{} minutes", secs / 60)
    } else {
        format!("{secs} seconds")
    }
}
