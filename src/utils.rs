// src/utils.rs

use chrono::{DateTime, Duration, Local, Utc};
use uuid::Uuid;

use crate::constants::UNTITLED_CONVERSATION;

/// Generates an id for messages that have not been confirmed by the backend yet.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Shortens a title for the sidebar, falling back to a default when empty.
pub fn truncate_text(text: &str, max_length: usize) -> String {
    let text = text.trim();
    if text.is_empty() {
        return UNTITLED_CONVERSATION.to_string();
    }
    if text.chars().count() <= max_length {
        return text.to_string();
    }
    let head: String = text.chars().take(max_length).collect();
    format!("{}...", head.trim_end())
}

/// Formats a message timestamp relative to `now` in local time.
pub fn format_timestamp(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let local = timestamp.with_timezone(&Local);
    let today = now.with_timezone(&Local).date_naive();

    if local.date_naive() == today {
        local.format("%-I:%M %p").to_string()
    } else if Some(local.date_naive()) == today.pred_opt() {
        format!("Yesterday {}", local.format("%-I:%M %p"))
    } else {
        local.format("%b %-d, %-I:%M %p").to_string()
    }
}

/// Formats the distance between `timestamp` and `now`, e.g. "5 minutes ago".
pub fn format_relative_time(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(timestamp);
    if elapsed < Duration::minutes(1) {
        return "just now".to_string();
    }

    let (value, unit) = if elapsed < Duration::hours(1) {
        (elapsed.num_minutes(), "minute")
    } else if elapsed < Duration::days(1) {
        (elapsed.num_hours(), "hour")
    } else if elapsed < Duration::days(30) {
        (elapsed.num_days(), "day")
    } else if elapsed < Duration::days(365) {
        (elapsed.num_days() / 30, "month")
    } else {
        (elapsed.num_days() / 365, "year")
    };

    if value == 1 {
        format!("1 {} ago", unit)
    } else {
        format!("{} {}s ago", value, unit)
    }
}
