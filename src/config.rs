//! Synchronizer tuning knobs, loaded from environment variables.
//!
//! Every knob has a default; unset or unparsable variables fall back to it.

use crate::model::Role;

pub const DEFAULT_STUDENT_HISTORY_LIMIT: i64 = 200;
pub const DEFAULT_ADMIN_HISTORY_LIMIT: i64 = 300;
pub const DEFAULT_MAX_BODY_CHARS: usize = 2000;
/// Ceiling on a body's JSON-encoded size. Leaves room for the frame envelope
/// under the 8000-byte `NOTIFY` payload limit.
pub const DEFAULT_MAX_BODY_BYTES: usize = 6000;
pub const DEFAULT_INBOX_CAPACITY: usize = 256;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;
pub const DEFAULT_ADMIN_LIST_LIMIT: i64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Most recent messages fetched when a student opens the chat.
    pub student_history_limit: i64,
    /// Most recent messages fetched when an admin opens a conversation.
    pub admin_history_limit: i64,
    /// Longest accepted message body, in characters.
    pub max_body_chars: usize,
    /// Largest accepted body once JSON-encoded, in bytes. Never above
    /// `DEFAULT_MAX_BODY_BYTES`.
    pub max_body_bytes: usize,
    /// Bounded capacity of the synchronizer's serialized inbox.
    pub inbox_capacity: usize,
    /// Bounded capacity of each realtime subscription's event queue.
    pub channel_capacity: usize,
    /// Page size for the admin conversation list.
    pub admin_list_limit: i64,
}

impl SyncConfig {
    /// Read overrides from the environment:
    /// - `SUPPORT_STUDENT_HISTORY_LIMIT` (default 200)
    /// - `SUPPORT_ADMIN_HISTORY_LIMIT` (default 300)
    /// - `SUPPORT_MAX_BODY_CHARS` (default 2000)
    /// - `SUPPORT_MAX_BODY_BYTES` (default and ceiling 6000)
    /// - `SUPPORT_INBOX_CAPACITY` (default 256)
    /// - `SUPPORT_CHANNEL_CAPACITY` (default 256)
    /// - `SUPPORT_ADMIN_LIST_LIMIT` (default 200)
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            student_history_limit: env_parse("SUPPORT_STUDENT_HISTORY_LIMIT", DEFAULT_STUDENT_HISTORY_LIMIT).max(1),
            admin_history_limit: env_parse("SUPPORT_ADMIN_HISTORY_LIMIT", DEFAULT_ADMIN_HISTORY_LIMIT).max(1),
            max_body_chars: env_parse("SUPPORT_MAX_BODY_CHARS", DEFAULT_MAX_BODY_CHARS).max(1),
            max_body_bytes: env_parse("SUPPORT_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES).clamp(1, DEFAULT_MAX_BODY_BYTES),
            // EDGE: tokio mpsc panics on zero capacity.
            inbox_capacity: env_parse("SUPPORT_INBOX_CAPACITY", DEFAULT_INBOX_CAPACITY).max(1),
            channel_capacity: env_parse("SUPPORT_CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY).max(1),
            admin_list_limit: env_parse("SUPPORT_ADMIN_LIST_LIMIT", DEFAULT_ADMIN_LIST_LIMIT).max(1),
        }
    }

    /// History window for the party opening a conversation.
    #[must_use]
    pub fn history_limit(&self, role: Role) -> i64 {
        match role {
            Role::Student => self.student_history_limit,
            Role::Admin => self.admin_history_limit,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            student_history_limit: DEFAULT_STUDENT_HISTORY_LIMIT,
            admin_history_limit: DEFAULT_ADMIN_HISTORY_LIMIT,
            max_body_chars: DEFAULT_MAX_BODY_CHARS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            admin_list_limit: DEFAULT_ADMIN_LIST_LIMIT,
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
