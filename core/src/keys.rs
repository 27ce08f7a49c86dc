//! Persisted-state key layout.
//!
//! All aggregates live under a single prefix (`analytics` by default):
//!
//! | Key                                   | Type       | Contents                         |
//! |---------------------------------------|------------|----------------------------------|
//! | `{prefix}:active_users`               | sorted set | `user_id` -> last-seen seconds   |
//! | `{prefix}:sessions`                   | sorted set | `session_id` -> last-seen        |
//! | `{prefix}:user_sessions:{user_id}`    | sorted set | `session_id` -> last-seen (TTL)  |
//! | `{prefix}:views:{minute_floor}`       | hash       | `page_url` -> view count (TTL)   |
//!
//! The two global windows are pruned by score; the sharded keys expire on
//! their own. Any backend that honours this layout can be swapped in without
//! touching the engine.

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "analytics";

/// Builds the keys the engine reads and writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
    active_users: String,
    sessions: String,
}

impl KeyLayout {
    /// Create a layout rooted at `prefix`.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            active_users: format!("{prefix}:active_users"),
            sessions: format!("{prefix}:sessions"),
            prefix,
        }
    }

    /// The key prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Sorted set of active users.
    #[must_use]
    pub fn active_users(&self) -> &str {
        &self.active_users
    }

    /// Sorted set of active sessions.
    #[must_use]
    pub fn sessions(&self) -> &str {
        &self.sessions
    }

    /// Per-user sorted set of sessions.
    #[must_use]
    pub fn user_sessions(&self, user_id: &str) -> String {
        format!("{}:user_sessions:{user_id}", self.prefix)
    }

    /// Page-view hash for the minute bucket starting at `bucket_start` (epoch seconds).
    #[must_use]
    pub fn page_views(&self, bucket_start: i64) -> String {
        format!("{}:views:{bucket_start}", self.prefix)
    }
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_matches_documented_keys() {
        let keys = KeyLayout::default();
        assert_eq!(keys.active_users(), "analytics:active_users");
        assert_eq!(keys.sessions(), "analytics:sessions");
        assert_eq!(keys.user_sessions("usr_789"), "analytics:user_sessions:usr_789");
        assert_eq!(keys.page_views(1_710_513_000), "analytics:views:1710513000");
    }

    #[test]
    fn custom_prefix_applies_everywhere() {
        let keys = KeyLayout::new("staging");
        assert_eq!(keys.prefix(), "staging");
        assert_eq!(keys.active_users(), "staging:active_users");
        assert_eq!(keys.page_views(60), "staging:views:60");
    }
}
