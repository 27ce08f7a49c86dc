//! Window lengths and minute-bucket arithmetic.

use std::time::Duration;

/// Width of a page-view bucket in seconds.
pub const BUCKET_SECONDS: i64 = 60;

/// Trailing window lengths for every aggregate.
///
/// Defaults: active users 5 minutes, sessions 5 minutes, page views 15
/// minutes, and a 5 minute expiry buffer on self-expiring keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowConfig {
    /// How long a user counts as active after their last event
    pub active_users: Duration,
    /// How long a session counts as active after its last event
    pub sessions: Duration,
    /// How far back top pages look
    pub page_views: Duration,
    /// Extra lifetime granted to TTL-managed keys beyond their window
    pub expiry_buffer: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            active_users: Duration::from_secs(300),
            sessions: Duration::from_secs(300),
            page_views: Duration::from_secs(900),
            expiry_buffer: Duration::from_secs(300),
        }
    }
}

impl WindowConfig {
    /// TTL applied to a page-view bucket on every write.
    #[must_use]
    pub fn page_view_ttl(&self) -> Duration {
        self.page_views.saturating_add(self.expiry_buffer)
    }

    /// TTL applied to a per-user session set on every write.
    #[must_use]
    pub fn user_session_ttl(&self) -> Duration {
        self.sessions.saturating_add(self.expiry_buffer)
    }

    /// Number of minute buckets top pages reads: `ceil(window / 60) + 1`.
    ///
    /// The extra bucket is the in-progress minute.
    #[must_use]
    pub fn page_view_bucket_count(&self) -> usize {
        let window = self.page_views.as_secs();
        let full = window.div_ceil(BUCKET_SECONDS.unsigned_abs());
        usize::try_from(full).unwrap_or(usize::MAX).saturating_add(1)
    }

    /// Lowest score still inside the active-user window at `now`.
    #[must_use]
    pub fn active_users_cutoff(&self, now: f64) -> f64 {
        now - self.active_users.as_secs_f64()
    }

    /// Lowest score still inside the session window at `now`.
    #[must_use]
    pub fn sessions_cutoff(&self, now: f64) -> f64 {
        now - self.sessions.as_secs_f64()
    }
}

/// Start of the minute bucket containing `timestamp` (epoch seconds).
#[must_use]
#[allow(clippy::cast_possible_truncation)] // Epoch seconds fit in i64 for any realistic time
pub fn minute_floor(timestamp: f64) -> i64 {
    let seconds = timestamp.floor() as i64;
    seconds.div_euclid(BUCKET_SECONDS) * BUCKET_SECONDS
}

/// Start times of the `count` most recent buckets, newest first.
#[must_use]
pub fn recent_buckets(now: f64, count: usize) -> Vec<i64> {
    let current = minute_floor(now);
    (0..count)
        .map(|i| {
            let offset = i64::try_from(i)
                .unwrap_or(i64::MAX)
                .saturating_mul(BUCKET_SECONDS);
            current.saturating_sub(offset)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_windows() {
        let windows = WindowConfig::default();
        assert_eq!(windows.page_view_ttl(), Duration::from_secs(1200));
        assert_eq!(windows.user_session_ttl(), Duration::from_secs(600));
        assert_eq!(windows.page_view_bucket_count(), 16);
    }

    #[test]
    fn bucket_count_rounds_partial_minutes_up() {
        let windows = WindowConfig {
            page_views: Duration::from_secs(61),
            ..WindowConfig::default()
        };
        assert_eq!(windows.page_view_bucket_count(), 3);
    }

    #[test]
    fn ttls_saturate_instead_of_overflowing() {
        let windows = WindowConfig {
            page_views: Duration::MAX,
            sessions: Duration::MAX,
            ..WindowConfig::default()
        };
        assert_eq!(windows.page_view_ttl(), Duration::MAX);
        assert_eq!(windows.user_session_ttl(), Duration::MAX);
    }

    #[test]
    fn minute_floor_aligns_to_minutes() {
        assert_eq!(minute_floor(1_710_513_059.9), 1_710_513_000);
        assert_eq!(minute_floor(1_710_513_060.0), 1_710_513_060);
        assert_eq!(minute_floor(0.5), 0);
    }

    #[test]
    fn recent_buckets_walk_backwards_from_current_minute() {
        assert_eq!(recent_buckets(185.0, 3), vec![180, 120, 60]);
    }

    proptest! {
        #[test]
        fn minute_floor_is_aligned_and_not_after_timestamp(ts in 0.0f64..4_000_000_000.0) {
            let bucket = minute_floor(ts);
            prop_assert_eq!(bucket % BUCKET_SECONDS, 0);
            #[allow(clippy::cast_precision_loss)]
            let start = bucket as f64;
            prop_assert!(start <= ts);
            prop_assert!(ts - start < 60.0);
        }

        #[test]
        fn recent_buckets_cover_the_page_view_window(window in 1u64..7200, now in 1_000_000.0f64..2_000_000_000.0) {
            let windows = WindowConfig {
                page_views: Duration::from_secs(window),
                ..WindowConfig::default()
            };
            let buckets = recent_buckets(now, windows.page_view_bucket_count());
            let oldest = *buckets.last().unwrap_or(&0);
            #[allow(clippy::cast_precision_loss)]
            let oldest = oldest as f64;
            // The oldest fetched bucket starts at or before the window start.
            prop_assert!(oldest <= now - windows.page_views.as_secs_f64());
        }
    }
}
