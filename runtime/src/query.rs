//! Read-side queries over the windowed aggregates.
//!
//! Cardinality queries trust the pruner and read the global sets as they
//! are. The two identity queries ([`QueryEngine::active_user_ids`] and
//! [`QueryEngine::user_session_count`]) re-filter by score at read time, so
//! they are exact even when a prune cycle is overdue.
//!
//! Top pages sum the `B = ceil(page_view_window / 60) + 1` most recent
//! minute buckets, newest first. Missing buckets contribute nothing.

use pulse_core::environment::Clock;
use pulse_core::keys::KeyLayout;
use pulse_core::store::{AggregateStore, Pipeline, ScoreBound, StoreError, StoreReply};
use pulse_core::window::{WindowConfig, recent_buckets};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Number of pages a dashboard snapshot lists.
pub const DEFAULT_TOP_PAGES: usize = 5;

/// Errors that can occur while answering a query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The read pipeline failed
    #[error("Query failed: {0}")]
    Store(#[from] StoreError),

    /// A page-view bucket held something other than a non-negative count
    #[error("Invalid count in '{hash}' for '{field}': {value}")]
    InvalidCount {
        /// Bucket key
        hash: String,
        /// Page URL
        field: String,
        /// Stored value
        value: String,
    },
}

/// Views of one page across the page-view window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PageCount {
    /// Page URL
    pub page_url: String,
    /// Summed views
    pub views: u64,
}

impl PageCount {
    /// Create a page count.
    #[must_use]
    pub fn new(page_url: impl Into<String>, views: u64) -> Self {
        Self {
            page_url: page_url.into(),
            views,
        }
    }
}

/// Every dashboard metric, read in one round trip.
///
/// `top_pages` serializes as an ordered `{page_url: views}` object.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Cardinality of the active-user window
    pub active_users: u64,
    /// Cardinality of the session window
    pub active_sessions: u64,
    /// Sessions per active user, two decimals
    pub avg_sessions_per_user: f64,
    /// Most viewed pages, descending
    #[serde(serialize_with = "serialize_top_pages")]
    pub top_pages: Vec<PageCount>,
}

fn serialize_top_pages<S: Serializer>(
    pages: &[PageCount],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(pages.iter().map(|page| (&page.page_url, page.views)))
}

/// Answers aggregate queries against an [`AggregateStore`].
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<dyn AggregateStore>,
    clock: Arc<dyn Clock>,
    keys: KeyLayout,
    windows: WindowConfig,
}

impl QueryEngine {
    /// Create a query engine with the default key layout and windows.
    #[must_use]
    pub fn new(store: Arc<dyn AggregateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            keys: KeyLayout::default(),
            windows: WindowConfig::default(),
        }
    }

    /// Use a different key layout.
    #[must_use]
    pub fn with_keys(mut self, keys: KeyLayout) -> Self {
        self.keys = keys;
        self
    }

    /// Use different window lengths.
    #[must_use]
    pub const fn with_windows(mut self, windows: WindowConfig) -> Self {
        self.windows = windows;
        self
    }

    /// Number of users in the active-user window.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Store`] if the read fails.
    pub async fn active_user_count(&self) -> Result<u64, QueryError> {
        let replies = self
            .execute(Pipeline::new().cardinality(self.keys.active_users()))
            .await?;
        count(&replies, 0)
    }

    /// Number of sessions in the session window.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Store`] if the read fails.
    pub async fn active_session_count(&self) -> Result<u64, QueryError> {
        let replies = self
            .execute(Pipeline::new().cardinality(self.keys.sessions()))
            .await?;
        count(&replies, 0)
    }

    /// Active sessions divided by active users, rounded to two decimals.
    ///
    /// `0.0` when there are no active users.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Store`] if the read fails.
    pub async fn average_sessions_per_active_user(&self) -> Result<f64, QueryError> {
        let replies = self
            .execute(
                Pipeline::new()
                    .cardinality(self.keys.active_users())
                    .cardinality(self.keys.sessions()),
            )
            .await?;
        Ok(average_sessions(count(&replies, 1)?, count(&replies, 0)?))
    }

    /// The `limit` most viewed pages over the page-view window.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] if the read fails or a bucket holds a
    /// malformed count.
    pub async fn top_pages(&self, limit: usize) -> Result<Vec<PageCount>, QueryError> {
        let buckets = self.bucket_keys();
        let pipeline = buckets
            .iter()
            .fold(Pipeline::new(), |pipeline, key| pipeline.get_hash(key.as_str()));
        let replies = self.execute(pipeline).await?;
        sum_buckets(&buckets, replies, 0, limit)
    }

    /// Users seen within the active-user window, ascending by last-seen.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Store`] if the read fails.
    pub async fn active_user_ids(&self) -> Result<Vec<String>, QueryError> {
        let cutoff = self.windows.active_users_cutoff(self.clock.now_seconds());
        let mut replies = self
            .execute(Pipeline::new().range_by_score(
                self.keys.active_users(),
                ScoreBound::Inclusive(cutoff),
                ScoreBound::PosInf,
            ))
            .await?;
        let reply = replies.pop().ok_or(StoreError::UnexpectedReply {
            index: 0,
            expected: "members",
        })?;
        Ok(reply.into_members(0)?)
    }

    /// Sessions of `user_id` seen within the session window.
    ///
    /// Unknown users have zero sessions.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Store`] if the read fails.
    pub async fn user_session_count(&self, user_id: &str) -> Result<u64, QueryError> {
        let cutoff = self.windows.sessions_cutoff(self.clock.now_seconds());
        let replies = self
            .execute(Pipeline::new().count_by_score(
                self.keys.user_sessions(user_id),
                ScoreBound::Inclusive(cutoff),
                ScoreBound::PosInf,
            ))
            .await?;
        count(&replies, 0)
    }

    /// Both cardinalities, the average and the top `limit` pages in one
    /// round trip.
    ///
    /// ```
    /// use pulse_runtime::QueryEngine;
    /// use pulse_runtime::query::DEFAULT_TOP_PAGES;
    /// use pulse_testing::{InMemoryAggregateStore, test_clock};
    /// use std::sync::Arc;
    ///
    /// # tokio_test::block_on(async {
    /// let clock = Arc::new(test_clock());
    /// let store = InMemoryAggregateStore::new(clock.clone());
    /// let query = QueryEngine::new(Arc::new(store), clock);
    ///
    /// let snapshot = query.metrics(DEFAULT_TOP_PAGES).await.unwrap();
    /// assert_eq!(snapshot.active_users, 0);
    /// assert!(snapshot.top_pages.is_empty());
    /// # });
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] if the read fails or a bucket holds a
    /// malformed count.
    pub async fn metrics(&self, limit: usize) -> Result<MetricsSnapshot, QueryError> {
        let buckets = self.bucket_keys();
        let pipeline = buckets.iter().fold(
            Pipeline::new()
                .cardinality(self.keys.active_users())
                .cardinality(self.keys.sessions()),
            |pipeline, key| pipeline.get_hash(key.as_str()),
        );
        let replies = self.execute(pipeline).await?;

        let active_users = count(&replies, 0)?;
        let active_sessions = count(&replies, 1)?;
        let top_pages = sum_buckets(&buckets, replies, 2, limit)?;

        Ok(MetricsSnapshot {
            active_users,
            active_sessions,
            avg_sessions_per_user: average_sessions(active_sessions, active_users),
            top_pages,
        })
    }

    async fn execute(&self, pipeline: Pipeline) -> Result<Vec<StoreReply>, QueryError> {
        let replies = self.store.execute(&pipeline).await?;
        if replies.len() != pipeline.len() {
            return Err(StoreError::Rejected(format!(
                "expected {} replies, got {}",
                pipeline.len(),
                replies.len()
            ))
            .into());
        }
        Ok(replies)
    }

    fn bucket_keys(&self) -> Vec<String> {
        recent_buckets(
            self.clock.now_seconds(),
            self.windows.page_view_bucket_count(),
        )
        .into_iter()
        .map(|bucket| self.keys.page_views(bucket))
        .collect()
    }
}

/// Parse the bucket replies starting at `offset` and rank them.
fn sum_buckets(
    buckets: &[String],
    replies: Vec<StoreReply>,
    offset: usize,
    limit: usize,
) -> Result<Vec<PageCount>, QueryError> {
    let mut counts = Vec::new();
    for (i, (reply, hash)) in replies.into_iter().skip(offset).zip(buckets).enumerate() {
        for (field, value) in reply.into_fields(offset + i)? {
            let views = value
                .parse::<u64>()
                .map_err(|_| QueryError::InvalidCount {
                    hash: hash.clone(),
                    field: field.clone(),
                    value: value.clone(),
                })?;
            counts.push((field, views));
        }
    }
    Ok(aggregate_top_pages(counts, limit))
}

fn count(replies: &[StoreReply], index: usize) -> Result<u64, QueryError> {
    let reply = replies.get(index).ok_or(StoreError::UnexpectedReply {
        index,
        expected: "integer",
    })?;
    let value = reply.integer(index)?;
    u64::try_from(value).map_err(|_| {
        StoreError::UnexpectedReply {
            index,
            expected: "non-negative integer",
        }
        .into()
    })
}

/// Sum per-page counts and return the `limit` largest, descending.
///
/// Ties keep the order in which pages were first seen.
///
/// # Examples
///
/// ```
/// use pulse_runtime::query::{PageCount, aggregate_top_pages};
///
/// let counts = [("/a", 10), ("/b", 5), ("/a", 2), ("/c", 1)]
///     .map(|(page, views)| (page.to_string(), views));
///
/// assert_eq!(
///     aggregate_top_pages(counts, 3),
///     vec![
///         PageCount::new("/a", 12),
///         PageCount::new("/b", 5),
///         PageCount::new("/c", 1),
///     ]
/// );
/// ```
#[must_use]
pub fn aggregate_top_pages<I>(counts: I, limit: usize) -> Vec<PageCount>
where
    I: IntoIterator<Item = (String, u64)>,
{
    let mut pages: Vec<PageCount> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (page_url, views) in counts {
        if let Some(&i) = index.get(&page_url) {
            pages[i].views += views;
        } else {
            index.insert(page_url.clone(), pages.len());
            pages.push(PageCount { page_url, views });
        }
    }

    // Stable sort keeps first-seen order among equal counts.
    pages.sort_by(|a, b| b.views.cmp(&a.views));
    pages.truncate(limit);
    pages
}

/// `sessions / users` rounded to two decimals, `0.0` when `users` is zero.
#[must_use]
#[allow(clippy::cast_precision_loss)] // Window cardinalities are far below 2^52
pub fn average_sessions(sessions: u64, users: u64) -> f64 {
    if users == 0 {
        return 0.0;
    }
    let ratio = sessions as f64 / users as f64;
    (ratio * 100.0).round() / 100.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn counts(pairs: &[(&str, u64)]) -> Vec<(String, u64)> {
        pairs
            .iter()
            .map(|(page, views)| ((*page).to_string(), *views))
            .collect()
    }

    #[test]
    fn ties_keep_first_seen_order() {
        let top = aggregate_top_pages(counts(&[("/x", 3), ("/y", 3), ("/z", 4)]), 10);
        assert_eq!(
            top,
            vec![
                PageCount::new("/z", 4),
                PageCount::new("/x", 3),
                PageCount::new("/y", 3),
            ]
        );
    }

    #[test]
    fn zero_limit_is_empty() {
        assert!(aggregate_top_pages(counts(&[("/x", 3)]), 0).is_empty());
    }

    #[test]
    fn average_rounds_to_two_decimals() {
        assert!((average_sessions(0, 0) - 0.0).abs() < f64::EPSILON);
        assert!((average_sessions(5, 0) - 0.0).abs() < f64::EPSILON);
        assert!((average_sessions(2, 3) - 0.67).abs() < f64::EPSILON);
        assert!((average_sessions(4, 2) - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_serializes_top_pages_as_ordered_object() {
        let snapshot = MetricsSnapshot {
            active_users: 2,
            active_sessions: 3,
            avg_sessions_per_user: 1.5,
            top_pages: vec![PageCount::new("/home", 7), PageCount::new("/about", 2)],
        };
        assert_eq!(
            serde_json::to_string(&snapshot).unwrap(),
            r#"{"active_users":2,"active_sessions":3,"avg_sessions_per_user":1.5,"top_pages":{"/home":7,"/about":2}}"#
        );
    }

    proptest! {
        #[test]
        fn top_pages_are_sorted_and_bounded(
            raw in prop::collection::vec((0usize..8, 0u64..100), 0..40),
            limit in 0usize..10,
        ) {
            let counts: Vec<_> = raw.iter().map(|(page, views)| (format!("/p{page}"), *views)).collect();
            let total: u64 = counts.iter().map(|(_, views)| views).sum();
            let top = aggregate_top_pages(counts, limit);

            prop_assert!(top.len() <= limit);
            prop_assert!(top.windows(2).all(|pair| pair[0].views >= pair[1].views));
            prop_assert!(top.iter().map(|page| page.views).sum::<u64>() <= total);
        }
    }
}
