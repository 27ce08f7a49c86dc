//! Configuration management for the worker.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Every value is optional; an unset or unparseable variable falls back to
//! its default.

use pulse_core::log::ConsumerRef;
use pulse_core::store::ScoreUpdate;
use pulse_core::window::WindowConfig;
use pulse_runtime::consumer::{DEFAULT_CONSUMER, DEFAULT_GROUP, DEFAULT_TOPIC};
use pulse_runtime::{ConsumerConfig, PrunerConfig, ReclaimPolicy};
use std::env;
use std::net::{AddrParseError, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Longest accepted window or expiry buffer, in seconds (30 days).
pub const MAX_WINDOW_SECS: u64 = 30 * 24 * 60 * 60;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Redis configuration
    pub redis: RedisConfig,
    /// Event stream configuration
    pub stream: StreamConfig,
    /// Window lengths
    pub windows: WindowSettings,
    /// Seconds between prune cycles
    pub prune_interval_secs: u64,
    /// Score update mode for last-seen upserts
    pub score_update: ScoreUpdate,
    /// Metrics and lifecycle configuration
    pub server: ServerConfig,
}

/// Redis configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
}

/// Event stream configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Stream key
    pub key: String,
    /// Consumer group
    pub group: String,
    /// Consumer name within the group
    pub consumer_name: String,
    /// Entries per read
    pub batch_size: usize,
    /// Milliseconds a read waits for new entries
    pub block_ms: u64,
    /// Approximate stream length cap applied on append, if any
    pub max_len: Option<usize>,
    /// Minimum idle time before a pending entry is reclaimed; reclaim is
    /// disabled when unset
    pub reclaim_min_idle_ms: Option<u64>,
    /// Seconds between reclaim sweeps
    pub reclaim_interval_secs: u64,
}

/// Window lengths in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSettings {
    /// Active-user window
    pub active_users: u64,
    /// Page-view window
    pub page_views: u64,
    /// Session window
    pub sessions: u64,
    /// Extra lifetime of self-expiring keys
    pub expiry_buffer: u64,
}

/// Metrics and lifecycle configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Metrics server host (for Prometheus scraping)
    pub metrics_host: String,
    /// Metrics server port
    pub metrics_port: u16,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout: u64,
}

impl Config {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let window = |name: &str, default: u64| {
            parsed(&lookup, name)
                .unwrap_or(default)
                .min(MAX_WINDOW_SECS)
        };

        Self {
            redis: RedisConfig {
                url: lookup("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
            },
            stream: StreamConfig {
                key: lookup("STREAM_KEY").unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
                group: lookup("CONSUMER_GROUP").unwrap_or_else(|| DEFAULT_GROUP.to_string()),
                consumer_name: lookup("CONSUMER_NAME")
                    .unwrap_or_else(|| DEFAULT_CONSUMER.to_string()),
                batch_size: parsed(&lookup, "BATCH_SIZE").unwrap_or(10),
                block_ms: parsed(&lookup, "BLOCK_MS").unwrap_or(2000),
                max_len: parsed(&lookup, "STREAM_MAX_LEN"),
                reclaim_min_idle_ms: parsed(&lookup, "RECLAIM_MIN_IDLE_MS"),
                reclaim_interval_secs: parsed(&lookup, "RECLAIM_INTERVAL_SECS").unwrap_or(30),
            },
            windows: WindowSettings {
                active_users: window("WINDOW_ACTIVE_USERS", 300),
                page_views: window("WINDOW_PAGE_VIEWS", 900),
                sessions: window("WINDOW_SESSIONS", 300),
                expiry_buffer: window("WINDOW_EXPIRY_BUFFER", 300),
            },
            prune_interval_secs: parsed(&lookup, "PRUNE_INTERVAL_SECS").unwrap_or(5),
            score_update: lookup("SCORE_UPDATE_MODE")
                .and_then(|s| parse_score_update(&s))
                .unwrap_or_default(),
            server: ServerConfig {
                metrics_host: lookup("METRICS_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                metrics_port: parsed(&lookup, "METRICS_PORT").unwrap_or(8001),
                shutdown_timeout: parsed(&lookup, "SHUTDOWN_TIMEOUT").unwrap_or(10),
            },
        }
    }

    /// Window lengths for the processor and pruner.
    #[must_use]
    pub const fn window_config(&self) -> WindowConfig {
        WindowConfig {
            active_users: Duration::from_secs(self.windows.active_users),
            sessions: Duration::from_secs(self.windows.sessions),
            page_views: Duration::from_secs(self.windows.page_views),
            expiry_buffer: Duration::from_secs(self.windows.expiry_buffer),
        }
    }

    /// Stream consumer settings.
    #[must_use]
    pub fn consumer_config(&self) -> ConsumerConfig {
        let config = ConsumerConfig::default()
            .with_consumer(ConsumerRef::new(
                &self.stream.key,
                &self.stream.group,
                &self.stream.consumer_name,
            ))
            .with_batch_size(self.stream.batch_size)
            .with_block(Duration::from_millis(self.stream.block_ms));

        match self.stream.reclaim_min_idle_ms {
            Some(min_idle) => config.with_reclaim(ReclaimPolicy {
                min_idle: Duration::from_millis(min_idle),
                interval: Duration::from_secs(self.stream.reclaim_interval_secs),
                batch_size: self.stream.batch_size,
            }),
            None => config,
        }
    }

    /// Pruner settings.
    #[must_use]
    pub const fn pruner_config(&self) -> PrunerConfig {
        PrunerConfig {
            interval: Duration::from_secs(self.prune_interval_secs),
        }
    }

    /// Address the metrics server binds to.
    ///
    /// # Errors
    ///
    /// Returns [`AddrParseError`] if host and port do not form a socket
    /// address.
    pub fn metrics_addr(&self) -> Result<SocketAddr, AddrParseError> {
        format!("{}:{}", self.server.metrics_host, self.server.metrics_port).parse()
    }

    /// Graceful shutdown timeout.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|s| s.trim().parse().ok())
}

fn parse_score_update(raw: &str) -> Option<ScoreUpdate> {
    match raw.trim().to_lowercase().as_str() {
        "overwrite" => Some(ScoreUpdate::Overwrite),
        "greater_wins" | "greater-wins" | "gt" => Some(ScoreUpdate::GreaterWins),
        _ => None,
    }
}
