//! Indexer configuration from environment variables

use crate::aggregation::AggregationSettings;
use crate::store::{PartitionManager, StoreOptions};
use std::env;
use std::time::Duration;

/// Configuration for the indexer runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexerConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Providers are split into this many buckets; one bucket is aggregated
    /// per round
    pub aggregate_period: i64,

    /// Rounds per aggregate partition
    pub partition_change_period: i64,

    /// Partitions retained before the oldest is dropped
    pub partition_keep_count: i64,

    /// Providers per aggregation batch
    pub page_limit: i64,

    /// Database file attached as the slow tablespace (disabled when unset)
    pub slow_tablespace: Option<String>,

    /// Partitions larger than this (bytes) move to the slow tablespace
    pub partitioned_table_max_size: i64,

    /// Packet channel capacity
    pub channel_buffer: usize,

    /// Per-block transaction deadline
    pub query_timeout_ms: u64,

    pub busy_timeout_ms: u64,

    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,

    /// JSONL packet file replayed at startup
    pub replay_path: Option<String>,
}

/// Configuration values that cannot run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    NotPositive { field: &'static str, value: i64 },
    RetryRange { initial_ms: u64, max_ms: u64 },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotPositive { field, value } => {
                write!(f, "{} must be greater than 0 (got {})", field, value)
            }
            ConfigError::RetryRange { initial_ms, max_ms } => write!(
                f,
                "retry initial delay {}ms exceeds max delay {}ms",
                initial_ms, max_ms
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            db_path: "/var/lib/chain-indexer/events.db".to_string(),
            aggregate_period: 10,
            partition_change_period: 100,
            partition_keep_count: 10,
            page_limit: 50,
            slow_tablespace: None,
            partitioned_table_max_size: 1 << 30,
            channel_buffer: 1_000,
            query_timeout_ms: 5_000,
            busy_timeout_ms: 5_000,
            retry_initial_ms: 100,
            retry_max_ms: 10_000,
            replay_path: None,
        }
    }
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl IndexerConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `INDEXER_DB_PATH` (default: /var/lib/chain-indexer/events.db)
    /// - `INDEXER_AGGREGATE_PERIOD` (default: 10)
    /// - `INDEXER_PARTITION_CHANGE_PERIOD` (default: 100)
    /// - `INDEXER_PARTITION_KEEP_COUNT` (default: 10)
    /// - `INDEXER_PAGE_LIMIT` (default: 50)
    /// - `INDEXER_SLOW_TABLESPACE` (default: unset)
    /// - `INDEXER_PARTITIONED_TABLE_MAX_SIZE` (default: 1 GiB)
    /// - `INDEXER_CHANNEL_BUFFER` (default: 1000)
    /// - `INDEXER_QUERY_TIMEOUT_MS` (default: 5000)
    /// - `INDEXER_BUSY_TIMEOUT_MS` (default: 5000)
    /// - `INDEXER_RETRY_INITIAL_MS` / `INDEXER_RETRY_MAX_MS` (default: 100 / 10000)
    /// - `INDEXER_REPLAY_PATH` (default: unset)
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            db_path: env::var("INDEXER_DB_PATH").unwrap_or(d.db_path),
            aggregate_period: parsed("INDEXER_AGGREGATE_PERIOD", d.aggregate_period),
            partition_change_period: parsed("INDEXER_PARTITION_CHANGE_PERIOD", d.partition_change_period),
            partition_keep_count: parsed("INDEXER_PARTITION_KEEP_COUNT", d.partition_keep_count),
            page_limit: parsed("INDEXER_PAGE_LIMIT", d.page_limit),
            slow_tablespace: optional("INDEXER_SLOW_TABLESPACE"),
            partitioned_table_max_size: parsed(
                "INDEXER_PARTITIONED_TABLE_MAX_SIZE",
                d.partitioned_table_max_size,
            ),
            channel_buffer: parsed("INDEXER_CHANNEL_BUFFER", d.channel_buffer),
            query_timeout_ms: parsed("INDEXER_QUERY_TIMEOUT_MS", d.query_timeout_ms),
            busy_timeout_ms: parsed("INDEXER_BUSY_TIMEOUT_MS", d.busy_timeout_ms),
            retry_initial_ms: parsed("INDEXER_RETRY_INITIAL_MS", d.retry_initial_ms),
            retry_max_ms: parsed("INDEXER_RETRY_MAX_MS", d.retry_max_ms),
            replay_path: optional("INDEXER_REPLAY_PATH"),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("aggregate_period", self.aggregate_period),
            ("partition_change_period", self.partition_change_period),
            ("partition_keep_count", self.partition_keep_count),
            ("page_limit", self.page_limit),
            ("partitioned_table_max_size", self.partitioned_table_max_size),
            ("channel_buffer", self.channel_buffer as i64),
            ("query_timeout_ms", self.query_timeout_ms as i64),
        ];
        for (field, value) in positive {
            if value <= 0 {
                return Err(ConfigError::NotPositive { field, value });
            }
        }
        if self.retry_initial_ms > self.retry_max_ms {
            return Err(ConfigError::RetryRange {
                initial_ms: self.retry_initial_ms,
                max_ms: self.retry_max_ms,
            });
        }
        Ok(())
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            slow_tablespace: self.slow_tablespace.clone(),
        }
    }

    pub fn aggregation(&self) -> AggregationSettings {
        AggregationSettings {
            aggregate_period: self.aggregate_period,
            page_limit: self.page_limit,
        }
    }

    pub fn partition_manager(&self) -> PartitionManager {
        PartitionManager::new(
            self.partition_change_period,
            self.partition_keep_count,
            self.partitioned_table_max_size,
            self.slow_tablespace.is_some(),
        )
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env vars are process-global; both cases run in one test so they never race
    #[test]
    fn test_config_from_env() {
        // Test: Default configuration when no env vars set
        for key in [
            "INDEXER_DB_PATH",
            "INDEXER_AGGREGATE_PERIOD",
            "INDEXER_PAGE_LIMIT",
            "INDEXER_SLOW_TABLESPACE",
            "INDEXER_REPLAY_PATH",
        ] {
            env::remove_var(key);
        }
        let config = IndexerConfig::from_env();
        assert_eq!(config, IndexerConfig::default());
        assert!(config.validate().is_ok());

        // Test: Custom configuration from env vars
        env::set_var("INDEXER_DB_PATH", "/tmp/indexer-test.db");
        env::set_var("INDEXER_AGGREGATE_PERIOD", "7");
        env::set_var("INDEXER_PAGE_LIMIT", "not-a-number");
        env::set_var("INDEXER_SLOW_TABLESPACE", "/tmp/slow.db");

        let config = IndexerConfig::from_env();
        assert_eq!(config.db_path, "/tmp/indexer-test.db");
        assert_eq!(config.aggregate_period, 7);
        assert_eq!(config.page_limit, 50);
        assert_eq!(config.slow_tablespace.as_deref(), Some("/tmp/slow.db"));
        assert!(config.store_options().slow_tablespace.is_some());

        // Cleanup
        env::remove_var("INDEXER_DB_PATH");
        env::remove_var("INDEXER_AGGREGATE_PERIOD");
        env::remove_var("INDEXER_PAGE_LIMIT");
        env::remove_var("INDEXER_SLOW_TABLESPACE");
    }

    #[test]
    fn test_validate_rejects_zero_period() {
        let config = IndexerConfig {
            aggregate_period: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotPositive {
                field: "aggregate_period",
                value: 0
            })
        );

        let config = IndexerConfig {
            retry_initial_ms: 500,
            retry_max_ms: 100,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::RetryRange { .. })));
    }
}
