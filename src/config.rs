//! The recognized configuration surface (spec §6). `sqlpool` owns this
//! validated, strongly-typed struct; parsing it out of a file or an XML
//! document is explicitly out of scope (spec §1) and left to the embedder,
//! the same division of labor the teacher driver draws between
//! `ConnectionPoolOptions` and whatever deployment-specific config loader
//! constructs one.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{self, Result};

/// A soft ceiling on `statement_cache_max_size`; configuring a cache larger
/// than this is almost certainly a mistake (misread units, accidental
/// multiplication) rather than an intentional capacity choice.
pub const STATEMENT_CACHE_MAX_SIZE_CAP: usize = 1 << 16;

/// Standard transaction isolation levels, applied to newly created
/// connections when [`ConnectionDefaults::transaction_isolation`] is set.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    None,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Polarity of a [`Restriction`] list.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Only prefixes present in the list may reach the driver.
    Whitelist,
    /// Prefixes present in the list may never reach the driver.
    Blacklist,
}

/// A query-prefix restriction list (spec §4.7.4). Prefixes are matched
/// lowercased, leading-whitespace-trimmed, by longest-prefix match.
#[derive(Clone, Debug, Deserialize)]
pub struct Restriction {
    pub polarity: Polarity,
    pub prefixes: Vec<String>,
}

impl Restriction {
    /// Returns `Ok(())` if `sql`'s leading prefix satisfies this
    /// restriction, `Err(ErrorKind::RestrictedQuery)` otherwise.
    pub(crate) fn check(&self, sql: &str) -> Result<()> {
        let trimmed = sql.trim_start().to_lowercase();
        let matched = self
            .prefixes
            .iter()
            .filter(|p| trimmed.starts_with(p.as_str()))
            .max_by_key(|p| p.len());

        let allowed = match self.polarity {
            Polarity::Whitelist => matched.is_some(),
            Polarity::Blacklist => matched.is_none(),
        };

        if allowed {
            Ok(())
        } else {
            Err(error::ErrorKind::RestrictedQuery {
                prefix: matched.cloned().unwrap_or_default(),
            }
            .into())
        }
    }
}

/// Defaults applied to connections as they are created (spec §6,
/// "defaults applied on created connections").
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConnectionDefaults {
    pub auto_commit: Option<bool>,
    pub read_only: Option<bool>,
    pub transaction_isolation: Option<IsolationLevel>,
    pub catalog: Option<String>,
    /// Whether the defaults above should be re-applied each time a
    /// connection is restored to the pool (undoing anything the borrowing
    /// caller may have changed).
    pub reset_defaults_after_use: bool,
}

/// Logging thresholds (spec §6). These are read once by [`crate::datasource::DataSource`]
/// at `start()` time to seed its atomic, dynamically-settable copies — see
/// `DataSource::set_log_connection_longer_than` and friends.
#[derive(Clone, Debug, Deserialize)]
pub struct LoggingThresholds {
    pub log_connection_longer_than: Option<Duration>,
    pub log_stack_trace_for_long_connection: bool,
    pub log_query_execution_longer_than: Option<Duration>,
    pub log_stack_trace_for_long_query_execution: bool,
    pub log_large_result_set: Option<u64>,
    pub log_stack_trace_for_large_result_set: bool,
    pub log_taken_connections_on_timeout: bool,
    pub log_line_regex: Option<String>,
    pub include_query_parameters: bool,
}

impl Default for LoggingThresholds {
    fn default() -> Self {
        LoggingThresholds {
            log_connection_longer_than: None,
            log_stack_trace_for_long_connection: false,
            log_query_execution_longer_than: None,
            log_stack_trace_for_long_query_execution: false,
            log_large_result_set: None,
            log_stack_trace_for_large_result_set: false,
            log_taken_connections_on_timeout: false,
            log_line_regex: None,
            include_query_parameters: false,
        }
    }
}

/// Statement-cache sizing (spec §4.4 / §6). A `max_size` of `0` disables the
/// cache entirely — `StatementCache::take` then always produces an uncached
/// holder.
#[derive(Clone, Debug, Deserialize)]
pub struct CacheConfig {
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig { max_size: 0 }
    }
}

/// The full, validated pool configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct PoolConfig {
    // -- connectivity --
    pub driver_class_name: Option<String>,
    pub jdbc_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Set when connections are supplied by an externally constructed
    /// factory rather than `driver_class_name`/`jdbc_url`.
    pub external_data_source: bool,

    // -- validation --
    /// An available handle idle longer than this is eligible for destruction
    /// by the reducer, independent of the taken-ratio reduction (spec §6,
    /// `connectionIdleLimitSeconds`). Never reduces the pool below
    /// `pool_initial_size`.
    pub connection_idle_limit: Option<Duration>,
    pub validate_timeout: Option<Duration>,
    /// Passed through to [`crate::driver::RawConnectionFactory::validate`] as
    /// its `test_query` argument (spec §6, `testConnectionQuery`).
    pub test_connection_query: Option<String>,
    /// Whether `restore(handle, valid: true)` re-validates the handle before
    /// making it available again (spec.md §4.2, `validateOnRestore`). An
    /// invalid result is treated the same as an explicitly invalid restore.
    pub validate_on_restore: bool,
    pub init_sql: Option<String>,
    pub clear_sql_warnings: bool,

    // -- pool shape --
    pub pool_initial_size: u32,
    pub pool_max_size: u32,
    pub pool_fair: bool,
    pub pool_enable_connection_tracking: bool,
    pub allow_connection_after_termination: bool,

    // -- reducer --
    pub reducer_interval: Option<Duration>,
    pub reducer_samples: u32,

    // -- acquisition --
    pub connection_timeout: Option<Duration>,
    pub login_timeout: Option<Duration>,
    pub acquire_retry_delay: Duration,
    pub acquire_retry_attempts: u32,

    // -- cache --
    pub cache: CacheConfig,

    // -- logging --
    pub logging: LoggingThresholds,

    // -- defaults --
    pub defaults: ConnectionDefaults,

    // -- restrictions --
    pub connection_restriction: Option<Restriction>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            driver_class_name: None,
            jdbc_url: None,
            username: None,
            password: None,
            external_data_source: true,
            connection_idle_limit: Some(Duration::from_secs(60 * 15)),
            validate_timeout: Some(Duration::from_secs(5)),
            test_connection_query: None,
            validate_on_restore: false,
            init_sql: None,
            clear_sql_warnings: true,
            pool_initial_size: 0,
            pool_max_size: 10,
            pool_fair: false,
            pool_enable_connection_tracking: false,
            allow_connection_after_termination: false,
            reducer_interval: Some(Duration::from_secs(60)),
            reducer_samples: 15,
            connection_timeout: Some(Duration::from_secs(30)),
            login_timeout: Some(Duration::from_secs(30)),
            acquire_retry_delay: Duration::from_millis(500),
            acquire_retry_attempts: 3,
            cache: CacheConfig::default(),
            logging: LoggingThresholds::default(),
            defaults: ConnectionDefaults::default(),
            connection_restriction: None,
        }
    }
}

impl PoolConfig {
    /// Validates configuration invariants. Called once by
    /// `DataSource::start()`; never guessed at or auto-corrected — a bad
    /// config is a hard `ErrorKind::Config` failure at startup.
    pub fn validate(&self) -> Result<()> {
        if self.pool_max_size == 0 {
            return Err(error::config("pool_max_size must be at least 1"));
        }
        if self.pool_initial_size > self.pool_max_size {
            return Err(error::config(
                "pool_initial_size must not exceed pool_max_size",
            ));
        }
        if !self.external_data_source
            && self.driver_class_name.is_none()
            && self.jdbc_url.is_none()
        {
            return Err(error::config(
                "either external_data_source or both driver_class_name and jdbc_url must be set",
            ));
        }
        if self.cache.max_size > STATEMENT_CACHE_MAX_SIZE_CAP {
            return Err(error::config(format!(
                "statement cache max_size {} exceeds the cap of {}",
                self.cache.max_size, STATEMENT_CACHE_MAX_SIZE_CAP
            )));
        }
        if self.reducer_interval.is_some() && self.reducer_samples == 0 {
            return Err(error::config(
                "reducer_samples must be at least 1 when reducer_interval is set",
            ));
        }
        if let Some(restriction) = &self.connection_restriction {
            if restriction.prefixes.iter().any(|p| p != &p.to_lowercase()) {
                return Err(error::config(
                    "connection_restriction prefixes must be lowercase",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        PoolConfig::default().validate().unwrap();
    }

    #[test]
    fn initial_size_over_max_is_rejected() {
        let mut cfg = PoolConfig::default();
        cfg.pool_initial_size = 20;
        cfg.pool_max_size = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_connectivity_is_rejected() {
        let mut cfg = PoolConfig::default();
        cfg.external_data_source = false;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn oversized_cache_is_rejected() {
        let mut cfg = PoolConfig::default();
        cfg.cache.max_size = STATEMENT_CACHE_MAX_SIZE_CAP + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn whitelist_restriction_allows_matching_prefix() {
        let r = Restriction {
            polarity: Polarity::Whitelist,
            prefixes: vec!["select".to_string()],
        };
        assert!(r.check("  SELECT * FROM t").is_ok());
        assert!(r.check("drop table t").is_err());
    }

    #[test]
    fn blacklist_restriction_rejects_matching_prefix() {
        let r = Restriction {
            polarity: Polarity::Blacklist,
            prefixes: vec!["drop".to_string(), "drop table".to_string()],
        };
        assert!(r.check("select 1").is_ok());
        let err = r.check("DROP TABLE t").unwrap_err();
        assert_eq!(err.sql_state(), "HY000");
    }

    #[test]
    fn longest_prefix_wins() {
        let r = Restriction {
            polarity: Polarity::Whitelist,
            prefixes: vec!["select".to_string(), "select * from secret".to_string()],
        };
        // Matches the shorter "select" prefix only: still allowed under
        // whitelist polarity regardless of which prefix matched longest.
        assert!(r.check("select * from public_table").is_ok());
    }
}
