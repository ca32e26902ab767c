//! Crawl configuration with defaults and validation.
//!
//! [`CrawlConfig`] is the library-side view of every recognized option. The
//! binary layers a config file and command-line flags on top of
//! [`CrawlConfig::default`] and calls [`CrawlConfig::validate`] before
//! starting a crawl.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::download::constants::DEFAULT_HTTP_TIMEOUT_SECS;
use crate::download::{DEFAULT_MAX_RETRIES, DEFAULT_RETRYABLE_STATUSES, RetryPolicy};
use crate::fetch::FetchSettings;
use crate::localize::{DEFAULT_MAX_LOCALISE_LINKS, LocaliseSettings};
use crate::scheduler::{
    DEFAULT_MAX_DEPTH, DEFAULT_MAX_HOST_WORKERS, DEFAULT_MAX_RESTARTS,
    DEFAULT_PER_HOST_CONCURRENCY, DEFAULT_RESTART_WINDOW, SchedulerConfig,
};

/// Default pages drained from the store per cycle.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default ceiling on a single download, in bytes.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10_000_000;

/// Default size after which download progress is logged, in bytes.
pub const DEFAULT_MIN_PROGRESS_SIZE: u64 = 1_000_000;

/// Accepted range for the HTTP timeout, in seconds.
pub const HTTP_TIMEOUT_RANGE_SECS: std::ops::RangeInclusive<u64> = 1..=120;

/// Errors from validating a [`CrawlConfig`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A count or size that must be positive is zero.
    #[error("`{field}` must be greater than zero")]
    Zero { field: &'static str },

    /// A value outside its accepted range.
    #[error("`{field}` is {value}, expected {expected}")]
    OutOfRange {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl ConfigError {
    fn out_of_range(field: &'static str, value: impl ToString, expected: &'static str) -> Self {
        Self::OutOfRange {
            field,
            value: value.to_string(),
            expected,
        }
    }
}

/// Exponential backoff for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    /// Attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            multiplier: 2.0,
        }
    }
}

/// Restart budget for a host's worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisionSettings {
    pub max_restarts: u32,
    pub window: Duration,
}

impl Default for SupervisionSettings {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RESTARTS,
            window: DEFAULT_RESTART_WINDOW,
        }
    }
}

/// Every option a crawl recognizes.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlConfig {
    /// Directory for HTML pages.
    pub html_dir: PathBuf,
    /// Directory for everything that is not HTML.
    pub other_dir: PathBuf,
    /// Directory retired files are moved to.
    pub backup_dir: PathBuf,
    /// `SQLite` database holding the page graph.
    pub database: PathBuf,
    pub batch_size: usize,
    pub max_file_size: u64,
    pub min_progress_size: u64,
    pub max_host_workers: usize,
    pub per_host_concurrency: usize,
    pub http_timeout: Duration,
    pub retryable_statuses: Vec<u16>,
    pub retry: RetrySettings,
    pub max_depth: u32,
    pub max_localise_links: usize,
    pub same_host_only: bool,
    pub supervision: SupervisionSettings,
    /// Drain pages left undownloaded by earlier runs.
    pub resume: bool,
    /// Run the localization pass after the crawl.
    pub localise: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        let root = PathBuf::from("./mirror");
        Self {
            html_dir: root.join("html"),
            other_dir: root.join("files"),
            backup_dir: root.join("backup"),
            database: root.join("webmirror.db"),
            batch_size: DEFAULT_BATCH_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            min_progress_size: DEFAULT_MIN_PROGRESS_SIZE,
            max_host_workers: DEFAULT_MAX_HOST_WORKERS,
            per_host_concurrency: DEFAULT_PER_HOST_CONCURRENCY,
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
            retry: RetrySettings::default(),
            max_depth: DEFAULT_MAX_DEPTH,
            max_localise_links: DEFAULT_MAX_LOCALISE_LINKS,
            same_host_only: true,
            supervision: SupervisionSettings::default(),
            resume: false,
            localise: true,
        }
    }
}

impl CrawlConfig {
    /// Places the three output directories and the database under `root`.
    #[must_use]
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            html_dir: root.join("html"),
            other_dir: root.join("files"),
            backup_dir: root.join("backup"),
            database: root.join("webmirror.db"),
            ..Self::default()
        }
    }

    /// Checks every value against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        nonzero("batch_size", self.batch_size)?;
        nonzero("max_host_workers", self.max_host_workers)?;
        nonzero("per_host_concurrency", self.per_host_concurrency)?;
        nonzero("max_localise_links", self.max_localise_links)?;
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "retry.max_attempts",
            });
        }
        if self.max_file_size == 0 {
            return Err(ConfigError::Zero {
                field: "max_file_size",
            });
        }
        if self.min_progress_size > self.max_file_size {
            return Err(ConfigError::out_of_range(
                "min_progress_size",
                self.min_progress_size,
                "at most max_file_size",
            ));
        }

        let timeout = self.http_timeout.as_secs();
        if !HTTP_TIMEOUT_RANGE_SECS.contains(&timeout) || self.http_timeout.subsec_nanos() != 0 {
            return Err(ConfigError::out_of_range(
                "http_timeout",
                format!("{}s", self.http_timeout.as_secs_f64()),
                "whole seconds in 1..=120",
            ));
        }

        if let Some(status) = self
            .retryable_statuses
            .iter()
            .find(|status| !(100..=599).contains(*status))
        {
            return Err(ConfigError::out_of_range(
                "retryable_statuses",
                status,
                "status codes in 100..=599",
            ));
        }

        if self.retry.multiplier < 1.0 || !self.retry.multiplier.is_finite() {
            return Err(ConfigError::out_of_range(
                "retry.multiplier",
                self.retry.multiplier,
                "at least 1.0",
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::out_of_range(
                "retry.base_delay",
                format!("{:?}", self.retry.base_delay),
                "at most retry.max_delay",
            ));
        }
        if self.supervision.window.is_zero() {
            return Err(ConfigError::Zero {
                field: "supervision.window",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            self.retry.base_delay,
            self.retry.max_delay,
            self.retry.multiplier,
        )
        .with_retryable_statuses(self.retryable_statuses.iter().copied())
    }

    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_host_workers: self.max_host_workers,
            per_host_concurrency: self.per_host_concurrency,
            max_depth: self.max_depth,
            same_host_only: self.same_host_only,
            max_restarts: self.supervision.max_restarts,
            restart_window: self.supervision.window,
        }
    }

    #[must_use]
    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            max_file_size: self.max_file_size,
            progress_step: self.min_progress_size,
            backup_dir: self.backup_dir.clone(),
        }
    }

    #[must_use]
    pub fn localise_settings(&self) -> LocaliseSettings {
        LocaliseSettings {
            max_links: self.max_localise_links,
            best_effort_fetch: true,
            backup_dir: self.backup_dir.clone(),
        }
    }
}

fn nonzero(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero { field })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CrawlConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.html_dir, PathBuf::from("./mirror/html"));
        assert_eq!(config.http_timeout, Duration::from_secs(15));
        assert_eq!(config.retryable_statuses, vec![408, 429, 500, 502, 503, 504]);
    }

    #[test]
    fn test_zero_caps_are_rejected() {
        let config = CrawlConfig {
            per_host_concurrency: 0,
            ..CrawlConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "per_host_concurrency"
            })
        );
    }

    #[test]
    fn test_timeout_outside_range_is_rejected() {
        for secs in [0, 121] {
            let config = CrawlConfig {
                http_timeout: Duration::from_secs(secs),
                ..CrawlConfig::default()
            };
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("http_timeout"), "{err}");
        }
    }

    #[test]
    fn test_progress_above_max_size_is_rejected() {
        let config = CrawlConfig {
            max_file_size: 1_000,
            min_progress_size: 2_000,
            ..CrawlConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                field: "min_progress_size",
                ..
            })
        ));
    }

    #[test]
    fn test_bad_status_code_is_rejected() {
        let config = CrawlConfig {
            retryable_statuses: vec![503, 600],
            ..CrawlConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "`retryable_statuses` is 600, expected status codes in 100..=599"
        );
    }

    #[test]
    fn test_rooted_at_moves_every_location() {
        let config = CrawlConfig::rooted_at("/srv/site");
        assert_eq!(config.other_dir, PathBuf::from("/srv/site/files"));
        assert_eq!(config.backup_dir, PathBuf::from("/srv/site/backup"));
        assert_eq!(config.database, PathBuf::from("/srv/site/webmirror.db"));
    }

    #[test]
    fn test_derived_settings_follow_config() {
        let config = CrawlConfig {
            max_host_workers: 7,
            max_depth: 5,
            retryable_statuses: vec![503],
            ..CrawlConfig::default()
        };
        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.max_host_workers, 7);
        assert_eq!(scheduler.max_depth, 5);
        assert_eq!(scheduler.max_restarts, DEFAULT_MAX_RESTARTS);

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts(), DEFAULT_MAX_RETRIES);
        assert_eq!(
            policy.classify_status(500),
            crate::download::FailureKind::Permanent
        );
        assert_eq!(
            policy.classify_status(503),
            crate::download::FailureKind::Transient
        );
        assert_eq!(config.fetch_settings().progress_step, DEFAULT_MIN_PROGRESS_SIZE);
    }
}
