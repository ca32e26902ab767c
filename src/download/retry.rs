//! Exponential backoff for requests that may succeed when repeated.
//!
//! [`HttpClient`](super::HttpClient) consults a [`RetryPolicy`] after every
//! failed attempt and only hands the final outcome to its caller. Statuses in
//! the policy's retryable set (default [`DEFAULT_RETRYABLE_STATUSES`]) and
//! network faults other than TLS failures are retried; a `Retry-After`
//! header replaces the computed delay.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use webmirror_core::download::{FailureKind, RetryPolicy};
//!
//! let policy = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(8), 2.0);
//! let kind = policy.classify_status(503);
//! assert_eq!(kind, FailureKind::Transient);
//! assert!(policy.delay_before_retry(kind, 1, None).is_some());
//! assert!(policy.delay_before_retry(kind, 3, None).is_none());
//! ```

use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tracing::{debug, warn};

use super::DownloadError;
use super::constants::MAX_RETRY_AFTER;

/// Attempts made per request, the first included.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Statuses retried unless configured otherwise.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);
const DEFAULT_MULTIPLIER: f32 = 2.0;

/// Upper bound on random jitter added to a backoff delay.
const MAX_JITTER: Duration = Duration::from_millis(500);

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Worth repeating after a backoff.
    Transient,
    /// HTTP 429; repeated after a backoff or the server's `Retry-After`.
    RateLimited,
    /// Repeating cannot change the outcome.
    Permanent,
}

impl FailureKind {
    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

/// Attempt limit, backoff schedule and retryable statuses.
///
/// The delay after failed attempt `n` is
/// `min(base_delay * multiplier^(n-1), max_delay)` plus jitter of at most
/// `min(500ms, base_delay)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f32,
    retryable_statuses: BTreeSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_RETRIES,
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
            DEFAULT_MULTIPLIER,
        )
    }
}

impl RetryPolicy {
    /// A policy with the default retryable statuses. `max_attempts` below 1 is raised to 1.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, multiplier: f32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            multiplier,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.into_iter().collect(),
        }
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub fn no_retries() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, 1.0)
    }

    /// Replaces the retryable status set.
    #[must_use]
    pub fn with_retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = statuses.into_iter().collect();
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Classifies a non-success HTTP status.
    #[must_use]
    pub fn classify_status(&self, status: u16) -> FailureKind {
        match status {
            _ if !self.retryable_statuses.contains(&status) => FailureKind::Permanent,
            429 => FailureKind::RateLimited,
            _ => FailureKind::Transient,
        }
    }

    /// Delay before the next attempt, or `None` when the request should not be repeated.
    ///
    /// `failed_attempt` is 1-based. A server-supplied `retry_after` replaces the
    /// backoff for retryable failures.
    #[must_use]
    pub fn delay_before_retry(
        &self,
        kind: FailureKind,
        failed_attempt: u32,
        retry_after: Option<Duration>,
    ) -> Option<Duration> {
        if !kind.is_retryable() {
            return None;
        }
        if failed_attempt >= self.max_attempts {
            debug!(failed_attempt, max = self.max_attempts, "attempts exhausted");
            return None;
        }
        Some(retry_after.unwrap_or_else(|| self.backoff(failed_attempt) + self.jitter()))
    }

    /// Backoff without jitter after `failed_attempt`.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn backoff(&self, failed_attempt: u32) -> Duration {
        let exponent = i32::try_from(failed_attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * f64::from(self.multiplier).powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_millis((capped * 1000.0) as u64)
        } else {
            Duration::ZERO
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn jitter(&self) -> Duration {
        let ceiling = MAX_JITTER.min(self.base_delay).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

/// Classifies an attempt that produced no response.
///
/// Timeouts and network faults are transient, except TLS failures, which a
/// retry will not fix. Local I/O, bad URLs, redirect loops and oversize
/// bodies are permanent.
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureKind {
    match error {
        DownloadError::Timeout { .. } => FailureKind::Transient,
        DownloadError::Network { source, .. } if is_tls_failure(source) => FailureKind::Permanent,
        DownloadError::Network { .. } => FailureKind::Transient,
        DownloadError::Io { .. }
        | DownloadError::InvalidUrl { .. }
        | DownloadError::TooManyRedirects { .. }
        | DownloadError::TooLarge { .. }
        | DownloadError::ClientBuild(_) => FailureKind::Permanent,
    }
}

/// Looks for certificate or handshake trouble anywhere in the error chain.
fn is_tls_failure(error: &reqwest::Error) -> bool {
    const MARKERS: [&str; 4] = ["certificate", "tls", "ssl", "handshake"];
    let mut current: Option<&dyn std::error::Error> = Some(error);
    while let Some(err) = current {
        let message = err.to_string().to_ascii_lowercase();
        if MARKERS.iter().any(|marker| message.contains(marker)) {
            return true;
        }
        current = err.source();
    }
    false
}

/// Parses `Retry-After` as delta-seconds or an HTTP-date, capped at one hour.
///
/// Negative values and dates already past yield `None`.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let value = header_value.trim();
    let delay = match value.parse::<i64>() {
        Ok(seconds) => Duration::from_secs(u64::try_from(seconds).ok()?),
        Err(_) => httpdate::parse_http_date(value)
            .ok()?
            .duration_since(SystemTime::now())
            .ok()?,
    };
    if delay > MAX_RETRY_AFTER {
        warn!(
            requested_secs = delay.as_secs(),
            "Retry-After longer than an hour, capping"
        );
        return Some(MAX_RETRY_AFTER);
    }
    Some(delay)
}
