//! Constants for the download module (timeouts, redirects, retry caps).

use std::time::Duration;

/// Default HTTP connect timeout (10 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default total request timeout (15 seconds).
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;

/// Redirect hops followed before a request is abandoned.
pub const MAX_REDIRECT_HOPS: usize = 10;

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);
