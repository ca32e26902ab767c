//! Error types for the HTTP layer.
//!
//! HTTP error statuses are not errors here: the final response, whatever its
//! status, is handed to the fetcher. These variants cover requests that never
//! produced a usable response or body.

use std::path::PathBuf;

use thiserror::Error;

/// A request that produced no usable response, or a body that could not be saved.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// DNS, connect, TLS or protocol failure.
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("timeout fetching {url}")]
    Timeout { url: String },

    /// Writing the body to disk failed.
    #[error("IO error writing to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed, or not http(s).
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    #[error("too many redirects fetching {url} ({hops} hops)")]
    TooManyRedirects { url: String, hops: usize },

    /// The body crossed the size ceiling while streaming.
    #[error("body of {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: u64 },

    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

impl DownloadError {
    /// Wraps a reqwest failure; timeouts become [`Self::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    pub fn too_many_redirects(url: impl Into<String>, hops: usize) -> Self {
        Self::TooManyRedirects {
            url: url.into(),
            hops,
        }
    }

    pub fn too_large(url: impl Into<String>, limit: u64) -> Self {
        Self::TooLarge {
            url: url.into(),
            limit,
        }
    }

    /// URL the failure concerns, when there is one.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Network { url, .. }
            | Self::Timeout { url }
            | Self::InvalidUrl { url }
            | Self::TooManyRedirects { url, .. }
            | Self::TooLarge { url, .. } => Some(url),
            Self::Io { .. } | Self::ClientBuild(_) => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let error = DownloadError::timeout("https://example.com/slow");
        assert_eq!(error.to_string(), "timeout fetching https://example.com/slow");
    }

    #[test]
    fn test_io_display_includes_path() {
        let error = DownloadError::io(
            "/mirror/html/a.html",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let message = error.to_string();
        assert!(message.contains("/mirror/html/a.html"));
        assert!(message.contains("denied"));
    }

    #[test]
    fn test_too_many_redirects_display() {
        let error = DownloadError::too_many_redirects("https://example.com/loop", 11);
        assert_eq!(
            error.to_string(),
            "too many redirects fetching https://example.com/loop (11 hops)"
        );
    }

    #[test]
    fn test_too_large_display() {
        let error = DownloadError::too_large("https://example.com/big.iso", 10_000_000);
        assert!(error.to_string().contains("10000000"));
    }

    #[test]
    fn test_invalid_url_display() {
        let error = DownloadError::invalid_url("not-a-url");
        assert_eq!(error.to_string(), "invalid URL: not-a-url");
        assert_eq!(error.url(), Some("not-a-url"));
    }

    #[test]
    fn test_io_error_has_no_url() {
        let error = DownloadError::io("/x", std::io::Error::other("disk"));
        assert_eq!(error.url(), None);
    }
}
