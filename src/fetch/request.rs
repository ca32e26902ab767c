//! Units of work and their outcomes.

use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::urls::{self, InvalidUrl, LinkMap, UrlKey};

/// What to do when the page already has content on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Skip the request when the page is downloaded and its file exists.
    LeaveIfExists,
    /// Fetch and adopt whatever filespec resolves.
    Revector,
    /// Fetch, then keep the older file when the content is identical.
    #[default]
    RevectorAndCompare,
    /// Fetch and write over the intended path.
    OverwriteAlways,
}

/// Where the fetched content should go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FetchTarget {
    /// Pick the directory by extension and the name from the URL.
    #[default]
    Auto,
    /// Name from the URL, inside this directory.
    Directory(PathBuf),
    /// Exactly this file.
    File(PathBuf),
}

/// A request to fetch one URL.
///
/// Two requests for the same URL are equal whatever their targets.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    url: String,
    key: UrlKey,
    target: FetchTarget,
    disposition: Disposition,
    depth: u32,
    draft: Option<String>,
}

impl FetchRequest {
    /// Creates a depth-0 request with a normalized URL.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidUrl`] when the URL is not absolute http(s).
    pub fn new(url: &str) -> Result<Self, InvalidUrl> {
        let url = urls::normalize_url(url)?;
        Ok(Self {
            key: UrlKey::new(&url),
            url,
            target: FetchTarget::Auto,
            disposition: Disposition::default(),
            depth: 0,
            draft: None,
        })
    }

    #[must_use]
    pub fn with_target(mut self, target: FetchTarget) -> Self {
        self.target = target;
        self
    }

    #[must_use]
    pub fn with_disposition(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;
        self
    }

    #[must_use]
    pub fn at_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    /// Suggested file name, used when the page record has none.
    #[must_use]
    pub fn with_draft(mut self, draft: Option<String>) -> Self {
        self.draft = draft.filter(|d| !d.trim().is_empty());
        self
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn key(&self) -> &UrlKey {
        &self.key
    }

    #[must_use]
    pub fn host(&self) -> String {
        urls::host_of(&self.url)
    }

    #[must_use]
    pub fn target(&self) -> &FetchTarget {
        &self.target
    }

    /// Target file, once one has been decided.
    #[must_use]
    pub fn target_file(&self) -> Option<&Path> {
        match &self.target {
            FetchTarget::File(path) => Some(path),
            FetchTarget::Auto | FetchTarget::Directory(_) => None,
        }
    }

    #[must_use]
    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    #[must_use]
    pub fn draft(&self) -> Option<&str> {
        self.draft.as_deref()
    }
}

impl PartialEq for FetchRequest {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for FetchRequest {}

impl Hash for FetchRequest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

/// Why a fetch did not produce a file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchCause {
    /// Final response had a non-success status.
    #[error("HTTP {status} ({reason})")]
    Http { status: u16, reason: String },

    /// Body is larger than the configured ceiling.
    #[error("content exceeds {limit} bytes")]
    Oversize { limit: u64 },

    /// No extension could be resolved for the content.
    #[error("unknown extension for content type {content_type:?}")]
    UnknownExtension { content_type: Option<String> },

    /// No response after retries.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The fetch path faulted and supervision dropped the request.
    #[error("worker fault: {0}")]
    Fault(String),

    /// The request could not be admitted.
    #[error("rejected at admission: {0}")]
    Admission(String),

    /// The host's worker was stopped permanently.
    #[error("host {0} stopped")]
    HostStopped(String),

    /// The scheduler was torn down after exhausting its retry budget.
    #[error("scheduler escalated")]
    Escalated,
}

impl FetchCause {
    /// Failures that mark the page `Ignore` rather than leaving it for retry.
    #[must_use]
    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Oversize { .. } | Self::UnknownExtension { .. })
    }
}

/// Outcome of one fetch.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub request: FetchRequest,
    /// Authoritative local file.
    pub filespec: Option<PathBuf>,
    /// Final HTTP status, when a response arrived.
    pub status: Option<u16>,
    pub cause: Option<FetchCause>,
    /// Resolved extension of the file.
    pub extension: Option<String>,
    /// Landing URL when the fetch was redirected.
    pub redirected_to: Option<String>,
    /// Every hop when more than one redirect was followed.
    pub redirect_hops: Vec<String>,
    /// The new content matched an existing file, which was kept.
    pub deduplicated: bool,
    /// The request was satisfied without a network fetch.
    pub skipped: bool,
    /// Outbound links of an HTML result.
    pub links: LinkMap,
}

impl FetchResult {
    /// A successful result with `filespec`.
    #[must_use]
    pub fn succeeded(request: FetchRequest, filespec: PathBuf) -> Self {
        Self {
            request,
            filespec: Some(filespec),
            status: None,
            cause: None,
            extension: None,
            redirected_to: None,
            redirect_hops: Vec::new(),
            deduplicated: false,
            skipped: false,
            links: LinkMap::new(),
        }
    }

    /// A failed result.
    #[must_use]
    pub fn failed(request: FetchRequest, cause: FetchCause) -> Self {
        Self {
            request,
            filespec: None,
            status: None,
            cause: Some(cause),
            extension: None,
            redirected_to: None,
            redirect_hops: Vec::new(),
            deduplicated: false,
            skipped: false,
            links: LinkMap::new(),
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.cause.is_none()
    }

    #[must_use]
    pub fn url(&self) -> &str {
        self.request.url()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_requests_compare_by_url_only() {
        let a = FetchRequest::new("http://Example.com/Page/").unwrap();
        let b = FetchRequest::new("http://example.com/page")
            .unwrap()
            .with_target(FetchTarget::File(PathBuf::from("/tmp/x.html")))
            .at_depth(3);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }

    #[test]
    fn test_request_normalizes_url() {
        let request = FetchRequest::new("https://example.com/a/#frag").unwrap();
        assert_eq!(request.url(), "https://example.com/a");
        assert_eq!(request.host(), "example.com");
        assert_eq!(request.disposition(), Disposition::RevectorAndCompare);
    }

    #[test]
    fn test_request_rejects_non_http() {
        assert!(FetchRequest::new("ftp://example.com/file").is_err());
    }

    #[test]
    fn test_blank_draft_is_dropped() {
        let request = FetchRequest::new("http://h/a")
            .unwrap()
            .with_draft(Some("  ".to_string()));
        assert_eq!(request.draft(), None);
    }

    #[test]
    fn test_ignored_causes() {
        assert!(FetchCause::Oversize { limit: 1 }.is_ignored());
        assert!(FetchCause::UnknownExtension { content_type: None }.is_ignored());
        assert!(!FetchCause::Transport("reset".into()).is_ignored());
    }
}
