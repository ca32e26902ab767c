//! URL identity for pages and fetch requests.
//!
//! A page is identified by its normalized absolute URL: scheme, host, path and
//! query, without fragment or trailing slash. Case is preserved for display but
//! every comparison goes through [`UrlKey`], which folds case.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use url::Url;

/// URLs longer than this are truncated during normalization.
pub const MAX_URL_LEN: usize = 2000;

/// Error returned when a string cannot be used as a crawlable URL.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid URL: {url} ({reason})")]
pub struct InvalidUrl {
    /// The rejected input.
    pub url: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

impl InvalidUrl {
    fn new(url: &str, reason: &'static str) -> Self {
        Self {
            url: url.to_string(),
            reason,
        }
    }
}

/// Parses and normalizes an absolute http(s) URL.
///
/// # Errors
///
/// Returns [`InvalidUrl`] for unparseable input, non-http schemes, or URLs
/// without a host.
pub fn normalize_url(raw: &str) -> Result<String, InvalidUrl> {
    let mut parsed = Url::parse(raw.trim()).map_err(|_| InvalidUrl::new(raw, "unparseable"))?;
    normalize_parsed(&mut parsed).ok_or_else(|| InvalidUrl::new(raw, "not an http(s) URL"))
}

/// Resolves `href` against `base` and normalizes the result.
///
/// Returns `None` for non-navigable references (`javascript:`, `mailto:`,
/// `tel:`, `data:`, fragment-only) and anything that does not resolve to http(s).
#[must_use]
pub fn resolve_link(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || ["javascript:", "mailto:", "tel:", "data:"]
            .iter()
            .any(|prefix| {
                href.get(..prefix.len())
                    .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
            })
    {
        return None;
    }
    let mut joined = base.join(href).ok()?;
    normalize_parsed(&mut joined)
}

fn normalize_parsed(url: &mut Url) -> Option<String> {
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none_or(str::is_empty) {
        return None;
    }
    url.set_fragment(None);

    let serialized = url.as_str();
    let (head, query) = match serialized.find('?') {
        Some(pos) => (&serialized[..pos], Some(&serialized[pos..])),
        None => (serialized, None),
    };
    let mut normalized = head.trim_end_matches('/').to_string();
    if let Some(query) = query.filter(|q| q.len() > 1) {
        normalized.push_str(query);
    }
    Some(truncate_url(normalized))
}

fn truncate_url(mut url: String) -> String {
    if url.len() > MAX_URL_LEN {
        let mut cut = MAX_URL_LEN;
        while !url.is_char_boundary(cut) {
            cut -= 1;
        }
        tracing::debug!(original_len = url.len(), "truncating over-long URL");
        url.truncate(cut);
    }
    url
}

/// Lowercased host of `url`, or `"unknown"` when it has none.
#[must_use]
pub fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Last non-empty path segment of `url`, percent-decoded.
#[must_use]
pub fn last_segment(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed
        .path_segments()?
        .rev()
        .find(|segment| !segment.is_empty())?
        .to_string();
    Some(
        urlencoding::decode(&segment)
            .map(std::borrow::Cow::into_owned)
            .unwrap_or(segment),
    )
}

/// Case-insensitive identity of a normalized URL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UrlKey(String);

impl UrlKey {
    /// Builds a key from an already normalized URL.
    #[must_use]
    pub fn new(url: &str) -> Self {
        Self(url.to_lowercase())
    }

    /// The folded form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UrlKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered map from URL (case-insensitive) to a string value.
///
/// Extraction stores suggested file names as values; localization stores
/// relative paths. The first insertion for a URL wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkMap {
    entries: BTreeMap<UrlKey, (String, String)>,
}

impl LinkMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `url -> value` unless the URL is already present.
    /// Returns `true` when the entry was added.
    pub fn insert(&mut self, url: impl Into<String>, value: impl Into<String>) -> bool {
        let url = url.into();
        let key = UrlKey::new(&url);
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, (url, value.into()));
        true
    }

    /// Looks up a URL regardless of case.
    #[must_use]
    pub fn get(&self, url: &str) -> Option<&str> {
        self.entries
            .get(&UrlKey::new(url))
            .map(|(_, value)| value.as_str())
    }

    /// Whether the URL is present regardless of case.
    #[must_use]
    pub fn contains(&self, url: &str) -> bool {
        self.entries.contains_key(&UrlKey::new(url))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates `(url, value)` pairs in key order, with the URL as first inserted.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|(url, value)| (url.as_str(), value.as_str()))
    }
}
