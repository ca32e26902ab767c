//! Filename extraction, sanitization, and path resolution for fetched files.
//!
//! [`NameResolver`] turns response metadata into a target path: the
//! extension comes from Content-Disposition, then the content type table,
//! then the draft name; the stem from Content-Disposition, then the URL,
//! then the draft, then a random name. The draft stem comes before the
//! random one so a name suggested by the linking page survives URLs that
//! end in a bare slash. The fetcher claims a free path with an exclusive
//! create before any byte is written.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use rand::distributions::Alphanumeric;
use thiserror::Error;
use tracing::debug;

use crate::content_type::{ContentTypeTable, is_page_extension, normalize_extension};
use crate::urls;

/// Longest target path accepted before an alternate name is generated.
pub const MAX_PATH_LEN: usize = 250;

/// Length of generated stems.
const RANDOM_STEM_LEN: usize = 12;

/// Alternate names tried before giving up on a directory.
const MAX_NAME_ATTEMPTS: usize = 64;

/// Longest extension accepted from a filename.
const MAX_EXTENSION_LEN: usize = 10;

/// 1990-01-01T00:00:00Z; earlier origin timestamps are ignored.
const EARLIEST_ORIGIN_SECS: u64 = 631_152_000;

/// Errors from name resolution.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No source yielded an extension.
    #[error("unknown extension for {url} (content type {content_type:?})")]
    UnknownExtension {
        /// Page URL.
        url: String,
        /// Response content type, if any.
        content_type: Option<String>,
    },

    /// Every candidate name in a directory was taken or too long.
    #[error("no free file name in {dir} after {attempts} attempts")]
    NoFreeName {
        /// Directory searched.
        dir: PathBuf,
        /// Names tried.
        attempts: usize,
    },
}

impl ResolveError {
    /// Creates an unknown-extension error.
    pub fn unknown_extension(url: impl Into<String>, content_type: Option<&str>) -> Self {
        Self::UnknownExtension {
            url: url.into(),
            content_type: content_type.map(str::to_string),
        }
    }
}

/// Parsed `Content-Disposition` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentDisposition {
    /// Suggested filename, decoded.
    pub filename: Option<String>,
    /// `modification-date` parameter.
    pub modified: Option<SystemTime>,
}

impl ContentDisposition {
    /// Parses a raw header value.
    #[must_use]
    pub fn parse(header: &str) -> Self {
        Self {
            filename: parse_content_disposition(header),
            modified: parameter(header, "modification-date")
                .and_then(|value| httpdate::parse_http_date(&value).ok()),
        }
    }
}

/// Metadata the resolver chooses a name from.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameHints<'a> {
    /// Landing URL of the fetch.
    pub url: &'a str,
    /// Response `Content-Type`.
    pub content_type: Option<&'a str>,
    /// Filename from `Content-Disposition`.
    pub disposition: Option<&'a str>,
    /// Caller-supplied draft filename.
    pub draft: Option<&'a str>,
}

/// Stem and extension chosen for a fetch, before a directory is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    pub stem: String,
    pub extension: String,
}

impl ResolvedName {
    /// `stem.extension`.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.stem, self.extension)
    }

    /// Whether the name points into the HTML directory.
    #[must_use]
    pub fn is_page(&self) -> bool {
        is_page_extension(&self.extension)
    }
}

/// Chooses names and target paths for fetched resources.
#[derive(Debug, Clone)]
pub struct NameResolver {
    table: Arc<ContentTypeTable>,
    html_dir: PathBuf,
    other_dir: PathBuf,
}

impl NameResolver {
    #[must_use]
    pub fn new(
        table: Arc<ContentTypeTable>,
        html_dir: impl Into<PathBuf>,
        other_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            table,
            html_dir: html_dir.into(),
            other_dir: other_dir.into(),
        }
    }

    #[must_use]
    pub fn table(&self) -> &ContentTypeTable {
        &self.table
    }

    /// Output directory for an extension class.
    #[must_use]
    pub fn dir_for(&self, extension: &str) -> &Path {
        if is_page_extension(extension) {
            &self.html_dir
        } else {
            &self.other_dir
        }
    }

    /// Picks stem and extension from the hints.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::UnknownExtension`] when neither the
    /// disposition filename, the content type, nor the draft yields one.
    pub fn resolve_name(&self, hints: &NameHints<'_>) -> Result<ResolvedName, ResolveError> {
        let disposition = hints.disposition.map(split_name);
        let draft = hints.draft.map(split_name);

        let extension = disposition
            .as_ref()
            .and_then(|(_, ext)| ext.clone())
            .or_else(|| {
                hints
                    .content_type
                    .and_then(|mime| self.table.extension_for_mime(mime))
                    .map(str::to_string)
            })
            .or_else(|| draft.as_ref().and_then(|(_, ext)| ext.clone()))
            .ok_or_else(|| ResolveError::unknown_extension(hints.url, hints.content_type))?;

        let stem = disposition
            .map(|(stem, _)| stem)
            .filter(|stem| !stem.is_empty())
            .or_else(|| {
                urls::last_segment(hints.url)
                    .map(|segment| split_name(&segment).0)
                    .filter(|stem| !stem.is_empty())
            })
            .or_else(|| draft.map(|(stem, _)| stem).filter(|stem| !stem.is_empty()))
            .unwrap_or_else(random_stem);

        debug!(url = hints.url, %stem, %extension, "resolved name");
        Ok(ResolvedName { stem, extension })
    }

    /// Default target for a URL before any response is seen.
    ///
    /// Uses the URL's last segment, or a random stem, with `default_extension`
    /// applied when the segment carries none.
    #[must_use]
    pub fn default_target(&self, url: &str, draft: Option<&str>, default_extension: &str) -> PathBuf {
        let (stem, extension) = draft
            .map(split_name)
            .filter(|(stem, _)| !stem.is_empty())
            .or_else(|| urls::last_segment(url).map(|segment| split_name(&segment)))
            .filter(|(stem, _)| !stem.is_empty())
            .unwrap_or_else(|| (random_stem(), None));
        let extension = extension.unwrap_or_else(|| normalize_extension(default_extension));
        self.dir_for(&extension).join(format!("{stem}.{extension}"))
    }

    /// Unused path for `name` in its extension's directory.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::NoFreeName`] when no alternate is found.
    pub fn free_path(&self, name: &ResolvedName) -> Result<PathBuf, ResolveError> {
        free_path_in(self.dir_for(&name.extension), &name.stem, &name.extension)
    }
}

/// Unused `dir/stem.extension`, or a random alternate when taken or too long.
///
/// # Errors
///
/// Returns [`ResolveError::NoFreeName`] after [`MAX_NAME_ATTEMPTS`] alternates.
pub fn free_path_in(dir: &Path, stem: &str, extension: &str) -> Result<PathBuf, ResolveError> {
    let preferred = dir.join(format!("{stem}.{extension}"));
    if is_usable(&preferred) {
        return Ok(preferred);
    }
    for _ in 0..MAX_NAME_ATTEMPTS {
        let candidate = dir.join(format!("{}.{extension}", random_stem()));
        if is_usable(&candidate) {
            debug!(preferred = %preferred.display(), chosen = %candidate.display(), "using alternate name");
            return Ok(candidate);
        }
    }
    Err(ResolveError::NoFreeName {
        dir: dir.to_path_buf(),
        attempts: MAX_NAME_ATTEMPTS,
    })
}

fn is_usable(path: &Path) -> bool {
    path.as_os_str().len() <= MAX_PATH_LEN && !path.exists()
}

/// Unused path in `backup_dir` for retiring `original`.
///
/// Keeps the original file name when free; otherwise a random stem with the
/// same extension.
#[must_use]
pub fn unique_backup_path(backup_dir: &Path, original: &Path) -> PathBuf {
    let file_name = original
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (stem, extension) = split_name(&file_name);
    let stem = if stem.is_empty() { random_stem() } else { stem };
    let extension = extension.unwrap_or_else(|| "bak".to_string());
    free_path_in(backup_dir, &stem, &extension)
        .unwrap_or_else(|_| backup_dir.join(format!("{}-{}.{extension}", random_stem(), random_stem())))
}

/// Random alphanumeric stem.
#[must_use]
pub fn random_stem() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_STEM_LEN)
        .map(char::from)
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Splits a raw filename into a sanitized stem and a validated extension.
#[must_use]
pub fn split_name(raw: &str) -> (String, Option<String>) {
    let name = sanitize_filename(raw);
    match name.rfind('.') {
        Some(dot) if dot > 0 => {
            let extension = normalize_extension(&name[dot + 1..]);
            if is_valid_extension(&extension) {
                (name[..dot].trim().to_string(), Some(extension))
            } else {
                (name, None)
            }
        }
        _ => (name.trim_start_matches('.').to_string(), None),
    }
}

fn is_valid_extension(extension: &str) -> bool {
    !extension.is_empty()
        && extension.len() <= MAX_EXTENSION_LEN
        && extension.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Sanitizes a filename for filesystem safety.
///
/// Only the first line is kept. Runs of characters invalid on common
/// filesystems (`/ \ : * ? " < > |` and control characters) become a single
/// space. Names that are dot segments come back empty.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let first_line = name.lines().map(str::trim).find(|line| !line.is_empty()).unwrap_or("");
    let mut out = String::with_capacity(first_line.len());
    let mut pending_space = false;
    for c in first_line.chars() {
        let invalid = matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|')
            || c.is_control()
            || c.is_whitespace();
        if invalid {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push(c);
    }

    if is_safe_filename_segment(&out) {
        out
    } else {
        String::new()
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Parses Content-Disposition header to extract filename.
///
/// Handles both:
/// - `attachment; filename="example.pdf"`
/// - `attachment; filename=example.pdf`
/// - `attachment; filename*=UTF-8''example.pdf` (RFC 5987)
pub(crate) fn parse_content_disposition(header: &str) -> Option<String> {
    if let Some(value) = parameter(header, "filename*")
        && let Some(quote_pos) = value.find("''")
        && let Ok(decoded) = urlencoding::decode(&value[quote_pos + 2..])
    {
        let decoded = decoded.trim();
        if !decoded.is_empty() {
            return Some(decoded.to_string());
        }
    }
    parameter(header, "filename")
}

/// Value of a `name=value` parameter, unquoted.
fn parameter(header: &str, name: &str) -> Option<String> {
    header.split(';').skip(1).find_map(|part| {
        let (key, value) = part.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case(name) {
            return None;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|inner| inner.strip_suffix('"'))
            .unwrap_or(value)
            .trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Accepts an origin timestamp only between 1990-01-01 and now.
#[must_use]
pub fn sane_origin_time(time: SystemTime) -> Option<SystemTime> {
    let earliest = UNIX_EPOCH + Duration::from_secs(EARLIEST_ORIGIN_SECS);
    (time >= earliest && time <= SystemTime::now()).then_some(time)
}
