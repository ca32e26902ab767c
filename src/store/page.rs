//! Page records, their lifecycle states, and the unit of work used to persist them.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::StoreError;
use crate::urls::UrlKey;

/// Surrogate key of a page record.
pub type PageId = i64;

/// Prefix marking a `Filespec` that records a failure instead of a path.
pub const ERROR_SENTINEL: char = '!';

/// Builds the failure tag stored in `Filespec`, e.g. `!404(Not Found)`.
#[must_use]
pub fn error_tag(status: u16, reason: &str) -> String {
    format!("{ERROR_SENTINEL}{status}({reason})")
}

/// Download lifecycle of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    /// Known but not (successfully) fetched yet.
    Unknown,
    /// Content is on disk at `Filespec`.
    Downloaded,
    /// Fetching landed elsewhere; content belongs to the redirect target.
    Redirected,
    /// Deliberately not downloaded (oversize, unknown type).
    Ignore,
}

impl DownloadState {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Downloaded => "downloaded",
            Self::Redirected => "redirected",
            Self::Ignore => "ignore",
        }
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DownloadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "downloaded" => Ok(Self::Downloaded),
            "redirected" => Ok(Self::Redirected),
            "ignore" => Ok(Self::Ignore),
            _ => Err(format!("invalid download state: {s}")),
        }
    }
}

/// Localization lifecycle of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocaliseState {
    /// Links should be rewritten once the page is downloaded.
    ToLocalise,
    /// Links have been rewritten to local paths.
    Localised,
    /// Excluded from localization.
    Ignore,
}

impl LocaliseState {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToLocalise => "to_localise",
            Self::Localised => "localised",
            Self::Ignore => "ignore",
        }
    }

    /// State given to pages discovered from a page in this state.
    #[must_use]
    pub fn inherited(self) -> Self {
        match self {
            Self::ToLocalise | Self::Localised => Self::ToLocalise,
            Self::Ignore => Self::Ignore,
        }
    }
}

impl fmt::Display for LocaliseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LocaliseState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "to_localise" => Ok(Self::ToLocalise),
            "localised" => Ok(Self::Localised),
            "ignore" => Ok(Self::Ignore),
            _ => Err(format!("invalid localise state: {s}")),
        }
    }
}

/// A page known to the crawl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageRecord {
    pub id: PageId,
    /// Normalized absolute URL.
    pub url: String,
    /// File name hint (no directory) proposed before the response is seen.
    pub draft_filespec: Option<String>,
    /// Resolved local path, or an [`error_tag`], or nothing yet.
    pub filespec: Option<String>,
    pub download_state: DownloadState,
    pub localise_state: LocaliseState,
    /// Landing page when `download_state` is `Redirected`.
    pub redirect_id: Option<PageId>,
}

impl PageRecord {
    #[must_use]
    pub fn url_key(&self) -> UrlKey {
        UrlKey::new(&self.url)
    }

    /// True when `Filespec` holds a failure tag.
    #[must_use]
    pub fn is_error_tagged(&self) -> bool {
        self.filespec
            .as_deref()
            .is_some_and(|spec| spec.starts_with(ERROR_SENTINEL))
    }

    /// Local file path, if `Filespec` names one.
    #[must_use]
    pub fn file_path(&self) -> Option<&Path> {
        self.filespec
            .as_deref()
            .filter(|spec| !spec.is_empty() && !spec.starts_with(ERROR_SENTINEL))
            .map(Path::new)
    }

    /// Downloaded and the file is present on disk.
    #[must_use]
    pub fn has_local_file(&self) -> bool {
        self.download_state == DownloadState::Downloaded
            && self.file_path().is_some_and(Path::is_file)
    }

    /// Records a final HTTP failure. State is left for a later retry.
    pub fn mark_http_failure(&mut self, status: u16, reason: &str) {
        self.filespec = Some(error_tag(status, reason));
    }
}

/// Raw row shape of the `pages` table.
#[derive(Debug, FromRow)]
pub(crate) struct PageRow {
    id: i64,
    url: String,
    draft_filespec: Option<String>,
    filespec: Option<String>,
    download_state: String,
    localise_state: String,
    redirect_id: Option<i64>,
}

impl TryFrom<PageRow> for PageRecord {
    type Error = StoreError;

    fn try_from(row: PageRow) -> Result<Self, Self::Error> {
        let download_state = row.download_state.parse().map_err(|_| StoreError::CorruptRow {
            id: row.id,
            column: "download_state",
            value: row.download_state.clone(),
        })?;
        let localise_state = row.localise_state.parse().map_err(|_| StoreError::CorruptRow {
            id: row.id,
            column: "localise_state",
            value: row.localise_state.clone(),
        })?;
        Ok(Self {
            id: row.id,
            url: row.url,
            draft_filespec: row.draft_filespec,
            filespec: row.filespec,
            download_state,
            localise_state,
            redirect_id: row.redirect_id,
        })
    }
}

/// Arguments for creating a page record.
#[derive(Debug, Clone)]
pub struct NewPage {
    pub url: String,
    pub draft_filespec: Option<String>,
    pub filespec: Option<String>,
    pub download_state: DownloadState,
    pub localise_state: LocaliseState,
}

impl NewPage {
    /// A page nobody has fetched yet.
    #[must_use]
    pub fn unfetched(url: impl Into<String>, localise_state: LocaliseState) -> Self {
        Self {
            url: url.into(),
            draft_filespec: None,
            filespec: None,
            download_state: DownloadState::Unknown,
            localise_state,
        }
    }

    #[must_use]
    pub fn with_draft(mut self, draft: Option<String>) -> Self {
        self.draft_filespec = draft;
        self
    }
}

/// Inbound references to `from` move to `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Repoint {
    pub from: PageId,
    pub to: PageId,
}

/// Everything one fetch or one localization wants persisted, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pages: Vec<PageRecord>,
    repoints: Vec<Repoint>,
    links: Vec<(PageId, PageId)>,
}

impl ChangeSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the full row of `page`. A later update of the same id replaces it.
    pub fn update(&mut self, page: &PageRecord) {
        self.pages.retain(|existing| existing.id != page.id);
        self.pages.push(page.clone());
    }

    /// Every page consuming `from` consumes `to` instead, except `to` itself.
    pub fn repoint_inbound(&mut self, from: PageId, to: PageId) {
        self.repoints.push(Repoint { from, to });
    }

    /// Adds the edge `consumer -> supplier`.
    pub fn link(&mut self, consumer: PageId, supplier: PageId) {
        if !self.links.contains(&(consumer, supplier)) {
            self.links.push((consumer, supplier));
        }
    }

    #[must_use]
    pub fn pages(&self) -> &[PageRecord] {
        &self.pages
    }

    #[must_use]
    pub fn repoints(&self) -> &[Repoint] {
        &self.repoints
    }

    #[must_use]
    pub fn links(&self) -> &[(PageId, PageId)] {
        &self.links
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty() && self.repoints.is_empty() && self.links.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn page(filespec: Option<&str>) -> PageRecord {
        PageRecord {
            id: 1,
            url: "http://example.com/a".to_string(),
            draft_filespec: None,
            filespec: filespec.map(str::to_string),
            download_state: DownloadState::Downloaded,
            localise_state: LocaliseState::ToLocalise,
            redirect_id: None,
        }
    }

    #[test]
    fn test_error_tag_format() {
        assert_eq!(error_tag(404, "Not Found"), "!404(Not Found)");
    }

    #[test]
    fn test_mark_http_failure_hides_file_path() {
        let mut record = page(Some("/tmp/a.html"));
        record.mark_http_failure(500, "Internal Server Error");

        assert!(record.is_error_tagged());
        assert_eq!(record.file_path(), None);
        assert_eq!(record.download_state, DownloadState::Downloaded);
    }

    #[test]
    fn test_state_round_trip_through_strings() {
        for state in [
            DownloadState::Unknown,
            DownloadState::Downloaded,
            DownloadState::Redirected,
            DownloadState::Ignore,
        ] {
            assert_eq!(state.as_str().parse::<DownloadState>().unwrap(), state);
        }
        assert!("bogus".parse::<LocaliseState>().is_err());
    }

    #[test]
    fn test_localise_state_inheritance() {
        assert_eq!(LocaliseState::Localised.inherited(), LocaliseState::ToLocalise);
        assert_eq!(LocaliseState::Ignore.inherited(), LocaliseState::Ignore);
    }

    #[test]
    fn test_change_set_keeps_last_update_per_page() {
        let mut changes = ChangeSet::new();
        let mut record = page(None);
        changes.update(&record);
        record.filespec = Some("/tmp/b.html".to_string());
        changes.update(&record);
        changes.link(1, 2);
        changes.link(1, 2);

        assert_eq!(changes.pages().len(), 1);
        assert_eq!(changes.pages()[0].filespec.as_deref(), Some("/tmp/b.html"));
        assert_eq!(changes.links().len(), 1);
    }

    #[test]
    fn test_page_row_with_unknown_state_is_corrupt() {
        let row = PageRow {
            id: 7,
            url: "http://example.com".to_string(),
            draft_filespec: None,
            filespec: None,
            download_state: "exploded".to_string(),
            localise_state: "ignore".to_string(),
            redirect_id: None,
        };
        let err = PageRecord::try_from(row).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { id: 7, .. }));
    }
}
