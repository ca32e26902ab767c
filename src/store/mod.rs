//! Page store: page records, the link graph between them, and the content
//! type table.
//!
//! [`PageStore`] is the seam the fetcher, scheduler and localizer depend on.
//! [`SqliteStore`] is the persistent implementation; [`MemoryStore`] keeps the
//! same graph in an in-process arena.
//!
//! Batches returned by [`PageStore::pages_to_download`] and
//! [`PageStore::pages_to_localise`] are at-least-once: a page stays eligible
//! until a commit moves it out of the selecting state.

mod error;
mod memory;
mod page;
mod sqlite;

use async_trait::async_trait;

pub use error::{StoreDbErrorKind, StoreError};
pub use memory::MemoryStore;
pub use page::{
    ChangeSet, DownloadState, ERROR_SENTINEL, LocaliseState, NewPage, PageId, PageRecord, Repoint,
    error_tag,
};
pub use sqlite::SqliteStore;

use crate::content_type::ContentTypeEntry;
use crate::urls::LinkMap;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Data-access contract for the crawl graph.
#[async_trait]
pub trait PageStore: Send + Sync {
    /// Pages never fetched and not failure-tagged, oldest first.
    async fn pages_to_download(&self, max_count: usize) -> Result<Vec<PageRecord>>;

    /// Downloaded pages still marked `ToLocalise`, oldest first.
    async fn pages_to_localise(&self, max_count: usize) -> Result<Vec<PageRecord>>;

    /// Finds or creates a page per link and records `page -> link` edges.
    ///
    /// New pages take the link value as their draft name and inherit the
    /// consumer's localization flag. An existing page keeps its draft name
    /// unless it had none. Returns the number of new edges.
    async fn add_or_merge_links(&self, page: &PageRecord, links: &LinkMap) -> Result<usize>;

    /// Looks a page up by URL, case-insensitively.
    async fn find_page_by_url(&self, url: &str) -> Result<Option<PageRecord>>;

    /// Looks a page up by id.
    async fn find_page(&self, id: PageId) -> Result<Option<PageRecord>>;

    /// Inserts a page. Fails with a constraint violation if the URL exists.
    async fn create_page(&self, page: &NewPage) -> Result<PageRecord>;

    /// Applies a unit of work atomically and returns the rows written.
    async fn commit_changes(&self, changes: &ChangeSet) -> Result<u64>;

    /// Rows of the content type table.
    async fn load_content_type_mappings(&self) -> Result<Vec<ContentTypeEntry>>;

    /// Pages this page links to (`ConsumeFrom`).
    async fn dependencies(&self, id: PageId) -> Result<Vec<PageRecord>>;

    /// Pages linking to this page (`SupplyTo`).
    async fn dependents(&self, id: PageId) -> Result<Vec<PageRecord>>;

    /// Returns the page for `page.url`, creating it when absent.
    ///
    /// The boolean is `true` when the page was created by this call. A
    /// concurrent creation of the same URL is resolved by re-reading.
    async fn find_or_create_page(&self, page: &NewPage) -> Result<(PageRecord, bool)> {
        if let Some(existing) = self.find_page_by_url(&page.url).await? {
            return Ok((existing, false));
        }
        match self.create_page(page).await {
            Ok(created) => Ok((created, true)),
            Err(error) if error.database_kind() == Some(StoreDbErrorKind::ConstraintViolation) => {
                let existing = self
                    .find_page_by_url(&page.url)
                    .await?
                    .ok_or(error)?;
                Ok((existing, false))
            }
            Err(error) => Err(error),
        }
    }
}
