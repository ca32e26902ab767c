//! `SQLite` implementation of [`PageStore`].

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::page::PageRow;
use super::{ChangeSet, NewPage, PageId, PageRecord, PageStore, Result};
use crate::content_type::ContentTypeEntry;
use crate::db::Database;
use crate::urls::{LinkMap, UrlKey};

const PAGE_COLUMNS: &str =
    "id, url, draft_filespec, filespec, download_state, localise_state, redirect_id";

/// Page store backed by the crawl database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn select_pages(&self, sql: &str, bind: i64) -> Result<Vec<PageRecord>> {
        let rows = sqlx::query_as::<_, PageRow>(sql)
            .bind(bind)
            .fetch_all(self.db.pool())
            .await?;
        rows.into_iter().map(PageRecord::try_from).collect()
    }
}

fn limit(max_count: usize) -> i64 {
    i64::try_from(max_count).unwrap_or(i64::MAX)
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

#[async_trait]
impl PageStore for SqliteStore {
    #[instrument(skip(self))]
    async fn pages_to_download(&self, max_count: usize) -> Result<Vec<PageRecord>> {
        self.select_pages(
            &format!(
                "SELECT {PAGE_COLUMNS} FROM pages \
                 WHERE download_state = 'unknown' AND filespec IS NULL \
                 ORDER BY id LIMIT ?"
            ),
            limit(max_count),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn pages_to_localise(&self, max_count: usize) -> Result<Vec<PageRecord>> {
        self.select_pages(
            &format!(
                "SELECT {PAGE_COLUMNS} FROM pages \
                 WHERE localise_state = 'to_localise' AND download_state = 'downloaded' \
                 ORDER BY id LIMIT ?"
            ),
            limit(max_count),
        )
        .await
    }

    #[instrument(skip(self, links), fields(page_id = page.id, links = links.len()))]
    async fn add_or_merge_links(&self, page: &PageRecord, links: &LinkMap) -> Result<usize> {
        let localise_state = page.localise_state.inherited();
        let mut tx = self.db.pool().begin().await?;
        let mut added = 0usize;

        for (url, suggested) in links.iter() {
            if UrlKey::new(url) == page.url_key() {
                continue;
            }
            let draft = non_empty(suggested);
            let (supplier_id,): (i64,) = sqlx::query_as(
                "INSERT INTO pages (url, draft_filespec, localise_state) VALUES (?, ?, ?) \
                 ON CONFLICT(url) DO UPDATE SET \
                     draft_filespec = COALESCE(pages.draft_filespec, excluded.draft_filespec) \
                 RETURNING id",
            )
            .bind(url)
            .bind(draft)
            .bind(localise_state.as_str())
            .fetch_one(&mut *tx)
            .await?;

            let result = sqlx::query(
                "INSERT OR IGNORE INTO page_links (consumer_id, supplier_id, suggested_name) \
                 VALUES (?, ?, ?)",
            )
            .bind(page.id)
            .bind(supplier_id)
            .bind(draft)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() > 0 {
                added += 1;
            }
        }

        tx.commit().await?;
        debug!(added, "merged links");
        Ok(added)
    }

    #[instrument(skip(self))]
    async fn find_page_by_url(&self, url: &str) -> Result<Option<PageRecord>> {
        let row = sqlx::query_as::<_, PageRow>(&format!(
            "SELECT {PAGE_COLUMNS} FROM pages WHERE url = ?"
        ))
        .bind(url)
        .fetch_optional(self.db.pool())
        .await?;
        row.map(PageRecord::try_from).transpose()
    }

    async fn find_page(&self, id: PageId) -> Result<Option<PageRecord>> {
        let row = sqlx::query_as::<_, PageRow>(&format!(
            "SELECT {PAGE_COLUMNS} FROM pages WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;
        row.map(PageRecord::try_from).transpose()
    }

    #[instrument(skip(self, page), fields(url = %page.url))]
    async fn create_page(&self, page: &NewPage) -> Result<PageRecord> {
        let row = sqlx::query_as::<_, PageRow>(&format!(
            "INSERT INTO pages (url, draft_filespec, filespec, download_state, localise_state) \
             VALUES (?, ?, ?, ?, ?) RETURNING {PAGE_COLUMNS}"
        ))
        .bind(&page.url)
        .bind(page.draft_filespec.as_deref())
        .bind(page.filespec.as_deref())
        .bind(page.download_state.as_str())
        .bind(page.localise_state.as_str())
        .fetch_one(self.db.pool())
        .await?;
        PageRecord::try_from(row)
    }

    #[instrument(skip(self, changes), fields(pages = changes.pages().len()))]
    async fn commit_changes(&self, changes: &ChangeSet) -> Result<u64> {
        if changes.is_empty() {
            return Ok(0);
        }
        let mut tx = self.db.pool().begin().await?;
        let mut rows = 0u64;

        for page in changes.pages() {
            rows += sqlx::query(
                "UPDATE pages SET draft_filespec = ?, filespec = ?, download_state = ?, \
                 localise_state = ?, redirect_id = ?, updated_at = datetime('now') \
                 WHERE id = ?",
            )
            .bind(page.draft_filespec.as_deref())
            .bind(page.filespec.as_deref())
            .bind(page.download_state.as_str())
            .bind(page.localise_state.as_str())
            .bind(page.redirect_id)
            .bind(page.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        for &(consumer, supplier) in changes.links() {
            rows += sqlx::query(
                "INSERT OR IGNORE INTO page_links (consumer_id, supplier_id) VALUES (?, ?)",
            )
            .bind(consumer)
            .bind(supplier)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        for repoint in changes.repoints() {
            rows += sqlx::query(
                "INSERT OR IGNORE INTO page_links (consumer_id, supplier_id, suggested_name) \
                 SELECT consumer_id, ?, suggested_name FROM page_links \
                 WHERE supplier_id = ? AND consumer_id NOT IN (?, ?)",
            )
            .bind(repoint.to)
            .bind(repoint.from)
            .bind(repoint.from)
            .bind(repoint.to)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            sqlx::query(
                "DELETE FROM page_links WHERE supplier_id = ? AND consumer_id NOT IN (?, ?)",
            )
            .bind(repoint.from)
            .bind(repoint.from)
            .bind(repoint.to)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(rows)
    }

    async fn load_content_type_mappings(&self) -> Result<Vec<ContentTypeEntry>> {
        let entries = sqlx::query_as::<_, ContentTypeEntry>(
            "SELECT template, extension, is_text FROM content_types ORDER BY template",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(entries)
    }

    async fn dependencies(&self, id: PageId) -> Result<Vec<PageRecord>> {
        self.select_pages(
            "SELECT p.id, p.url, p.draft_filespec, p.filespec, p.download_state, \
             p.localise_state, p.redirect_id FROM pages p \
             JOIN page_links l ON l.supplier_id = p.id \
             WHERE l.consumer_id = ? ORDER BY p.id",
            id,
        )
        .await
    }

    async fn dependents(&self, id: PageId) -> Result<Vec<PageRecord>> {
        self.select_pages(
            "SELECT p.id, p.url, p.draft_filespec, p.filespec, p.download_state, \
             p.localise_state, p.redirect_id FROM pages p \
             JOIN page_links l ON l.consumer_id = p.id \
             WHERE l.supplier_id = ? ORDER BY p.id",
            id,
        )
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::{DownloadState, LocaliseState, StoreDbErrorKind};

    async fn store() -> SqliteStore {
        SqliteStore::new(Database::new_in_memory().await.unwrap())
    }

    async fn seed(store: &SqliteStore, url: &str) -> PageRecord {
        store
            .create_page(&NewPage::unfetched(url, LocaliseState::ToLocalise))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_find_page_case_insensitively() {
        let store = store().await;
        let created = seed(&store, "http://example.com/Page").await;

        let found = store
            .find_page_by_url("HTTP://EXAMPLE.COM/page")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.url, "http://example.com/Page");
        assert_eq!(found.download_state, DownloadState::Unknown);
    }

    #[tokio::test]
    async fn test_create_duplicate_page_is_constraint_violation() {
        let store = store().await;
        seed(&store, "http://example.com/a").await;

        let err = store
            .create_page(&NewPage::unfetched(
                "http://example.com/A",
                LocaliseState::Ignore,
            ))
            .await
            .unwrap_err();
        assert_eq!(
            err.database_kind(),
            Some(StoreDbErrorKind::ConstraintViolation)
        );

        let (page, created) = store
            .find_or_create_page(&NewPage::unfetched(
                "http://example.com/A",
                LocaliseState::Ignore,
            ))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(page.url, "http://example.com/a");
    }

    #[tokio::test]
    async fn test_add_or_merge_links_creates_pages_and_edges() {
        let store = store().await;
        let page = seed(&store, "http://example.com").await;
        let mut links = LinkMap::new();
        links.insert("http://example.com/about", "About us");
        links.insert("http://example.com/logo.png", "");
        links.insert("http://example.com", "self");

        let added = store.add_or_merge_links(&page, &links).await.unwrap();
        assert_eq!(added, 2);

        let deps = store.dependencies(page.id).await.unwrap();
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].draft_filespec.as_deref(), Some("About us"));
        assert_eq!(deps[1].draft_filespec, None);
        assert_eq!(deps[0].localise_state, LocaliseState::ToLocalise);

        let again = store.add_or_merge_links(&page, &links).await.unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn test_add_or_merge_links_keeps_first_draft_name() {
        let store = store().await;
        let first = seed(&store, "http://example.com/one").await;
        let second = seed(&store, "http://example.com/two").await;

        let mut links = LinkMap::new();
        links.insert("http://example.com/target", "First name");
        store.add_or_merge_links(&first, &links).await.unwrap();
        let mut links = LinkMap::new();
        links.insert("http://example.com/target", "Second name");
        store.add_or_merge_links(&second, &links).await.unwrap();

        let target = store
            .find_page_by_url("http://example.com/target")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(target.draft_filespec.as_deref(), Some("First name"));
        assert_eq!(store.dependents(target.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_batches_select_by_state() {
        let store = store().await;
        let mut done = seed(&store, "http://example.com/done").await;
        let mut failed = seed(&store, "http://example.com/failed").await;
        let fresh = seed(&store, "http://example.com/fresh").await;

        done.download_state = DownloadState::Downloaded;
        done.filespec = Some("/tmp/done.html".to_string());
        failed.mark_http_failure(404, "Not Found");
        let mut changes = ChangeSet::new();
        changes.update(&done);
        changes.update(&failed);
        assert_eq!(store.commit_changes(&changes).await.unwrap(), 2);

        let to_download = store.pages_to_download(10).await.unwrap();
        assert_eq!(to_download.len(), 1);
        assert_eq!(to_download[0].id, fresh.id);

        let to_localise = store.pages_to_localise(10).await.unwrap();
        assert_eq!(to_localise.len(), 1);
        assert_eq!(to_localise[0].id, done.id);

        assert_eq!(store.pages_to_download(0).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_repoint_moves_inbound_edges_except_redirect_edge() {
        let store = store().await;
        let referrer = seed(&store, "http://example.com/referrer").await;
        let original = seed(&store, "http://example.com/old").await;
        let landing = seed(&store, "http://example.com/new").await;

        let mut links = LinkMap::new();
        links.insert("http://example.com/old", "");
        store.add_or_merge_links(&referrer, &links).await.unwrap();
        let mut links = LinkMap::new();
        links.insert("http://example.com/old", "");
        store.add_or_merge_links(&landing, &links).await.unwrap();

        let mut changes = ChangeSet::new();
        changes.link(original.id, landing.id);
        changes.repoint_inbound(original.id, landing.id);
        store.commit_changes(&changes).await.unwrap();

        let referrer_deps = store.dependencies(referrer.id).await.unwrap();
        assert_eq!(referrer_deps.len(), 1);
        assert_eq!(referrer_deps[0].id, landing.id);

        let original_deps = store.dependencies(original.id).await.unwrap();
        assert_eq!(original_deps.len(), 1);
        assert_eq!(original_deps[0].id, landing.id);

        // landing -> original is left alone rather than becoming a self loop
        let landing_deps = store.dependencies(landing.id).await.unwrap();
        assert_eq!(landing_deps.len(), 1);
        assert_eq!(landing_deps[0].id, original.id);
    }

    #[tokio::test]
    async fn test_load_content_type_mappings_returns_seeded_rows() {
        let store = store().await;
        let entries = store.load_content_type_mappings().await.unwrap();
        assert!(
            entries
                .iter()
                .any(|entry| entry.template == "text/html" && entry.extension == "html")
        );
        assert!(entries.iter().any(|entry| !entry.is_text));
    }

    #[tokio::test]
    async fn test_commit_empty_change_set_writes_nothing() {
        let store = store().await;
        assert_eq!(store.commit_changes(&ChangeSet::new()).await.unwrap(), 0);
    }
}
