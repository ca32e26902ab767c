//! Link localization: rewriting a downloaded page so its links point at the
//! local copies of the pages it references.
//!
//! Each dependency is followed through its redirect chain to the page that
//! actually holds the content. Dependencies that end anywhere other than a
//! downloaded file keep their original absolute link.

mod error;

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, instrument, warn};

pub use error::LocaliseError;

use crate::document::SharedLoader;
use crate::download::filename::random_stem;
use crate::fetch::{Fetcher, FetchRequest, retire_to_backup};
use crate::store::{ChangeSet, DownloadState, LocaliseState, PageId, PageRecord, PageStore};
use crate::urls::LinkMap;

/// Default cap on links rewritten per page.
pub const DEFAULT_MAX_LOCALISE_LINKS: usize = 2000;

/// Longest redirect chain followed for one dependency.
const MAX_CHAIN: usize = 32;

/// Limits and locations the localizer works with.
#[derive(Debug, Clone)]
pub struct LocaliseSettings {
    /// Entries in one page's rewrite map, the self reference included.
    pub max_links: usize,
    /// Fetch pages on demand when they are missing.
    pub best_effort_fetch: bool,
    /// Where originals are moved before the rewritten file replaces them.
    pub backup_dir: PathBuf,
}

/// What localizing one page did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocaliseOutcome {
    /// Links rewritten; `backup` holds the original.
    Localised {
        path: PathBuf,
        backup: PathBuf,
        links: usize,
    },
    /// The page was localized before.
    AlreadyLocalised,
    /// Nothing in the page changed; it is now excluded.
    Unchanged,
    /// The page has no file to rewrite; it is now excluded.
    NotDownloaded,
    /// The page is excluded from localization.
    Excluded,
}

/// Rewrites downloaded pages to reference local files.
pub struct Localizer {
    store: Arc<dyn PageStore>,
    loader: SharedLoader,
    fetcher: Option<Fetcher>,
    settings: LocaliseSettings,
    /// Pages already fetched on demand during this localizer's lifetime.
    attempted: Mutex<HashSet<PageId>>,
}

impl Localizer {
    #[must_use]
    pub fn new(store: Arc<dyn PageStore>, loader: SharedLoader, settings: LocaliseSettings) -> Self {
        Self {
            store,
            loader,
            fetcher: None,
            settings,
            attempted: Mutex::new(HashSet::new()),
        }
    }

    /// Enables on-demand fetches through `fetcher` when best effort is on.
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Fetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Localizes one page.
    ///
    /// # Errors
    ///
    /// Returns [`LocaliseError`] when the store cannot be read, the document
    /// cannot be rewritten, or the file swap fails. The original file is
    /// restored when the swap fails after it was moved.
    #[instrument(skip(self, page), fields(url = %page.url, page_id = page.id))]
    pub async fn localise(&self, page: PageRecord) -> Result<LocaliseOutcome, LocaliseError> {
        match page.localise_state {
            LocaliseState::Localised => {
                debug!("already localised");
                return Ok(LocaliseOutcome::AlreadyLocalised);
            }
            LocaliseState::Ignore => return Ok(LocaliseOutcome::Excluded),
            LocaliseState::ToLocalise => {}
        }

        let mut page = page;
        if !page.has_local_file() {
            let (Ok(fetched) | Err(fetched)) = self.fetch_on_demand(page).await?;
            page = fetched;
            if !page.has_local_file() {
                debug!("no local file, excluding from localization");
                page.localise_state = LocaliseState::Ignore;
                self.commit(&page).await?;
                return Ok(LocaliseOutcome::NotDownloaded);
            }
        }
        let Some(path) = page.file_path().map(Path::to_path_buf) else {
            return Ok(LocaliseOutcome::NotDownloaded);
        };

        let map = self.rewrite_map(&page, &path).await?;
        let temp = temp_path_for(&path);
        let changed = self.rewrite_into(&page.url, &path, &temp, map.clone()).await?;
        if !changed {
            debug!("no links changed");
            page.localise_state = LocaliseState::Ignore;
            self.commit(&page).await?;
            return Ok(LocaliseOutcome::Unchanged);
        }

        let backup = match retire_to_backup(&path, &self.settings.backup_dir).await {
            Ok(backup) => backup,
            Err(source) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(LocaliseError::io(&path, source));
            }
        };
        if let Err(source) = tokio::fs::rename(&temp, &path).await {
            warn!(error = %source, "could not move rewritten file in place, restoring original");
            if let Err(error) = tokio::fs::rename(&backup, &path).await {
                warn!(%error, backup = %backup.display(), "original left in backup");
            }
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(LocaliseError::io(&path, source));
        }

        page.localise_state = LocaliseState::Localised;
        self.commit(&page).await?;
        info!(links = map.len(), backup = %backup.display(), "page localised");
        Ok(LocaliseOutcome::Localised {
            path,
            backup,
            links: map.len(),
        })
    }

    /// URL to relative path for every dependency that resolves to a local file.
    async fn rewrite_map(&self, page: &PageRecord, path: &Path) -> Result<LinkMap, LocaliseError> {
        let mut map = LinkMap::new();
        map.insert(page.url.clone(), ".");
        let page_dir = path.parent().unwrap_or_else(|| Path::new("."));

        for dependency in self.store.dependencies(page.id).await? {
            if map.len() >= self.settings.max_links {
                debug!(max = self.settings.max_links, "link cap reached");
                break;
            }
            let url = dependency.url.clone();
            let Some(target) = self.authoritative_file(dependency).await? else {
                debug!(%url, "dependency has no local file, left absolute");
                continue;
            };
            if let Some(relative) = relative_link(page_dir, &target) {
                map.insert(url, relative);
            }
        }
        Ok(map)
    }

    /// Follows redirects from `page` to the file that holds its content.
    async fn authoritative_file(
        &self,
        page: PageRecord,
    ) -> Result<Option<PathBuf>, LocaliseError> {
        let mut visited = HashSet::new();
        let mut current = page;
        loop {
            if !visited.insert(current.id) || visited.len() > MAX_CHAIN {
                debug!(url = %current.url, "redirect chain loops or is too long");
                return Ok(None);
            }
            match current.download_state {
                DownloadState::Redirected => {
                    let Some(next) = current.redirect_id else {
                        return Ok(None);
                    };
                    match self.store.find_page(next).await? {
                        Some(next) => current = next,
                        None => return Ok(None),
                    }
                }
                DownloadState::Ignore => match self.fetch_on_demand(current).await? {
                    Ok(fetched) => {
                        visited.remove(&fetched.id);
                        current = fetched;
                    }
                    Err(_) => return Ok(None),
                },
                DownloadState::Downloaded => {
                    return Ok(current
                        .has_local_file()
                        .then(|| current.file_path().map(Path::to_path_buf))
                        .flatten());
                }
                DownloadState::Unknown => return Ok(None),
            }
        }
    }

    /// One best-effort fetch of `page`, returning its reloaded record.
    ///
    /// `Err(page)` hands the page back when no fetch was allowed or it failed.
    async fn fetch_on_demand(
        &self,
        page: PageRecord,
    ) -> Result<Result<PageRecord, PageRecord>, LocaliseError> {
        let Some(fetcher) = self.fetcher.as_ref().filter(|_| self.settings.best_effort_fetch)
        else {
            return Ok(Err(page));
        };
        if page.is_error_tagged() || !self.first_attempt(page.id) {
            return Ok(Err(page));
        }
        let Ok(request) = FetchRequest::new(&page.url) else {
            return Ok(Err(page));
        };
        let request = request.with_draft(page.draft_filespec.clone());
        let id = page.id;
        debug!(url = %page.url, "fetching on demand");
        let result = fetcher.fetch_page(page.clone(), &request).await?;
        if !result.is_success() {
            debug!(cause = ?result.cause, "on-demand fetch failed");
        }
        match self.store.find_page(id).await? {
            Some(reloaded) if reloaded.download_state != DownloadState::Ignore => {
                Ok(Ok(reloaded))
            }
            Some(reloaded) => Ok(Err(reloaded)),
            None => Ok(Err(page)),
        }
    }

    fn first_attempt(&self, id: PageId) -> bool {
        self.attempted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id)
    }

    /// Loads `source`, applies `map`, and saves to `temp` if anything changed.
    async fn rewrite_into(
        &self,
        url: &str,
        source: &Path,
        temp: &Path,
        map: LinkMap,
    ) -> Result<bool, LocaliseError> {
        let loader = Arc::clone(&self.loader);
        let (url, source, temp) = (url.to_string(), source.to_path_buf(), temp.to_path_buf());
        tokio::task::spawn_blocking(move || {
            let mut document = loader.load(&url, &source)?;
            if !document.rewrite_links(&map)? {
                return Ok(false);
            }
            document.save(&temp)?;
            Ok(true)
        })
        .await
        .map_err(|e| LocaliseError::Task(e.to_string()))?
    }

    async fn commit(&self, page: &PageRecord) -> Result<(), LocaliseError> {
        let mut changes = ChangeSet::new();
        changes.update(page);
        self.store.commit_changes(&changes).await?;
        Ok(())
    }
}

/// Hidden sibling of `path` that the rewritten document is written to first.
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!(".{name}.{}.tmp", random_stem()))
}

/// Path from `from_dir` to `target` as a URL reference with `/` separators.
fn relative_link(from_dir: &Path, target: &Path) -> Option<String> {
    let from = std::path::absolute(from_dir).ok()?;
    let target = std::path::absolute(target).ok()?;
    let relative = pathdiff::diff_paths(target, from)?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::ParentDir => Some("..".to_string()),
            Component::Normal(part) => {
                Some(urlencoding::encode(&part.to_string_lossy()).into_owned())
            }
            _ => None,
        })
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::document::html_loader;
    use crate::store::{MemoryStore, NewPage};
    use tempfile::TempDir;

    struct Mirror {
        _dir: TempDir,
        root: PathBuf,
        store: Arc<MemoryStore>,
    }

    impl Mirror {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let root = dir.path().to_path_buf();
            std::fs::create_dir_all(root.join("html")).unwrap();
            std::fs::create_dir_all(root.join("files")).unwrap();
            Self {
                _dir: dir,
                root,
                store: Arc::new(MemoryStore::new(Vec::new())),
            }
        }

        async fn page(
            &self,
            url: &str,
            state: DownloadState,
            file: Option<(&str, &str)>,
        ) -> PageRecord {
            let filespec = file.map(|(name, body)| {
                let path = self.root.join(name);
                std::fs::write(&path, body).unwrap();
                path.to_string_lossy().into_owned()
            });
            let new_page = NewPage {
                filespec,
                download_state: state,
                ..NewPage::unfetched(url, LocaliseState::ToLocalise)
            };
            self.store.create_page(&new_page).await.unwrap()
        }

        async fn save(&self, page: &PageRecord, links: &[&PageRecord]) {
            let mut changes = ChangeSet::new();
            changes.update(page);
            for link in links {
                changes.link(page.id, link.id);
            }
            self.store.commit_changes(&changes).await.unwrap();
        }

        fn localizer(&self) -> Localizer {
            let store: Arc<dyn PageStore> = Arc::clone(&self.store) as Arc<dyn PageStore>;
            Localizer::new(
                store,
                html_loader(),
                LocaliseSettings {
                    max_links: DEFAULT_MAX_LOCALISE_LINKS,
                    best_effort_fetch: false,
                    backup_dir: self.root.join("backup"),
                },
            )
        }

        fn backups(&self) -> usize {
            std::fs::read_dir(self.root.join("backup"))
                .map(|entries| entries.count())
                .unwrap_or(0)
        }
    }

    const PAGE: &str = r#"<html><body>
        <a href="/b">B</a>
        <a href="http://site.test/c#part">C</a>
        <img src="/logo">
        <a href="/ignored">I</a>
        <a href="/gone">G</a>
        <a href="/a">self</a>
    </body></html>"#;

    #[tokio::test]
    async fn test_localise_rewrites_resolved_dependencies() {
        let mirror = Mirror::new();
        let a = mirror
            .page("http://site.test/a", DownloadState::Downloaded, Some(("html/a.html", PAGE)))
            .await;
        let b = mirror
            .page("http://site.test/b", DownloadState::Downloaded, Some(("html/b.html", "b")))
            .await;
        let landing = mirror
            .page("http://site.test/c2", DownloadState::Downloaded, Some(("html/c2.html", "c")))
            .await;
        let mut c = mirror.page("http://site.test/c", DownloadState::Unknown, None).await;
        c.download_state = DownloadState::Redirected;
        c.redirect_id = Some(landing.id);
        mirror.save(&c, &[&landing]).await;
        let logo = mirror
            .page("http://site.test/logo", DownloadState::Downloaded, Some(("files/logo.png", "png")))
            .await;
        let ignored = mirror.page("http://site.test/ignored", DownloadState::Ignore, None).await;
        let gone = mirror
            .page("http://site.test/gone", DownloadState::Downloaded, Some(("html/gone.html", "g")))
            .await;
        std::fs::remove_file(gone.file_path().unwrap()).unwrap();
        mirror.save(&a, &[&b, &c, &logo, &ignored, &gone]).await;

        let outcome = mirror.localizer().localise(a.clone()).await.unwrap();
        let LocaliseOutcome::Localised { path, backup, .. } = outcome else {
            panic!("expected localised, got {outcome:?}");
        };

        let html = std::fs::read_to_string(&path).unwrap();
        assert!(html.contains(r#"href="b.html""#), "{html}");
        assert!(html.contains(r#"href="c2.html#part""#), "{html}");
        assert!(html.contains(r#"src="../files/logo.png""#), "{html}");
        assert!(html.contains(r#"href="/ignored""#), "{html}");
        assert!(html.contains(r#"href="/gone""#), "{html}");
        assert!(html.contains(r#"href=".""#), "{html}");
        assert_eq!(std::fs::read_to_string(backup).unwrap(), PAGE);

        let stored = mirror.store.find_page(a.id).await.unwrap().unwrap();
        assert_eq!(stored.localise_state, LocaliseState::Localised);
        assert_eq!(stored.filespec, a.filespec);
    }

    #[tokio::test]
    async fn test_localise_twice_is_noop() {
        let mirror = Mirror::new();
        let a = mirror
            .page("http://site.test/a", DownloadState::Downloaded, Some(("html/a.html", PAGE)))
            .await;
        let b = mirror
            .page("http://site.test/b", DownloadState::Downloaded, Some(("html/b.html", "b")))
            .await;
        mirror.save(&a, &[&b]).await;
        let localizer = mirror.localizer();

        localizer.localise(a.clone()).await.unwrap();
        let after_first = std::fs::read_to_string(a.file_path().unwrap()).unwrap();
        let stored = mirror.store.find_page(a.id).await.unwrap().unwrap();

        assert_eq!(localizer.localise(stored).await.unwrap(), LocaliseOutcome::AlreadyLocalised);
        assert_eq!(mirror.backups(), 1);
        assert_eq!(std::fs::read_to_string(a.file_path().unwrap()).unwrap(), after_first);
    }

    #[tokio::test]
    async fn test_page_without_changes_is_excluded() {
        let mirror = Mirror::new();
        let a = mirror
            .page(
                "http://site.test/a",
                DownloadState::Downloaded,
                Some(("html/a.html", r#"<a href="http://other.test/x">x</a>"#)),
            )
            .await;

        let outcome = mirror.localizer().localise(a.clone()).await.unwrap();

        assert_eq!(outcome, LocaliseOutcome::Unchanged);
        assert_eq!(mirror.backups(), 0);
        let stored = mirror.store.find_page(a.id).await.unwrap().unwrap();
        assert_eq!(stored.localise_state, LocaliseState::Ignore);
    }

    #[tokio::test]
    async fn test_missing_file_without_best_effort_is_excluded() {
        let mirror = Mirror::new();
        let a = mirror.page("http://site.test/a", DownloadState::Unknown, None).await;

        let outcome = mirror.localizer().localise(a.clone()).await.unwrap();

        assert_eq!(outcome, LocaliseOutcome::NotDownloaded);
        let stored = mirror.store.find_page(a.id).await.unwrap().unwrap();
        assert_eq!(stored.localise_state, LocaliseState::Ignore);
    }

    #[tokio::test]
    async fn test_redirect_cycle_is_left_absolute() {
        let mirror = Mirror::new();
        let a = mirror
            .page("http://site.test/a", DownloadState::Downloaded, Some(("html/a.html", PAGE)))
            .await;
        let mut b = mirror.page("http://site.test/b", DownloadState::Unknown, None).await;
        let mut loop_back = mirror.page("http://site.test/b2", DownloadState::Unknown, None).await;
        b.download_state = DownloadState::Redirected;
        b.redirect_id = Some(loop_back.id);
        loop_back.download_state = DownloadState::Redirected;
        loop_back.redirect_id = Some(b.id);
        mirror.save(&b, &[]).await;
        mirror.save(&loop_back, &[]).await;
        mirror.save(&a, &[&b]).await;

        let outcome = mirror.localizer().localise(a.clone()).await.unwrap();

        // Only the self reference resolves.
        let LocaliseOutcome::Localised { path, links, .. } = outcome else {
            panic!("expected localised, got {outcome:?}");
        };
        assert_eq!(links, 1);
        let html = std::fs::read_to_string(path).unwrap();
        assert!(html.contains(r#"href="/b""#));
    }

    #[tokio::test]
    async fn test_link_cap_bounds_rewrite_map() {
        let mirror = Mirror::new();
        let a = mirror
            .page("http://site.test/a", DownloadState::Downloaded, Some(("html/a.html", PAGE)))
            .await;
        let b = mirror
            .page("http://site.test/b", DownloadState::Downloaded, Some(("html/b.html", "b")))
            .await;
        mirror.save(&a, &[&b]).await;
        let store: Arc<dyn PageStore> = Arc::clone(&mirror.store) as Arc<dyn PageStore>;
        let localizer = Localizer::new(
            store,
            html_loader(),
            LocaliseSettings {
                max_links: 1,
                best_effort_fetch: false,
                backup_dir: mirror.root.join("backup"),
            },
        );

        let outcome = localizer.localise(a).await.unwrap();

        let LocaliseOutcome::Localised { path, links, .. } = outcome else {
            panic!("expected localised, got {outcome:?}");
        };
        assert_eq!(links, 1);
        assert!(std::fs::read_to_string(path).unwrap().contains(r#"href="/b""#));
    }

    #[test]
    fn test_relative_link_encodes_segments() {
        let root = Path::new("/mirror");
        assert_eq!(
            relative_link(&root.join("html"), &root.join("files/annual report.pdf")).as_deref(),
            Some("../files/annual%20report.pdf")
        );
        assert_eq!(
            relative_link(&root.join("html"), &root.join("html/b.html")).as_deref(),
            Some("b.html")
        );
    }
}
