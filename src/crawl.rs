//! Crawl driver: seeds in, mirrored and localized files out.
//!
//! [`Crawler`] wires the store, the fetcher, the scheduler and the localizer
//! together for one run and reports a [`CrawlSummary`].

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigError, CrawlConfig};
use crate::content_type::{ContentTypeError, ContentTypeTable};
use crate::db::{Database, DbError};
use crate::document::{SharedLoader, html_loader};
use crate::download::{DownloadError, HttpClient, NameResolver};
use crate::fetch::{FetchRequest, FetchResult, FetchService, Fetcher};
use crate::localize::{LocaliseOutcome, Localizer};
use crate::scheduler::{Scheduler, SchedulerError, SchedulerHandle};
use crate::store::{LocaliseState, NewPage, PageId, PageRecord, PageStore, SqliteStore, StoreError};

/// Called with every completed fetch as it arrives.
pub type ProgressFn = Arc<dyn Fn(&FetchResult) + Send + Sync>;

/// Errors that end a crawl before it starts or while it drains the store.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    ContentTypes(#[from] ContentTypeError),

    #[error(transparent)]
    Http(#[from] DownloadError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// An output directory cannot be created or written.
    #[error("output directory {path} is not writable: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What a crawl did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrawlSummary {
    /// Distinct URLs admitted to the scheduler.
    pub submitted: usize,
    /// Fetches that wrote or kept a file.
    pub fetched: usize,
    /// Requests satisfied by a file already on disk.
    pub skipped: usize,
    pub failed: usize,
    /// Pages excluded for size or unknown type.
    pub ignored: usize,
    pub redirected: usize,
    /// Fetches whose content matched a file already on disk.
    pub deduplicated: usize,
    /// Redirected fetches that went through more than one hop.
    pub multi_hop_redirects: usize,
    pub localised: usize,
    pub localise_unchanged: usize,
    pub localise_failed: usize,
    /// Seeds that were not absolute http(s) URLs.
    pub rejected_seeds: usize,
    pub per_extension: BTreeMap<String, usize>,
    pub restarts: usize,
    pub stops: usize,
    pub escalated: bool,
}

impl CrawlSummary {
    fn record(&mut self, result: &FetchResult) {
        if result.is_success() {
            if result.skipped {
                self.skipped += 1;
            } else {
                self.fetched += 1;
            }
            if let Some(extension) = &result.extension {
                *self.per_extension.entry(extension.clone()).or_default() += 1;
            }
        } else if result.cause.as_ref().is_some_and(|cause| cause.is_ignored()) {
            self.ignored += 1;
        } else {
            self.failed += 1;
        }
        if result.redirected_to.is_some() {
            self.redirected += 1;
        }
        if result.redirect_hops.len() > 1 {
            self.multi_hop_redirects += 1;
        }
        if result.deduplicated {
            self.deduplicated += 1;
        }
    }
}

/// One crawl over one store.
pub struct Crawler {
    config: CrawlConfig,
    store: Arc<dyn PageStore>,
    fetcher: Fetcher,
    loader: SharedLoader,
    progress: Option<ProgressFn>,
}

impl Crawler {
    /// Opens the configured database and prepares a crawler over it.
    ///
    /// # Errors
    ///
    /// See [`Crawler::with_store`]; also fails when the database cannot be opened.
    pub async fn open(config: CrawlConfig) -> Result<Self, CrawlError> {
        config.validate()?;
        if let Some(parent) = config.database.parent() {
            create_writable_dir(parent).await?;
        }
        let db = Database::new(&config.database).await?;
        let store: Arc<dyn PageStore> = Arc::new(SqliteStore::new(db));
        Self::with_store(config, store).await
    }

    /// Prepares a crawler over `store`.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError`] for an invalid configuration, a content type
    /// table whose indexes disagree, or an output directory that cannot be
    /// written.
    pub async fn with_store(
        config: CrawlConfig,
        store: Arc<dyn PageStore>,
    ) -> Result<Self, CrawlError> {
        config.validate()?;
        let table = ContentTypeTable::from_entries(store.load_content_type_mappings().await?)?;
        debug!(entries = table.len(), "content type table loaded");
        for dir in [&config.html_dir, &config.other_dir, &config.backup_dir] {
            create_writable_dir(dir).await?;
        }

        let client = HttpClient::with_policy(config.http_timeout, config.retry_policy())?;
        let names = NameResolver::new(Arc::new(table), &config.html_dir, &config.other_dir);
        let loader = html_loader();
        let fetcher = Fetcher::new(
            client,
            Arc::clone(&store),
            names,
            Arc::clone(&loader),
            config.fetch_settings(),
        );
        Ok(Self {
            config,
            store,
            fetcher,
            loader,
            progress: None,
        })
    }

    /// Reports every completed fetch to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    #[must_use]
    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    /// Crawls from `seeds`, then localizes what was downloaded.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError`] when the store cannot be read or the scheduler
    /// stops answering. Individual page failures are counted, not returned.
    #[instrument(skip(self, seeds), fields(seeds = seeds.len()))]
    pub async fn run(&self, seeds: &[String]) -> Result<CrawlSummary, CrawlError> {
        let summary = Arc::new(Mutex::new(CrawlSummary::default()));
        let (sink, results) = mpsc::unbounded_channel();
        let collector = self.collect(results, Arc::clone(&summary));

        let service: Arc<dyn FetchService> = Arc::new(self.fetcher.clone());
        let scheduler = Scheduler::start(self.config.scheduler_config(), service, Some(sink));
        let handle = scheduler.handle();

        let fetched = self.fetch_phase(&handle, seeds, &summary).await;
        let stats = handle.stats().await;
        scheduler.shutdown().await;
        if let Err(error) = collector.await {
            warn!(%error, "result collector ended abnormally");
        }
        fetched?;
        let stats = stats?;

        let mut summary = summary.lock().unwrap_or_else(PoisonError::into_inner).clone();
        summary.submitted = stats.submitted;
        summary.restarts = stats.restarts;
        summary.stops = stats.stops;
        summary.escalated = stats.escalated;

        if self.config.localise && !summary.escalated {
            self.localise_phase(&mut summary).await?;
        }
        info!(
            fetched = summary.fetched,
            failed = summary.failed,
            localised = summary.localised,
            "crawl finished"
        );
        Ok(summary)
    }

    fn collect(
        &self,
        mut results: mpsc::UnboundedReceiver<FetchResult>,
        summary: Arc<Mutex<CrawlSummary>>,
    ) -> JoinHandle<()> {
        let progress = self.progress.clone();
        tokio::spawn(async move {
            while let Some(result) = results.recv().await {
                summary
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(&result);
                if let Some(progress) = &progress {
                    progress(&result);
                }
            }
        })
    }

    async fn fetch_phase(
        &self,
        handle: &SchedulerHandle,
        seeds: &[String],
        summary: &Mutex<CrawlSummary>,
    ) -> Result<(), CrawlError> {
        for seed in seeds {
            let request = match FetchRequest::new(seed) {
                Ok(request) => request,
                Err(error) => {
                    warn!(%error, "rejected seed");
                    summary
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .rejected_seeds += 1;
                    continue;
                }
            };
            let new_page = NewPage::unfetched(request.url(), LocaliseState::ToLocalise);
            let (page, created) = self.store.find_or_create_page(&new_page).await?;
            debug!(url = %page.url, created, "seed");
            handle.enqueue(request.with_draft(page.draft_filespec))?;
        }
        let stats = handle.idle().await?;
        debug!(submitted = stats.submitted, "seeds drained");

        if self.config.resume && !stats.escalated {
            let mut seen = HashSet::new();
            loop {
                let batch = self.unseen(&mut seen, Pending::Download).await?;
                if batch.is_empty() {
                    break;
                }
                info!(pages = batch.len(), "resuming undownloaded pages");
                for page in batch {
                    let Ok(request) = FetchRequest::new(&page.url) else {
                        continue;
                    };
                    handle.enqueue(request.with_draft(page.draft_filespec))?;
                }
                if handle.idle().await?.escalated {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn localise_phase(&self, summary: &mut CrawlSummary) -> Result<(), CrawlError> {
        let localizer = Localizer::new(
            Arc::clone(&self.store),
            Arc::clone(&self.loader),
            self.config.localise_settings(),
        )
        .with_fetcher(self.fetcher.clone());

        let mut seen = HashSet::new();
        loop {
            let batch = self.unseen(&mut seen, Pending::Localise).await?;
            if batch.is_empty() {
                return Ok(());
            }
            for page in batch {
                let url = page.url.clone();
                match localizer.localise(page).await {
                    Ok(LocaliseOutcome::Localised { .. }) => summary.localised += 1,
                    Ok(LocaliseOutcome::Unchanged) => summary.localise_unchanged += 1,
                    Ok(outcome) => debug!(%url, ?outcome, "not localised"),
                    Err(error) => {
                        warn!(%url, %error, "localisation failed");
                        summary.localise_failed += 1;
                    }
                }
            }
        }
    }

    /// Next store batch with pages not handled earlier in this run.
    ///
    /// Store batches are at-least-once, so a page that could not be moved out
    /// of its selecting state would otherwise come back forever.
    async fn unseen(
        &self,
        seen: &mut HashSet<PageId>,
        pending: Pending,
    ) -> Result<Vec<PageRecord>, CrawlError> {
        let window = seen.len() + self.config.batch_size;
        let pages = match pending {
            Pending::Download => self.store.pages_to_download(window).await?,
            Pending::Localise => self.store.pages_to_localise(window).await?,
        };
        Ok(pages
            .into_iter()
            .filter(|page| seen.insert(page.id))
            .take(self.config.batch_size)
            .collect())
    }
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    Download,
    Localise,
}

/// Creates `dir` and proves a file can be written in it.
async fn create_writable_dir(dir: &Path) -> Result<(), CrawlError> {
    let fail = |source| CrawlError::OutputDir {
        path: dir.to_path_buf(),
        source,
    };
    tokio::fs::create_dir_all(dir).await.map_err(fail)?;
    let write_check = dir.join(format!(".webmirror-write-check-{}", std::process::id()));
    tokio::fs::write(&write_check, b"").await.map_err(fail)?;
    tokio::fs::remove_file(&write_check).await.map_err(fail)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fetch::FetchCause;
    use crate::store::MemoryStore;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    fn config(root: &Path) -> CrawlConfig {
        CrawlConfig {
            http_timeout: std::time::Duration::from_secs(5),
            retry: crate::config::RetrySettings {
                max_attempts: 1,
                ..crate::config::RetrySettings::default()
            },
            ..CrawlConfig::rooted_at(root)
        }
    }

    async fn sqlite_store() -> Arc<dyn PageStore> {
        let db = Database::new_in_memory().await.unwrap();
        Arc::new(SqliteStore::new(db))
    }

    fn html(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body, "text/html; charset=utf-8")
    }

    #[test]
    fn test_summary_records_outcomes() {
        let request = FetchRequest::new("http://a.test/x").unwrap();
        let mut summary = CrawlSummary::default();

        let mut ok = FetchResult::succeeded(request.clone(), PathBuf::from("/m/x.html"));
        ok.extension = Some("html".into());
        ok.redirected_to = Some("http://a.test/y".into());
        ok.redirect_hops = vec!["http://a.test/z".into(), "http://a.test/y".into()];
        summary.record(&ok);
        summary.record(&FetchResult::failed(
            request.clone(),
            FetchCause::Oversize { limit: 10 },
        ));
        summary.record(&FetchResult::failed(
            request,
            FetchCause::Transport("reset".into()),
        ));

        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.ignored, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.redirected, 1);
        assert_eq!(summary.multi_hop_redirects, 1);
        assert_eq!(summary.per_extension.get("html"), Some(&1));
    }

    #[tokio::test]
    async fn test_unwritable_output_dir_is_fatal() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();
        let config = CrawlConfig {
            html_dir: blocker.join("html"),
            ..config(dir.path())
        };
        let store: Arc<dyn PageStore> = Arc::new(MemoryStore::new(Vec::new()));

        let result = Crawler::with_store(config, store).await;

        assert!(matches!(result, Err(CrawlError::OutputDir { .. })));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = CrawlConfig {
            batch_size: 0,
            ..config(dir.path())
        };
        let store: Arc<dyn PageStore> = Arc::new(MemoryStore::new(Vec::new()));

        assert!(matches!(
            Crawler::with_store(config, store).await,
            Err(CrawlError::Config(ConfigError::Zero { field: "batch_size" }))
        ));
    }

    #[tokio::test]
    async fn test_crawl_mirrors_and_localises_site() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/index"))
            .respond_with(html(
                r#"<html><body><a href="/about">About</a> <a href="/report">Report</a></body></html>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/about"))
            .respond_with(html("<html><body>about us</body></html>"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/report"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/pdf")
                    .set_body_bytes(b"%PDF-1.4".to_vec()),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let crawler = Crawler::with_store(config(dir.path()), sqlite_store().await)
            .await
            .unwrap();
        let seed = format!("{}/index", server.uri());

        let summary = crawler.run(&[seed, "not a url".into()]).await.unwrap();

        assert_eq!(summary.rejected_seeds, 1);
        assert_eq!(summary.fetched, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.per_extension.get("html"), Some(&2));
        assert_eq!(summary.per_extension.get("pdf"), Some(&1));
        assert_eq!(summary.localised, 1);
        assert_eq!(summary.localise_unchanged, 1);

        let index = std::fs::read_to_string(dir.path().join("html/index.html")).unwrap();
        assert!(index.contains(r#"href="about.html""#), "{index}");
        assert!(index.contains(r#"href="../files/report.pdf""#), "{index}");
        assert!(dir.path().join("files/report.pdf").is_file());
    }

    #[tokio::test]
    async fn test_resume_drains_pages_from_earlier_runs() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/left-over"))
            .respond_with(html("<p>later</p>"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let store = sqlite_store().await;
        let url = format!("{}/left-over", server.uri());
        store
            .create_page(&NewPage::unfetched(&url, LocaliseState::Ignore))
            .await
            .unwrap();
        let crawler = Crawler::with_store(
            CrawlConfig {
                resume: true,
                localise: false,
                ..config(dir.path())
            },
            store,
        )
        .await
        .unwrap();

        let summary = crawler.run(&[]).await.unwrap();

        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.localised, 0);
        let page = crawler.store().find_page_by_url(&url).await.unwrap().unwrap();
        assert!(page.has_local_file());
    }
}
