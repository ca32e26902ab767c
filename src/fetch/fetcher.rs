//! One fetch, from request to committed page state.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::File;
use tracing::{debug, info, instrument, warn};

use super::dedup;
use super::{FetchCause, FetchError, FetchRequest, FetchResult, FetchService, FetchTarget};
use crate::content_type::{PAGE_EXTENSION, normalize_extension};
use crate::document::SharedLoader;
use crate::download::{
    ContentDisposition, DownloadError, FetchResponse, HttpClient, NameHints, NameResolver,
    ResolveError, ResolvedName, open_target,
};
use crate::fetch::Disposition;
use crate::store::{ChangeSet, DownloadState, LocaliseState, NewPage, PageRecord, PageStore};
use crate::urls::{self, LinkMap, UrlKey};

/// Exclusive creates tried before a name search gives up.
const MAX_CLAIM_ATTEMPTS: usize = 8;

/// Limits and locations the fetcher works with.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Largest body accepted, in bytes.
    pub max_file_size: u64,
    /// Bytes between progress log lines; zero disables them.
    pub progress_step: u64,
    /// Where replaced files are moved.
    pub backup_dir: PathBuf,
}

/// Fetches pages and records the outcome in the store.
#[derive(Clone)]
pub struct Fetcher {
    pub(super) client: HttpClient,
    pub(super) store: Arc<dyn PageStore>,
    pub(super) names: NameResolver,
    pub(super) loader: SharedLoader,
    pub(super) settings: FetchSettings,
}

/// Where the body ended up after dedup.
pub(super) struct Written {
    pub(super) path: PathBuf,
    pub(super) deduplicated: bool,
}

impl Fetcher {
    #[must_use]
    pub fn new(
        client: HttpClient,
        store: Arc<dyn PageStore>,
        names: NameResolver,
        loader: SharedLoader,
        settings: FetchSettings,
    ) -> Self {
        Self {
            client,
            store,
            names,
            loader,
            settings,
        }
    }

    #[must_use]
    pub fn names(&self) -> &NameResolver {
        &self.names
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    /// Fetches the page for `request`, creating its record when needed.
    ///
    /// # Errors
    ///
    /// See [`Fetcher::fetch_page`].
    pub async fn fetch_request(&self, request: &FetchRequest) -> Result<FetchResult, FetchError> {
        let new_page = NewPage::unfetched(request.url(), LocaliseState::ToLocalise)
            .with_draft(request.draft().map(str::to_string));
        let (page, _) = self.store.find_or_create_page(&new_page).await?;
        self.fetch_page(page, request).await
    }

    /// Fetches `page` and persists what the response means for it.
    ///
    /// HTTP failures, oversize content and unknown content types come back as
    /// a failed [`FetchResult`].
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] for filesystem faults and store reads that fail.
    #[instrument(skip(self, page, request), fields(url = %request.url(), page_id = page.id))]
    pub async fn fetch_page(
        &self,
        mut page: PageRecord,
        request: &FetchRequest,
    ) -> Result<FetchResult, FetchError> {
        if request.disposition() == Disposition::LeaveIfExists
            && page.has_local_file()
            && let Some(existing) = page.file_path()
        {
            debug!(path = %existing.display(), "already downloaded, leaving as is");
            let mut result = FetchResult::succeeded(request.clone(), existing.to_path_buf());
            result.skipped = true;
            result.extension = extension_of(existing);
            return Ok(result);
        }

        let intended: Option<PathBuf> = page
            .has_local_file()
            .then(|| page.file_path().map(Path::to_path_buf))
            .flatten()
            .or_else(|| request.target_file().map(Path::to_path_buf));
        let own_previous = page.has_local_file().then(|| page.filespec.clone()).flatten();

        let response = match self.client.get(request.url()).await {
            Ok(response) => response,
            Err(DownloadError::Io { path, source }) => return Err(FetchError::io(path, source)),
            Err(error) => {
                debug!(%error, "no usable response");
                return Ok(FetchResult::failed(
                    request.clone(),
                    FetchCause::Transport(error.to_string()),
                ));
            }
        };

        let hops = response.hops().to_vec();
        if hops.len() > 1 {
            warn!(hops = ?hops, "multiple redirects in one fetch, acting on the final hop only");
        }
        let status = response.status().as_u16();

        if !response.status().is_success() {
            let reason = response.reason();
            page.mark_http_failure(status, reason);
            let mut changes = ChangeSet::new();
            changes.update(&page);
            self.persist(&changes).await;
            info!(status, "fetch failed");
            return Ok(FetchResult::failed(
                request.clone(),
                FetchCause::Http {
                    status,
                    reason: reason.to_string(),
                },
            )
            .with_status(status));
        }

        let landing = landing_url(&response, &page);

        if let Some(declared) = response.content_length()
            && declared > self.settings.max_file_size
        {
            debug!(declared, limit = self.settings.max_file_size, "content too large");
            return Ok(self.ignore(page, request, oversize(self.settings.max_file_size), status).await);
        }

        let disposition = response
            .content_disposition()
            .map(|header| ContentDisposition::parse(&header))
            .unwrap_or_default();
        let content_type = response.content_type();
        let name_url = landing.as_deref().unwrap_or(&page.url).to_string();
        let hints = NameHints {
            url: &name_url,
            content_type: content_type.as_deref(),
            disposition: disposition.filename.as_deref(),
            draft: page.draft_filespec.as_deref().or(request.draft()),
        };
        let name = match self.names.resolve_name(&hints) {
            Ok(name) => name,
            Err(ResolveError::UnknownExtension { content_type, .. }) => {
                warn!(?content_type, "unknown extension, ignoring page");
                let cause = FetchCause::UnknownExtension { content_type };
                return Ok(self.ignore(page, request, cause, status).await);
            }
            Err(error) => return Err(error.into()),
        };

        let origin_time = disposition.modified.or_else(|| response.last_modified());
        let (write_path, file) = self.claim_target(&name, intended.as_deref(), request).await?;

        match response
            .stream_into(
                file,
                &write_path,
                Some(self.settings.max_file_size),
                self.settings.progress_step,
            )
            .await
        {
            Ok(_) => {}
            Err(DownloadError::TooLarge { limit, .. }) => {
                return Ok(self.ignore(page, request, oversize(limit), status).await);
            }
            Err(DownloadError::Io { path, source }) => return Err(FetchError::io(path, source)),
            Err(error) => {
                debug!(%error, "transfer broke off");
                return Ok(FetchResult::failed(
                    request.clone(),
                    FetchCause::Transport(error.to_string()),
                )
                .with_status(status));
            }
        }

        let mut written = self
            .settle_against_intended(write_path, intended.as_deref(), own_previous.as_deref(), request)
            .await?;

        let mut changes = ChangeSet::new();
        let owner = match landing.as_deref() {
            Some(landing_url) => {
                let owner = self
                    .resolve_redirect(&mut page, landing_url, &name, &mut written, &mut changes)
                    .await?;
                changes.update(&page);
                owner
            }
            None => {
                page.filespec = Some(written.path.to_string_lossy().into_owned());
                page.download_state = DownloadState::Downloaded;
                page.localise_state = localise_state_for(&name, page.localise_state);
                page.redirect_id = None;
                changes.update(&page);
                page.clone()
            }
        };

        if !written.deduplicated {
            dedup::apply_origin_time(&written.path, origin_time).await;
        }
        self.persist(&changes).await;

        let links = if name.is_page() {
            self.extract_and_merge(&owner, &name_url, &written.path).await
        } else {
            LinkMap::new()
        };

        info!(path = %written.path.display(), deduplicated = written.deduplicated, "fetch complete");
        let mut result = FetchResult::succeeded(request.clone(), written.path).with_status(status);
        result.extension = Some(name.extension);
        result.redirected_to = landing;
        result.redirect_hops = if hops.len() > 1 { hops } else { Vec::new() };
        result.deduplicated = written.deduplicated;
        result.links = links;
        Ok(result)
    }

    /// Opens the file the body is streamed into.
    ///
    /// `OverwriteAlways` reuses the intended path when its extension still
    /// fits. Otherwise a free name is claimed with an exclusive create, so two
    /// fetches resolving the same name never share a file.
    async fn claim_target(
        &self,
        name: &ResolvedName,
        intended: Option<&Path>,
        request: &FetchRequest,
    ) -> Result<(PathBuf, File), FetchError> {
        let dir = self.names.dir_for(&name.extension);
        if request.disposition() == Disposition::OverwriteAlways {
            let path = intended
                .filter(|path| extension_of(path).as_deref() == Some(name.extension.as_str()))
                .map_or_else(|| dir.join(name.file_name()), Path::to_path_buf);
            create_parent(&path).await?;
            let file = open_target(&path, true)
                .await
                .map_err(|e| FetchError::io(&path, e))?;
            return Ok((path, file));
        }

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| FetchError::io(dir, e))?;
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let path = self.names.free_path(name)?;
            match open_target(&path, false).await {
                Ok(file) => return Ok((path, file)),
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(path = %path.display(), "name claimed by another fetch, picking again");
                }
                Err(error) => return Err(FetchError::io(&path, error)),
            }
        }
        Err(ResolveError::NoFreeName {
            dir: dir.to_path_buf(),
            attempts: MAX_CLAIM_ATTEMPTS,
        }
        .into())
    }

    /// Compares the new file with the intended one and keeps the older copy when identical.
    async fn settle_against_intended(
        &self,
        written: PathBuf,
        intended: Option<&Path>,
        own_previous: Option<&str>,
        request: &FetchRequest,
    ) -> Result<Written, FetchError> {
        if request.disposition() == Disposition::Revector
            && let Some(previous) = own_previous
                .map(Path::new)
                .filter(|previous| *previous != written && previous.is_file())
        {
            dedup::retire_to_backup(previous, &self.settings.backup_dir)
                .await
                .map_err(|e| FetchError::io(previous, e))?;
            debug!(retired = %previous.display(), "previous file moved to backup");
        }

        let compare = matches!(
            request.disposition(),
            Disposition::RevectorAndCompare | Disposition::LeaveIfExists
        );
        let Some(intended) = intended.filter(|path| compare && *path != written && path.is_file())
        else {
            return Ok(Written {
                path: written,
                deduplicated: false,
            });
        };

        let identical = dedup::same_content(intended, &written)
            .await
            .map_err(|e| FetchError::io(intended, e))?;
        if identical {
            tokio::fs::remove_file(&written)
                .await
                .map_err(|e| FetchError::io(&written, e))?;
            debug!(kept = %intended.display(), "identical content, kept existing file");
            return Ok(Written {
                path: intended.to_path_buf(),
                deduplicated: true,
            });
        }

        if own_previous.is_some_and(|previous| Path::new(previous) == intended) {
            dedup::retire_to_backup(intended, &self.settings.backup_dir)
                .await
                .map_err(|e| FetchError::io(intended, e))?;
        }
        Ok(Written {
            path: written,
            deduplicated: false,
        })
    }

    /// Marks the page `Ignore` and returns the matching failure.
    async fn ignore(
        &self,
        mut page: PageRecord,
        request: &FetchRequest,
        cause: FetchCause,
        status: u16,
    ) -> FetchResult {
        page.download_state = DownloadState::Ignore;
        page.localise_state = LocaliseState::Ignore;
        let mut changes = ChangeSet::new();
        changes.update(&page);
        self.persist(&changes).await;
        FetchResult::failed(request.clone(), cause).with_status(status)
    }

    /// Commits, logging instead of failing.
    pub(super) async fn persist(&self, changes: &ChangeSet) {
        if changes.is_empty() {
            return;
        }
        match self.store.commit_changes(changes).await {
            Ok(rows) => debug!(rows, "committed fetch changes"),
            Err(error) => warn!(%error, "failed to persist fetch changes"),
        }
    }

    /// Extracts links from the saved page and merges them into the graph.
    async fn extract_and_merge(&self, owner: &PageRecord, base_url: &str, path: &Path) -> LinkMap {
        let loader = Arc::clone(&self.loader);
        let base_url = base_url.to_string();
        let path = path.to_path_buf();
        let extracted =
            tokio::task::spawn_blocking(move || loader.load(&base_url, &path).map(|d| d.extract_links()))
                .await;
        let links = match extracted {
            Ok(Ok(links)) => links,
            Ok(Err(error)) => {
                warn!(%error, "could not load page for link extraction");
                return LinkMap::new();
            }
            Err(error) => {
                warn!(%error, "link extraction task failed");
                return LinkMap::new();
            }
        };
        match self.store.add_or_merge_links(owner, &links).await {
            Ok(added) => debug!(links = links.len(), added, "merged links"),
            Err(error) => warn!(%error, "failed to merge links"),
        }
        links
    }
}

#[async_trait]
impl FetchService for Fetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResult, FetchError> {
        self.fetch_request(request).await
    }

    fn admission_target(&self, request: &FetchRequest) -> Result<PathBuf, FetchError> {
        let auto = || {
            self.names
                .default_target(request.url(), request.draft(), PAGE_EXTENSION)
        };
        let target = match request.target() {
            FetchTarget::File(path) => path.clone(),
            FetchTarget::Directory(dir) => {
                let auto = auto();
                auto.file_name().map_or(auto.clone(), |name| dir.join(name))
            }
            FetchTarget::Auto => auto(),
        };
        if let Some(dir) = target.parent() {
            std::fs::create_dir_all(dir).map_err(|e| FetchError::io(dir, e))?;
        }
        Ok(target)
    }
}

/// Landing URL when the fetch ended somewhere other than the page's URL.
fn landing_url(response: &FetchResponse, page: &PageRecord) -> Option<String> {
    let candidate = if response.hops().is_empty() {
        response.location()?
    } else {
        response.final_url().clone()
    };
    let landing = urls::normalize_url(candidate.as_str()).ok()?;
    (UrlKey::new(&landing) != page.url_key()).then_some(landing)
}

async fn create_parent(path: &Path) -> Result<(), FetchError> {
    match path.parent() {
        Some(dir) => tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| FetchError::io(dir, e)),
        None => Ok(()),
    }
}

fn oversize(limit: u64) -> FetchCause {
    FetchCause::Oversize { limit }
}

pub(super) fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| normalize_extension(&ext.to_string_lossy()))
}

/// Non-pages are never localised; pages keep an exclusion, otherwise need localising.
pub(super) fn localise_state_for(name: &ResolvedName, current: LocaliseState) -> LocaliseState {
    if !name.is_page() || current == LocaliseState::Ignore {
        LocaliseState::Ignore
    } else {
        LocaliseState::ToLocalise
    }
}
