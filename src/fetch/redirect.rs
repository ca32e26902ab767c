//! Moving fetched content onto the landing page of a redirect.

use std::path::Path;

use tracing::{debug, info};

use super::dedup;
use super::fetcher::{Fetcher, Written, localise_state_for};
use super::FetchError;
use crate::download::ResolvedName;
use crate::store::{ChangeSet, DownloadState, LocaliseState, NewPage, PageRecord};

impl Fetcher {
    /// Records `page` as redirected to `landing` and gives the content to the landing page.
    ///
    /// Returns the landing page as updated. `page` is modified in place; the
    /// caller adds it to `changes`.
    pub(super) async fn resolve_redirect(
        &self,
        page: &mut PageRecord,
        landing: &str,
        name: &ResolvedName,
        written: &mut Written,
        changes: &mut ChangeSet,
    ) -> Result<PageRecord, FetchError> {
        let localise_state = match page.localise_state {
            LocaliseState::Ignore => LocaliseState::ToLocalise,
            state => state.inherited(),
        };
        let new_page = NewPage::unfetched(landing, localise_state)
            .with_draft(page.draft_filespec.clone());
        let (mut target, created) = self.store.find_or_create_page(&new_page).await?;

        if !created {
            if target.draft_filespec.is_none() {
                target.draft_filespec.clone_from(&page.draft_filespec);
            }
            self.reconcile_filespec(&target, written).await?;
        }

        target.filespec = Some(written.path.to_string_lossy().into_owned());
        target.download_state = DownloadState::Downloaded;
        target.localise_state = localise_state_for(name, target.localise_state);
        target.redirect_id = None;

        page.download_state = DownloadState::Redirected;
        page.filespec = None;
        page.localise_state = LocaliseState::Ignore;
        page.redirect_id = Some(target.id);

        changes.update(&target);
        changes.link(page.id, target.id);
        changes.repoint_inbound(page.id, target.id);

        info!(from = %page.url, to = %target.url, created, "redirect resolved");
        Ok(target)
    }

    /// Settles a landing page that already has a file of its own.
    ///
    /// Identical content keeps the landing page's file; otherwise that file is
    /// retired to backup and the new one wins.
    async fn reconcile_filespec(
        &self,
        target: &PageRecord,
        written: &mut Written,
    ) -> Result<(), FetchError> {
        let Some(existing) = target
            .has_local_file()
            .then(|| target.file_path())
            .flatten()
            .filter(|existing| *existing != written.path)
        else {
            return Ok(());
        };

        if dedup::same_content(existing, &written.path)
            .await
            .map_err(|e| FetchError::io(existing, e))?
        {
            if !written.deduplicated {
                tokio::fs::remove_file(&written.path)
                    .await
                    .map_err(|e| FetchError::io(&written.path, e))?;
            }
            debug!(kept = %existing.display(), "landing page already holds this content");
            written.path = existing.to_path_buf();
            written.deduplicated = true;
            return Ok(());
        }

        retire(existing, &self.settings.backup_dir).await
    }
}

async fn retire(existing: &Path, backup_dir: &Path) -> Result<(), FetchError> {
    dedup::retire_to_backup(existing, backup_dir)
        .await
        .map(|_| ())
        .map_err(|e| FetchError::io(existing, e))
}
