//! In-process [`PageStore`] holding the graph as an arena plus adjacency sets.
//!
//! Page ids index the arena. `consume_from` is the primary edge set and
//! `supply_to` is the inverse index, maintained on every edge change.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{
    ChangeSet, DownloadState, LocaliseState, NewPage, PageId, PageRecord, PageStore, Result,
    StoreDbErrorKind, StoreError,
};
use crate::content_type::ContentTypeEntry;
use crate::urls::{LinkMap, UrlKey};

#[derive(Debug, Default)]
struct Graph {
    pages: Vec<PageRecord>,
    by_url: HashMap<UrlKey, PageId>,
    consume_from: BTreeMap<PageId, BTreeSet<PageId>>,
    supply_to: BTreeMap<PageId, BTreeSet<PageId>>,
}

impl Graph {
    fn get(&self, id: PageId) -> Option<&PageRecord> {
        usize::try_from(id - 1).ok().and_then(|index| self.pages.get(index))
    }

    fn get_mut(&mut self, id: PageId) -> Option<&mut PageRecord> {
        usize::try_from(id - 1)
            .ok()
            .and_then(|index| self.pages.get_mut(index))
    }

    fn insert(&mut self, page: &NewPage) -> Result<PageRecord> {
        let key = UrlKey::new(&page.url);
        if self.by_url.contains_key(&key) {
            return Err(StoreError::Database {
                kind: StoreDbErrorKind::ConstraintViolation,
                message: format!("page already exists: {}", page.url),
            });
        }
        let id = PageId::try_from(self.pages.len() + 1).unwrap_or(PageId::MAX);
        let record = PageRecord {
            id,
            url: page.url.clone(),
            draft_filespec: page.draft_filespec.clone(),
            filespec: page.filespec.clone(),
            download_state: page.download_state,
            localise_state: page.localise_state,
            redirect_id: None,
        };
        self.by_url.insert(key, id);
        self.pages.push(record.clone());
        Ok(record)
    }

    fn add_edge(&mut self, consumer: PageId, supplier: PageId) -> bool {
        let added = self.consume_from.entry(consumer).or_default().insert(supplier);
        self.supply_to.entry(supplier).or_default().insert(consumer);
        added
    }

    fn remove_edge(&mut self, consumer: PageId, supplier: PageId) {
        if let Some(set) = self.consume_from.get_mut(&consumer) {
            set.remove(&supplier);
        }
        if let Some(set) = self.supply_to.get_mut(&supplier) {
            set.remove(&consumer);
        }
    }

    fn collect(&self, ids: Option<&BTreeSet<PageId>>) -> Vec<PageRecord> {
        ids.into_iter()
            .flatten()
            .filter_map(|&id| self.get(id).cloned())
            .collect()
    }
}

/// Page store kept entirely in memory.
#[derive(Debug)]
pub struct MemoryStore {
    graph: Mutex<Graph>,
    content_types: Vec<ContentTypeEntry>,
}

impl MemoryStore {
    /// Creates an empty store serving the given content type rows.
    #[must_use]
    pub fn new(content_types: Vec<ContentTypeEntry>) -> Self {
        Self {
            graph: Mutex::new(Graph::default()),
            content_types,
        }
    }

    fn graph(&self) -> MutexGuard<'_, Graph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PageStore for MemoryStore {
    async fn pages_to_download(&self, max_count: usize) -> Result<Vec<PageRecord>> {
        Ok(self
            .graph()
            .pages
            .iter()
            .filter(|page| {
                page.download_state == DownloadState::Unknown && page.filespec.is_none()
            })
            .take(max_count)
            .cloned()
            .collect())
    }

    async fn pages_to_localise(&self, max_count: usize) -> Result<Vec<PageRecord>> {
        Ok(self
            .graph()
            .pages
            .iter()
            .filter(|page| {
                page.localise_state == LocaliseState::ToLocalise
                    && page.download_state == DownloadState::Downloaded
            })
            .take(max_count)
            .cloned()
            .collect())
    }

    async fn add_or_merge_links(&self, page: &PageRecord, links: &LinkMap) -> Result<usize> {
        let mut graph = self.graph();
        let localise_state = page.localise_state.inherited();
        let mut added = 0;
        for (url, suggested) in links.iter() {
            let key = UrlKey::new(url);
            if key == page.url_key() {
                continue;
            }
            let draft = Some(suggested.trim())
                .filter(|name| !name.is_empty())
                .map(str::to_string);
            let supplier = match graph.by_url.get(&key).copied() {
                Some(id) => {
                    if let Some(existing) = graph.get_mut(id)
                        && existing.draft_filespec.is_none()
                    {
                        existing.draft_filespec = draft;
                    }
                    id
                }
                None => {
                    graph
                        .insert(&NewPage::unfetched(url, localise_state).with_draft(draft))?
                        .id
                }
            };
            if graph.add_edge(page.id, supplier) {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn find_page_by_url(&self, url: &str) -> Result<Option<PageRecord>> {
        let graph = self.graph();
        Ok(graph
            .by_url
            .get(&UrlKey::new(url))
            .and_then(|&id| graph.get(id).cloned()))
    }

    async fn find_page(&self, id: PageId) -> Result<Option<PageRecord>> {
        Ok(self.graph().get(id).cloned())
    }

    async fn create_page(&self, page: &NewPage) -> Result<PageRecord> {
        self.graph().insert(page)
    }

    async fn commit_changes(&self, changes: &ChangeSet) -> Result<u64> {
        let mut graph = self.graph();
        for page in changes.pages() {
            if graph.get(page.id).is_none() {
                return Err(StoreError::PageNotFound(page.id));
            }
        }

        let mut rows = 0;
        for page in changes.pages() {
            if let Some(slot) = graph.get_mut(page.id) {
                *slot = page.clone();
                rows += 1;
            }
        }
        for &(consumer, supplier) in changes.links() {
            if graph.add_edge(consumer, supplier) {
                rows += 1;
            }
        }
        for repoint in changes.repoints() {
            let consumers: Vec<PageId> = graph
                .supply_to
                .get(&repoint.from)
                .into_iter()
                .flatten()
                .copied()
                .filter(|&consumer| consumer != repoint.from && consumer != repoint.to)
                .collect();
            for consumer in consumers {
                graph.remove_edge(consumer, repoint.from);
                if graph.add_edge(consumer, repoint.to) {
                    rows += 1;
                }
            }
        }
        Ok(rows)
    }

    async fn load_content_type_mappings(&self) -> Result<Vec<ContentTypeEntry>> {
        Ok(self.content_types.clone())
    }

    async fn dependencies(&self, id: PageId) -> Result<Vec<PageRecord>> {
        let graph = self.graph();
        Ok(graph.collect(graph.consume_from.get(&id)))
    }

    async fn dependents(&self, id: PageId) -> Result<Vec<PageRecord>> {
        let graph = self.graph();
        Ok(graph.collect(graph.supply_to.get(&id)))
    }
}
