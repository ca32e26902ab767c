//! Webmirror Core Library
//!
//! Crawls web sites into a local mirror: pages and assets are fetched into
//! an HTML directory and a files directory, the link graph is kept in
//! SQLite, and downloaded HTML is rewritten so its links point at the local
//! copies.
//!
//! # Architecture
//!
//! - [`urls`] - URL normalization, keys and link maps
//! - [`store`] - page and link graph persistence behind [`PageStore`]
//! - [`download`] - HTTP client, retry policy and file naming
//! - [`document`] - HTML link extraction and rewriting
//! - [`fetch`] - one fetch end to end: redirects, dedup, store updates
//! - [`scheduler`] - per-host worker actors under a supervising coordinator
//! - [`localize`] - relinking downloaded pages to local files
//! - [`crawl`] - the run driver tying the phases together

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod content_type;
pub mod crawl;
pub mod db;
pub mod document;
pub mod download;
pub mod fetch;
pub mod localize;
pub mod scheduler;
pub mod store;
pub mod urls;
mod user_agent;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::{ConfigError, CrawlConfig, RetrySettings, SupervisionSettings};
pub use content_type::{ContentTypeEntry, ContentTypeTable};
pub use crawl::{CrawlError, CrawlSummary, Crawler, ProgressFn};
pub use db::Database;
pub use document::{Document, DocumentLoader, ParseError, html_loader};
pub use download::{DownloadError, HttpClient, NameResolver, RetryPolicy};
pub use fetch::{
    Disposition, FetchCause, FetchError, FetchRequest, FetchResult, FetchService, FetchSettings,
    FetchTarget, Fetcher,
};
pub use localize::{LocaliseError, LocaliseOutcome, LocaliseSettings, Localizer};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerError, SchedulerHandle, SchedulerStats};
pub use store::{
    DownloadState, LocaliseState, MemoryStore, NewPage, PageId, PageRecord, PageStore,
    SqliteStore, StoreError,
};
pub use urls::{InvalidUrl, LinkMap, UrlKey, normalize_url};
