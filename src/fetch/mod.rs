//! Fetch resolution: one HTTP GET turned into a deduplicated file and an
//! updated page graph.
//!
//! The [`Fetcher`] streams the body to a target chosen before the write,
//! compares it against the file the page was expected to have, follows one
//! level of redirect by moving the content to the landing page, and hands
//! HTML files to link extraction. Everything it changes for one fetch goes
//! into a single [`crate::store::ChangeSet`].

mod dedup;
mod error;
mod fetcher;
mod redirect;
mod request;

use std::path::PathBuf;

use async_trait::async_trait;

pub use dedup::{file_digest, retire_to_backup, same_content};
pub use error::FetchError;
pub use fetcher::{FetchSettings, Fetcher};
pub use request::{Disposition, FetchCause, FetchRequest, FetchResult, FetchTarget};

/// What the scheduler's workers call to perform a fetch.
#[async_trait]
pub trait FetchService: Send + Sync {
    /// Performs the fetch for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] for faults the caller's supervision should classify.
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResult, FetchError>;

    /// File a request is expected to produce, decided at admission.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] when the target's directory cannot be prepared.
    fn admission_target(&self, request: &FetchRequest) -> Result<PathBuf, FetchError>;
}
