//! Document capability consumed by the fetcher and the localizer.
//!
//! A [`DocumentLoader`] opens a downloaded file as a [`Document`] that can
//! list its outbound links and substitute them. Everything here is
//! synchronous; async callers run it under `spawn_blocking`.

mod error;
mod html;

use std::path::Path;
use std::sync::Arc;

pub use error::ParseError;
pub use html::{HtmlDocument, HtmlLoader};

use crate::urls::LinkMap;

/// A loaded document.
pub trait Document: Send {
    /// URL the document was fetched from.
    fn url(&self) -> &str;

    /// Document title, if it declares one.
    fn title(&self) -> Option<String>;

    /// Absolute outbound URLs mapped to a suggested file name.
    fn extract_links(&self) -> LinkMap;

    /// Replaces every link found in `links` with its mapped value.
    ///
    /// Returns whether anything changed.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Rewrite`] when the document cannot be processed.
    fn rewrite_links(&mut self, links: &LinkMap) -> Result<bool, ParseError>;

    /// Writes the document's current content to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Write`] on I/O failure.
    fn save(&self, path: &Path) -> Result<(), ParseError>;
}

/// Opens downloaded files as documents.
pub trait DocumentLoader: Send + Sync {
    /// Loads the file at `path` fetched from `url`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] when the file cannot be read or the URL is unusable.
    fn load(&self, url: &str, path: &Path) -> Result<Box<dyn Document>, ParseError>;
}

/// Shared loader handle.
pub type SharedLoader = Arc<dyn DocumentLoader>;

/// Loader for HTML pages.
#[must_use]
pub fn html_loader() -> SharedLoader {
    Arc::new(HtmlLoader)
}
