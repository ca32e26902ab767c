//! Errors raised while localizing a page.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::document::ParseError;
use crate::fetch::FetchError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum LocaliseError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The blocking rewrite task did not finish.
    #[error("rewrite task failed: {0}")]
    Task(String),
}

impl LocaliseError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
