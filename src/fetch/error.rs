//! Faults raised by the fetch path.
//!
//! HTTP failures, oversize bodies and unknown types are not errors; they come
//! back as a failed [`super::FetchResult`]. What remains here are faults the
//! scheduler's supervision classifies.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::download::{DownloadError, ResolveError};
use crate::store::StoreError;
use crate::urls::InvalidUrl;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    InvalidUrl(#[from] InvalidUrl),
}

impl FetchError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Kind of the underlying filesystem error, if this is one.
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Io { source, .. } | Self::Download(DownloadError::Io { source, .. }) => {
                Some(source.kind())
            }
            _ => None,
        }
    }

    /// The store reported busy or locked.
    #[must_use]
    pub fn is_store_busy(&self) -> bool {
        matches!(self, Self::Store(error) if error.is_busy_or_locked())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::store::StoreDbErrorKind;

    #[test]
    fn test_io_kind_sees_through_download_errors() {
        let error = FetchError::from(DownloadError::io(
            "/x",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        ));
        assert_eq!(error.io_kind(), Some(io::ErrorKind::PermissionDenied));
        assert_eq!(
            FetchError::io("/y", io::Error::other("full")).io_kind(),
            Some(io::ErrorKind::Other)
        );
    }

    #[test]
    fn test_store_busy_detection() {
        let busy = FetchError::Store(StoreError::Database {
            kind: StoreDbErrorKind::BusyOrLocked,
            message: "database is locked".into(),
        });
        assert!(busy.is_store_busy());
        assert!(!FetchError::Store(StoreError::PageNotFound(1)).is_store_busy());
    }
}
