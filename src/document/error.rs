//! Error types for document loading and rewriting.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading, rewriting, or saving a document.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The document file could not be read.
    #[error("failed to read document {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document file could not be written.
    #[error("failed to write document {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The page URL cannot serve as a base for relative links.
    #[error("invalid document URL: {url}")]
    InvalidBaseUrl { url: String },

    /// The HTML rewriter rejected the document.
    #[error("failed to rewrite {url}: {message}")]
    Rewrite { url: String, message: String },
}

impl ParseError {
    pub fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }

    pub fn rewrite(url: impl Into<String>, message: impl ToString) -> Self {
        Self::Rewrite {
            url: url.into(),
            message: message.to_string(),
        }
    }
}
