//! HTTP layer: requests with manual redirects, retries, and body streaming,
//! plus the naming rules for files written to the mirror.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use webmirror_core::download::HttpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new()?;
//! let response = client.get("https://example.com/paper.pdf").await?;
//! let bytes = response
//!     .stream_to_file(Path::new("./paper.pdf"), false, Some(10_000_000), 0)
//!     .await?;
//! println!("wrote {bytes} bytes");
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod error;
pub mod filename;
mod retry;

pub use client::{FetchResponse, HttpClient, open_target};
pub use error::DownloadError;
pub use filename::{
    ContentDisposition, NameHints, NameResolver, ResolveError, ResolvedName, unique_backup_path,
};
pub use retry::{
    DEFAULT_MAX_RETRIES, DEFAULT_RETRYABLE_STATUSES, FailureKind, RetryPolicy, classify_error,
    parse_retry_after,
};
