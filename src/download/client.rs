//! HTTP client wrapper for crawl requests.
//!
//! [`HttpClient`] issues GETs with a fixed timeout, follows redirects itself
//! so every hop is visible, and retries recoverable failures through its
//! [`RetryPolicy`]. The returned [`FetchResponse`] has only its headers read;
//! the body is streamed to disk on demand.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED, LOCATION, RETRY_AFTER};
use reqwest::{Client, StatusCode, redirect};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, DEFAULT_HTTP_TIMEOUT_SECS, MAX_REDIRECT_HOPS};
use super::error::DownloadError;
use super::retry::{RetryPolicy, classify_error, parse_retry_after};
use crate::user_agent;

/// HTTP client for crawl requests.
///
/// Created once and shared by every worker, taking advantage of connection
/// pooling.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    retry: RetryPolicy,
    max_redirects: usize,
}

/// A response whose headers have arrived and whose body has not been read.
#[derive(Debug)]
pub struct FetchResponse {
    requested_url: String,
    final_url: Url,
    hops: Vec<String>,
    response: reqwest::Response,
}

impl HttpClient {
    /// Creates a client with the default 15 second timeout and retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ClientBuild`] if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_policy(
            Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            RetryPolicy::default(),
        )
    }

    /// Creates a client with an explicit request timeout and retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ClientBuild`] if the TLS backend cannot be initialised.
    pub fn with_policy(timeout: Duration, retry: RetryPolicy) -> Result<Self, DownloadError> {
        let connect_timeout = Duration::from_secs(CONNECT_TIMEOUT_SECS).min(timeout);
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .gzip(true)
            .redirect(redirect::Policy::none())
            .user_agent(user_agent::default_crawl_user_agent())
            .build()
            .map_err(DownloadError::ClientBuild)?;
        Ok(Self {
            client,
            retry,
            max_redirects: MAX_REDIRECT_HOPS,
        })
    }

    /// Overrides the redirect hop limit.
    #[must_use]
    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Issues a GET for `url`, retrying recoverable failures.
    ///
    /// Returns the final response even when its status is an error; the
    /// caller decides what a failed status means for the page.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] when no response could be obtained after
    /// retries: invalid URL, network failure, timeout, or redirect loop.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn get(&self, url: &str) -> Result<FetchResponse, DownloadError> {
        let mut attempt = 1;
        loop {
            let outcome = self.get_following_redirects(url).await;
            let verdict = match &outcome {
                Ok(response) if response.status().is_success() => None,
                Ok(response) => Some((
                    self.retry.classify_status(response.status().as_u16()),
                    response.retry_after(),
                )),
                Err(error) => Some((classify_error(error), None)),
            };
            let Some((failure, retry_after)) = verdict else {
                return outcome;
            };

            let Some(delay) = self.retry.delay_before_retry(failure, attempt, retry_after) else {
                debug!(attempt, ?failure, "returning final outcome");
                return outcome;
            };
            debug!(
                attempt,
                delay_ms = delay.as_millis(),
                ?failure,
                "retrying request"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn get_following_redirects(&self, url: &str) -> Result<FetchResponse, DownloadError> {
        let mut current = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        let mut hops: Vec<String> = Vec::new();

        loop {
            let response = self
                .client
                .get(current.clone())
                .send()
                .await
                .map_err(|e| DownloadError::network(current.as_str(), e))?;

            let status = response.status();
            let next = (status.is_redirection() && status != StatusCode::NOT_MODIFIED)
                .then(|| header_str(&response, LOCATION))
                .flatten()
                .and_then(|location| current.join(&location).ok());

            let Some(next) = next else {
                return Ok(FetchResponse {
                    requested_url: url.to_string(),
                    final_url: current,
                    hops,
                    response,
                });
            };

            if hops.len() >= self.max_redirects {
                return Err(DownloadError::too_many_redirects(url, hops.len() + 1));
            }
            debug!(from = %current, to = %next, status = status.as_u16(), "following redirect");
            hops.push(next.to_string());
            current = next;
        }
    }
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

impl FetchResponse {
    /// URL passed to [`HttpClient::get`].
    #[must_use]
    pub fn requested_url(&self) -> &str {
        &self.requested_url
    }

    /// URL the final response came from.
    #[must_use]
    pub fn final_url(&self) -> &Url {
        &self.final_url
    }

    /// Every redirect target followed, in order.
    #[must_use]
    pub fn hops(&self) -> &[String] {
        &self.hops
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// Canonical reason phrase for the status.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        self.status().canonical_reason().unwrap_or("Unknown")
    }

    /// Declared body length from the `Content-Length` header.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        header_str(&self.response, CONTENT_LENGTH).and_then(|value| value.parse().ok())
    }

    #[must_use]
    pub fn content_type(&self) -> Option<String> {
        header_str(&self.response, CONTENT_TYPE)
    }

    /// Raw `Content-Disposition` header.
    #[must_use]
    pub fn content_disposition(&self) -> Option<String> {
        header_str(&self.response, CONTENT_DISPOSITION)
    }

    /// `Last-Modified` as a timestamp.
    #[must_use]
    pub fn last_modified(&self) -> Option<SystemTime> {
        header_str(&self.response, LAST_MODIFIED)
            .and_then(|value| httpdate::parse_http_date(&value).ok())
    }

    /// `Location` of a non-redirect response, resolved against the final URL.
    #[must_use]
    pub fn location(&self) -> Option<Url> {
        header_str(&self.response, LOCATION).and_then(|value| self.final_url.join(&value).ok())
    }

    /// Delay requested by a `Retry-After` header.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        header_str(&self.response, RETRY_AFTER).and_then(|value| parse_retry_after(&value))
    }

    /// Streams the body into `path`, returning the bytes written.
    ///
    /// With `overwrite` unset the file must not exist yet. See
    /// [`FetchResponse::stream_into`] for limits and cleanup.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] when the file cannot be opened, otherwise
    /// as [`FetchResponse::stream_into`].
    pub async fn stream_to_file(
        self,
        path: &Path,
        overwrite: bool,
        limit: Option<u64>,
        progress_step: u64,
    ) -> Result<u64, DownloadError> {
        let file = open_target(path, overwrite)
            .await
            .map_err(|e| DownloadError::io(path, e))?;
        self.stream_into(file, path, limit, progress_step).await
    }

    /// Streams the body into `file`, already opened at `path`.
    ///
    /// When `limit` is set and the body grows past it, the write stops with
    /// [`DownloadError::TooLarge`]. The file at `path` is removed on any error,
    /// and also when this future is dropped before it completes.
    /// Progress is logged every `progress_step` bytes when non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] for file failures, [`DownloadError::Network`]
    /// or [`DownloadError::Timeout`] when the transfer breaks off.
    #[instrument(skip(self, file), fields(url = %self.final_url, path = %path.display()))]
    pub async fn stream_into(
        self,
        mut file: File,
        path: &Path,
        limit: Option<u64>,
        progress_step: u64,
    ) -> Result<u64, DownloadError> {
        let partial = PartialFile::new(path);
        let url = self.final_url.to_string();
        let result = stream_body(&mut file, self.response, &url, path, limit, progress_step).await;
        drop(file);
        let bytes = result?;
        partial.keep();
        info!(bytes, "body written");
        Ok(bytes)
    }
}

/// Opens `path` for writing a body.
///
/// Without `overwrite` the path is claimed atomically: an existing file
/// fails with [`std::io::ErrorKind::AlreadyExists`].
///
/// # Errors
///
/// Returns the error from opening the file.
pub async fn open_target(path: &Path, overwrite: bool) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    options.open(path).await
}

/// Removes a file being written unless told to keep it.
struct PartialFile {
    path: Option<PathBuf>,
}

impl PartialFile {
    fn new(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
        }
    }

    fn keep(mut self) {
        self.path = None;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            debug!(path = %path.display(), "removing partial file");
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Streams response body to file, returning bytes written.
async fn stream_body(
    file: &mut File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
    limit: Option<u64>,
    progress_step: u64,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;
    let mut next_report = progress_step;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| DownloadError::network(url, e))?;

        bytes_written += chunk.len() as u64;
        if let Some(limit) = limit
            && bytes_written > limit
        {
            return Err(DownloadError::too_large(url, limit));
        }

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path, e))?;

        if progress_step > 0 && bytes_written >= next_report {
            debug!(bytes_written, "download progress");
            next_report = bytes_written + progress_step;
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;

    Ok(bytes_written)
}
