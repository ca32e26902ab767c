//! Crawl scheduling: a coordinator actor and one worker actor per host.
//!
//! The coordinator owns every piece of scheduling state. It deduplicates
//! submissions by URL, records the file each URL resolves to, bounds how many
//! host workers exist at once and how many fetches each runs, and supervises
//! worker faults with a per-host restart budget. Links found in fetched pages
//! are submitted back into the frontier up to a configured depth.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use webmirror_core::fetch::{FetchRequest, FetchService};
//! use webmirror_core::scheduler::{Scheduler, SchedulerConfig};
//!
//! # async fn example(service: Arc<dyn FetchService>) -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = Scheduler::start(SchedulerConfig::default(), service, None);
//! let handle = scheduler.handle();
//! let result = handle
//!     .submit_and_wait(FetchRequest::new("https://example.com/")?)
//!     .await?;
//! println!("{} -> {:?}", result.url(), result.filespec);
//! let stats = handle.idle().await?;
//! println!("{} completed", stats.completed);
//! scheduler.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod coordinator;
pub mod supervision;
mod worker;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::fetch::{FetchRequest, FetchResult, FetchService};
use coordinator::{Command, Coordinator};

/// Default number of host workers alive at once.
pub const DEFAULT_MAX_HOST_WORKERS: usize = 4;

/// Default number of concurrent fetches per host.
pub const DEFAULT_PER_HOST_CONCURRENCY: usize = 2;

/// Default link depth below the submitted URLs.
pub const DEFAULT_MAX_DEPTH: u32 = 2;

/// Default restarts a host may use inside [`DEFAULT_RESTART_WINDOW`].
pub const DEFAULT_MAX_RESTARTS: u32 = 5;

/// Default window for counting restarts.
pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(60);

/// Scheduler limits.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Host workers alive at once; requests for further hosts wait globally.
    pub max_host_workers: usize,
    /// Fetches one host worker runs concurrently.
    pub per_host_concurrency: usize,
    /// Links are followed while the parent's depth is below this.
    pub max_depth: u32,
    /// Only follow links that stay on the parent's host.
    pub same_host_only: bool,
    /// Restarts a host may use inside `restart_window` before escalation.
    pub max_restarts: u32,
    pub restart_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_host_workers: DEFAULT_MAX_HOST_WORKERS,
            per_host_concurrency: DEFAULT_PER_HOST_CONCURRENCY,
            max_depth: DEFAULT_MAX_DEPTH,
            same_host_only: true,
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_window: DEFAULT_RESTART_WINDOW,
        }
    }
}

/// Counters reported by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Distinct URLs admitted.
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    /// Successful fetches by resolved extension.
    pub per_extension: BTreeMap<String, usize>,
    pub active_workers: usize,
    pub queued_global: usize,
    pub queued_host: usize,
    pub in_flight: usize,
    pub restarts: usize,
    pub resumes: usize,
    pub stops: usize,
    /// A host exhausted its restart budget and the scheduler tore down.
    pub escalated: bool,
}

/// Errors from talking to the scheduler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// The coordinator is no longer running.
    #[error("scheduler is not running")]
    Closed,
}

/// Cloneable handle for submitting work and querying the coordinator.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    /// Submits a request; the receiver resolves when its URL completes.
    ///
    /// A URL already completed resolves immediately with the cached result.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`] if the coordinator has stopped.
    pub fn submit(
        &self,
        request: FetchRequest,
    ) -> Result<oneshot::Receiver<FetchResult>, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit {
            request,
            reply: Some(reply),
        })?;
        Ok(rx)
    }

    /// Submits a request without waiting for its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`] if the coordinator has stopped.
    pub fn enqueue(&self, request: FetchRequest) -> Result<(), SchedulerError> {
        self.send(Command::Submit {
            request,
            reply: None,
        })
    }

    /// Submits a request and waits for its result.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`] if the coordinator stops first.
    pub async fn submit_and_wait(
        &self,
        request: FetchRequest,
    ) -> Result<FetchResult, SchedulerError> {
        self.submit(request)?
            .await
            .map_err(|_| SchedulerError::Closed)
    }

    /// Current counters.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`] if the coordinator has stopped.
    pub async fn stats(&self) -> Result<SchedulerStats, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats(reply))?;
        rx.await.map_err(|_| SchedulerError::Closed)
    }

    /// Waits until nothing is outstanding, frontier growth included.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`] if the coordinator has stopped.
    pub async fn idle(&self) -> Result<SchedulerStats, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Idle(reply))?;
        rx.await.map_err(|_| SchedulerError::Closed)
    }

    /// File the coordinator has recorded for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`] if the coordinator has stopped.
    pub async fn filespec(&self, url: &str) -> Result<Option<PathBuf>, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Filespec {
            url: crate::urls::normalize_url(url).unwrap_or_else(|_| url.to_string()),
            reply,
        })?;
        rx.await.map_err(|_| SchedulerError::Closed)
    }

    /// Asks the coordinator to fail outstanding work and stop.
    pub fn request_shutdown(&self) {
        if self.send(Command::Shutdown).is_err() {
            warn!("scheduler already stopped");
        }
    }

    fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.tx.send(command).map_err(|_| SchedulerError::Closed)
    }
}

/// A running scheduler.
#[derive(Debug)]
pub struct Scheduler {
    handle: SchedulerHandle,
    task: JoinHandle<()>,
}

impl Scheduler {
    /// Spawns the coordinator on the current runtime.
    ///
    /// Every completed result is also sent to `sink` when one is given.
    #[must_use]
    pub fn start(
        config: SchedulerConfig,
        service: Arc<dyn FetchService>,
        sink: Option<mpsc::UnboundedSender<FetchResult>>,
    ) -> Self {
        let (tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(config, service, sink, events_tx);
        let task = tokio::spawn(coordinator.run(commands_rx, events_rx));
        Self {
            handle: SchedulerHandle { tx },
            task,
        }
    }

    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Fails outstanding work, stops every worker and waits for the coordinator.
    pub async fn shutdown(self) {
        self.handle.request_shutdown();
        if let Err(error) = self.task.await {
            warn!(%error, "scheduler task ended abnormally");
        }
    }
}
