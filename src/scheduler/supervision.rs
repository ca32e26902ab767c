//! Fault classification for per-host workers.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::time::Duration;

use tokio::time::Instant;

use crate::fetch::FetchError;

/// What went wrong inside a worker's fetch.
#[derive(Debug)]
pub enum Fault {
    /// The fetch path panicked.
    Panic(String),
    /// The fetch path returned a fault.
    Error(FetchError),
}

impl Fault {
    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::Panic(message)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Panic(message) => write!(f, "panic: {message}"),
            Self::Error(error) => write!(f, "{error}"),
        }
    }
}

/// Supervision response to a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Keep the worker as is; only the failed request is dropped.
    Resume,
    /// Reset the worker's state; its in-flight work goes back on the host queue.
    Restart,
    /// Retire the worker and its host permanently.
    Stop,
}

/// Maps a fault to a directive.
///
/// Filesystem permission problems are not going to fix themselves, so they
/// stop the host. A busy or locked store clears on its own, and a file name
/// taken by another fetch says nothing about the worker, so both resume.
/// Everything else restarts.
#[must_use]
pub fn decide(fault: &Fault) -> Directive {
    match fault {
        Fault::Error(error)
            if matches!(
                error.io_kind(),
                Some(io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem)
            ) =>
        {
            Directive::Stop
        }
        Fault::Error(error)
            if error.is_store_busy() || error.io_kind() == Some(io::ErrorKind::AlreadyExists) =>
        {
            Directive::Resume
        }
        Fault::Error(_) | Fault::Panic(_) => Directive::Restart,
    }
}

/// Restarts allowed within a rolling window.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max_restarts: u32,
    window: Duration,
    history: VecDeque<Instant>,
}

impl RetryBudget {
    #[must_use]
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
            history: VecDeque::new(),
        }
    }

    /// Records a restart at `now`. Returns `false` once the budget is exceeded.
    pub fn record(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.history.front() {
            if now.duration_since(oldest) > self.window {
                self.history.pop_front();
            } else {
                break;
            }
        }
        self.history.push_back(now);
        self.history.len() <= self.max_restarts as usize
    }

    /// Restarts currently inside the window.
    #[must_use]
    pub fn used(&self) -> usize {
        self.history.len()
    }
}
