//! Progress UI (spinner) for crawl runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use webmirror_core::{FetchResult, ProgressFn};

/// A spinner that counts finished fetches.
pub(crate) struct Spinner {
    bar: ProgressBar,
    done: Arc<AtomicUsize>,
}

impl Spinner {
    /// Starts the spinner when `enabled`, otherwise returns `None`.
    pub(crate) fn start(enabled: bool) -> Option<Self> {
        if !enabled {
            return None;
        }
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_message("Starting crawl...");
        Some(Self {
            bar,
            done: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Callback that advances the spinner for each result.
    pub(crate) fn progress_fn(&self) -> ProgressFn {
        let bar = self.bar.clone();
        let done = Arc::clone(&self.done);
        Arc::new(move |result: &FetchResult| {
            let count = done.fetch_add(1, Ordering::Relaxed) + 1;
            bar.set_message(status_line(count, result));
        })
    }

    pub(crate) fn finish(self) {
        self.bar.finish_and_clear();
    }
}

fn status_line(count: usize, result: &FetchResult) -> String {
    let verb = if result.is_success() { "Fetched" } else { "Failed" };
    format!("[{count}] {verb} {}", result.url())
}

#[cfg(test)]
mod tests {
    use super::*;
    use webmirror_core::{FetchCause, FetchRequest};

    #[test]
    fn test_spinner_disabled_returns_none() {
        assert!(Spinner::start(false).is_none());
    }

    #[test]
    fn test_status_line_reports_outcome() {
        let request = FetchRequest::new("https://a.test/x").unwrap();
        let ok = FetchResult::succeeded(request.clone(), "/tmp/x.html".into());
        assert_eq!(status_line(3, &ok), "[3] Fetched https://a.test/x");

        let failed = FetchResult::failed(request, FetchCause::Fault("boom".into()));
        assert!(status_line(4, &failed).starts_with("[4] Failed"));
    }
}
