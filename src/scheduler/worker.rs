//! Per-host worker actor.
//!
//! A worker runs the fetches the coordinator hands it, never more than the
//! coordinator allows, and reports each outcome back as a [`WorkerEvent`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, instrument};

use super::supervision::Fault;
use crate::fetch::{FetchError, FetchRequest, FetchResult, FetchService};

pub(crate) type WorkerId = u64;

/// Messages a worker accepts.
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    Fetch(FetchRequest),
    /// Abort in-flight work, hand it back, and continue with fresh state.
    Restart,
    /// Abort in-flight work and exit.
    Stop,
}

/// Messages a worker sends to the coordinator.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Finished {
        host: String,
        worker: WorkerId,
        result: FetchResult,
    },
    Faulted {
        host: String,
        worker: WorkerId,
        request: FetchRequest,
        fault: Fault,
    },
    /// Requests aborted by a restart, to be queued again.
    Requeued {
        host: String,
        worker: WorkerId,
        requests: Vec<FetchRequest>,
    },
}

/// Coordinator's side of a worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    pub(crate) id: WorkerId,
    tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl WorkerHandle {
    /// Sends a command; `false` if the worker is gone.
    pub(crate) fn send(&self, command: WorkerCommand) -> bool {
        self.tx.send(command).is_ok()
    }
}

type TaskOutcome = (
    FetchRequest,
    std::thread::Result<Result<FetchResult, FetchError>>,
);

struct Worker {
    id: WorkerId,
    host: String,
    service: Arc<dyn FetchService>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    tasks: JoinSet<TaskOutcome>,
    running: Vec<FetchRequest>,
}

/// Starts a worker bound to `host`.
pub(crate) fn spawn(
    id: WorkerId,
    host: String,
    service: Arc<dyn FetchService>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> WorkerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = Worker {
        id,
        host,
        service,
        events,
        tasks: JoinSet::new(),
        running: Vec::new(),
    };
    tokio::spawn(worker.run(rx));
    WorkerHandle { id, tx }
}

impl Worker {
    #[instrument(skip_all, fields(host = %self.host, worker = self.id))]
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkerCommand>) {
        debug!("worker started");
        let mut mailbox_open = true;
        loop {
            if !mailbox_open && self.tasks.is_empty() {
                break;
            }
            tokio::select! {
                command = rx.recv(), if mailbox_open => match command {
                    Some(WorkerCommand::Fetch(request)) => self.start(request),
                    Some(WorkerCommand::Restart) => self.restart().await,
                    Some(WorkerCommand::Stop) => {
                        self.tasks.abort_all();
                        while self.tasks.join_next().await.is_some() {}
                        break;
                    }
                    None => mailbox_open = false,
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Ok(outcome) = joined {
                        self.report(outcome);
                    }
                }
            }
        }
        debug!("worker exited");
    }

    fn start(&mut self, request: FetchRequest) {
        debug!(url = %request.url(), "fetch started");
        self.running.push(request.clone());
        let service = Arc::clone(&self.service);
        self.tasks.spawn(async move {
            let outcome = AssertUnwindSafe(async { service.fetch(&request).await })
                .catch_unwind()
                .await;
            (request, outcome)
        });
    }

    fn report(&mut self, (request, outcome): TaskOutcome) {
        self.running.retain(|running| running != &request);
        let host = self.host.clone();
        let worker = self.id;
        let event = match outcome {
            Ok(Ok(result)) => WorkerEvent::Finished {
                host,
                worker,
                result,
            },
            Ok(Err(error)) => WorkerEvent::Faulted {
                host,
                worker,
                request,
                fault: Fault::Error(error),
            },
            Err(payload) => WorkerEvent::Faulted {
                host,
                worker,
                request,
                fault: Fault::from_panic(payload.as_ref()),
            },
        };
        let _ = self.events.send(event);
    }

    /// Aborts everything in flight and hands the unfinished requests back.
    async fn restart(&mut self) {
        self.tasks.abort_all();
        while let Some(joined) = self.tasks.join_next().await {
            if let Ok(outcome) = joined {
                self.report(outcome);
            }
        }
        let requests = std::mem::take(&mut self.running);
        debug!(requeued = requests.len(), "worker restarted");
        self.tasks = JoinSet::new();
        let _ = self.events.send(WorkerEvent::Requeued {
            host: self.host.clone(),
            worker: self.id,
            requests,
        });
    }
}
