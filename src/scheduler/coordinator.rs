//! The frontier coordinator actor.
//!
//! Owns the URL dedup table, the URL to filespec map, and one [`HostState`]
//! per remote host. Admission, completion and supervision all run here, one
//! message at a time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::supervision::{Directive, Fault, RetryBudget, decide};
use super::worker::{self, WorkerCommand, WorkerEvent, WorkerHandle, WorkerId};
use super::{SchedulerConfig, SchedulerStats};
use crate::fetch::{FetchCause, FetchRequest, FetchResult, FetchService, FetchTarget};
use crate::urls::{UrlKey, host_of};

/// Messages from [`super::SchedulerHandle`].
#[derive(Debug)]
pub(crate) enum Command {
    Submit {
        request: FetchRequest,
        reply: Option<oneshot::Sender<FetchResult>>,
    },
    Stats(oneshot::Sender<SchedulerStats>),
    Idle(oneshot::Sender<SchedulerStats>),
    Filespec {
        url: String,
        reply: oneshot::Sender<Option<PathBuf>>,
    },
    Shutdown,
}

#[derive(Debug)]
struct HostState {
    worker: Option<WorkerHandle>,
    in_flight: Vec<FetchRequest>,
    pending: VecDeque<FetchRequest>,
    stopped: bool,
    budget: RetryBudget,
}

impl HostState {
    fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.pending.is_empty()
    }
}

pub(crate) struct Coordinator {
    config: SchedulerConfig,
    service: Arc<dyn FetchService>,
    sink: Option<mpsc::UnboundedSender<FetchResult>>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    hosts: HashMap<String, HostState>,
    active_workers: usize,
    next_worker_id: WorkerId,
    global_pending: VecDeque<FetchRequest>,
    outstanding: HashSet<UrlKey>,
    completed: HashMap<UrlKey, FetchResult>,
    waiters: HashMap<UrlKey, Vec<oneshot::Sender<FetchResult>>>,
    filespecs: HashMap<UrlKey, PathBuf>,
    idle_waiters: Vec<oneshot::Sender<SchedulerStats>>,
    stats: SchedulerStats,
}

impl Coordinator {
    pub(crate) fn new(
        config: SchedulerConfig,
        service: Arc<dyn FetchService>,
        sink: Option<mpsc::UnboundedSender<FetchResult>>,
        events_tx: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            config,
            service,
            sink,
            events_tx,
            hosts: HashMap::new(),
            active_workers: 0,
            next_worker_id: 1,
            global_pending: VecDeque::new(),
            outstanding: HashSet::new(),
            completed: HashMap::new(),
            waiters: HashMap::new(),
            filespecs: HashMap::new(),
            idle_waiters: Vec::new(),
            stats: SchedulerStats::default(),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        info!(
            max_host_workers = self.config.max_host_workers,
            per_host = self.config.per_host_concurrency,
            "scheduler started"
        );
        let mut handles_open = true;
        loop {
            if !handles_open && self.outstanding.is_empty() {
                break;
            }
            tokio::select! {
                command = commands.recv(), if handles_open => match command {
                    Some(Command::Submit { request, reply }) => self.admit(request, reply),
                    Some(Command::Stats(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::Idle(reply)) => self.idle_waiters.push(reply),
                    Some(Command::Filespec { url, reply }) => {
                        let _ = reply.send(self.filespecs.get(&UrlKey::new(&url)).cloned());
                    }
                    Some(Command::Shutdown) => {
                        self.shut_down(FetchCause::Fault("scheduler shut down".to_string()));
                        break;
                    }
                    None => handles_open = false,
                },
                Some(event) = events.recv() => self.on_event(event),
            }
            self.notify_if_idle();
        }
        self.notify_if_idle();
        info!(
            completed = self.stats.completed,
            failed = self.stats.failed,
            "scheduler stopped"
        );
    }

    fn snapshot(&self) -> SchedulerStats {
        let mut stats = self.stats.clone();
        stats.active_workers = self.active_workers;
        stats.queued_global = self.global_pending.len();
        stats.queued_host = self.hosts.values().map(|h| h.pending.len()).sum();
        stats.in_flight = self.hosts.values().map(|h| h.in_flight.len()).sum();
        stats
    }

    fn notify_if_idle(&mut self) {
        if self.outstanding.is_empty() && !self.idle_waiters.is_empty() {
            let stats = self.snapshot();
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(stats.clone());
            }
        }
    }

    #[instrument(skip(self, request, reply), fields(url = %request.url(), depth = request.depth()))]
    fn admit(&mut self, request: FetchRequest, reply: Option<oneshot::Sender<FetchResult>>) {
        let key = request.key().clone();
        if let Some(done) = self.completed.get(&key) {
            debug!("already completed");
            let mut done = done.clone();
            done.request = request;
            if let Some(reply) = reply {
                let _ = reply.send(done);
            }
            return;
        }
        if self.outstanding.contains(&key) {
            debug!("already admitted, waiting on the same fetch");
            if let Some(reply) = reply {
                self.waiters.entry(key).or_default().push(reply);
            }
            return;
        }

        self.stats.submitted += 1;
        self.outstanding.insert(key.clone());
        if let Some(reply) = reply {
            self.waiters.entry(key.clone()).or_default().push(reply);
        }

        if self.stats.escalated {
            self.complete(FetchResult::failed(request, FetchCause::Escalated));
            return;
        }
        let host = request.host();
        if self.hosts.get(&host).is_some_and(|state| state.stopped) {
            self.complete(FetchResult::failed(request, FetchCause::HostStopped(host)));
            return;
        }

        let service = Arc::clone(&self.service);
        let target = std::panic::catch_unwind(AssertUnwindSafe(|| {
            service.admission_target(&request)
        }));
        let target = match target {
            Ok(Ok(target)) => target,
            Ok(Err(error)) => {
                warn!(%error, "admission failed");
                self.complete(FetchResult::failed(
                    request,
                    FetchCause::Admission(error.to_string()),
                ));
                return;
            }
            Err(payload) => {
                let fault = Fault::from_panic(payload.as_ref());
                warn!(%fault, "admission panicked");
                self.complete(FetchResult::failed(
                    request,
                    FetchCause::Admission(fault.to_string()),
                ));
                return;
            }
        };
        self.filespecs.insert(key, target.clone());
        self.dispatch(request.with_target(FetchTarget::File(target)));
    }

    /// Hands a request to its host's worker, or queues it.
    fn dispatch(&mut self, request: FetchRequest) {
        let host = request.host();
        let limit = self.config.per_host_concurrency;
        let budget = RetryBudget::new(self.config.max_restarts, self.config.restart_window);
        let state = self.hosts.entry(host.clone()).or_insert_with(|| HostState {
            worker: None,
            in_flight: Vec::new(),
            pending: VecDeque::new(),
            stopped: false,
            budget,
        });

        if state.worker.is_some() {
            if state.in_flight.len() < limit {
                self.send_to_worker(&host, request);
            } else {
                debug!(%host, url = %request.url(), "host saturated, queued");
                state.pending.push_back(request);
            }
            return;
        }

        if self.active_workers < self.config.max_host_workers {
            let id = self.next_worker_id;
            self.next_worker_id += 1;
            let handle = worker::spawn(
                id,
                host.clone(),
                Arc::clone(&self.service),
                self.events_tx.clone(),
            );
            state.worker = Some(handle);
            self.active_workers += 1;
            debug!(%host, worker = id, "worker created");
            self.send_to_worker(&host, request);
        } else {
            debug!(%host, url = %request.url(), "worker pool full, queued globally");
            self.global_pending.push_back(request);
        }
    }

    fn send_to_worker(&mut self, host: &str, request: FetchRequest) {
        let Some(state) = self.hosts.get_mut(host) else {
            return;
        };
        let sent = state
            .worker
            .as_ref()
            .is_some_and(|worker| worker.send(WorkerCommand::Fetch(request.clone())));
        if sent {
            state.in_flight.push(request);
        } else {
            self.complete(FetchResult::failed(
                request,
                FetchCause::Fault("worker mailbox closed".to_string()),
            ));
        }
    }

    fn on_event(&mut self, event: WorkerEvent) {
        let host = match &event {
            WorkerEvent::Finished { host, .. }
            | WorkerEvent::Faulted { host, .. }
            | WorkerEvent::Requeued { host, .. } => host.clone(),
        };
        match event {
            WorkerEvent::Finished { worker, result, .. } => {
                if !self.take_in_flight(&host, worker, result.request.key()) {
                    return;
                }
                self.complete(result);
            }
            WorkerEvent::Faulted {
                worker,
                request,
                fault,
                ..
            } => {
                if !self.take_in_flight(&host, worker, request.key()) {
                    return;
                }
                self.supervise(&host, request, &fault);
            }
            WorkerEvent::Requeued {
                worker, requests, ..
            } => {
                if let Some(state) = self.current_host(&host, worker) {
                    for request in requests.into_iter().rev() {
                        state.in_flight.retain(|r| r != &request);
                        state.pending.push_front(request);
                    }
                }
            }
        }
        self.pump(&host);
        self.retire_if_idle(&host);
        self.drain_global();
    }

    /// Feeds the host's worker from its queue up to the concurrency limit.
    fn pump(&mut self, host: &str) {
        loop {
            let Some(state) = self.hosts.get_mut(host) else {
                return;
            };
            if state.worker.is_none() || state.in_flight.len() >= self.config.per_host_concurrency
            {
                return;
            }
            let Some(next) = state.pending.pop_front() else {
                return;
            };
            self.send_to_worker(host, next);
        }
    }

    /// Frees the pool slot of a worker with nothing left to do.
    fn retire_if_idle(&mut self, host: &str) {
        let Some(state) = self.hosts.get_mut(host) else {
            return;
        };
        if state.worker.is_some() && state.is_idle() {
            state.worker = None;
            self.active_workers = self.active_workers.saturating_sub(1);
            debug!(%host, "worker retired");
        }
    }

    /// Retries globally queued requests against the current pool.
    fn drain_global(&mut self) {
        if self.global_pending.is_empty() {
            return;
        }
        for request in std::mem::take(&mut self.global_pending) {
            self.dispatch(request);
        }
    }

    /// Host state when `worker` is still the host's worker.
    fn current_host(&mut self, host: &str, worker: WorkerId) -> Option<&mut HostState> {
        self.hosts
            .get_mut(host)
            .filter(|state| state.worker.as_ref().is_some_and(|w| w.id == worker))
    }

    /// Removes a request from the host's in-flight list; `false` for stale events.
    fn take_in_flight(&mut self, host: &str, worker: WorkerId, key: &UrlKey) -> bool {
        let Some(state) = self.current_host(host, worker) else {
            debug!(%host, worker, "ignoring event from retired worker");
            return false;
        };
        state.in_flight.retain(|r| r.key() != key);
        true
    }

    fn supervise(&mut self, host: &str, request: FetchRequest, fault: &Fault) {
        let directive = decide(fault);
        warn!(%host, url = %request.url(), %fault, ?directive, "worker fault");
        let failed = FetchResult::failed(request, FetchCause::Fault(fault.to_string()));
        match directive {
            Directive::Resume => {
                self.stats.resumes += 1;
                self.complete(failed);
            }
            Directive::Restart => {
                self.stats.restarts += 1;
                let within_budget = self
                    .hosts
                    .get_mut(host)
                    .is_some_and(|state| state.budget.record(Instant::now()));
                self.complete(failed);
                if !within_budget {
                    error!(%host, "restart budget exhausted, escalating");
                    self.escalate();
                    return;
                }
                if let Some(worker) = self.hosts.get(host).and_then(|s| s.worker.as_ref()) {
                    worker.send(WorkerCommand::Restart);
                }
            }
            Directive::Stop => {
                self.stats.stops += 1;
                self.complete(failed);
                self.stop_host(host, FetchCause::HostStopped(host.to_string()));
            }
        }
    }

    /// Retires the host's worker for good and fails its queued work.
    fn stop_host(&mut self, host: &str, cause: FetchCause) {
        let Some(state) = self.hosts.get_mut(host) else {
            return;
        };
        state.stopped = true;
        if let Some(worker) = state.worker.take() {
            worker.send(WorkerCommand::Stop);
            self.active_workers = self.active_workers.saturating_sub(1);
        }
        let abandoned: Vec<FetchRequest> = state
            .in_flight
            .drain(..)
            .chain(state.pending.drain(..))
            .collect();
        warn!(%host, abandoned = abandoned.len(), "host stopped");
        for request in abandoned {
            self.complete(FetchResult::failed(request, cause.clone()));
        }
        let queued: Vec<FetchRequest> = self
            .global_pending
            .iter()
            .filter(|r| r.host() == host)
            .cloned()
            .collect();
        self.global_pending.retain(|r| r.host() != host);
        for request in queued {
            self.complete(FetchResult::failed(request, cause.clone()));
        }
    }

    /// Tears the scheduler down after an exhausted retry budget.
    fn escalate(&mut self) {
        self.stats.escalated = true;
        self.shut_down(FetchCause::Escalated);
    }

    fn shut_down(&mut self, cause: FetchCause) {
        let hosts: Vec<String> = self.hosts.keys().cloned().collect();
        for host in hosts {
            self.stop_host(&host, cause.clone());
        }
        for request in std::mem::take(&mut self.global_pending) {
            self.complete(FetchResult::failed(request, cause.clone()));
        }
        self.active_workers = 0;
    }

    /// Records a finished unit of work and notifies everyone waiting on it.
    fn complete(&mut self, mut result: FetchResult) {
        let key = result.request.key().clone();
        if !self.outstanding.remove(&key) {
            return;
        }
        if let Some(filespec) = &result.filespec {
            self.filespecs.insert(key.clone(), filespec.clone());
        }
        if result.is_success() {
            self.stats.completed += 1;
            if let Some(extension) = &result.extension {
                *self.stats.per_extension.entry(extension.clone()).or_default() += 1;
            }
        } else {
            self.stats.failed += 1;
        }
        debug!(url = %result.url(), success = result.is_success(), "completed");

        let links = std::mem::take(&mut result.links);
        for waiter in self.waiters.remove(&key).unwrap_or_default() {
            let mut copy = result.clone();
            copy.links.clone_from(&links);
            let _ = waiter.send(copy);
        }
        if let Some(sink) = &self.sink {
            let mut copy = result.clone();
            copy.links.clone_from(&links);
            let _ = sink.send(copy);
        }
        let parent = result.request.clone();
        self.completed.insert(key, result);

        self.grow_frontier(&parent, &links);
    }

    /// Submits a page's links one level deeper.
    fn grow_frontier(&mut self, parent: &FetchRequest, links: &crate::urls::LinkMap) {
        if links.is_empty() || self.stats.escalated || parent.depth() >= self.config.max_depth {
            return;
        }
        let parent_host = parent.host();
        for (url, suggested) in links.iter() {
            if self.config.same_host_only && host_of(url) != parent_host {
                continue;
            }
            let Ok(child) = FetchRequest::new(url) else {
                continue;
            };
            let child = child
                .at_depth(parent.depth() + 1)
                .with_disposition(parent.disposition())
                .with_draft(Some(suggested.to_string()));
            self.admit(child, None);
        }
    }
}
