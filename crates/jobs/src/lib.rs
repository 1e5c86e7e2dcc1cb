//! Bounded background worker.
//!
//! Jobs are queued in arrival order and started on a fixed number of slots by a
//! single scheduler thread. A running job is reclaimed when its handler reports
//! it done (after a [`ProbeSignal`]), when its deadline passes, or when it is
//! cancelled. Every started job is stopped exactly once before it is released.

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::{
    fmt, mem,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, trace, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("worker is shutting down")]
    ShuttingDown,
    #[error("job queue is full ({0} pending)")]
    QueueFull(usize),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("max_threads must be at least 1")]
    NoSlots,
    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    TimedOut,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: JobId,
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of jobs allowed to run at the same time.
    pub max_threads: usize,
    /// Applied to jobs pushed without their own timeout. `None` never expires.
    pub default_timeout_ms: Option<u64>,
    /// Upper bound on queued (not yet started) jobs. `None` is unbounded.
    pub max_queued: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_threads: 1,
            default_timeout_ms: None,
            max_queued: None,
        }
    }
}

impl WorkerConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

/// The per-job operations the worker drives.
///
/// `probe` is called with the worker's internal lock held and must not call
/// back into the worker. `stop` must be idempotent with respect to whatever
/// the running job already did on its own.
pub trait JobHandler: Send + Sync + 'static {
    type Job: Send + Sync + 'static;
    type Running: Send + 'static;

    /// Begin executing `job`. An error resolves the job immediately without
    /// holding a slot.
    fn start(&self, job: &Arc<Self::Job>) -> Result<Self::Running>;

    /// Whether a running job has finished on its own.
    fn probe(&self, running: &Self::Running) -> bool;

    /// Terminate a running job. Called once per started job, whether it
    /// finished, expired or was cancelled. Dropping `Running` afterwards
    /// releases it.
    fn stop(&self, running: &mut Self::Running);

    /// A queued job is being discarded because the worker shuts down.
    fn abandon(&self, _job: &Arc<Self::Job>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still queued and has been removed without starting.
    Dequeued,
    /// The job is running; it will be stopped by the scheduler.
    Stopping,
    /// Unknown id, or the job already finished.
    NotFound,
}

enum Signal {
    Wake,
    Shutdown,
}

/// Cloneable handle used by running jobs to ask the worker to re-check them.
#[derive(Clone)]
pub struct ProbeSignal {
    tx: Sender<Signal>,
}

impl ProbeSignal {
    pub fn request_probe(&self) {
        let _ = self.tx.send(Signal::Wake);
    }
}

impl fmt::Debug for ProbeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeSignal").finish_non_exhaustive()
    }
}

struct Pending<J> {
    id: JobId,
    job: Arc<J>,
    timeout: Option<Duration>,
}

struct Slot<R> {
    id: JobId,
    running: Option<R>,
    deadline: Option<Instant>,
    cancelled: bool,
}

struct PoolState<J, R> {
    queue: VecDeque<Pending<J>>,
    active: Vec<Slot<R>>,
    closing: bool,
}

struct Shared<H: JobHandler> {
    handler: H,
    config: WorkerConfig,
    state: Mutex<PoolState<H::Job, H::Running>>,
    wake: Sender<Signal>,
    subscribers: Mutex<Vec<Sender<JobEvent>>>,
}

pub struct BackgroundWorker<H: JobHandler> {
    shared: Arc<Shared<H>>,
    scheduler: Option<thread::JoinHandle<()>>,
}

impl<H: JobHandler> BackgroundWorker<H> {
    pub fn new(handler: H, config: WorkerConfig) -> Result<Self, WorkerError> {
        if config.max_threads == 0 {
            return Err(WorkerError::NoSlots);
        }
        let (wake, rx_wake) = unbounded::<Signal>();
        let shared = Arc::new(Shared {
            handler,
            config,
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                active: Vec::new(),
                closing: false,
            }),
            wake,
            subscribers: Mutex::new(Vec::new()),
        });

        let scheduler = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("jobs-scheduler".into())
                .spawn(move || shared.run(rx_wake))?
        };
        debug!(
            max_threads = shared.config.max_threads,
            default_timeout_ms = ?shared.config.default_timeout_ms,
            "background worker started"
        );

        Ok(Self {
            shared,
            scheduler: Some(scheduler),
        })
    }

    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.shared.config
    }

    pub fn probe_signal(&self) -> ProbeSignal {
        ProbeSignal {
            tx: self.shared.wake.clone(),
        }
    }

    /// Receive lifecycle events for every job pushed after this call.
    pub fn subscribe(&self) -> Receiver<JobEvent> {
        let (tx, rx) = unbounded();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    /// Queue `job`. `timeout` overrides the configured default and is counted
    /// from the moment the job starts.
    pub fn push(
        &self,
        job: Arc<H::Job>,
        timeout: Option<Duration>,
    ) -> Result<JobId, AdmissionError> {
        let id = JobId::new();
        {
            let mut state = self.shared.state.lock();
            if state.closing {
                return Err(AdmissionError::ShuttingDown);
            }
            if let Some(limit) = self.shared.config.max_queued {
                if state.queue.len() >= limit {
                    return Err(AdmissionError::QueueFull(limit));
                }
            }
            state.queue.push_back(Pending {
                id,
                job,
                timeout: timeout.or_else(|| self.shared.config.default_timeout()),
            });
            self.shared.emit(id, JobStatus::Queued);
        }
        trace!(job = %id, "job queued");
        self.request_probe();
        Ok(id)
    }

    pub fn cancel(&self, id: JobId) -> CancelOutcome {
        let mut state = self.shared.state.lock();
        if let Some(pos) = state.queue.iter().position(|p| p.id == id) {
            let removed = state.queue.remove(pos);
            self.shared.emit(id, JobStatus::Cancelled);
            drop(state);
            drop(removed);
            debug!(job = %id, "queued job cancelled");
            return CancelOutcome::Dequeued;
        }
        if let Some(slot) = state.active.iter_mut().find(|s| s.id == id) {
            slot.cancelled = true;
            drop(state);
            debug!(job = %id, "running job cancelled");
            self.request_probe();
            return CancelOutcome::Stopping;
        }
        CancelOutcome::NotFound
    }

    pub fn request_probe(&self) {
        let _ = self.shared.wake.send(Signal::Wake);
    }

    pub fn queued_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn active_len(&self) -> usize {
        self.shared.state.lock().active.len()
    }

    /// Stop running jobs, abandon queued ones and join the scheduler. Later
    /// pushes are refused.
    pub fn shutdown(&mut self) {
        let Some(scheduler) = self.scheduler.take() else {
            return;
        };
        self.shared.state.lock().closing = true;
        let _ = self.shared.wake.send(Signal::Shutdown);
        // Dropped from inside a handler callback: the loop drains on its own.
        if scheduler.thread().id() == thread::current().id() {
            return;
        }
        if scheduler.join().is_err() {
            warn!("jobs scheduler thread panicked");
        }
    }
}

impl<H: JobHandler> Drop for BackgroundWorker<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<H: JobHandler> fmt::Debug for BackgroundWorker<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("BackgroundWorker")
            .field("config", &self.shared.config)
            .field("queued", &state.queue.len())
            .field("active", &state.active.len())
            .finish()
    }
}

impl<H: JobHandler> Shared<H> {
    fn run(&self, rx_wake: Receiver<Signal>) {
        trace!("scheduler loop started");
        loop {
            if self.state.lock().closing {
                break;
            }
            self.reap();
            self.fill_slots();

            let signal = match self.next_deadline() {
                Some(deadline) => {
                    rx_wake.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                None => rx_wake.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match signal {
                Ok(Signal::Wake) | Err(RecvTimeoutError::Timeout) => {}
                Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.drain();
    }

    fn reap(&self) {
        let now = Instant::now();
        let finished = {
            let mut state = self.state.lock();
            let mut finished = Vec::new();
            let mut i = 0;
            while i < state.active.len() {
                let slot = &state.active[i];
                let status = if slot.cancelled {
                    Some(JobStatus::Cancelled)
                } else if slot
                    .running
                    .as_ref()
                    .is_some_and(|running| self.handler.probe(running))
                {
                    Some(JobStatus::Done)
                } else if slot.deadline.is_some_and(|deadline| deadline <= now) {
                    Some(JobStatus::TimedOut)
                } else {
                    None
                };
                match status {
                    Some(status) => finished.push((state.active.remove(i), status)),
                    None => i += 1,
                }
            }
            finished
        };
        for (slot, status) in finished {
            self.retire(slot, status);
        }
    }

    fn retire(&self, mut slot: Slot<H::Running>, status: JobStatus) {
        let id = slot.id;
        if let Some(running) = slot.running.as_mut() {
            self.handler.stop(running);
        }
        match status {
            JobStatus::TimedOut => debug!(job = %id, "job timed out"),
            _ => trace!(job = %id, ?status, "job finished"),
        }
        drop(slot);
        self.emit(id, status);
    }

    fn fill_slots(&self) {
        loop {
            let (id, job, timeout) = {
                let mut state = self.state.lock();
                if state.closing || state.active.len() >= self.config.max_threads {
                    return;
                }
                let Some(next) = state.queue.pop_front() else {
                    return;
                };
                state.active.push(Slot {
                    id: next.id,
                    running: None,
                    deadline: None,
                    cancelled: false,
                });
                (next.id, next.job, next.timeout)
            };

            trace!(job = %id, "starting job");
            let started = self.handler.start(&job);

            let mut state = self.state.lock();
            let pos = state.active.iter().position(|s| s.id == id);
            match (pos, started) {
                (Some(pos), Ok(running)) => {
                    let slot = &mut state.active[pos];
                    slot.running = Some(running);
                    slot.deadline = timeout.map(|t| Instant::now() + t);
                    self.emit(id, JobStatus::Running);
                }
                (None, Ok(mut running)) => {
                    drop(state);
                    self.handler.stop(&mut running);
                }
                (pos, Err(err)) => {
                    if let Some(pos) = pos {
                        state.active.remove(pos);
                    }
                    drop(state);
                    warn!(job = %id, "job failed to start: {err:#}");
                    self.emit(id, JobStatus::Failed(err.to_string()));
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.state
            .lock()
            .active
            .iter()
            .filter_map(|s| s.deadline)
            .min()
    }

    fn drain(&self) {
        let (queue, active) = {
            let mut state = self.state.lock();
            state.closing = true;
            (mem::take(&mut state.queue), mem::take(&mut state.active))
        };
        if !queue.is_empty() || !active.is_empty() {
            debug!(
                queued = queue.len(),
                running = active.len(),
                "shutting down with outstanding jobs"
            );
        }
        for slot in active {
            self.retire(slot, JobStatus::Cancelled);
        }
        for pending in queue {
            self.handler.abandon(&pending.job);
            self.emit(pending.id, JobStatus::Cancelled);
        }
        trace!("scheduler loop stopped");
    }

    fn emit(&self, id: JobId, status: JobStatus) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|tx| {
            tx.send(JobEvent {
                id,
                status: status.clone(),
            })
            .is_ok()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Recorder {
        started: Mutex<Vec<u32>>,
        stopped: Mutex<Vec<u32>>,
        abandoned: Mutex<Vec<u32>>,
    }

    struct FakeJob {
        tag: u32,
        fail_start: bool,
        done: AtomicBool,
    }

    impl FakeJob {
        fn new(tag: u32) -> Arc<Self> {
            Arc::new(Self {
                tag,
                fail_start: false,
                done: AtomicBool::new(false),
            })
        }

        fn failing(tag: u32) -> Arc<Self> {
            Arc::new(Self {
                tag,
                fail_start: true,
                done: AtomicBool::new(false),
            })
        }
    }

    struct FakeHandler {
        log: Arc<Recorder>,
    }

    impl JobHandler for FakeHandler {
        type Job = FakeJob;
        type Running = Arc<FakeJob>;

        fn start(&self, job: &Arc<FakeJob>) -> Result<Arc<FakeJob>> {
            if job.fail_start {
                anyhow::bail!("job {} cannot start", job.tag);
            }
            self.log.started.lock().push(job.tag);
            Ok(Arc::clone(job))
        }

        fn probe(&self, running: &Arc<FakeJob>) -> bool {
            running.done.load(Ordering::SeqCst)
        }

        fn stop(&self, running: &mut Arc<FakeJob>) {
            self.log.stopped.lock().push(running.tag);
        }

        fn abandon(&self, job: &Arc<FakeJob>) {
            self.log.abandoned.lock().push(job.tag);
        }
    }

    fn worker(config: WorkerConfig) -> (BackgroundWorker<FakeHandler>, Arc<Recorder>) {
        let log = Arc::new(Recorder::default());
        let worker = BackgroundWorker::new(
            FakeHandler {
                log: Arc::clone(&log),
            },
            config,
        )
        .unwrap();
        (worker, log)
    }

    fn wait_for(rx: &Receiver<JobEvent>, id: JobId, status: JobStatus) {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let event = rx
                .recv_timeout(left)
                .unwrap_or_else(|_| panic!("no {status:?} event for {id}"));
            if event.id == id && event.status == status {
                return;
            }
        }
    }

    fn finish(job: &FakeJob, worker: &BackgroundWorker<FakeHandler>) {
        job.done.store(true, Ordering::SeqCst);
        worker.request_probe();
    }

    #[test]
    fn single_slot_starts_jobs_in_submission_order() {
        let (worker, log) = worker(WorkerConfig::default());
        let events = worker.subscribe();
        let jobs: Vec<_> = (1..=3).map(FakeJob::new).collect();
        let ids: Vec<_> = jobs
            .iter()
            .map(|j| worker.push(Arc::clone(j), None).unwrap())
            .collect();

        for (job, id) in jobs.iter().zip(&ids) {
            wait_for(&events, *id, JobStatus::Running);
            assert_eq!(worker.active_len(), 1);
            finish(job, &worker);
            wait_for(&events, *id, JobStatus::Done);
        }
        assert_eq!(*log.started.lock(), vec![1, 2, 3]);
        assert_eq!(*log.stopped.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn concurrency_is_bounded_by_max_threads() {
        let (worker, log) = worker(WorkerConfig {
            max_threads: 2,
            ..Default::default()
        });
        let events = worker.subscribe();
        let jobs: Vec<_> = (1..=4).map(FakeJob::new).collect();
        let ids: Vec<_> = jobs
            .iter()
            .map(|j| worker.push(Arc::clone(j), None).unwrap())
            .collect();

        wait_for(&events, ids[1], JobStatus::Running);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(worker.active_len(), 2);
        assert_eq!(worker.queued_len(), 2);
        assert_eq!(*log.started.lock(), vec![1, 2]);

        finish(&jobs[1], &worker);
        wait_for(&events, ids[2], JobStatus::Running);
        assert_eq!(*log.started.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn cancelled_queued_job_never_starts() {
        let (worker, log) = worker(WorkerConfig::default());
        let events = worker.subscribe();
        let first = FakeJob::new(1);
        let first_id = worker.push(Arc::clone(&first), None).unwrap();
        let second_id = worker.push(FakeJob::new(2), None).unwrap();
        wait_for(&events, first_id, JobStatus::Running);

        assert_eq!(worker.cancel(second_id), CancelOutcome::Dequeued);
        finish(&first, &worker);
        wait_for(&events, first_id, JobStatus::Done);
        thread::sleep(Duration::from_millis(50));

        assert_eq!(*log.started.lock(), vec![1]);
        assert_eq!(worker.queued_len(), 0);
        assert_eq!(worker.cancel(second_id), CancelOutcome::NotFound);
    }

    #[test]
    fn cancelling_running_job_stops_it_and_frees_the_slot() {
        let (worker, log) = worker(WorkerConfig::default());
        let events = worker.subscribe();
        let first_id = worker.push(FakeJob::new(1), None).unwrap();
        let second_id = worker.push(FakeJob::new(2), None).unwrap();
        wait_for(&events, first_id, JobStatus::Running);

        assert_eq!(worker.cancel(first_id), CancelOutcome::Stopping);
        wait_for(&events, first_id, JobStatus::Cancelled);
        wait_for(&events, second_id, JobStatus::Running);
        assert_eq!(*log.stopped.lock(), vec![1]);
    }

    #[test]
    fn expired_job_is_stopped() {
        let (worker, log) = worker(WorkerConfig {
            default_timeout_ms: Some(50),
            ..Default::default()
        });
        let events = worker.subscribe();
        let started = Instant::now();
        let id = worker.push(FakeJob::new(7), None).unwrap();

        wait_for(&events, id, JobStatus::TimedOut);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
        assert_eq!(*log.stopped.lock(), vec![7]);
        assert_eq!(worker.active_len(), 0);
    }

    #[test]
    fn per_job_timeout_overrides_default() {
        let (worker, _log) = worker(WorkerConfig {
            default_timeout_ms: Some(10_000),
            ..Default::default()
        });
        let events = worker.subscribe();
        let id = worker
            .push(FakeJob::new(1), Some(Duration::from_millis(30)))
            .unwrap();
        wait_for(&events, id, JobStatus::TimedOut);
    }

    #[test]
    fn start_failure_does_not_hold_a_slot() {
        let (worker, log) = worker(WorkerConfig::default());
        let events = worker.subscribe();
        let bad = worker.push(FakeJob::failing(1), None).unwrap();
        let good = worker.push(FakeJob::new(2), None).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let failure = loop {
            let event = events
                .recv_timeout(deadline.saturating_duration_since(Instant::now()))
                .unwrap();
            if let (true, JobStatus::Failed(msg)) = (event.id == bad, &event.status) {
                break msg.clone();
            }
        };
        assert!(failure.contains("cannot start"));
        wait_for(&events, good, JobStatus::Running);
        assert_eq!(*log.started.lock(), vec![2]);
        assert!(log.stopped.lock().is_empty());
    }

    #[test]
    fn queue_limit_rejects_excess_jobs() {
        let (worker, _log) = worker(WorkerConfig {
            max_queued: Some(1),
            ..Default::default()
        });
        let events = worker.subscribe();
        let running = worker.push(FakeJob::new(1), None).unwrap();
        wait_for(&events, running, JobStatus::Running);
        worker.push(FakeJob::new(2), None).unwrap();

        let err = worker.push(FakeJob::new(3), None).unwrap_err();
        assert!(matches!(err, AdmissionError::QueueFull(1)));
    }

    #[test]
    fn shutdown_stops_running_and_abandons_queued() {
        let (mut worker, log) = worker(WorkerConfig::default());
        let events = worker.subscribe();
        let running = worker.push(FakeJob::new(1), None).unwrap();
        worker.push(FakeJob::new(2), None).unwrap();
        worker.push(FakeJob::new(3), None).unwrap();
        wait_for(&events, running, JobStatus::Running);

        worker.shutdown();
        assert_eq!(*log.stopped.lock(), vec![1]);
        assert_eq!(*log.abandoned.lock(), vec![2, 3]);
        assert!(matches!(
            worker.push(FakeJob::new(4), None),
            Err(AdmissionError::ShuttingDown)
        ));
    }

    #[test]
    fn zero_slots_is_rejected() {
        let log = Arc::new(Recorder::default());
        let result = BackgroundWorker::new(
            FakeHandler { log },
            WorkerConfig {
                max_threads: 0,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(WorkerError::NoSlots)));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: WorkerConfig =
            serde_json::from_str(r#"{"default_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.max_threads, 1);
        assert_eq!(config.default_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.max_queued, None);
    }
}
