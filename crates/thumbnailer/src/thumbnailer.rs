use anyhow::Context;
use crossbeam_channel::{bounded, Receiver};
use jobs::{BackgroundWorker, CancelOutcome, JobEvent, JobHandler, WorkerConfig, WorkerError};
use media_io::{DecodeSession, Picture, SessionFactory};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

use crate::request::{RequestError, RequestHandle, ThumbnailJob, ThumbnailParams};

#[derive(Debug, Error)]
pub enum ThumbnailerError {
    #[error("cannot create thumbnail worker: {0}")]
    Worker(#[from] WorkerError),
}

/// Thumbnail requests share decoder resources, so they run one at a time.
const CONCURRENT_DECODES: usize = 1;

pub struct Thumbnailer {
    worker: BackgroundWorker<ThumbnailHandler>,
}

impl Thumbnailer {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Result<Self, ThumbnailerError> {
        let config = WorkerConfig {
            max_threads: CONCURRENT_DECODES,
            default_timeout_ms: None,
            max_queued: None,
        };
        let worker = BackgroundWorker::new(ThumbnailHandler { factory }, config)?;
        Ok(Self { worker })
    }

    /// Queue a thumbnail request. `completion` runs exactly once unless the
    /// request is cancelled first; it may run on the decoder thread or on the
    /// scheduler thread.
    pub fn request<F>(
        &self,
        params: ThumbnailParams,
        completion: F,
    ) -> Result<RequestHandle, RequestError>
    where
        F: FnOnce(Option<Picture>) + Send + 'static,
    {
        params.validate()?;
        let timeout = params.timeout;
        let job = ThumbnailJob::new(params, Box::new(completion), self.worker.probe_signal());
        let id = self.worker.push(Arc::clone(&job), timeout)?;
        debug!(
            request = %id,
            item = ?job.params().item.location(),
            seek = ?job.params().seek,
            fast = job.params().fast_seek,
            "thumbnail requested"
        );
        Ok(RequestHandle { id, job })
    }

    /// Like [`request`](Self::request), with the result delivered on a
    /// channel. The channel disconnects without a value if the request is
    /// cancelled.
    pub fn request_channel(
        &self,
        params: ThumbnailParams,
    ) -> Result<(RequestHandle, Receiver<Option<Picture>>), RequestError> {
        let (tx, rx) = bounded(1);
        let handle = self.request(params, move |picture| {
            let _ = tx.send(picture);
        })?;
        Ok((handle, rx))
    }

    /// No completion runs for `handle` once this returns.
    pub fn cancel(&self, handle: &RequestHandle) {
        handle.job.disarm();
        match self.worker.cancel(handle.id) {
            CancelOutcome::Dequeued => debug!(request = %handle.id, "cancelled before start"),
            CancelOutcome::Stopping => debug!(request = %handle.id, "cancelled while running"),
            CancelOutcome::NotFound => trace!(request = %handle.id, "cancel after completion"),
        }
    }

    pub fn subscribe(&self) -> Receiver<JobEvent> {
        self.worker.subscribe()
    }

    /// Requests queued or running.
    pub fn pending(&self) -> usize {
        self.worker.queued_len() + self.worker.active_len()
    }

    /// Stop everything outstanding; unresolved requests complete with `None`.
    pub fn release(mut self) {
        self.worker.shutdown();
    }
}

impl fmt::Debug for Thumbnailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thumbnailer")
            .field("worker", &self.worker)
            .finish()
    }
}

struct ThumbnailHandler {
    factory: Arc<dyn SessionFactory>,
}

struct ActiveRequest {
    job: Arc<ThumbnailJob>,
    session: Box<dyn DecodeSession>,
}

impl ThumbnailHandler {
    fn open(&self, job: &Arc<ThumbnailJob>) -> anyhow::Result<Box<dyn DecodeSession>> {
        let params = job.params();
        let sink_job = Arc::clone(job);
        let mut session = self
            .factory
            .create(
                &params.item,
                Box::new(move |event| sink_job.on_session_event(event)),
            )
            .with_context(|| format!("create decode session for {}", params.item.mrl()))?;
        session.set_seek(params.seek, params.fast_seek);
        session.start().context("start decode session")?;
        Ok(session)
    }
}

impl JobHandler for ThumbnailHandler {
    type Job = ThumbnailJob;
    type Running = ActiveRequest;

    fn start(&self, job: &Arc<ThumbnailJob>) -> anyhow::Result<ActiveRequest> {
        match self.open(job) {
            Ok(session) => Ok(ActiveRequest {
                job: Arc::clone(job),
                session,
            }),
            Err(err) => {
                job.resolve(None);
                Err(err)
            }
        }
    }

    fn probe(&self, running: &ActiveRequest) -> bool {
        running.job.is_done()
    }

    fn stop(&self, running: &mut ActiveRequest) {
        // Still armed here means the session never answered: timeout or shutdown.
        if running.job.resolve(None) {
            debug!(item = ?running.job.params().item.location(), "thumbnail request expired");
        }
        running.session.stop();
    }

    fn abandon(&self, job: &Arc<ThumbnailJob>) {
        job.resolve(None);
    }
}
