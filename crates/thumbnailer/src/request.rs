use jobs::{AdmissionError, JobId, ProbeSignal};
use media_io::{MediaItem, Picture, SeekTarget, SessionEvent};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Invoked once with the thumbnail, or `None` when the request failed or
/// timed out. Runs with the request's lock held: it must not cancel its own
/// request, and must not drop or release the last handle to its
/// [`Thumbnailer`](crate::Thumbnailer), since shutdown waits on that lock.
pub type Completion = Box<dyn FnOnce(Option<Picture>) + Send>;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("seek position {0} is outside [0, 1]")]
    InvalidPosition(f32),
    #[error("request rejected: {0}")]
    Admission(#[from] AdmissionError),
}

#[derive(Debug, Clone)]
pub struct ThumbnailParams {
    pub item: MediaItem,
    pub seek: SeekTarget,
    /// Approximate (keyframe) seeking instead of an exact one.
    pub fast_seek: bool,
    /// `None` waits as long as the decoder takes.
    pub timeout: Option<Duration>,
}

impl ThumbnailParams {
    pub fn at_time(item: MediaItem, time: Duration) -> Self {
        Self {
            item,
            seek: SeekTarget::Time(time),
            fast_seek: false,
            timeout: None,
        }
    }

    pub fn at_position(item: MediaItem, position: f32) -> Self {
        Self {
            item,
            seek: SeekTarget::Position(position),
            fast_seek: false,
            timeout: None,
        }
    }

    pub fn fast_seek(mut self, fast: bool) -> Self {
        self.fast_seek = fast;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), RequestError> {
        match self.seek {
            SeekTarget::Position(pos) if !(0.0..=1.0).contains(&pos) => {
                Err(RequestError::InvalidPosition(pos))
            }
            _ => Ok(()),
        }
    }
}

/// Pool-side record of one request.
pub(crate) struct ThumbnailJob {
    params: ThumbnailParams,
    completion: Mutex<Option<Completion>>,
    // Written with `completion` locked; read lock-free by the scheduler.
    done: AtomicBool,
    probe: ProbeSignal,
}

impl ThumbnailJob {
    pub(crate) fn new(
        params: ThumbnailParams,
        completion: Completion,
        probe: ProbeSignal,
    ) -> Arc<Self> {
        Arc::new(Self {
            params,
            completion: Mutex::new(Some(completion)),
            done: AtomicBool::new(false),
            probe,
        })
    }

    pub(crate) fn params(&self) -> &ThumbnailParams {
        &self.params
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Terminal event from the decode session.
    pub(crate) fn on_session_event(&self, event: SessionEvent) {
        let picture = match event {
            SessionEvent::ThumbnailReady(picture) => Some(picture),
            SessionEvent::Error(reason) => {
                debug!(item = ?self.params.item.location(), "thumbnail decode failed: {reason}");
                None
            }
        };
        self.resolve(picture);
        self.probe.request_probe();
    }

    /// Mark the request done and hand `picture` to the completion if it is
    /// still armed. Returns whether the completion ran.
    pub(crate) fn resolve(&self, picture: Option<Picture>) -> bool {
        let mut completion = self.completion.lock();
        let fired = match completion.take() {
            Some(complete) => {
                complete(picture);
                true
            }
            None => false,
        };
        self.done.store(true, Ordering::Release);
        fired
    }

    /// Disarm the completion. Blocks while a completion is running.
    pub(crate) fn disarm(&self) {
        self.completion.lock().take();
    }
}

/// Identifies a submitted request. Holding it keeps the media item alive;
/// cancelling or querying it after completion is harmless.
#[derive(Clone)]
pub struct RequestHandle {
    pub(crate) id: JobId,
    pub(crate) job: Arc<ThumbnailJob>,
}

impl RequestHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn item(&self) -> &MediaItem {
        &self.job.params.item
    }

    pub fn is_done(&self) -> bool {
        self.job.is_done()
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("item", &self.job.params.item)
            .field("seek", &self.job.params.seek)
            .finish()
    }
}
