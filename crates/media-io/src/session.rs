//! Decode sessions: one seek-and-grab pipeline per thumbnail request.
//!
//! A started session delivers exactly one [`SessionEvent`] through its
//! [`EventSink`] unless it is stopped first. Dropping a session closes it.

use parking_lot::Mutex;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::probe::{ffprobe_command, parse_probe_output};
use crate::{MediaItem, Picture, ProbeError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeekTarget {
    Time(Duration),
    /// Fraction of the media duration, in `[0, 1]`.
    Position(f32),
}

#[derive(Debug)]
pub enum SessionEvent {
    ThumbnailReady(Picture),
    Error(String),
}

/// Receives the terminal event of a session. Being `FnOnce`, it can only ever
/// see one.
pub type EventSink = Box<dyn FnOnce(SessionEvent) + Send>;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("ffmpeg not found on PATH; please install FFmpeg")]
    FfmpegMissing,
    #[error("media not found: {0}")]
    MissingMedia(PathBuf),
    #[error("session already started")]
    AlreadyStarted,
    #[error("session stopped")]
    Stopped,
    #[error("cannot resolve seek position: {0}")]
    Seek(String),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("decode failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub trait DecodeSession: Send {
    /// Must be called before `start`.
    fn set_seek(&mut self, seek: SeekTarget, fast: bool);

    fn start(&mut self) -> Result<(), DecodeError>;

    /// Request early termination. Safe to call repeatedly and after the
    /// terminal event; no event is delivered once this returns. Blocks while
    /// an event is being delivered.
    fn stop(&mut self);
}

pub trait SessionFactory: Send + Sync {
    fn create(
        &self,
        item: &MediaItem,
        sink: EventSink,
    ) -> Result<Box<dyn DecodeSession>, DecodeError>;
}

/// Sessions that grab a single frame with an `ffmpeg` child process.
/// `ffprobe` is only needed for [`SeekTarget::Position`].
#[derive(Debug, Clone)]
pub struct FfmpegSessionFactory {
    ffmpeg: PathBuf,
    ffprobe: Option<PathBuf>,
}

impl FfmpegSessionFactory {
    pub fn locate() -> Result<Self, DecodeError> {
        let ffmpeg = which::which("ffmpeg").map_err(|_| DecodeError::FfmpegMissing)?;
        debug!("using ffmpeg at {}", ffmpeg.display());
        Ok(Self::with_binary(ffmpeg))
    }

    pub fn with_binary(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: which::which("ffprobe").ok(),
        }
    }

    pub fn with_ffprobe(mut self, ffprobe: impl Into<PathBuf>) -> Self {
        self.ffprobe = Some(ffprobe.into());
        self
    }

    fn open(&self, path: PathBuf, sink: EventSink) -> FfmpegSession {
        FfmpegSession {
            grab: Grab {
                ffmpeg: self.ffmpeg.clone(),
                ffprobe: self.ffprobe.clone(),
                path,
                seek: SeekTarget::Time(Duration::ZERO),
                fast: false,
                child: Arc::new(Mutex::new(None)),
                stopped: Arc::new(AtomicBool::new(false)),
            },
            sink: Some(sink),
            worker: None,
        }
    }
}

impl SessionFactory for FfmpegSessionFactory {
    fn create(
        &self,
        item: &MediaItem,
        sink: EventSink,
    ) -> Result<Box<dyn DecodeSession>, DecodeError> {
        let path = item.location().to_path_buf();
        if !path.exists() {
            return Err(DecodeError::MissingMedia(path));
        }
        Ok(Box::new(self.open(path, sink)))
    }
}

struct FfmpegSession {
    grab: Grab,
    sink: Option<EventSink>,
    worker: Option<thread::JoinHandle<()>>,
}

impl DecodeSession for FfmpegSession {
    fn set_seek(&mut self, seek: SeekTarget, fast: bool) {
        if self.worker.is_some() {
            warn!("seek ignored on a started session");
            return;
        }
        self.grab.seek = seek;
        self.grab.fast = fast;
    }

    fn start(&mut self) -> Result<(), DecodeError> {
        let sink = self.sink.take().ok_or(DecodeError::AlreadyStarted)?;
        let grab = self.grab.clone();
        let worker = thread::Builder::new()
            .name("thumb-session".into())
            .spawn(move || grab.run(sink))?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        let mut child = self.grab.child.lock();
        self.grab.stopped.store(true, Ordering::SeqCst);
        if let Some(child) = child.as_mut() {
            let _ = child.kill();
        }
    }
}

impl Drop for FfmpegSession {
    fn drop(&mut self) {
        // The grab thread exits on its own once the child is gone.
        self.stop();
    }
}

/// State shared between a session and its grab thread. `child` holds
/// whichever process is running (ffprobe, then ffmpeg) and also serializes
/// event delivery against `stop`.
#[derive(Clone)]
struct Grab {
    ffmpeg: PathBuf,
    ffprobe: Option<PathBuf>,
    path: PathBuf,
    seek: SeekTarget,
    fast: bool,
    child: Arc<Mutex<Option<Child>>>,
    stopped: Arc<AtomicBool>,
}

impl Grab {
    fn run(self, sink: EventSink) {
        let outcome = self.capture();
        let _delivery = self.child.lock();
        if self.stopped.load(Ordering::SeqCst) {
            trace!("session for {} stopped, dropping result", self.path.display());
            return;
        }
        match outcome {
            Ok(picture) => sink(SessionEvent::ThumbnailReady(picture)),
            Err(e) => {
                debug!("thumbnail grab failed for {}: {e}", self.path.display());
                sink(SessionEvent::Error(e.to_string()))
            }
        }
    }

    fn capture(&self) -> Result<Picture, DecodeError> {
        let seconds = self.resolve_seek()?;
        let ss = format!("{:.3}", seconds.max(0.0));

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-v", "error", "-nostdin"]);
        // Input seeking snaps to the nearest keyframe; output seeking decodes
        // up to the exact timestamp.
        if self.fast {
            cmd.arg("-ss").arg(&ss).arg("-i").arg(&self.path);
        } else {
            cmd.arg("-i").arg(&self.path).arg("-ss").arg(&ss);
        }
        cmd.args(["-frames:v", "1", "-f", "image2pipe", "-vcodec", "png", "-"]);

        let png = self.run_child("ffmpeg", cmd)?;
        if png.is_empty() {
            return Err(DecodeError::Failed(format!(
                "no frame at {ss}s in {}",
                self.path.display()
            )));
        }
        Picture::decode(&png).map_err(|e| DecodeError::Failed(e.to_string()))
    }

    /// Run `cmd` to completion and return its stdout. The process sits in
    /// `child` meanwhile so that `stop` can kill it.
    fn run_child(&self, name: &str, mut cmd: Command) -> Result<Vec<u8>, DecodeError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = cmd.spawn()?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| DecodeError::Failed(format!("{name} stdout unavailable")))?;
        {
            let mut slot = self.child.lock();
            if self.stopped.load(Ordering::SeqCst) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(DecodeError::Stopped);
            }
            *slot = Some(child);
        }

        let mut out = Vec::new();
        let read = stdout.read_to_end(&mut out);
        let finished = self.child.lock().take();
        let status = match finished {
            Some(mut child) => Some(child.wait()?),
            None => None,
        };
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DecodeError::Stopped);
        }
        read?;

        match status {
            Some(status) if !status.success() => Err(DecodeError::Failed(format!(
                "{name} exited with {status}"
            ))),
            _ => Ok(out),
        }
    }

    fn resolve_seek(&self) -> Result<f64, DecodeError> {
        match self.seek {
            SeekTarget::Time(t) => Ok(t.as_secs_f64()),
            SeekTarget::Position(pos) if pos <= 0.0 => Ok(0.0),
            SeekTarget::Position(pos) => {
                let ffprobe = self.ffprobe.as_ref().ok_or(ProbeError::FfprobeMissing)?;
                let json = self.run_child("ffprobe", ffprobe_command(ffprobe, &self.path))?;
                let info = parse_probe_output(&json)?;
                info.seek_time(pos).ok_or_else(|| {
                    DecodeError::Seek(format!("unknown duration for {}", self.path.display()))
                })
            }
        }
    }
}
