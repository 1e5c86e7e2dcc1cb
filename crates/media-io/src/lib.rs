mod item;
mod picture;
mod probe;
mod session;

pub use item::{path_to_uri, MediaItem};
pub use picture::{Picture, PictureError, PictureType};
pub use probe::ProbeError;
pub use session::{
    DecodeError, DecodeSession, EventSink, FfmpegSessionFactory, SeekTarget, SessionEvent,
    SessionFactory,
};
