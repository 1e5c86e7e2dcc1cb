//! Asynchronous thumbnail requests.
//!
//! A [`Thumbnailer`] runs one decode session at a time. Each request resolves
//! exactly once with `Some(picture)` or `None` (failure, timeout, decode
//! error), unless it is cancelled, in which case it never resolves.

mod library;
mod request;
mod thumbnailer;

pub use library::{
    default_thumbnail_dir, GenerateError, GeneratedThumbnail, MediaThumbnailer,
    THUMBNAIL_HEIGHT, THUMBNAIL_POSITION, THUMBNAIL_TIMEOUT, THUMBNAIL_WIDTH,
};
pub use request::{Completion, RequestError, RequestHandle, ThumbnailParams};
pub use thumbnailer::{Thumbnailer, ThumbnailerError};

pub use jobs::{JobEvent, JobId, JobStatus};
pub use media_io::{MediaItem, Picture, PictureType, SeekTarget};
