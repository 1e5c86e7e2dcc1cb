//! Thumbnails for media catalog entries.

use media_io::{path_to_uri, MediaItem, PictureError, PictureType};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::{RequestError, ThumbnailParams, Thumbnailer};

/// Where in the media the frame is taken, as a fraction of its duration.
pub const THUMBNAIL_POSITION: f32 = 0.3;
pub const THUMBNAIL_TIMEOUT: Duration = Duration::from_secs(3);
pub const THUMBNAIL_WIDTH: u32 = 512;
pub const THUMBNAIL_HEIGHT: u32 = 320;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("{0} has no catalog id")]
    MissingId(PathBuf),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("no thumbnail could be taken from {0}")]
    NoThumbnail(String),
    #[error("cannot write thumbnail: {0}")]
    Picture(#[from] PictureError),
    #[error("cannot create thumbnail directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct GeneratedThumbnail {
    pub path: PathBuf,
    /// `file://` URI of `path`, as stored in the catalog.
    pub mrl: String,
    pub width: u32,
    pub height: u32,
}

pub fn default_thumbnail_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("thumbnailer").join("thumbnails")
}

/// Synchronous thumbnail generation for catalog entries, written as
/// `<dir>/<media id>.jpg`.
#[derive(Debug)]
pub struct MediaThumbnailer {
    thumbnailer: Thumbnailer,
    dir: PathBuf,
}

impl MediaThumbnailer {
    pub fn new(thumbnailer: Thumbnailer, dir: impl Into<PathBuf>) -> Self {
        Self {
            thumbnailer,
            dir: dir.into(),
        }
    }

    pub fn with_default_dir(thumbnailer: Thumbnailer) -> Self {
        Self::new(thumbnailer, default_thumbnail_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn thumbnailer(&self) -> &Thumbnailer {
        &self.thumbnailer
    }

    /// Blocks until the thumbnail is written or the request fails.
    pub fn generate(&self, item: &MediaItem) -> Result<GeneratedThumbnail, GenerateError> {
        let id = item
            .id()
            .ok_or_else(|| GenerateError::MissingId(item.location().to_path_buf()))?;

        let params = ThumbnailParams::at_position(item.clone(), THUMBNAIL_POSITION)
            .fast_seek(true)
            .timeout(THUMBNAIL_TIMEOUT);
        let (_request, rx) = self.thumbnailer.request_channel(params)?;
        let picture = rx
            .recv()
            .ok()
            .flatten()
            .ok_or_else(|| GenerateError::NoThumbnail(item.title().to_string()))?;
        debug!(
            media = id,
            width = picture.width(),
            height = picture.height(),
            "thumbnail captured"
        );

        let jpeg = picture.export(PictureType::Jpg, THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT)?;
        std::fs::create_dir_all(&self.dir).map_err(|source| GenerateError::Directory {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.dir.join(format!("{id}.jpg"));
        jpeg.save(&path)?;
        info!("thumbnail for media {id} written to {}", path.display());

        Ok(GeneratedThumbnail {
            mrl: path_to_uri(&path),
            path,
            width: jpeg.width(),
            height: jpeg.height(),
        })
    }
}
