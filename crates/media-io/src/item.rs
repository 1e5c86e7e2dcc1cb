use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Shared handle to a playable media item.
///
/// Cloning retains the item, dropping releases it.
#[derive(Clone)]
pub struct MediaItem {
    inner: Arc<ItemInner>,
}

struct ItemInner {
    id: Option<i64>,
    location: PathBuf,
    title: String,
}

impl MediaItem {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        let location = location.into();
        let title = location
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_parts(None, location, title)
    }

    /// An item known to the media catalog under `id`.
    pub fn from_parts(
        id: Option<i64>,
        location: impl Into<PathBuf>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(ItemInner {
                id,
                location: location.into(),
                title: title.into(),
            }),
        }
    }

    pub fn id(&self) -> Option<i64> {
        self.inner.id
    }

    pub fn location(&self) -> &Path {
        &self.inner.location
    }

    pub fn title(&self) -> &str {
        &self.inner.title
    }

    pub fn mrl(&self) -> String {
        path_to_uri(&self.inner.location)
    }

    /// Number of live handles to this item.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for MediaItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaItem")
            .field("id", &self.inner.id)
            .field("location", &self.inner.location)
            .field("title", &self.inner.title)
            .finish()
    }
}

/// `file://` URI for a local path.
pub fn path_to_uri(path: &Path) -> String {
    let raw = path.to_string_lossy().replace('\\', "/");
    let encoded = utf8_percent_encode(&raw, PATH_SEGMENT).to_string();
    if encoded.starts_with('/') {
        format!("file://{encoded}")
    } else {
        format!("file:///{encoded}")
    }
}
