use image::{imageops::FilterType, DynamicImage, ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PictureType {
    /// Uncompressed, 4 bytes per pixel in A, R, G, B order.
    Argb,
    Png,
    Jpg,
}

impl PictureType {
    pub fn extension(self) -> &'static str {
        match self {
            PictureType::Argb => "argb",
            PictureType::Png => "png",
            PictureType::Jpg => "jpg",
        }
    }
}

#[derive(Debug, Error)]
pub enum PictureError {
    #[error("picture has no pixels")]
    Empty,
    #[error("buffer holds {actual} bytes, {width}x{height} ARGB needs {expected}")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("image codec error: {0}")]
    Codec(#[from] image::ImageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reference-counted picture.
///
/// Cloning retains the picture; the buffer is freed when the last clone is
/// dropped.
#[derive(Clone)]
pub struct Picture {
    inner: Arc<PictureData>,
}

struct PictureData {
    ty: PictureType,
    width: u32,
    height: u32,
    buffer: Vec<u8>,
}

impl Picture {
    /// Build an ARGB picture from tightly packed RGBA pixels.
    pub fn from_rgba(width: u32, height: u32, mut rgba: Vec<u8>) -> Result<Self, PictureError> {
        if width == 0 || height == 0 {
            return Err(PictureError::Empty);
        }
        let expected = width as usize * height as usize * 4;
        if rgba.len() != expected {
            return Err(PictureError::BufferSize {
                width,
                height,
                expected,
                actual: rgba.len(),
            });
        }
        for px in rgba.chunks_exact_mut(4) {
            px.rotate_right(1);
        }
        Ok(Self::wrap(PictureType::Argb, width, height, rgba))
    }

    /// Decode an encoded still (PNG, JPEG) into an ARGB picture.
    pub fn decode(bytes: &[u8]) -> Result<Self, PictureError> {
        let rgba = image::load_from_memory(bytes)?.to_rgba8();
        let (width, height) = rgba.dimensions();
        Self::from_rgba(width, height, rgba.into_raw())
    }

    fn wrap(ty: PictureType, width: u32, height: u32, buffer: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(PictureData {
                ty,
                width,
                height,
                buffer,
            }),
        }
    }

    pub fn picture_type(&self) -> PictureType {
        self.inner.ty
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn buffer(&self) -> &[u8] {
        &self.inner.buffer
    }

    /// Bytes per line. Only meaningful for uncompressed pictures.
    pub fn stride(&self) -> Option<usize> {
        match self.inner.ty {
            PictureType::Argb => Some(self.inner.width as usize * 4),
            PictureType::Png | PictureType::Jpg => None,
        }
    }

    /// Convert to `ty`, scaled to fit inside `width`x`height` with the aspect
    /// ratio kept. A zero dimension is derived from the other one; both zero
    /// keeps the current size.
    pub fn export(&self, ty: PictureType, width: u32, height: u32) -> Result<Self, PictureError> {
        let rgba = self.to_rgba()?;
        let (w, h) = fit_within(rgba.width(), rgba.height(), width, height);
        let rgba = if (w, h) == rgba.dimensions() {
            rgba
        } else {
            image::imageops::resize(&rgba, w, h, FilterType::Triangle)
        };

        match ty {
            PictureType::Argb => Self::from_rgba(w, h, rgba.into_raw()),
            PictureType::Png => {
                let buffer = encode(DynamicImage::ImageRgba8(rgba), ImageFormat::Png)?;
                Ok(Self::wrap(ty, w, h, buffer))
            }
            PictureType::Jpg => {
                // JPEG has no alpha channel.
                let rgb = DynamicImage::ImageRgba8(rgba).to_rgb8();
                let buffer = encode(DynamicImage::ImageRgb8(rgb), ImageFormat::Jpeg)?;
                Ok(Self::wrap(ty, w, h, buffer))
            }
        }
    }

    /// Write the buffer as-is.
    pub fn save(&self, path: &Path) -> Result<(), PictureError> {
        std::fs::write(path, &self.inner.buffer)?;
        Ok(())
    }

    fn to_rgba(&self) -> Result<RgbaImage, PictureError> {
        let data = &self.inner;
        match data.ty {
            PictureType::Argb => {
                let mut raw = data.buffer.clone();
                for px in raw.chunks_exact_mut(4) {
                    px.rotate_left(1);
                }
                RgbaImage::from_raw(data.width, data.height, raw).ok_or(PictureError::BufferSize {
                    width: data.width,
                    height: data.height,
                    expected: data.width as usize * data.height as usize * 4,
                    actual: data.buffer.len(),
                })
            }
            PictureType::Png | PictureType::Jpg => {
                Ok(image::load_from_memory(&data.buffer)?.to_rgba8())
            }
        }
    }
}

impl fmt::Debug for Picture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Picture")
            .field("type", &self.inner.ty)
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("bytes", &self.inner.buffer.len())
            .finish()
    }
}

fn encode(img: DynamicImage, format: ImageFormat) -> Result<Vec<u8>, PictureError> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format)?;
    Ok(out.into_inner())
}

fn fit_within(width: u32, height: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    let (w, h) = (width as f64, height as f64);
    let scale = match (max_w, max_h) {
        (0, 0) => return (width, height),
        (0, max_h) => max_h as f64 / h,
        (max_w, 0) => max_w as f64 / w,
        (max_w, max_h) => (max_w as f64 / w).min(max_h as f64 / h),
    };
    let w = (w * scale).round().max(1.0) as u32;
    let h = (h * scale).round().max(1.0) as u32;
    (w, h)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(width: u32, height: u32) -> Picture {
        let mut rgba = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                let on = (x + y) % 2 == 0;
                rgba.extend_from_slice(if on { &[255, 0, 0, 255] } else { &[0, 0, 255, 128] });
            }
        }
        Picture::from_rgba(width, height, rgba).unwrap()
    }

    #[test]
    fn rgba_is_stored_as_argb() {
        let pic = Picture::from_rgba(1, 1, vec![10, 20, 30, 40]).unwrap();
        assert_eq!(pic.picture_type(), PictureType::Argb);
        assert_eq!(pic.buffer(), &[40, 10, 20, 30]);
        assert_eq!(pic.stride(), Some(4));
    }

    #[test]
    fn rejects_mismatched_buffer() {
        let err = Picture::from_rgba(2, 2, vec![0; 15]).unwrap_err();
        assert!(matches!(
            err,
            PictureError::BufferSize {
                expected: 16,
                actual: 15,
                ..
            }
        ));
        assert!(matches!(
            Picture::from_rgba(0, 4, Vec::new()),
            Err(PictureError::Empty)
        ));
    }

    #[test]
    fn fit_keeps_aspect_ratio() {
        assert_eq!(fit_within(1920, 1080, 512, 320), (512, 288));
        assert_eq!(fit_within(1080, 1920, 512, 320), (180, 320));
        assert_eq!(fit_within(640, 480, 0, 240), (320, 240));
        assert_eq!(fit_within(640, 480, 320, 0), (320, 240));
        assert_eq!(fit_within(640, 480, 0, 0), (640, 480));
        assert_eq!(fit_within(100, 10, 5, 5), (5, 1));
    }

    #[test]
    fn export_png_decodes_back() {
        let pic = checker(64, 32);
        let png = pic.export(PictureType::Png, 32, 32).unwrap();
        assert_eq!(png.picture_type(), PictureType::Png);
        assert_eq!((png.width(), png.height()), (32, 16));
        assert_eq!(png.stride(), None);
        assert!(png.buffer().starts_with(b"\x89PNG"));

        let back = Picture::decode(png.buffer()).unwrap();
        assert_eq!((back.width(), back.height()), (32, 16));
    }

    #[test]
    fn export_jpg_drops_alpha() {
        let jpg = checker(16, 16).export(PictureType::Jpg, 0, 0).unwrap();
        assert_eq!(jpg.picture_type(), PictureType::Jpg);
        assert_eq!((jpg.width(), jpg.height()), (16, 16));
        assert!(jpg.buffer().starts_with(&[0xFF, 0xD8]));
    }

    #[test]
    fn export_argb_keeps_pixels() {
        let pic = checker(4, 4);
        let same = pic.export(PictureType::Argb, 0, 0).unwrap();
        assert_eq!(same.buffer(), pic.buffer());
    }

    #[test]
    fn save_writes_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thumb.png");
        let png = checker(8, 8).export(PictureType::Png, 0, 0).unwrap();
        png.save(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), png.buffer());
    }
}
