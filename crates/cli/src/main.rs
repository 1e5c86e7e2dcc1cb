use anyhow::{bail, Context, Result};
use clap::Parser;
use media_io::FfmpegSessionFactory;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thumbnailer::{
    MediaItem, Picture, PictureType, SeekTarget, ThumbnailParams, Thumbnailer,
    THUMBNAIL_HEIGHT, THUMBNAIL_POSITION, THUMBNAIL_TIMEOUT, THUMBNAIL_WIDTH,
};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "thumbctl")]
#[command(about = "Generate thumbnails for media files")]
#[command(version)]
struct Cli {
    /// Media files to thumbnail
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Seek to a fraction of the duration (0.0 - 1.0)
    #[arg(long, conflicts_with = "time")]
    position: Option<f32>,

    /// Seek to an absolute time in seconds
    #[arg(long)]
    time: Option<f64>,

    /// Decode up to the exact frame instead of the nearest keyframe
    #[arg(long)]
    precise: bool,

    /// Give up on a file after this many milliseconds (0 waits forever)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Output format (jpg, png, argb)
    #[arg(long, value_parser = parse_format)]
    format: Option<PictureType>,

    /// Bounding box width
    #[arg(long)]
    width: Option<u32>,

    /// Bounding box height
    #[arg(long)]
    height: Option<u32>,

    /// Output directory; thumbnails go next to their input otherwise
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// JSON file with default settings
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

/// Defaults for every run, overridden by command-line flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct CliConfig {
    position: f32,
    fast_seek: bool,
    timeout_ms: Option<u64>,
    format: PictureType,
    width: u32,
    height: u32,
    out_dir: Option<PathBuf>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            position: THUMBNAIL_POSITION,
            fast_seek: true,
            timeout_ms: Some(THUMBNAIL_TIMEOUT.as_millis() as u64),
            format: PictureType::Jpg,
            width: THUMBNAIL_WIDTH,
            height: THUMBNAIL_HEIGHT,
            out_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Settings {
    seek: SeekTarget,
    fast_seek: bool,
    timeout: Option<Duration>,
    format: PictureType,
    width: u32,
    height: u32,
    out_dir: Option<PathBuf>,
}

impl Settings {
    fn resolve(cli: &Cli, config: CliConfig) -> Result<Self> {
        let seek = match cli.time {
            Some(secs) if !secs.is_finite() || secs < 0.0 => {
                bail!("--time must be a non-negative number of seconds, got {secs}")
            }
            Some(secs) => match Duration::try_from_secs_f64(secs) {
                Ok(time) => SeekTarget::Time(time),
                Err(e) => bail!("--time {secs} is out of range: {e}"),
            },
            None => SeekTarget::Position(cli.position.unwrap_or(config.position)),
        };
        Ok(Self {
            seek,
            fast_seek: config.fast_seek && !cli.precise,
            timeout: cli
                .timeout_ms
                .or(config.timeout_ms)
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            format: cli.format.unwrap_or(config.format),
            width: cli.width.unwrap_or(config.width),
            height: cli.height.unwrap_or(config.height),
            out_dir: cli.out.clone().or(config.out_dir),
        })
    }

    fn params(&self, file: &Path) -> ThumbnailParams {
        ThumbnailParams {
            item: MediaItem::new(file),
            seek: self.seek,
            fast_seek: self.fast_seek,
            timeout: self.timeout,
        }
    }

    fn output_path(&self, file: &Path) -> PathBuf {
        let ext = self.format.extension();
        match &self.out_dir {
            Some(dir) => {
                let stem = file
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "thumbnail".to_string());
                dir.join(format!("{stem}.{ext}"))
            }
            None => file.with_extension(format!("thumb.{ext}")),
        }
    }
}

fn parse_format(value: &str) -> Result<PictureType, String> {
    match value.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Ok(PictureType::Jpg),
        "png" => Ok(PictureType::Png),
        "argb" => Ok(PictureType::Argb),
        other => Err(format!("unknown format '{other}' (expected jpg, png or argb)")),
    }
}

fn load_config(path: Option<&Path>) -> Result<CliConfig> {
    let Some(path) = path else {
        return Ok(CliConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parse config {}", path.display()))
}

fn write_thumbnail(settings: &Settings, file: &Path, picture: &Picture) -> Result<PathBuf> {
    let out = picture
        .export(settings.format, settings.width, settings.height)
        .context("convert thumbnail")?;
    let path = settings.output_path(file);
    out.save(&path)
        .with_context(|| format!("write {}", path.display()))?;
    debug!(
        width = out.width(),
        height = out.height(),
        "saved {}",
        path.display()
    );
    Ok(path)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = load_config(cli.config.as_deref())?;
    let settings = Settings::resolve(&cli, config)?;
    if let Some(dir) = &settings.out_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create output directory {}", dir.display()))?;
    }

    let factory = FfmpegSessionFactory::locate().context("ffmpeg is required")?;
    let thumbnailer = Thumbnailer::new(Arc::new(factory))?;
    info!("Generating {} thumbnails", cli.files.len());

    let mut failures = 0usize;
    let mut pending = Vec::new();
    for file in &cli.files {
        if !file.exists() {
            warn!("File does not exist: {:?}", file);
            failures += 1;
            continue;
        }
        match thumbnailer.request_channel(settings.params(file)) {
            Ok((handle, rx)) => pending.push((file, handle, rx)),
            Err(e) => {
                warn!("Cannot request thumbnail for {}: {}", file.display(), e);
                failures += 1;
            }
        }
    }

    for (file, _handle, rx) in pending {
        match rx.recv().ok().flatten() {
            Some(picture) => match write_thumbnail(&settings, file, &picture) {
                Ok(path) => println!("{} -> {}", file.display(), path.display()),
                Err(e) => {
                    warn!("{}: {:#}", file.display(), e);
                    failures += 1;
                }
            },
            None => {
                warn!("No thumbnail for {}", file.display());
                failures += 1;
            }
        }
    }
    thumbnailer.release();

    if failures > 0 {
        bail!("{failures} of {} thumbnails failed", cli.files.len());
    }
    info!("Done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("thumbctl").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_match_the_library_thumbnail() {
        let settings = Settings::resolve(&parse(&["a.mkv"]), CliConfig::default()).unwrap();
        assert_eq!(settings.seek, SeekTarget::Position(THUMBNAIL_POSITION));
        assert!(settings.fast_seek);
        assert_eq!(settings.timeout, Some(THUMBNAIL_TIMEOUT));
        assert_eq!(settings.format, PictureType::Jpg);
        assert_eq!((settings.width, settings.height), (512, 320));
    }

    #[test]
    fn flags_override_config_file() {
        let config: CliConfig = serde_json::from_str(
            r#"{ "position": 0.5, "format": "png", "width": 160, "timeout_ms": 900 }"#,
        )
        .unwrap();
        assert_eq!(config.format, PictureType::Png);
        assert_eq!(config.height, THUMBNAIL_HEIGHT);

        let cli = parse(&[
            "--time",
            "2.5",
            "--precise",
            "--timeout-ms",
            "0",
            "--width",
            "64",
            "a.mkv",
        ]);
        let settings = Settings::resolve(&cli, config).unwrap();
        assert_eq!(settings.seek, SeekTarget::Time(Duration::from_millis(2500)));
        assert!(!settings.fast_seek);
        assert_eq!(settings.timeout, None);
        assert_eq!(settings.format, PictureType::Png);
        assert_eq!(settings.width, 64);
    }

    #[test]
    fn negative_time_is_rejected() {
        let cli = parse(&["--time=-1", "a.mkv"]);
        assert!(Settings::resolve(&cli, CliConfig::default()).is_err());
    }

    #[test]
    fn huge_time_is_rejected() {
        let cli = parse(&["--time", "1e30", "a.mkv"]);
        assert!(Settings::resolve(&cli, CliConfig::default()).is_err());
    }

    #[test]
    fn position_and_time_are_exclusive() {
        let err = Cli::try_parse_from(["thumbctl", "--position", "0.1", "--time", "3", "a.mkv"]);
        assert!(err.is_err());
    }

    #[test]
    fn format_names() {
        assert_eq!(parse_format("JPEG"), Ok(PictureType::Jpg));
        assert_eq!(parse_format("argb"), Ok(PictureType::Argb));
        assert!(parse_format("gif").is_err());
    }

    #[test]
    fn output_goes_next_to_input_or_into_out_dir() {
        let mut settings = Settings::resolve(&parse(&["a.mkv"]), CliConfig::default()).unwrap();
        assert_eq!(
            settings.output_path(Path::new("/clips/a.mkv")),
            PathBuf::from("/clips/a.thumb.jpg")
        );
        settings.out_dir = Some(PathBuf::from("/thumbs"));
        settings.format = PictureType::Png;
        assert_eq!(
            settings.output_path(Path::new("/clips/a.mkv")),
            PathBuf::from("/thumbs/a.png")
        );
    }

    #[test]
    fn config_file_is_loaded_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thumbctl.json");
        std::fs::write(&path, r#"{ "fast_seek": false, "out_dir": "/tmp/t" }"#).unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert!(!config.fast_seek);
        assert_eq!(config.out_dir, Some(PathBuf::from("/tmp/t")));
        assert!(load_config(Some(&dir.path().join("missing.json"))).is_err());
    }
}
