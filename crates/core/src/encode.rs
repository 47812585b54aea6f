use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Command;

use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

use crate::domain::{ArtifactKind, MediaKind};
use crate::error::{Error, Result};

/// What to produce from one source file.
#[derive(Debug, Clone)]
pub struct EncodeRequest<'a> {
    pub source: &'a Path,
    pub media: MediaKind,
    pub artifact: ArtifactKind,
    /// Longest edge of the output, in pixels. Sources already inside the box keep their size.
    pub max_dimension: u32,
    pub quality: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedArtifact {
    pub bytes: Vec<u8>,
    /// File extension of the produced container, without the dot.
    pub extension: &'static str,
}

/// Turns a source file into artifact bytes. Implementations must be
/// callable from many worker threads at once.
pub trait Encoder: Send + Sync {
    fn encode(&self, request: &EncodeRequest<'_>) -> Result<EncodedArtifact>;
}

/// Images through the `image` crate (lossless WebP), videos through `ffmpeg`.
pub struct DefaultEncoder {
    ffmpeg: PathBuf,
}

impl DefaultEncoder {
    pub fn new() -> Self {
        Self::with_ffmpeg(PathBuf::from("ffmpeg"))
    }

    pub fn with_ffmpeg(ffmpeg: PathBuf) -> Self {
        Self { ffmpeg }
    }

    fn encode_image(&self, source: &Path, max_dimension: u32) -> Result<EncodedArtifact> {
        let img = image::open(source)?;
        encode_webp(fit_within(img, max_dimension))
    }

    fn video_thumbnail(&self, source: &Path, max_dimension: u32) -> Result<EncodedArtifact> {
        let frame = tempfile::Builder::new()
            .prefix(".frame")
            .suffix(".png")
            .tempfile()?;

        self.run_ffmpeg(
            source,
            &[
                "-ss", "1",
                "-i", &source.to_string_lossy(),
                "-vframes", "1",
                "-y", &frame.path().to_string_lossy(),
            ],
        )?;

        let img = image::open(frame.path())?;
        encode_webp(fit_within(img, max_dimension))
    }

    fn transcode_video(
        &self,
        source: &Path,
        max_dimension: u32,
        quality: u8,
    ) -> Result<EncodedArtifact> {
        let output = tempfile::Builder::new()
            .prefix(".transcode")
            .suffix(".mp4")
            .tempfile()?;

        let scale = format!(
            "scale='min({m},iw)':'min({m},ih)':force_original_aspect_ratio=decrease,\
             scale=trunc(iw/2)*2:trunc(ih/2)*2",
            m = max_dimension
        );
        let crf = crf_for_quality(quality).to_string();

        self.run_ffmpeg(
            source,
            &[
                "-i", &source.to_string_lossy(),
                "-vf", &scale,
                "-c:v", "libx264",
                "-preset", "medium",
                "-crf", &crf,
                "-c:a", "aac",
                "-b:a", "128k",
                "-movflags", "+faststart",
                "-y", &output.path().to_string_lossy(),
            ],
        )?;

        Ok(EncodedArtifact {
            bytes: std::fs::read(output.path())?,
            extension: "mp4",
        })
    }

    fn run_ffmpeg(&self, source: &Path, args: &[&str]) -> Result<()> {
        let output = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error"])
            .args(args)
            .output()
            .map_err(|e| Error::Encode {
                path: source.to_path_buf(),
                message: if e.kind() == std::io::ErrorKind::NotFound {
                    format!("{} not found; install ffmpeg to process videos", self.ffmpeg.display())
                } else {
                    format!("failed to run ffmpeg: {e}")
                },
            })?;

        if !output.status.success() {
            return Err(Error::Encode {
                path: source.to_path_buf(),
                message: format!(
                    "ffmpeg failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

impl Default for DefaultEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for DefaultEncoder {
    fn encode(&self, request: &EncodeRequest<'_>) -> Result<EncodedArtifact> {
        tracing::debug!(
            source = %request.source.display(),
            kind = %request.artifact,
            "encoding"
        );
        match (request.media, request.artifact) {
            (MediaKind::Image, _) => self.encode_image(request.source, request.max_dimension),
            (MediaKind::Video, ArtifactKind::Thumbnail) => {
                self.video_thumbnail(request.source, request.max_dimension)
            }
            (MediaKind::Video, ArtifactKind::Optimized) => {
                self.transcode_video(request.source, request.max_dimension, request.quality)
            }
        }
    }
}

/// Shrink into a `max` x `max` box with Lanczos3, never upscale.
fn fit_within(img: DynamicImage, max: u32) -> DynamicImage {
    if max == 0 || (img.width() <= max && img.height() <= max) {
        return img;
    }
    img.resize(max, max, FilterType::Lanczos3)
}

fn encode_webp(img: DynamicImage) -> Result<EncodedArtifact> {
    // The WebP encoder only takes 8-bit RGB(A).
    let img = if img.color().has_alpha() {
        DynamicImage::ImageRgba8(img.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(img.to_rgb8())
    };

    let mut bytes = Vec::new();
    img.write_with_encoder(WebPEncoder::new_lossless(Cursor::new(&mut bytes)))?;
    Ok(EncodedArtifact {
        bytes,
        extension: "webp",
    })
}

/// Map 0-100 quality onto an x264 CRF (85 -> 23).
fn crf_for_quality(quality: u8) -> u8 {
    18 + (100 - quality.min(100)) / 3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
        let path = dir.join(name);
        image::RgbImage::from_fn(w, h, |x, y| image::Rgb([(x % 256) as u8, (y % 256) as u8, 90]))
            .save(&path)
            .unwrap();
        path
    }

    fn request(source: &Path, artifact: ArtifactKind, max: u32) -> EncodeRequest<'_> {
        EncodeRequest {
            source,
            media: MediaKind::Image,
            artifact,
            max_dimension: max,
            quality: 85,
        }
    }

    #[test]
    fn test_image_is_downscaled_into_box() {
        let tmp = tempfile::tempdir().unwrap();
        let src = write_png(tmp.path(), "wide.png", 400, 200);

        let out = DefaultEncoder::new()
            .encode(&request(&src, ArtifactKind::Thumbnail, 100))
            .unwrap();
        assert_eq!(out.extension, "webp");

        let decoded = image::load_from_memory(&out.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (100, 50));
    }

    #[test]
    fn test_small_image_is_not_upscaled() {
        let tmp = tempfile::tempdir().unwrap();
        let src = write_png(tmp.path(), "small.png", 30, 20);

        let out = DefaultEncoder::new()
            .encode(&request(&src, ArtifactKind::Optimized, 1920))
            .unwrap();
        let decoded = image::load_from_memory(&out.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (30, 20));
    }

    #[test]
    fn test_corrupt_image_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("bad.jpg");
        std::fs::write(&src, b"not an image").unwrap();

        assert!(DefaultEncoder::new()
            .encode(&request(&src, ArtifactKind::Optimized, 100))
            .is_err());
    }

    #[test]
    fn test_missing_ffmpeg_is_encode_error() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("clip.mp4");
        std::fs::write(&src, b"fake video").unwrap();

        let encoder = DefaultEncoder::with_ffmpeg(PathBuf::from("/nonexistent/ffmpeg"));
        let err = encoder
            .encode(&EncodeRequest {
                source: &src,
                media: MediaKind::Video,
                artifact: ArtifactKind::Optimized,
                max_dimension: 1920,
                quality: 85,
            })
            .unwrap_err();
        assert!(matches!(err, Error::Encode { .. }));
    }

    #[test]
    fn test_crf_for_quality() {
        assert_eq!(crf_for_quality(85), 23);
        assert_eq!(crf_for_quality(100), 18);
        assert_eq!(crf_for_quality(0), 51);
    }
}
