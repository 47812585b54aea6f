use std::fs;
use std::io::BufReader;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};

use crate::domain::{MediaDescriptor, MediaKind};
use crate::error::Result;
use crate::hasher;

/// Hash and inspect one file. Decoding problems leave dimensions at 0x0 and
/// the capture time empty; only a failure to read the file is an error.
pub fn describe(path: &Path, kind: MediaKind) -> Result<MediaDescriptor> {
    let meta = fs::metadata(path)?;
    let fingerprint = hasher::fingerprint_file(path)?;

    let (width, height, captured_at) = match kind {
        MediaKind::Image => {
            let (w, h) = image::image_dimensions(path).unwrap_or((0, 0));
            (w, h, capture_time(path))
        }
        MediaKind::Video => (0, 0, None),
    };

    Ok(MediaDescriptor {
        fingerprint,
        path: path.to_path_buf(),
        size: meta.len(),
        width,
        height,
        captured_at,
        modified_at: modified_secs(&meta),
        kind,
    })
}

/// Modification time in whole seconds since the epoch (0 when unavailable).
pub fn modified_secs(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// EXIF `DateTimeOriginal`, falling back to `DateTime`.
pub fn capture_time(path: &Path) -> Option<NaiveDateTime> {
    let file = fs::File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;

    [exif::Tag::DateTimeOriginal, exif::Tag::DateTime]
        .into_iter()
        .find_map(|tag| {
            let field = exif.get_field(tag, exif::In::PRIMARY)?;
            match field.value {
                exif::Value::Ascii(ref values) => values.first().and_then(|v| parse_exif_ascii(v)),
                _ => None,
            }
        })
}

fn parse_exif_ascii(raw: &[u8]) -> Option<NaiveDateTime> {
    let dt = exif::DateTime::from_ascii(raw).ok()?;
    NaiveDate::from_ymd_opt(dt.year as i32, dt.month as u32, dt.day as u32)?.and_hms_opt(
        dt.hour as u32,
        dt.minute as u32,
        dt.second as u32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_parse_exif_ascii_valid() {
        let dt = parse_exif_ascii(b"2024:01:15 12:30:45").unwrap();
        assert_eq!((dt.year(), dt.month(), dt.day()), (2024, 1, 15));
        assert_eq!((dt.hour(), dt.minute(), dt.second()), (12, 30, 45));
    }

    #[test]
    fn test_parse_exif_ascii_rejects_garbage() {
        assert!(parse_exif_ascii(b"not a date").is_none());
        assert!(parse_exif_ascii(b"2024:13:40 25:00:00").is_none());
    }

    #[test]
    fn test_describe_png_reads_dimensions() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pic.png");
        image::RgbImage::from_fn(40, 20, |x, y| image::Rgb([x as u8, y as u8, 7]))
            .save(&path)
            .unwrap();

        let d = describe(&path, MediaKind::Image).unwrap();
        assert_eq!((d.width, d.height), (40, 20));
        assert_eq!(d.size, fs::metadata(&path).unwrap().len());
        assert_eq!(d.fingerprint, hasher::fingerprint_file(&path).unwrap());
        assert!(d.captured_at.is_none());
        assert!(d.modified_at > 0);
    }

    #[test]
    fn test_describe_corrupt_image_still_yields_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("broken.jpg");
        fs::write(&path, b"definitely not a jpeg").unwrap();

        let d = describe(&path, MediaKind::Image).unwrap();
        assert_eq!((d.width, d.height), (0, 0));
        assert_eq!(d.size, 21);
    }

    #[test]
    fn test_describe_video_has_no_dimensions() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("clip.mp4");
        fs::write(&path, b"\x00\x00\x00\x18ftypmp42").unwrap();

        let d = describe(&path, MediaKind::Video).unwrap();
        assert_eq!(d.kind, MediaKind::Video);
        assert_eq!((d.width, d.height), (0, 0));
    }

    #[test]
    fn test_describe_missing_file_is_error() {
        assert!(describe(Path::new("/nonexistent/x.jpg"), MediaKind::Image).is_err());
    }
}
