//! GPS position and capture time from EXIF.
//!
//! Extraction never fails towards the caller: unreadable files, missing EXIF
//! blocks and malformed tags all come back as "no data", with a log line.

use chrono::NaiveDateTime;
use exif::{Field, In, Reader, Tag, Value};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::errors::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMetadata {
    pub coordinate: Option<GeoPoint>,
    /// Capture time, interpreted as UTC.
    pub captured_at: Option<NaiveDateTime>,
}

pub trait MetadataSource: Send + Sync {
    fn extract(&self, path: &Path) -> ImageMetadata;
}

/// EXIF-backed [`MetadataSource`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ExifMetadata;

impl ExifMetadata {
    pub fn new() -> Self {
        Self
    }

    fn try_extract(&self, path: &Path) -> Result<ImageMetadata, PipelineError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let exif = match Reader::new().read_from_container(&mut reader) {
            Ok(exif) => exif,
            // no EXIF block at all is absence, not malformation
            Err(exif::Error::NotFound(_)) => return Ok(ImageMetadata::default()),
            Err(e) => {
                return Err(PipelineError::MalformedMetadata {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        };

        let coordinate = gps_coordinate(
            exif.get_field(Tag::GPSLatitude, In::PRIMARY),
            exif.get_field(Tag::GPSLatitudeRef, In::PRIMARY),
            exif.get_field(Tag::GPSLongitude, In::PRIMARY),
            exif.get_field(Tag::GPSLongitudeRef, In::PRIMARY),
        );

        let captured_at = exif
            .get_field(Tag::DateTimeOriginal, In::PRIMARY)
            .or_else(|| exif.get_field(Tag::DateTime, In::PRIMARY))
            .and_then(|field| ascii_value(&field.value))
            .and_then(|raw| {
                let parsed = parse_exif_datetime(&raw);
                if parsed.is_none() {
                    log::warn!("unparseable EXIF datetime {raw:?} in {}", path.display());
                }
                parsed
            });

        Ok(ImageMetadata {
            coordinate,
            captured_at,
        })
    }
}

impl MetadataSource for ExifMetadata {
    fn extract(&self, path: &Path) -> ImageMetadata {
        match self.try_extract(path) {
            Ok(meta) => meta,
            Err(e) => {
                log::warn!("metadata unavailable for {}: {e}", path.display());
                ImageMetadata::default()
            }
        }
    }
}

fn gps_coordinate(
    lat: Option<&Field>,
    lat_ref: Option<&Field>,
    lon: Option<&Field>,
    lon_ref: Option<&Field>,
) -> Option<GeoPoint> {
    let lat = dms_to_decimal(rationals(&lat?.value)?, &ascii_value(&lat_ref?.value)?)?;
    let lon = dms_to_decimal(rationals(&lon?.value)?, &ascii_value(&lon_ref?.value)?)?;
    Some(GeoPoint { lat, lon })
}

fn rationals(value: &Value) -> Option<Vec<(u32, u32)>> {
    match value {
        Value::Rational(v) => Some(v.iter().map(|r| (r.num, r.denom)).collect()),
        _ => None,
    }
}

fn ascii_value(value: &Value) -> Option<String> {
    match value {
        Value::Ascii(vec) => vec.first().map(|bytes| {
            String::from_utf8_lossy(bytes)
                .trim_end_matches('\0')
                .trim()
                .to_string()
        }),
        _ => None,
    }
}

/// Degrees/minutes/seconds rationals plus hemisphere ref to signed degrees.
pub fn dms_to_decimal(dms: Vec<(u32, u32)>, hemisphere: &str) -> Option<f64> {
    if dms.len() < 3 {
        return None;
    }

    let mut parts = [0f64; 3];
    for (slot, (num, denom)) in parts.iter_mut().zip(dms) {
        if denom == 0 {
            return None;
        }
        *slot = num as f64 / denom as f64;
    }

    let decimal = parts[0] + parts[1] / 60.0 + parts[2] / 3600.0;
    match hemisphere {
        "S" | "W" => Some(-decimal),
        _ => Some(decimal),
    }
}

/// Parse EXIF `YYYY:MM:DD HH:MM:SS`.
pub fn parse_exif_datetime(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), "%Y:%m:%d %H:%M:%S").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_dms_north_east() {
        let lat = dms_to_decimal(vec![(55, 1), (45, 1), (0, 1)], "N").unwrap();
        assert!((lat - 55.75).abs() < 1e-9);

        let lon = dms_to_decimal(vec![(37, 1), (36, 1), (3600, 100)], "E").unwrap();
        assert!((lon - (37.6 + 0.01)).abs() < 1e-9);
    }

    #[test]
    fn test_dms_south_west_negative() {
        let lat = dms_to_decimal(vec![(33, 1), (30, 1), (0, 1)], "S").unwrap();
        assert!((lat + 33.5).abs() < 1e-9);
        let lon = dms_to_decimal(vec![(70, 1), (0, 1), (0, 1)], "W").unwrap();
        assert!((lon + 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_dms_zero_denominator() {
        assert!(dms_to_decimal(vec![(1, 0), (0, 1), (0, 1)], "N").is_none());
        assert!(dms_to_decimal(vec![(1, 1)], "N").is_none());
    }

    #[test]
    fn test_parse_exif_datetime() {
        let dt = parse_exif_datetime("2023:12:25 14:30:45").unwrap();
        assert_eq!((dt.year(), dt.month(), dt.day()), (2023, 12, 25));
        assert_eq!((dt.hour(), dt.minute(), dt.second()), (14, 30, 45));

        assert!(parse_exif_datetime("2023-12-25").is_none());
    }

    #[test]
    fn test_missing_file_yields_no_data() {
        let meta = ExifMetadata::new().extract(Path::new("/non/existent/file.jpg"));
        assert_eq!(meta, ImageMetadata::default());
    }

    #[test]
    fn test_non_image_yields_no_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("no_exif.jpg");
        std::fs::write(&path, b"This is not an image file").unwrap();

        let meta = ExifMetadata::new().extract(&path);
        assert!(meta.coordinate.is_none());
        assert!(meta.captured_at.is_none());
    }
}
