//! Vector store access.
//!
//! # Architecture
//!
//! - `index`: in-memory cosine index with payload range filtering
//! - `storage`: binary file I/O for the local backend
//! - `local`: [`VectorStore`] over `index` + `storage`
//! - `qdrant`: [`VectorStore`] over a Qdrant server

use async_trait::async_trait;
use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::metadata::ImageMetadata;

mod index;
mod local;
mod qdrant;
mod storage;

pub use index::{IndexError, VectorIndex};
pub use local::LocalStore;
pub use qdrant::QdrantStore;
pub use storage::{VectorStorage, VectorStorageError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("collection {0} does not exist")]
    MissingCollection(String),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("storage error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("payload error: {0}")]
    Payload(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Scalar fields stored next to each vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPayload {
    /// Serialized logical image reference.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    /// Epoch seconds, UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// `[year, month, day]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<[u32; 3]>,
    /// `[hour, minute, second]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<[u32; 3]>,
}

impl RecordPayload {
    /// Coordinates and calendar fields always come in complete groups.
    pub fn new(source: String, meta: &ImageMetadata) -> Self {
        let (lat, lon) = match meta.coordinate {
            Some(point) => (Some(point.lat), Some(point.lon)),
            None => (None, None),
        };

        let mut payload = Self {
            source,
            lat,
            lon,
            ..Default::default()
        };
        if let Some(at) = meta.captured_at {
            payload.set_time(at);
        }
        payload
    }

    fn set_time(&mut self, at: NaiveDateTime) {
        let at = at.and_utc();
        self.timestamp = Some(at.timestamp());
        self.date = Some([at.year() as u32, at.month(), at.day()]);
        self.time = Some([at.hour(), at.minute(), at.second()]);
    }

    fn field(&self, field: Field) -> Option<f64> {
        match field {
            Field::Lat => self.lat,
            Field::Lon => self.lon,
            Field::Timestamp => self.timestamp.map(|ts| ts as f64),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: RecordPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Lat,
    Lon,
    Timestamp,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Lat => "lat",
            Field::Lon => "lon",
            Field::Timestamp => "timestamp",
        }
    }
}

/// Inclusive range on one payload field. An absent field never matches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldRange {
    pub field: Field,
    pub gte: Option<f64>,
    pub lte: Option<f64>,
}

impl FieldRange {
    pub fn between(field: Field, gte: f64, lte: f64) -> Self {
        Self {
            field,
            gte: Some(gte),
            lte: Some(lte),
        }
    }

    pub fn matches(&self, payload: &RecordPayload) -> bool {
        let Some(value) = payload.field(self.field) else {
            return false;
        };
        self.gte.map_or(true, |min| value >= min) && self.lte.map_or(true, |max| value <= max)
    }
}

/// Conjunction of field ranges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub must: Vec<FieldRange>,
}

impl RecordFilter {
    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }

    pub fn matches(&self, payload: &RecordPayload) -> bool {
        self.must.iter().all(|range| range.matches(payload))
    }
}

#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub id: String,
    pub score: f32,
    pub payload: RecordPayload,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if absent. An existing one is reused as-is.
    async fn ensure_collection(&self) -> Result<(), StoreError>;

    /// Insert or overwrite by id.
    async fn upsert(&self, records: Vec<ImageRecord>) -> Result<(), StoreError>;

    /// Up to `limit` hits by descending score.
    async fn search(
        &self,
        vector: Vec<f32>,
        filter: &RecordFilter,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<RecordPayload>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    async fn delete_collection(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::GeoPoint;
    use chrono::NaiveDate;

    fn payload_at(lat: f64, lon: f64) -> RecordPayload {
        RecordPayload {
            source: "a.jpg".to_string(),
            lat: Some(lat),
            lon: Some(lon),
            ..Default::default()
        }
    }

    #[test]
    fn test_payload_from_metadata() {
        let meta = ImageMetadata {
            coordinate: Some(GeoPoint { lat: 55.7, lon: 37.6 }),
            captured_at: NaiveDate::from_ymd_opt(2024, 1, 2)
                .and_then(|d| d.and_hms_opt(3, 4, 5)),
        };

        let payload = RecordPayload::new("s3://b/k.jpg".to_string(), &meta);
        assert_eq!(payload.lat, Some(55.7));
        assert_eq!(payload.lon, Some(37.6));
        assert_eq!(payload.timestamp, Some(1704164645));
        assert_eq!(payload.date, Some([2024, 1, 2]));
        assert_eq!(payload.time, Some([3, 4, 5]));
    }

    #[test]
    fn test_payload_without_metadata_serializes_source_only() {
        let payload = RecordPayload::new("x.png".to_string(), &ImageMetadata::default());
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, serde_json::json!({"source": "x.png"}));
    }

    #[test]
    fn test_range_inclusive_and_absent_field() {
        let range = FieldRange::between(Field::Lat, 10.0, 20.0);
        assert!(range.matches(&payload_at(10.0, 0.0)));
        assert!(range.matches(&payload_at(20.0, 0.0)));
        assert!(!range.matches(&payload_at(20.5, 0.0)));

        let no_coords = RecordPayload::default();
        assert!(!range.matches(&no_coords));
    }

    #[test]
    fn test_filter_is_conjunction() {
        let filter = RecordFilter {
            must: vec![
                FieldRange::between(Field::Lat, 0.0, 10.0),
                FieldRange::between(Field::Lon, 0.0, 0.0),
            ],
        };
        assert!(filter.matches(&payload_at(5.0, 0.0)));
        assert!(!filter.matches(&payload_at(5.0, 1.0)));
        assert!(RecordFilter::default().matches(&RecordPayload::default()));
    }
}
