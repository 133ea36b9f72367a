//! Query embedding, filter construction and result mapping.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::ContentCache;
use crate::embedding::{Embedder, EmbeddingError};
use crate::errors::PipelineError;
use crate::reference::{ImageReference, S3_SCHEME};
use crate::store::{Field, FieldRange, RecordFilter, ScoredRecord, VectorStore};

pub const DEFAULT_TOP_K: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Text(String),
    Image(ImageReference),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl GeoBounds {
    /// All four bounds must be present and finite; anything less means no
    /// geo filter at all.
    pub fn from_parts(
        min_lat: Option<f64>,
        max_lat: Option<f64>,
        min_lon: Option<f64>,
        max_lon: Option<f64>,
    ) -> Option<Self> {
        let bounds = GeoBounds {
            min_lat: min_lat?,
            max_lat: max_lat?,
            min_lon: min_lon?,
            max_lon: max_lon?,
        };
        let finite = [bounds.min_lat, bounds.max_lat, bounds.min_lon, bounds.max_lon]
            .iter()
            .all(|v| v.is_finite());
        finite.then_some(bounds)
    }
}

/// Search request as accepted over HTTP.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    #[serde(alias = "text")]
    pub query: String,
    /// Treat `query` as an image reference instead of text.
    #[serde(default)]
    pub image: bool,
    pub min_lat: Option<f64>,
    pub max_lat: Option<f64>,
    pub min_lon: Option<f64>,
    pub max_lon: Option<f64>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    pub start_datetime: Option<String>,
    pub end_datetime: Option<String>,
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

impl SearchRequest {
    pub fn to_query(&self) -> Result<Query, PipelineError> {
        if self.image {
            Ok(Query::Image(self.query.parse()?))
        } else {
            Ok(Query::Text(self.query.clone()))
        }
    }

    pub fn geo_bounds(&self) -> Option<GeoBounds> {
        GeoBounds::from_parts(self.min_lat, self.max_lat, self.min_lon, self.max_lon)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub display_url: String,
    pub source: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub score: f32,
    pub date: Option<[u32; 3]>,
    pub time: Option<[u32; 3]>,
}

/// Parse a time bound into epoch seconds (UTC).
///
/// A bare date gets 00:00:00 for a start bound and 23:59:59 for an end
/// bound. Blank input is no bound; malformed input is logged and dropped.
pub fn parse_time_bound(raw: &str, end_of_day: bool) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let time = if end_of_day {
            NaiveTime::from_hms_opt(23, 59, 59)
        } else {
            NaiveTime::from_hms_opt(0, 0, 0)
        }?;
        return Some(date.and_time(time).and_utc().timestamp());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp());
    }

    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt.and_utc().timestamp());
        }
    }

    log::warn!("[search] ignoring malformed datetime bound {raw:?}");
    None
}

pub fn build_filter(geo: Option<GeoBounds>, start: Option<i64>, end: Option<i64>) -> RecordFilter {
    let mut must = Vec::new();

    if let Some(geo) = geo {
        must.push(FieldRange::between(Field::Lat, geo.min_lat, geo.max_lat));
        must.push(FieldRange::between(Field::Lon, geo.min_lon, geo.max_lon));
    }
    if let Some(start) = start {
        must.push(FieldRange {
            field: Field::Timestamp,
            gte: Some(start as f64),
            lte: None,
        });
    }
    if let Some(end) = end {
        must.push(FieldRange {
            field: Field::Timestamp,
            gte: None,
            lte: Some(end as f64),
        });
    }

    RecordFilter { must }
}

/// Maps stored sources to something a browser can load.
#[derive(Debug, Clone)]
pub struct DisplayUrls {
    local_base: PathBuf,
    template: String,
}

impl DisplayUrls {
    pub fn new(local_base: impl Into<PathBuf>, template: &str) -> Self {
        Self {
            local_base: local_base.into(),
            template: template.to_string(),
        }
    }

    /// Sources under the local base become relative paths, `s3://` sources
    /// go through the public URL template, anything else is unchanged.
    pub fn display_url(&self, source: &str) -> String {
        if !self.local_base.as_os_str().is_empty() {
            if let Ok(rest) = Path::new(source).strip_prefix(&self.local_base) {
                return rest.to_string_lossy().to_string();
            }
        }

        if let Some(rest) = source.strip_prefix(S3_SCHEME) {
            if let Some((bucket, key)) = rest.split_once('/') {
                return self
                    .template
                    .replace("{bucket}", bucket)
                    .replace("{key}", key);
            }
        }

        source.to_string()
    }
}

pub struct SearchEngine {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    cache: Arc<ContentCache>,
    urls: DisplayUrls,
    embed_timeout: Duration,
    store_timeout: Duration,
}

impl SearchEngine {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        cache: Arc<ContentCache>,
        urls: DisplayUrls,
        embed_timeout: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            store,
            cache,
            urls,
            embed_timeout,
            store_timeout,
        }
    }

    async fn embed_query(&self, query: &Query) -> Result<Vec<f32>, PipelineError> {
        let embedder = self.embedder.clone();
        let (task, resolved) = match query {
            Query::Text(text) => {
                let texts = vec![text.clone()];
                let task = tokio::task::spawn_blocking(move || embedder.encode_texts(&texts));
                (task, None)
            }
            Query::Image(reference) => {
                let resolved = self.cache.resolve(reference).await?;
                let paths = vec![resolved.path.clone()];
                let task = tokio::task::spawn_blocking(move || embedder.encode_images(&paths));
                (task, Some(resolved))
            }
        };

        let vectors = tokio::time::timeout(self.embed_timeout, task).await;
        // query images stay cached
        if let Some(resolved) = &resolved {
            self.cache.release(resolved, false);
        }

        let vectors = vectors.map_err(|_| PipelineError::Timeout {
            operation: "query embedding",
            secs: self.embed_timeout.as_secs(),
        })???;

        vectors.into_iter().next().ok_or_else(|| {
            EmbeddingError::EmbeddingFailed("no embedding returned for query".to_string()).into()
        })
    }

    pub async fn search(
        &self,
        query: &Query,
        top_k: usize,
        geo: Option<GeoBounds>,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<SearchHit>, PipelineError> {
        let vector = self.embed_query(query).await?;

        let filter = build_filter(
            geo,
            start.and_then(|s| parse_time_bound(s, false)),
            end.and_then(|s| parse_time_bound(s, true)),
        );
        log::debug!("[search] top {top_k} with {} conditions", filter.must.len());

        let hits = tokio::time::timeout(
            self.store_timeout,
            self.store.search(vector, &filter, top_k),
        )
        .await
        .map_err(|_| PipelineError::Timeout {
            operation: "vector search",
            secs: self.store_timeout.as_secs(),
        })??;

        Ok(hits.into_iter().map(|hit| self.to_hit(hit)).collect())
    }

    pub async fn search_request(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, PipelineError> {
        self.search(
            &request.to_query()?,
            request.top_k,
            request.geo_bounds(),
            request.start_datetime.as_deref(),
            request.end_datetime.as_deref(),
        )
        .await
    }

    fn to_hit(&self, hit: ScoredRecord) -> SearchHit {
        SearchHit {
            display_url: self.urls.display_url(&hit.payload.source),
            id: hit.id,
            lat: hit.payload.lat,
            lon: hit.payload.lon,
            score: hit.score,
            date: hit.payload.date,
            time: hit.payload.time,
            source: hit.payload.source,
        }
    }
}
