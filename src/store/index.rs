//! In-memory vector index with cosine similarity search.

use std::cmp::Ordering;
use std::collections::HashMap;

use super::{ImageRecord, RecordFilter, RecordPayload, ScoredRecord};

/// An entry in the vector index.
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub embedding: Vec<f32>,
    pub payload: RecordPayload,
}

/// Embeddings keyed by record id, with payload-filtered search.
pub struct VectorIndex {
    entries: HashMap<String, VectorEntry>,
    dimensions: usize,
}

impl VectorIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: HashMap::new(),
            dimensions,
        }
    }

    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Insert or overwrite an entry.
    ///
    /// Returns an error if the embedding has zero norm (cannot be normalized).
    pub fn insert(&mut self, record: ImageRecord) -> Result<(), IndexError> {
        if record.vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: record.vector.len(),
            });
        }

        if Self::l2_norm(&record.vector) < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        self.entries.insert(
            record.id,
            VectorEntry {
                embedding: record.vector,
                payload: record.payload,
            },
        );

        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&VectorEntry> {
        self.entries.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VectorEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Results sorted by score (highest first), ties broken by id.
    pub fn search(
        &self,
        query: &[f32],
        filter: &RecordFilter,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        let query_norm = Self::l2_norm(query);
        if query_norm < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        let mut results: Vec<ScoredRecord> = self
            .entries
            .iter()
            .filter(|(_, entry)| filter.matches(&entry.payload))
            .map(|(id, entry)| ScoredRecord {
                id: id.clone(),
                score: Self::cosine_similarity(query, &entry.embedding, query_norm),
                payload: entry.payload.clone(),
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        results.truncate(limit);

        Ok(results)
    }

    fn l2_norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    fn cosine_similarity(query: &[f32], target: &[f32], query_norm: f32) -> f32 {
        let target_norm = Self::l2_norm(target);
        if target_norm < f32::EPSILON {
            return 0.0;
        }

        let dot_product: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
        dot_product / (query_norm * target_norm)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Field, FieldRange};

    fn record(id: &str, vector: Vec<f32>, lat: Option<f64>) -> ImageRecord {
        ImageRecord {
            id: id.to_string(),
            vector,
            payload: RecordPayload {
                source: format!("{id}.jpg"),
                lat,
                lon: lat,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_insert_overwrites_same_id() {
        let mut index = VectorIndex::new(3);
        index.insert(record("a", vec![1.0, 0.0, 0.0], None)).unwrap();
        index.insert(record("a", vec![0.0, 1.0, 0.0], Some(1.0))).unwrap();

        assert_eq!(index.len(), 1);
        let entry = index.get("a").unwrap();
        assert_eq!(entry.embedding, vec![0.0, 1.0, 0.0]);
        assert_eq!(entry.payload.lat, Some(1.0));
    }

    #[test]
    fn test_insert_dimension_mismatch() {
        let mut index = VectorIndex::new(3);
        let result = index.insert(record("a", vec![1.0, 0.0, 0.0, 0.0], None));
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_insert_zero_norm_rejected() {
        let mut index = VectorIndex::new(3);
        let result = index.insert(record("a", vec![0.0, 0.0, 0.0], None));
        assert!(matches!(result, Err(IndexError::ZeroNormVector)));
    }

    #[test]
    fn test_search_orders_by_score() {
        let mut index = VectorIndex::new(3);
        index.insert(record("x", vec![1.0, 0.0, 0.0], None)).unwrap();
        index.insert(record("y", vec![0.0, 1.0, 0.0], None)).unwrap();

        let results = index
            .search(&[1.0, 0.1, 0.0], &RecordFilter::default(), 10)
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "x");
        assert!(results[0].score > results[1].score);
    }

    #[test]
    fn test_search_ties_broken_by_id() {
        let mut index = VectorIndex::new(2);
        for id in ["c", "a", "b"] {
            index.insert(record(id, vec![1.0, 0.0], None)).unwrap();
        }

        let ids: Vec<String> = index
            .search(&[1.0, 0.0], &RecordFilter::default(), 2)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_search_applies_filter() {
        let mut index = VectorIndex::new(2);
        index.insert(record("in", vec![1.0, 0.0], Some(15.0))).unwrap();
        index.insert(record("out", vec![1.0, 0.0], Some(30.0))).unwrap();
        index.insert(record("none", vec![1.0, 0.0], None)).unwrap();

        let filter = RecordFilter {
            must: vec![FieldRange::between(Field::Lat, 10.0, 20.0)],
        };
        let results = index.search(&[1.0, 0.0], &filter, 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "in");
    }

    #[test]
    fn test_search_dimension_mismatch() {
        let index = VectorIndex::new(3);
        let result = index.search(&[1.0], &RecordFilter::default(), 1);
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
    }
}
