use async_trait::async_trait;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, value::Kind, Condition, CountPointsBuilder,
    CreateCollectionBuilder, DeleteCollectionBuilder, Distance, Filter, GetPointsBuilder, PointId, PointStruct, Range,
    SearchPointsBuilder, UpsertPointsBuilder, Value, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use std::collections::HashMap;

use super::{
    ImageRecord, RecordFilter, RecordPayload, ScoredRecord, StoreError, VectorStore,
};

/// Qdrant-backed store for one collection with cosine distance.
pub struct QdrantStore {
    client: Qdrant,
    collection: String,
    dimensions: u64,
}

impl QdrantStore {
    pub fn connect(url: &str, collection: &str, dimensions: usize) -> Result<Self, StoreError> {
        let client = Qdrant::from_url(url).build().map_err(backend)?;
        Ok(Self {
            client,
            collection: collection.to_string(),
            dimensions: dimensions as u64,
        })
    }
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn to_filter(filter: &RecordFilter) -> Filter {
    Filter::must(filter.must.iter().map(|range| {
        Condition::range(
            range.field.as_str(),
            Range {
                gte: range.gte,
                lte: range.lte,
                ..Default::default()
            },
        )
    }))
}

fn point_id_string(id: Option<PointId>) -> String {
    match id.and_then(|id| id.point_id_options) {
        Some(PointIdOptions::Uuid(uuid)) => uuid,
        Some(PointIdOptions::Num(num)) => num.to_string(),
        None => String::new(),
    }
}

fn value_to_json(value: Value) -> serde_json::Value {
    match value.kind {
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::IntegerValue(i)) => serde_json::Value::from(i),
        Some(Kind::DoubleValue(d)) => serde_json::Value::from(d),
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.into_iter().map(value_to_json).collect())
        }
        Some(Kind::StructValue(st)) => serde_json::Value::Object(
            st.fields
                .into_iter()
                .map(|(k, v)| (k, value_to_json(v)))
                .collect(),
        ),
        Some(Kind::NullValue(_)) | None => serde_json::Value::Null,
    }
}

fn decode_payload(payload: HashMap<String, Value>) -> Result<RecordPayload, StoreError> {
    let object: serde_json::Map<String, serde_json::Value> = payload
        .into_iter()
        .map(|(k, v)| (k, value_to_json(v)))
        .collect();
    serde_json::from_value(serde_json::Value::Object(object))
        .map_err(|e| StoreError::Payload(e.to_string()))
}

fn encode_payload(payload: &RecordPayload) -> Result<Payload, StoreError> {
    let json = serde_json::to_value(payload).map_err(|e| StoreError::Payload(e.to_string()))?;
    Payload::try_from(json).map_err(|e| StoreError::Payload(e.to_string()))
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self) -> Result<(), StoreError> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(backend)?;
        if exists {
            log::info!("using existing collection {}", self.collection);
            return Ok(());
        }

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(VectorParamsBuilder::new(self.dimensions, Distance::Cosine)),
            )
            .await
            .map_err(backend)?;
        log::info!(
            "created collection {} ({} dims, cosine)",
            self.collection,
            self.dimensions
        );
        Ok(())
    }

    async fn upsert(&self, records: Vec<ImageRecord>) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let points = records
            .into_iter()
            .map(|r| Ok(PointStruct::new(r.id, r.vector, encode_payload(&r.payload)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn search(
        &self,
        vector: Vec<f32>,
        filter: &RecordFilter,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>, StoreError> {
        let mut request =
            SearchPointsBuilder::new(&self.collection, vector, limit as u64).with_payload(true);
        if !filter.is_empty() {
            request = request.filter(to_filter(filter));
        }

        let response = self.client.search_points(request).await.map_err(backend)?;

        response
            .result
            .into_iter()
            .map(|point| {
                Ok(ScoredRecord {
                    id: point_id_string(point.id),
                    score: point.score,
                    payload: decode_payload(point.payload)?,
                })
            })
            .collect()
    }

    async fn get(&self, id: &str) -> Result<Option<RecordPayload>, StoreError> {
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(&self.collection, vec![PointId::from(id.to_string())])
                    .with_payload(true),
            )
            .await
            .map_err(backend)?;

        response
            .result
            .into_iter()
            .next()
            .map(|point| decode_payload(point.payload))
            .transpose()
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let response = self
            .client
            .count(CountPointsBuilder::new(&self.collection).exact(true))
            .await
            .map_err(backend)?;
        Ok(response.result.map(|r| r.count).unwrap_or(0))
    }

    async fn delete_collection(&self) -> Result<(), StoreError> {
        self.client
            .delete_collection(DeleteCollectionBuilder::new(&self.collection))
            .await
            .map_err(backend)?;
        log::info!("deleted collection {}", self.collection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Field, FieldRange};

    #[test]
    fn test_payload_round_trips_through_qdrant_values() {
        let payload = RecordPayload {
            source: "s3://b/k.jpg".to_string(),
            lat: Some(55.75),
            lon: Some(37.0),
            timestamp: Some(1_700_000_000),
            date: Some([2023, 11, 14]),
            time: Some([22, 13, 20]),
        };

        let encoded: HashMap<String, Value> = encode_payload(&payload).unwrap().into();
        assert_eq!(decode_payload(encoded).unwrap(), payload);
    }

    #[test]
    fn test_point_id_string() {
        let uuid = "4d0b9a43-4b8e-5a77-9b0c-0f2a1f1d5e11".to_string();
        assert_eq!(point_id_string(Some(PointId::from(uuid.clone()))), uuid);
        assert_eq!(point_id_string(Some(PointId::from(7u64))), "7");
        assert_eq!(point_id_string(None), "");
    }

    #[test]
    fn test_filter_conditions() {
        let filter = RecordFilter {
            must: vec![
                FieldRange::between(Field::Lat, 10.0, 20.0),
                FieldRange {
                    field: Field::Timestamp,
                    gte: Some(0.0),
                    lte: None,
                },
            ],
        };
        assert_eq!(to_filter(&filter).must.len(), 2);
    }
}
