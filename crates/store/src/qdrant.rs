//! Remote vector store over qdrant's gRPC API.
//!
//! Point ids in qdrant must be integers or UUIDs, while CALM ids are
//! arbitrary strings (content hashes, commit shas, entry uuids). Each id is
//! therefore mapped to a deterministic v5 UUID and the original string is
//! mirrored into the reserved `__id` payload key, restored on every read.

use std::time::Duration;

use qdrant_client::qdrant::{
    point_id::PointIdOptions, vectors_output::VectorsOptions, Condition, CountPointsBuilder,
    CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter as QdrantFilter,
    GetPointsBuilder, PointId, PointStruct, PointsIdsList, Range, RetrievedPoint,
    ScrollPointsBuilder, SearchPointsBuilder, SetPayloadPointsBuilder, UpsertPointsBuilder,
    Value as QdrantValue, VectorParamsBuilder, VectorsOutput,
};
use qdrant_client::{Payload as QdrantPayload, Qdrant};
use serde_json::Value;
use uuid::Uuid;

use calm_schema::{CalmError, Result};

use crate::{
    FieldCondition, Filter, FilterOp, Payload, PointRecord, ScoredPoint, ScrollPage,
    StoredPoint, VectorStore,
};

/// Reserved payload key carrying the caller's original point id.
const ID_KEY: &str = "__id";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct QdrantStore {
    client: Qdrant,
}

impl QdrantStore {
    pub fn connect(url: &str) -> Result<Self> {
        let client = Qdrant::from_url(url)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| CalmError::Store(format!("connecting to qdrant at {url}: {err}")))?;
        Ok(Self { client })
    }

    fn point_id(id: &str) -> PointId {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, id.as_bytes())
            .to_string()
            .into()
    }
}

fn store_err(context: &str, err: impl std::fmt::Display) -> CalmError {
    CalmError::Store(format!("{context}: {err}"))
}

#[async_trait::async_trait]
impl VectorStore for QdrantStore {
    async fn create_collection(&self, name: &str, dim: usize) -> Result<bool> {
        let exists = self
            .client
            .collection_exists(name)
            .await
            .map_err(|err| store_err("checking collection", err))?;
        if exists {
            return Ok(true);
        }
        self.client
            .create_collection(
                CreateCollectionBuilder::new(name)
                    .vectors_config(VectorParamsBuilder::new(dim as u64, Distance::Cosine)),
            )
            .await
            .map_err(|err| store_err("creating collection", err))?;
        Ok(false)
    }

    async fn upsert(&self, collection: &str, point: PointRecord) -> Result<()> {
        let mut payload = point.payload;
        payload.insert(ID_KEY.to_string(), Value::String(point.id.clone()));
        let qdrant_payload = QdrantPayload::try_from(Value::Object(payload))
            .map_err(|err| store_err("encoding payload", err))?;
        let record = PointStruct::new(Self::point_id(&point.id), point.vector, qdrant_payload);
        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, vec![record]))
            .await
            .map_err(|err| store_err("upserting point", err))?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<ScoredPoint>> {
        let mut builder =
            SearchPointsBuilder::new(collection, query.to_vec(), limit as u64).with_payload(true);
        if let Some(filter) = filter {
            builder = builder.filter(to_qdrant_filter(filter));
        }
        let response = self
            .client
            .search_points(builder)
            .await
            .map_err(|err| store_err("searching", err))?;

        Ok(response
            .result
            .into_iter()
            .map(|hit| {
                let (id, payload) = restore_payload(hit.payload, hit.id);
                ScoredPoint { id, score: hit.score, payload }
            })
            .collect())
    }

    async fn scroll(
        &self,
        collection: &str,
        limit: usize,
        cursor: Option<&str>,
        filter: Option<&Filter>,
    ) -> Result<ScrollPage> {
        let mut builder = ScrollPointsBuilder::new(collection)
            .limit(limit as u32)
            .with_payload(true)
            .with_vectors(true);
        if let Some(cursor) = cursor {
            builder = builder.offset(PointId::from(cursor.to_string()));
        }
        if let Some(filter) = filter {
            builder = builder.filter(to_qdrant_filter(filter));
        }
        let response = self
            .client
            .scroll(builder)
            .await
            .map_err(|err| store_err("scrolling", err))?;

        let points = response.result.into_iter().map(restore_point).collect();
        let next_cursor = response.next_page_offset.and_then(point_id_string);
        Ok(ScrollPage { points, next_cursor })
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<StoredPoint>> {
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(collection, vec![Self::point_id(id)])
                    .with_payload(true)
                    .with_vectors(true),
            )
            .await
            .map_err(|err| store_err("getting point", err))?;
        Ok(response.result.into_iter().next().map(restore_point))
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(collection)
                    .points(PointsIdsList { ids: vec![Self::point_id(id)] }),
            )
            .await
            .map_err(|err| store_err("deleting point", err))?;
        Ok(())
    }

    async fn count(&self, collection: &str, filter: Option<&Filter>) -> Result<u64> {
        let mut builder = CountPointsBuilder::new(collection).exact(true);
        if let Some(filter) = filter {
            builder = builder.filter(to_qdrant_filter(filter));
        }
        let response = self
            .client
            .count(builder)
            .await
            .map_err(|err| store_err("counting", err))?;
        Ok(response.result.map(|r| r.count).unwrap_or(0))
    }

    async fn set_payload(&self, collection: &str, id: &str, patch: Payload) -> Result<()> {
        let qdrant_payload = QdrantPayload::try_from(Value::Object(patch))
            .map_err(|err| store_err("encoding payload patch", err))?;
        self.client
            .set_payload(
                SetPayloadPointsBuilder::new(collection, qdrant_payload)
                    .points_selector(PointsIdsList { ids: vec![Self::point_id(id)] }),
            )
            .await
            .map_err(|err| store_err("setting payload", err))?;
        Ok(())
    }
}

// ── Wire conversions ──────────────────────────────────────────────────────────

fn to_qdrant_filter(filter: &Filter) -> QdrantFilter {
    QdrantFilter::must(filter.conditions.iter().map(to_condition).collect::<Vec<_>>())
}

fn to_condition(condition: &FieldCondition) -> Condition {
    let field = condition.field.as_str();
    match &condition.op {
        FilterOp::Eq(value) => match value {
            Value::String(s) => Condition::matches(field, s.clone()),
            Value::Bool(b) => Condition::matches(field, *b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Condition::matches(field, i),
                None => Condition::range(
                    field,
                    Range { gte: n.as_f64(), lte: n.as_f64(), ..Default::default() },
                ),
            },
            other => Condition::matches(field, other.to_string()),
        },
        FilterOp::In(values) => {
            let keywords: Vec<String> = values
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            Condition::matches(field, keywords)
        }
        FilterOp::Gte(bound) => Condition::range(
            field,
            Range { gte: Some(*bound), ..Default::default() },
        ),
        FilterOp::Lte(bound) => Condition::range(
            field,
            Range { lte: Some(*bound), ..Default::default() },
        ),
        FilterOp::Range { gte, lte } => Condition::range(
            field,
            Range { gte: *gte, lte: *lte, ..Default::default() },
        ),
    }
}

fn restore_point(point: RetrievedPoint) -> StoredPoint {
    let vector = vector_data(point.vectors);
    let (id, payload) = restore_payload(point.payload, point.id);
    StoredPoint { id, vector, payload }
}

/// Pull the original string id back out of the payload, falling back to the
/// qdrant point id for points written by other writers.
fn restore_payload(
    raw: std::collections::HashMap<String, QdrantValue>,
    point_id: Option<PointId>,
) -> (String, Payload) {
    let mut payload: Payload = raw
        .into_iter()
        .map(|(k, v)| (k, qdrant_value_to_json(v)))
        .collect();
    let id = match payload.remove(ID_KEY) {
        Some(Value::String(id)) => id,
        _ => point_id.and_then(point_id_string).unwrap_or_default(),
    };
    (id, payload)
}

fn point_id_string(id: PointId) -> Option<String> {
    match id.point_id_options {
        Some(PointIdOptions::Uuid(uuid)) => Some(uuid),
        Some(PointIdOptions::Num(num)) => Some(num.to_string()),
        None => None,
    }
}

fn vector_data(vectors: Option<VectorsOutput>) -> Vec<f32> {
    match vectors.and_then(|v| v.vectors_options) {
        Some(VectorsOptions::Vector(vector)) => vector.data,
        _ => Vec::new(),
    }
}

fn qdrant_value_to_json(value: QdrantValue) -> Value {
    use qdrant_client::qdrant::value::Kind;
    match value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::IntegerValue(i)) => Value::from(i),
        Some(Kind::DoubleValue(d)) => serde_json::Number::from_f64(d)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::ListValue(list)) => {
            Value::Array(list.values.into_iter().map(qdrant_value_to_json).collect())
        }
        Some(Kind::StructValue(fields)) => Value::Object(
            fields
                .fields
                .into_iter()
                .map(|(k, v)| (k, qdrant_value_to_json(v)))
                .collect(),
        ),
    }
}
