//! Centroid-validated values.
//!
//! A value is a short principle distilled by the calling agent from an
//! experience cluster. The store only accepts text whose embedding lies
//! within the cluster's centroid neighborhood: at most `mean + 0.5·std` of
//! the members' own centroid distances. Validation and storage are split so
//! the agent can iterate on wording; `store` requires a preceding successful
//! `validate` with the exact same text.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::info;

use calm_embedding::EmbeddingRegistry;
use calm_schema::collections::{ghap_collection, VALUES};
use calm_schema::value::parse_cluster_id;
use calm_schema::{Axis, CalmError, EmbedRole, Result, ValueRecord};
use calm_store::{scroll_all, Filter, Payload, PointRecord, StoredPoint, VectorStore};

use crate::cluster::{cluster_label_field, l2_normalize, tier_weight, weighted_centroid};

/// Outcome of a validation attempt.
#[derive(Debug, Clone)]
pub struct Validation {
    pub valid: bool,
    pub distance: f32,
    pub threshold: f32,
    pub reason: Option<String>,
}

pub struct ValueStore {
    store: Arc<dyn VectorStore>,
    registry: EmbeddingRegistry,
    /// Validation decisions awaiting a matching `store` call, keyed by
    /// sha256(text, cluster_id).
    validated: Mutex<HashMap<String, (f32, f32)>>,
}

impl ValueStore {
    pub fn new(store: Arc<dyn VectorStore>, registry: EmbeddingRegistry) -> Self {
        Self { store, registry, validated: Mutex::new(HashMap::new()) }
    }

    /// Check candidate text against the named cluster's weighted centroid.
    pub async fn validate(&self, text: &str, cluster_id: &str) -> Result<Validation> {
        let (axis, label) = parse_cluster_id(cluster_id).ok_or_else(|| {
            CalmError::validation(format!(
                "malformed cluster id '{cluster_id}', expected '{{axis}}:{{label}}:{{uuid}}'"
            ))
        })?;

        let members = self.cluster_members(axis, label).await?;
        if members.is_empty() {
            return Err(CalmError::EmptyCluster(format!(
                "cluster '{cluster_id}' has no members; labels may be stale after a re-cluster"
            )));
        }

        let weighted: Vec<(Vec<f32>, f32)> = members
            .iter()
            .map(|p| (l2_normalize(&p.vector), tier_weight(&p.payload)))
            .collect();
        let centroid = weighted_centroid(&weighted);

        let member_distances: Vec<f32> = weighted
            .iter()
            .map(|(vector, _)| cosine_distance(vector, &centroid))
            .collect();
        let mean = member_distances.iter().sum::<f32>() / member_distances.len() as f32;
        let variance = member_distances
            .iter()
            .map(|d| (d - mean) * (d - mean))
            .sum::<f32>()
            / member_distances.len() as f32;
        let threshold = mean + 0.5 * variance.sqrt();

        let candidate = self.registry.embed_one(EmbedRole::Semantic, text).await?;
        let distance = cosine_distance(&l2_normalize(&candidate), &centroid);
        let valid = distance <= threshold;

        if valid {
            let mut validated = self.validated.lock().await;
            validated.insert(decision_key(text, cluster_id), (distance, threshold));
        }

        Ok(Validation {
            valid,
            distance,
            threshold,
            reason: (!valid).then(|| {
                format!(
                    "candidate sits {distance:.4} from the centroid, beyond the member threshold {threshold:.4}"
                )
            }),
        })
    }

    /// Persist a value whose text already passed `validate` for this cluster.
    pub async fn store(&self, text: &str, cluster_id: &str) -> Result<ValueRecord> {
        let (axis, _) = parse_cluster_id(cluster_id).ok_or_else(|| {
            CalmError::validation(format!("malformed cluster id '{cluster_id}'"))
        })?;

        let decision = {
            let validated = self.validated.lock().await;
            validated.get(&decision_key(text, cluster_id)).copied()
        };
        let (distance, threshold) = decision.ok_or_else(|| {
            CalmError::InvalidState(
                "store_value requires a preceding successful validate_value with the same text"
                    .to_string(),
            )
        })?;

        let record = ValueRecord {
            id: ValueRecord::new_id(),
            text: text.to_string(),
            axis,
            cluster_id: cluster_id.to_string(),
            validated_at: Utc::now(),
            distance_to_centroid: distance,
            threshold,
        };

        let vector = self.registry.embed_one(EmbedRole::Semantic, text).await?;
        let mut payload = Payload::new();
        payload.insert("text".into(), json!(record.text));
        payload.insert("axis".into(), json!(record.axis.as_str()));
        payload.insert("cluster_id".into(), json!(record.cluster_id));
        payload.insert("validated_at".into(), json!(record.validated_at.timestamp()));
        payload.insert("distance_to_centroid".into(), json!(record.distance_to_centroid));
        payload.insert("threshold".into(), json!(record.threshold));

        self.store
            .upsert(VALUES, PointRecord { id: record.id.clone(), vector, payload })
            .await?;
        info!(value_id = %record.id, cluster_id = %record.cluster_id, "value stored");
        Ok(record)
    }

    pub async fn list(&self, axis: Option<Axis>) -> Result<Vec<ValueRecord>> {
        let filter = axis
            .map(|a| Filter::new().eq("axis", a.as_str()))
            .and_then(Filter::build);
        let points = scroll_all(self.store.as_ref(), VALUES, filter.as_ref()).await?;
        Ok(points.iter().filter_map(value_from_point).collect())
    }

    async fn cluster_members(&self, axis: Axis, label: i64) -> Result<Vec<StoredPoint>> {
        let filter = Filter::new().eq(cluster_label_field(axis), label);
        scroll_all(
            self.store.as_ref(),
            ghap_collection(axis),
            Some(&filter),
        )
        .await
    }
}

fn decision_key(text: &str, cluster_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update([0x1f]);
    hasher.update(cluster_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (mag_a * mag_b)
}

fn value_from_point(point: &StoredPoint) -> Option<ValueRecord> {
    let payload = &point.payload;
    Some(ValueRecord {
        id: point.id.clone(),
        text: payload.get("text")?.as_str()?.to_string(),
        axis: payload.get("axis")?.as_str()?.parse().ok()?,
        cluster_id: payload.get("cluster_id")?.as_str()?.to_string(),
        validated_at: chrono::DateTime::from_timestamp(
            payload.get("validated_at")?.as_i64()?,
            0,
        )?,
        distance_to_centroid: payload.get("distance_to_centroid")?.as_f64()? as f32,
        threshold: payload.get("threshold")?.as_f64()? as f32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use calm_schema::collections::{GHAP_STRATEGY, SEMANTIC_DIM, VALUES};
    use calm_schema::value::cluster_id;
    use calm_store::EmbeddedStore;

    /// Seed a labeled strategy cluster whose members embed near each other
    /// (shared vocabulary under the mock embedder).
    async fn seeded(
    ) -> Result<(Arc<EmbeddedStore>, EmbeddingRegistry, ValueStore, String)> {
        let store = Arc::new(EmbeddedStore::in_memory());
        let registry = EmbeddingRegistry::mock();
        store.create_collection(GHAP_STRATEGY, SEMANTIC_DIM).await?;
        store.create_collection(VALUES, SEMANTIC_DIM).await?;

        // Six members share a six-word core and differ in six words each, so
        // member-to-centroid distances are wide enough for a core-heavy
        // candidate to land inside the threshold.
        let texts = [
            "check flaky test shared state isolation tempdir collision parallel runner directory conflict",
            "check flaky test shared state isolation database fixture leftover rows polluted snapshot",
            "check flaky test shared state isolation network socket port reuse lingering listener",
            "check flaky test shared state isolation cache warm entries stale invalidation missed",
            "check flaky test shared state isolation ordering dependent suite sequence hidden coupling",
            "check flaky test shared state isolation clock skew timestamp rounding boundary jitter",
        ];
        for (i, text) in texts.iter().enumerate() {
            let vector = registry.embed_one(EmbedRole::Semantic, text).await?;
            let mut payload = Payload::new();
            payload.insert("confidence_tier".into(), json!("SILVER"));
            payload.insert("cluster_label_strategy".into(), json!(0));
            payload.insert("content".into(), json!(text));
            store
                .upsert(
                    GHAP_STRATEGY,
                    PointRecord { id: format!("m{i}"), vector, payload },
                )
                .await?;
        }

        let values = ValueStore::new(store.clone(), registry.clone());
        let id = cluster_id(Axis::Strategy, 0);
        Ok((store, registry, values, id))
    }

    #[tokio::test]
    async fn on_topic_text_validates_and_stores() -> Result<()> {
        let (_store, _registry, values, cluster) = seeded().await?;

        let verdict = values
            .validate(
                "check flaky test shared state isolation before sleeping",
                &cluster,
            )
            .await?;
        assert!(verdict.valid, "expected on-topic candidate to validate: {verdict:?}");
        assert!(verdict.distance <= verdict.threshold);

        let record = values
            .store(
                "check flaky test shared state isolation before sleeping",
                &cluster,
            )
            .await?;
        assert_eq!(record.axis, Axis::Strategy);
        assert!(record.distance_to_centroid <= record.threshold);

        let listed = values.list(Some(Axis::Strategy)).await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].cluster_id, cluster);
        Ok(())
    }

    #[tokio::test]
    async fn off_topic_text_is_rejected_with_reason() -> Result<()> {
        let (_store, _registry, values, cluster) = seeded().await?;
        let verdict = values
            .validate("always buy groceries on sunday mornings for the freshest produce", &cluster)
            .await?;
        assert!(!verdict.valid);
        assert!(verdict.reason.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn store_without_validate_is_rejected() -> Result<()> {
        let (_store, _registry, values, cluster) = seeded().await?;
        let err = values.store("some principle", &cluster).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
        Ok(())
    }

    #[tokio::test]
    async fn store_with_different_text_than_validated_is_rejected() -> Result<()> {
        let (_store, _registry, values, cluster) = seeded().await?;
        values
            .validate(
                "check flaky test shared state isolation before sleeping",
                &cluster,
            )
            .await?;
        let err = values.store("a different principle", &cluster).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
        Ok(())
    }

    #[tokio::test]
    async fn empty_cluster_is_reported() -> Result<()> {
        let (_store, _registry, values, _cluster) = seeded().await?;
        let stale = cluster_id(Axis::Strategy, 99);
        let err = values.validate("anything", &stale).await.unwrap_err();
        assert_eq!(err.kind(), "empty_cluster");
        Ok(())
    }

    #[tokio::test]
    async fn malformed_cluster_id_is_a_validation_error() -> Result<()> {
        let (_store, _registry, values, _cluster) = seeded().await?;
        let err = values.validate("anything", "strategy-0").await.unwrap_err();
        assert_eq!(err.kind(), "validation");
        Ok(())
    }
}
