//! Per-axis experience clustering.
//!
//! Reads every point of one GHAP axis collection, runs HDBSCAN over the
//! L2-normalized vectors on the blocking pool, writes the resulting labels
//! back into member payloads, and reports weighted centroids. Labels are
//! only meaningful until the next run for the same axis.

mod hdbscan;

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use calm_schema::collections::ghap_collection;
use calm_schema::{Axis, CalmError, ConfidenceTier, Result};
use calm_store::{scroll_all, Payload, StoredPoint, VectorStore};

pub use hdbscan::{cluster_labels, HdbscanParams, NOISE};

/// An axis must hold at least this many points before clustering runs.
pub const MIN_AXIS_MEMBERS: usize = 20;

#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub label: i64,
    pub member_ids: Vec<String>,
    pub size: usize,
    pub weighted_centroid: Vec<f32>,
}

pub struct ExperienceClusterer {
    store: Arc<dyn VectorStore>,
    params: HdbscanParams,
}

impl ExperienceClusterer {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self { store, params: HdbscanParams::default() }
    }

    /// Cluster one axis and persist `cluster_label_{axis}` into every member
    /// payload, noise included (so stale labels from earlier runs cannot
    /// survive a re-run).
    pub async fn run(&self, axis: Axis) -> Result<Vec<ClusterInfo>> {
        let collection = ghap_collection(axis);
        let members = scroll_all(self.store.as_ref(), collection, None).await?;
        if members.len() < MIN_AXIS_MEMBERS {
            return Err(CalmError::InsufficientData(format!(
                "axis '{axis}' has {} members, clustering requires at least {MIN_AXIS_MEMBERS}",
                members.len()
            )));
        }

        let normalized: Vec<Vec<f32>> =
            members.iter().map(|p| l2_normalize(&p.vector)).collect();
        let params = self.params;
        let labels = tokio::task::spawn_blocking(move || {
            cluster_labels(&normalized, &params)
        })
        .await
        .map_err(|err| CalmError::Store(format!("clustering task failed: {err}")))?;

        let label_field = cluster_label_field(axis);
        for (point, label) in members.iter().zip(&labels) {
            let mut patch = Payload::new();
            patch.insert(label_field.clone(), json!(label));
            self.store
                .set_payload(collection, &point.id, patch)
                .await?;
        }

        let clusters = build_cluster_infos(&members, &labels);
        info!(
            axis = %axis,
            members = members.len(),
            clusters = clusters.len(),
            noise = labels.iter().filter(|l| **l == NOISE).count(),
            "clustering run complete"
        );
        Ok(clusters)
    }
}

/// Payload key holding the latest cluster label for one axis.
pub fn cluster_label_field(axis: Axis) -> String {
    format!("cluster_label_{}", axis.as_str())
}

fn build_cluster_infos(members: &[StoredPoint], labels: &[i64]) -> Vec<ClusterInfo> {
    let mut by_label: std::collections::BTreeMap<i64, Vec<usize>> = Default::default();
    for (idx, label) in labels.iter().enumerate() {
        if *label != NOISE {
            by_label.entry(*label).or_default().push(idx);
        }
    }
    by_label
        .into_iter()
        .map(|(label, indices)| {
            let weighted: Vec<(Vec<f32>, f32)> = indices
                .iter()
                .map(|i| {
                    let point = &members[*i];
                    (l2_normalize(&point.vector), tier_weight(&point.payload))
                })
                .collect();
            ClusterInfo {
                label,
                member_ids: indices.iter().map(|i| members[*i].id.clone()).collect(),
                size: indices.len(),
                weighted_centroid: weighted_centroid(&weighted),
            }
        })
        .collect()
}

/// Centroid weight of a member, read from its `confidence_tier` payload.
pub fn tier_weight(payload: &Payload) -> f32 {
    payload
        .get("confidence_tier")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<ConfidenceTier>().ok())
        .unwrap_or(ConfidenceTier::Bronze)
        .centroid_weight()
}

/// `Σ wᵢ·vᵢ / Σ wᵢ` over `(vector, weight)` pairs.
pub fn weighted_centroid(members: &[(Vec<f32>, f32)]) -> Vec<f32> {
    let Some(dim) = members.first().map(|(v, _)| v.len()) else {
        return Vec::new();
    };
    let mut sum = vec![0.0_f32; dim];
    let mut total_weight = 0.0_f32;
    for (vector, weight) in members {
        for (slot, value) in sum.iter_mut().zip(vector) {
            *slot += value * weight;
        }
        total_weight += weight;
    }
    if total_weight > 0.0 {
        for slot in &mut sum {
            *slot /= total_weight;
        }
    }
    sum
}

pub fn l2_normalize(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter().map(|v| v / norm).collect()
    } else {
        vector.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use calm_schema::collections::GHAP_STRATEGY;
    use calm_store::{EmbeddedStore, PointRecord};
    use serde_json::json;

    fn strategy_point(id: &str, vector: Vec<f32>, tier: &str) -> PointRecord {
        PointRecord {
            id: id.to_string(),
            vector,
            payload: json!({
                "entry_id": id,
                "confidence_tier": tier,
                "outcome_status": "CONFIRMED",
                "axis": "strategy",
            })
            .as_object()
            .cloned()
            .unwrap(),
        }
    }

    /// Two well-separated direction groups in 3d. Within-group jitter grows
    /// linearly so members chain together one by one instead of forming
    /// accidental sub-groups.
    async fn seeded_store(count_a: usize, count_b: usize) -> Result<Arc<EmbeddedStore>> {
        let store = Arc::new(EmbeddedStore::in_memory());
        store.create_collection(GHAP_STRATEGY, 3).await?;
        for i in 0..count_a {
            let jitter = 0.001 * i as f32;
            store
                .upsert(
                    GHAP_STRATEGY,
                    strategy_point(&format!("a{i:02}"), vec![1.0, jitter, 0.0], "GOLD"),
                )
                .await?;
        }
        for i in 0..count_b {
            let jitter = 0.001 * i as f32;
            store
                .upsert(
                    GHAP_STRATEGY,
                    strategy_point(&format!("b{i:02}"), vec![jitter, 1.0, 0.0], "SILVER"),
                )
                .await?;
        }
        Ok(store)
    }

    #[tokio::test]
    async fn refuses_to_run_below_member_minimum() -> Result<()> {
        let store = seeded_store(5, 5).await?;
        let clusterer = ExperienceClusterer::new(store);
        let err = clusterer.run(Axis::Strategy).await.unwrap_err();
        assert_eq!(err.kind(), "insufficient_data");
        Ok(())
    }

    #[tokio::test]
    async fn clusters_two_groups_and_labels_payloads() -> Result<()> {
        let store = seeded_store(12, 13).await?;
        let clusterer = ExperienceClusterer::new(store.clone());
        let clusters = clusterer.run(Axis::Strategy).await?;

        assert_eq!(clusters.len(), 2);
        assert!(clusters.iter().all(|c| c.size >= 5));
        let total: usize = clusters.iter().map(|c| c.size).sum();
        assert_eq!(total, 25);

        // Labels were written back, and the two groups got different labels.
        let a = store.get(GHAP_STRATEGY, "a00").await?.unwrap();
        let b = store.get(GHAP_STRATEGY, "b00").await?.unwrap();
        let la = a.payload["cluster_label_strategy"].as_i64().unwrap();
        let lb = b.payload["cluster_label_strategy"].as_i64().unwrap();
        assert!(la >= 0);
        assert!(lb >= 0);
        assert_ne!(la, lb);
        Ok(())
    }

    #[tokio::test]
    async fn rerun_overwrites_stale_labels() -> Result<()> {
        let store = seeded_store(12, 13).await?;
        let clusterer = ExperienceClusterer::new(store.clone());
        clusterer.run(Axis::Strategy).await?;
        let before = store.get(GHAP_STRATEGY, "b05").await?.unwrap();
        assert!(before.payload["cluster_label_strategy"].as_i64().unwrap() >= 0);

        // Collapse everything onto one direction: a single homogeneous blob
        // has no internal split, so the re-run must relabel every point as
        // noise, stale labels included.
        let ids: Vec<String> = (0..12)
            .map(|i| format!("a{i:02}"))
            .chain((0..13).map(|i| format!("b{i:02}")))
            .collect();
        for id in ids {
            let point = store.get(GHAP_STRATEGY, &id).await?.unwrap();
            store
                .upsert(
                    GHAP_STRATEGY,
                    PointRecord { id, vector: vec![1.0, 0.0, 0.0], payload: point.payload },
                )
                .await?;
        }
        clusterer.run(Axis::Strategy).await?;
        let a = store.get(GHAP_STRATEGY, "a00").await?.unwrap();
        let b = store.get(GHAP_STRATEGY, "b05").await?.unwrap();
        assert_eq!(a.payload["cluster_label_strategy"].as_i64(), Some(-1));
        assert_eq!(b.payload["cluster_label_strategy"].as_i64(), Some(-1));
        Ok(())
    }

    #[test]
    fn weighted_centroid_respects_tier_weights() {
        let members = vec![
            (vec![1.0, 0.0], 1.0),
            (vec![0.0, 1.0], 0.2),
        ];
        let centroid = weighted_centroid(&members);
        assert!((centroid[0] - 1.0 / 1.2).abs() < 1e-6);
        assert!((centroid[1] - 0.2 / 1.2).abs() < 1e-6);
    }

    #[test]
    fn tier_weight_defaults_to_bronze_on_missing_field() {
        let payload = json!({"other": 1}).as_object().cloned().unwrap();
        assert_eq!(tier_weight(&payload), 0.5);
    }
}
