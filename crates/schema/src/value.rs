use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ghap::Axis;

/// A principle accepted into the `values` collection because its embedding
/// lies within the centroid neighborhood of a named experience cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueRecord {
    pub id: String,
    pub text: String,
    pub axis: Axis,
    /// `{axis}:{label}:{short-uuid}`: the cluster the value was validated
    /// against. Labels are only stable until the next cluster run.
    pub cluster_id: String,
    pub validated_at: DateTime<Utc>,
    pub distance_to_centroid: f32,
    pub threshold: f32,
}

impl ValueRecord {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }
}

/// Compose a cluster id from its axis and label plus a short uniquifier.
pub fn cluster_id(axis: Axis, label: i64) -> String {
    let short = &Uuid::new_v4().simple().to_string()[..8];
    format!("{}:{}:{}", axis.as_str(), label, short)
}

/// Split a cluster id back into `(axis, label)`. The trailing uniquifier is
/// not semantically meaningful and is discarded.
pub fn parse_cluster_id(id: &str) -> Option<(Axis, i64)> {
    let mut parts = id.splitn(3, ':');
    let axis = parts.next()?.parse::<Axis>().ok()?;
    let label = parts.next()?.parse::<i64>().ok()?;
    parts.next()?;
    Some((axis, label))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_ids_round_trip() {
        let id = cluster_id(Axis::Strategy, 3);
        assert!(id.starts_with("strategy:3:"));
        assert_eq!(parse_cluster_id(&id), Some((Axis::Strategy, 3)));
    }

    #[test]
    fn malformed_cluster_ids_parse_to_none() {
        assert_eq!(parse_cluster_id("strategy:3"), None);
        assert_eq!(parse_cluster_id("nope:3:abcd1234"), None);
        assert_eq!(parse_cluster_id("strategy:x:abcd1234"), None);
    }
}
