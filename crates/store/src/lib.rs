//! Vector and metadata storage.
//!
//! The [`VectorStore`] trait is the single seam between the service and its
//! vector backend. Two variants exist: [`EmbeddedStore`] (in-process, file
//! backed, the default and the only one used in tests) and [`QdrantStore`]
//! (remote, selected by `vector_store_url`). The [`MetadataStore`] is a redb
//! sidecar holding shadow records and indexing checkpoints.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use calm_schema::Result;

mod embedded;
mod filter;
mod meta;
mod qdrant;

pub use embedded::EmbeddedStore;
pub use filter::{FieldCondition, Filter, FilterOp};
pub use meta::{FileCheckpoint, GhapMeta, MetadataStore};
pub use qdrant::QdrantStore;

/// JSON object payload attached to every point.
pub type Payload = Map<String, Value>;

/// A point as written to a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

/// A point as returned by `get`/`scroll`, vector included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

/// A ranked search hit. `score` is raw cosine similarity in `[-1, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Payload,
}

/// One page of a scroll, ordered by id. `next_cursor` is `None` on the last
/// page; otherwise pass it back verbatim to continue.
#[derive(Debug, Clone, Default)]
pub struct ScrollPage {
    pub points: Vec<StoredPoint>,
    pub next_cursor: Option<String>,
}

/// Named collections of cosine-distance vectors with JSON payloads.
///
/// Guarantees common to all variants: `create_collection` is idempotent,
/// `upsert` is last-write-wins and atomic per point, `search` applies
/// filters before ranking, `scroll` pages in stable id order, `get` and
/// `delete` are idempotent, and stored data survives process restart.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Returns `true` when the collection already existed.
    async fn create_collection(&self, name: &str, dim: usize) -> Result<bool>;

    async fn upsert(&self, collection: &str, point: PointRecord) -> Result<()>;

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<ScoredPoint>>;

    async fn scroll(
        &self,
        collection: &str,
        limit: usize,
        cursor: Option<&str>,
        filter: Option<&Filter>,
    ) -> Result<ScrollPage>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<StoredPoint>>;

    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    async fn count(&self, collection: &str, filter: Option<&Filter>) -> Result<u64>;

    /// Merge `patch` into the point's payload, leaving other keys untouched.
    async fn set_payload(&self, collection: &str, id: &str, patch: Payload) -> Result<()>;
}

/// Scroll an entire filtered collection into memory, page by page.
pub async fn scroll_all(
    store: &dyn VectorStore,
    collection: &str,
    filter: Option<&Filter>,
) -> Result<Vec<StoredPoint>> {
    const PAGE: usize = 256;
    let mut out = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = store
            .scroll(collection, PAGE, cursor.as_deref(), filter)
            .await?;
        out.extend(page.points);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(out)
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}
