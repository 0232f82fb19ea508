//! In-process vector store with a per-collection JSONL op-log.
//!
//! Points live in memory; every mutation is appended to
//! `{dir}/{collection}.jsonl` and fsync'd, so committed writes survive a
//! crash. Replay happens at open. When the log grows past twice the live
//! point count it is compacted by an atomic temp + fsync + rename rewrite;
//! a crash at any moment leaves either the old log or the new one.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use calm_schema::{CalmError, Result};

use crate::{
    cosine_similarity, Filter, Payload, PointRecord, ScoredPoint, ScrollPage, StoredPoint,
    VectorStore,
};

/// Extra log-line slack before compaction kicks in.
const COMPACT_SLACK: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogRecord {
    Create { dim: usize },
    Upsert { id: String, vector: Vec<f32>, payload: Payload },
    Delete { id: String },
    SetPayload { id: String, patch: Payload },
}

#[derive(Debug, Default)]
struct Collection {
    dim: usize,
    points: BTreeMap<String, (Vec<f32>, Payload)>,
    /// Lines appended to the log since the last compaction.
    log_lines: usize,
}

pub struct EmbeddedStore {
    dir: Option<PathBuf>,
    state: RwLock<HashMap<String, Collection>>,
}

impl EmbeddedStore {
    /// Purely in-memory store; nothing is persisted. Test wiring.
    pub fn in_memory() -> Self {
        Self { dir: None, state: RwLock::new(HashMap::new()) }
    }

    /// Open (or create) a file-backed store rooted at `dir`, replaying any
    /// existing collection logs.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut collections = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let collection = replay_log(&path)?;
            info!(
                collection = name,
                points = collection.points.len(),
                "vector collection loaded"
            );
            collections.insert(name.to_string(), collection);
        }

        Ok(Self { dir: Some(dir), state: RwLock::new(collections) })
    }

    fn log_path(&self, collection: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{collection}.jsonl")))
    }

    fn append(&self, collection: &str, record: &LogRecord) -> Result<()> {
        let Some(path) = self.log_path(collection) else {
            return Ok(());
        };
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        let line = serde_json::to_string(record)
            .map_err(|err| CalmError::Store(format!("encoding log record: {err}")))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        Ok(())
    }

    /// Rewrite the collection log as `Create` + one `Upsert` per live point.
    fn compact(&self, name: &str, collection: &mut Collection) -> Result<()> {
        let Some(path) = self.log_path(name) else {
            return Ok(());
        };
        let tmp = path.with_extension("jsonl.tmp");

        let write_result: Result<()> = (|| {
            let mut file = fs::File::create(&tmp)?;
            let mut write_line = |record: &LogRecord| -> Result<()> {
                let line = serde_json::to_string(record)
                    .map_err(|err| CalmError::Store(format!("encoding log record: {err}")))?;
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
                Ok(())
            };
            write_line(&LogRecord::Create { dim: collection.dim })?;
            for (id, (vector, payload)) in &collection.points {
                write_line(&LogRecord::Upsert {
                    id: id.clone(),
                    vector: vector.clone(),
                    payload: payload.clone(),
                })?;
            }
            file.sync_all()?;
            Ok(())
        })();

        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        if let Err(err) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }

        collection.log_lines = collection.points.len() + 1;
        Ok(())
    }

    fn maybe_compact(&self, name: &str, collection: &mut Collection) -> Result<()> {
        if collection.log_lines > collection.points.len() * 2 + COMPACT_SLACK {
            self.compact(name, collection)?;
        }
        Ok(())
    }
}

fn replay_log(path: &Path) -> Result<Collection> {
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut collection = Collection::default();
    let mut corrupt = 0usize;

    for (line_idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        collection.log_lines += 1;
        match serde_json::from_str::<LogRecord>(&line) {
            Ok(LogRecord::Create { dim }) => collection.dim = dim,
            Ok(LogRecord::Upsert { id, vector, payload }) => {
                collection.points.insert(id, (vector, payload));
            }
            Ok(LogRecord::Delete { id }) => {
                collection.points.remove(&id);
            }
            Ok(LogRecord::SetPayload { id, patch }) => {
                if let Some((_, payload)) = collection.points.get_mut(&id) {
                    for (k, v) in patch {
                        payload.insert(k, v);
                    }
                }
            }
            Err(err) => {
                corrupt += 1;
                warn!(
                    line = line_idx + 1,
                    error = %err,
                    path = %path.display(),
                    "corrupt vector log line skipped"
                );
            }
        }
    }
    if corrupt > 0 {
        warn!(corrupt, path = %path.display(), "vector log replayed with skipped lines");
    }
    Ok(collection)
}

#[async_trait::async_trait]
impl VectorStore for EmbeddedStore {
    async fn create_collection(&self, name: &str, dim: usize) -> Result<bool> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.get(name) {
            if existing.dim != dim {
                return Err(CalmError::DimensionMismatch {
                    collection: name.to_string(),
                    expected: existing.dim,
                    actual: dim,
                });
            }
            return Ok(true);
        }
        self.append(name, &LogRecord::Create { dim })?;
        state.insert(
            name.to_string(),
            Collection { dim, points: BTreeMap::new(), log_lines: 1 },
        );
        Ok(false)
    }

    async fn upsert(&self, collection: &str, point: PointRecord) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .get_mut(collection)
            .ok_or_else(|| CalmError::not_found(format!("collection '{collection}'")))?;
        if point.vector.len() != entry.dim {
            return Err(CalmError::DimensionMismatch {
                collection: collection.to_string(),
                expected: entry.dim,
                actual: point.vector.len(),
            });
        }
        self.append(
            collection,
            &LogRecord::Upsert {
                id: point.id.clone(),
                vector: point.vector.clone(),
                payload: point.payload.clone(),
            },
        )?;
        entry.log_lines += 1;
        entry.points.insert(point.id, (point.vector, point.payload));
        self.maybe_compact(collection, entry)?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<ScoredPoint>> {
        let state = self.state.read().await;
        let entry = state
            .get(collection)
            .ok_or_else(|| CalmError::not_found(format!("collection '{collection}'")))?;

        let mut hits: Vec<ScoredPoint> = entry
            .points
            .iter()
            .filter(|(_, (_, payload))| filter.is_none_or(|f| f.matches(payload)))
            .map(|(id, (vector, payload))| ScoredPoint {
                id: id.clone(),
                score: cosine_similarity(query, vector),
                payload: payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn scroll(
        &self,
        collection: &str,
        limit: usize,
        cursor: Option<&str>,
        filter: Option<&Filter>,
    ) -> Result<ScrollPage> {
        let state = self.state.read().await;
        let entry = state
            .get(collection)
            .ok_or_else(|| CalmError::not_found(format!("collection '{collection}'")))?;

        let mut points: Vec<StoredPoint> = entry
            .points
            .iter()
            .filter(|(id, _)| cursor.is_none_or(|c| id.as_str() > c))
            .filter(|(_, (_, payload))| filter.is_none_or(|f| f.matches(payload)))
            .take(limit + 1)
            .map(|(id, (vector, payload))| StoredPoint {
                id: id.clone(),
                vector: vector.clone(),
                payload: payload.clone(),
            })
            .collect();

        let next_cursor = if points.len() > limit {
            points.truncate(limit);
            points.last().map(|p| p.id.clone())
        } else {
            None
        };
        Ok(ScrollPage { points, next_cursor })
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<StoredPoint>> {
        let state = self.state.read().await;
        let entry = state
            .get(collection)
            .ok_or_else(|| CalmError::not_found(format!("collection '{collection}'")))?;
        Ok(entry.points.get(id).map(|(vector, payload)| StoredPoint {
            id: id.to_string(),
            vector: vector.clone(),
            payload: payload.clone(),
        }))
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .get_mut(collection)
            .ok_or_else(|| CalmError::not_found(format!("collection '{collection}'")))?;
        if entry.points.remove(id).is_some() {
            self.append(collection, &LogRecord::Delete { id: id.to_string() })?;
            entry.log_lines += 1;
            self.maybe_compact(collection, entry)?;
        }
        Ok(())
    }

    async fn count(&self, collection: &str, filter: Option<&Filter>) -> Result<u64> {
        let state = self.state.read().await;
        let entry = state
            .get(collection)
            .ok_or_else(|| CalmError::not_found(format!("collection '{collection}'")))?;
        let count = entry
            .points
            .values()
            .filter(|(_, payload)| filter.is_none_or(|f| f.matches(payload)))
            .count();
        Ok(count as u64)
    }

    async fn set_payload(&self, collection: &str, id: &str, patch: Payload) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .get_mut(collection)
            .ok_or_else(|| CalmError::not_found(format!("collection '{collection}'")))?;
        let Some((_, payload)) = entry.points.get_mut(id) else {
            return Err(CalmError::not_found(format!(
                "point '{id}' in collection '{collection}'"
            )));
        };
        self.append(
            collection,
            &LogRecord::SetPayload { id: id.to_string(), patch: patch.clone() },
        )?;
        entry.log_lines += 1;
        for (k, v) in patch {
            payload.insert(k, v);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serde_json::json;

    fn point(id: &str, vector: Vec<f32>, payload: serde_json::Value) -> PointRecord {
        PointRecord {
            id: id.to_string(),
            vector,
            payload: payload.as_object().cloned().unwrap(),
        }
    }

    #[tokio::test]
    async fn upsert_is_last_write_wins() -> Result<()> {
        let store = EmbeddedStore::in_memory();
        store.create_collection("memories", 3).await?;
        store
            .upsert("memories", point("a", vec![1.0, 0.0, 0.0], json!({"v": 1})))
            .await?;
        store
            .upsert("memories", point("a", vec![0.0, 1.0, 0.0], json!({"v": 2})))
            .await?;

        let stored = store.get("memories", "a").await?.unwrap();
        assert_eq!(stored.payload["v"], json!(2));
        assert_eq!(store.count("memories", None).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn upsert_rejects_wrong_dimension() -> Result<()> {
        let store = EmbeddedStore::in_memory();
        store.create_collection("memories", 3).await?;
        let err = store
            .upsert("memories", point("a", vec![1.0, 0.0], json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "dimension_mismatch");
        Ok(())
    }

    #[tokio::test]
    async fn search_applies_filters_before_ranking() -> Result<()> {
        let store = EmbeddedStore::in_memory();
        store.create_collection("memories", 2).await?;
        store
            .upsert("memories", point("close", vec![1.0, 0.0], json!({"category": "fact"})))
            .await?;
        store
            .upsert(
                "memories",
                point("closer", vec![1.0, 0.1], json!({"category": "preference"})),
            )
            .await?;

        let filter = Filter::new().eq("category", "fact");
        let hits = store
            .search("memories", &[1.0, 0.05], 10, Some(&filter))
            .await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "close");
        Ok(())
    }

    #[tokio::test]
    async fn scroll_pages_in_stable_id_order() -> Result<()> {
        let store = EmbeddedStore::in_memory();
        store.create_collection("c", 1).await?;
        for id in ["b", "d", "a", "c", "e"] {
            store.upsert("c", point(id, vec![1.0], json!({}))).await?;
        }

        let first = store.scroll("c", 2, None, None).await?;
        assert_eq!(
            first.points.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        let second = store
            .scroll("c", 2, first.next_cursor.as_deref(), None)
            .await?;
        assert_eq!(
            second.points.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["c", "d"]
        );
        let third = store
            .scroll("c", 2, second.next_cursor.as_deref(), None)
            .await?;
        assert_eq!(third.points.len(), 1);
        assert!(third.next_cursor.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn delete_and_get_are_idempotent() -> Result<()> {
        let store = EmbeddedStore::in_memory();
        store.create_collection("c", 1).await?;
        store.upsert("c", point("x", vec![1.0], json!({}))).await?;
        store.delete("c", "x").await?;
        store.delete("c", "x").await?;
        assert!(store.get("c", "x").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn set_payload_merges_without_clobbering() -> Result<()> {
        let store = EmbeddedStore::in_memory();
        store.create_collection("c", 1).await?;
        store
            .upsert("c", point("x", vec![1.0], json!({"keep": true, "label": 0})))
            .await?;
        let patch = json!({"label": 7}).as_object().cloned().unwrap();
        store.set_payload("c", "x", patch).await?;

        let stored = store.get("c", "x").await?.unwrap();
        assert_eq!(stored.payload["keep"], json!(true));
        assert_eq!(stored.payload["label"], json!(7));
        Ok(())
    }

    #[tokio::test]
    async fn data_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = EmbeddedStore::open(dir.path())?;
            store.create_collection("memories", 2).await?;
            store
                .upsert("memories", point("a", vec![0.6, 0.8], json!({"content": "hi"})))
                .await?;
            store
                .upsert("memories", point("b", vec![1.0, 0.0], json!({"content": "yo"})))
                .await?;
            store.delete("memories", "b").await?;
        }

        let reopened = EmbeddedStore::open(dir.path())?;
        assert_eq!(reopened.count("memories", None).await?, 1);
        let stored = reopened.get("memories", "a").await?.unwrap();
        assert_eq!(stored.vector, vec![0.6, 0.8]);
        assert_eq!(stored.payload["content"], json!("hi"));
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_trailing_line_is_tolerated_on_replay() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = EmbeddedStore::open(dir.path())?;
            store.create_collection("c", 1).await?;
            store.upsert("c", point("x", vec![1.0], json!({}))).await?;
        }
        // Simulate a crash mid-append.
        let log = dir.path().join("c.jsonl");
        let mut file = fs::OpenOptions::new().append(true).open(&log)?;
        file.write_all(b"{\"op\":\"upsert\",\"id\":\"tr")?;

        let reopened = EmbeddedStore::open(dir.path())?;
        assert_eq!(reopened.count("c", None).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn compaction_preserves_live_points() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = EmbeddedStore::open(dir.path())?;
        store.create_collection("c", 1).await?;
        // Rewrite the same point enough times to cross the compaction bound.
        for i in 0..200 {
            store
                .upsert("c", point("x", vec![1.0], json!({"i": i})))
                .await?;
        }
        drop(store);

        let reopened = EmbeddedStore::open(dir.path())?;
        let stored = reopened.get("c", "x").await?.unwrap();
        assert_eq!(stored.payload["i"], json!(199));
        assert_eq!(reopened.count("c", None).await?, 1);
        Ok(())
    }
}
