//! Embed the query with the role-appropriate model, run a filtered top-k
//! search, and shape the raw payload into a typed hit. Empty results are a
//! success, not an error.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use calm_embedding::EmbeddingRegistry;
use calm_schema::collections::{
    ghap_collection, role_for_collection, CODE_UNITS, COMMITS, MEMORIES, VALUES,
};
use calm_schema::{Axis, Domain, OutcomeStatus, Result, Strategy};
use calm_store::{Filter, Payload, ScoredPoint, VectorStore};

/// Optional narrowing for memory searches.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilters {
    pub category: Option<String>,
    pub min_importance: Option<f32>,
    pub tags_any: Option<Vec<String>>,
}

/// Optional narrowing for experience searches.
#[derive(Debug, Clone, Default)]
pub struct ExperienceFilters {
    pub domain: Option<Domain>,
    pub strategy: Option<Strategy>,
    pub outcome: Option<OutcomeStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryHit {
    pub id: String,
    pub score: f32,
    pub content: String,
    pub category: String,
    pub importance: f32,
    pub tags: Vec<String>,
    pub created_at: i64,
    pub project: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CodeHit {
    pub id: String,
    pub score: f32,
    pub project: String,
    pub file_path: String,
    pub qualified_name: String,
    pub unit_type: String,
    pub language: String,
    pub signature: String,
    pub start_line: u32,
    pub end_line: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperienceHit {
    pub entry_id: String,
    pub score: f32,
    pub axis: String,
    pub domain: String,
    pub strategy: String,
    pub outcome_status: String,
    pub confidence_tier: String,
    pub iteration_count: u32,
    pub content: String,
    pub captured_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValueHit {
    pub id: String,
    pub score: f32,
    pub text: String,
    pub axis: String,
    pub cluster_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitHit {
    pub sha: String,
    pub score: f32,
    pub author: String,
    pub timestamp: i64,
    pub summary: String,
    pub files: Vec<String>,
    pub insertions: u64,
    pub deletions: u64,
    pub project: String,
}

#[derive(Clone)]
pub struct UnifiedSearcher {
    store: Arc<dyn VectorStore>,
    registry: EmbeddingRegistry,
}

impl UnifiedSearcher {
    pub fn new(store: Arc<dyn VectorStore>, registry: EmbeddingRegistry) -> Self {
        Self { store, registry }
    }

    async fn query(
        &self,
        collection: &str,
        query: &str,
        limit: usize,
        filter: Option<Filter>,
    ) -> Result<Vec<ScoredPoint>> {
        let embedder = self.registry.for_role(role_for_collection(collection));
        let vector = embedder.embed_one(query).await?;
        self.store
            .search(collection, &vector, limit, filter.as_ref())
            .await
    }

    pub async fn search_memories(
        &self,
        query: &str,
        limit: usize,
        filters: MemoryFilters,
    ) -> Result<Vec<MemoryHit>> {
        let mut filter = Filter::new();
        if let Some(category) = filters.category {
            filter = filter.eq("category", category);
        }
        if let Some(min) = filters.min_importance {
            filter = filter.gte("importance", min as f64);
        }
        if let Some(tags) = filters.tags_any {
            filter = filter.any_of("tags", tags.into_iter().map(Value::from).collect());
        }

        let hits = self.query(MEMORIES, query, limit, filter.build()).await?;
        Ok(hits
            .into_iter()
            .map(|hit| MemoryHit {
                id: hit.id,
                score: hit.score,
                content: str_field(&hit.payload, "content"),
                category: str_field(&hit.payload, "category"),
                importance: f32_field(&hit.payload, "importance"),
                tags: string_list(&hit.payload, "tags"),
                created_at: i64_field(&hit.payload, "created_at"),
                project: hit
                    .payload
                    .get("project")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            })
            .collect())
    }

    pub async fn search_code(
        &self,
        query: &str,
        limit: usize,
        project: Option<String>,
        language: Option<String>,
        unit_type: Option<String>,
    ) -> Result<Vec<CodeHit>> {
        let mut filter = Filter::new();
        if let Some(project) = project {
            filter = filter.eq("project", project);
        }
        if let Some(language) = language {
            filter = filter.eq("language", language);
        }
        if let Some(unit_type) = unit_type {
            filter = filter.eq("unit_type", unit_type);
        }

        let hits = self.query(CODE_UNITS, query, limit, filter.build()).await?;
        Ok(hits
            .into_iter()
            .map(|hit| CodeHit {
                id: hit.id,
                score: hit.score,
                project: str_field(&hit.payload, "project"),
                file_path: str_field(&hit.payload, "file_path"),
                qualified_name: str_field(&hit.payload, "qualified_name"),
                unit_type: str_field(&hit.payload, "unit_type"),
                language: str_field(&hit.payload, "language"),
                signature: str_field(&hit.payload, "signature"),
                start_line: i64_field(&hit.payload, "start_line") as u32,
                end_line: i64_field(&hit.payload, "end_line") as u32,
            })
            .collect())
    }

    pub async fn search_experiences(
        &self,
        query: &str,
        limit: usize,
        axis: Axis,
        filters: ExperienceFilters,
    ) -> Result<Vec<ExperienceHit>> {
        let mut filter = Filter::new();
        if let Some(domain) = filters.domain {
            filter = filter.eq("domain", domain.as_str());
        }
        if let Some(strategy) = filters.strategy {
            filter = filter.eq("strategy", strategy.as_str());
        }
        if let Some(outcome) = filters.outcome {
            filter = filter.eq("outcome_status", outcome.as_str());
        }

        let hits = self
            .query(ghap_collection(axis), query, limit, filter.build())
            .await?;
        Ok(hits
            .into_iter()
            .map(|hit| ExperienceHit {
                entry_id: str_field(&hit.payload, "entry_id"),
                score: hit.score,
                axis: str_field(&hit.payload, "axis"),
                domain: str_field(&hit.payload, "domain"),
                strategy: str_field(&hit.payload, "strategy"),
                outcome_status: str_field(&hit.payload, "outcome_status"),
                confidence_tier: str_field(&hit.payload, "confidence_tier"),
                iteration_count: i64_field(&hit.payload, "iteration_count") as u32,
                content: str_field(&hit.payload, "content"),
                captured_at: i64_field(&hit.payload, "captured_at"),
            })
            .collect())
    }

    pub async fn search_values(
        &self,
        query: &str,
        limit: usize,
        axis: Option<Axis>,
    ) -> Result<Vec<ValueHit>> {
        let mut filter = Filter::new();
        if let Some(axis) = axis {
            filter = filter.eq("axis", axis.as_str());
        }
        let hits = self.query(VALUES, query, limit, filter.build()).await?;
        Ok(hits
            .into_iter()
            .map(|hit| ValueHit {
                id: hit.id,
                score: hit.score,
                text: str_field(&hit.payload, "text"),
                axis: str_field(&hit.payload, "axis"),
                cluster_id: str_field(&hit.payload, "cluster_id"),
            })
            .collect())
    }

    pub async fn search_commits(
        &self,
        query: &str,
        limit: usize,
        author: Option<String>,
        since: Option<i64>,
        until: Option<i64>,
    ) -> Result<Vec<CommitHit>> {
        let mut filter = Filter::new();
        if let Some(author) = author {
            filter = filter.eq("author", author);
        }
        if since.is_some() || until.is_some() {
            filter = filter.range(
                "timestamp",
                since.map(|v| v as f64),
                until.map(|v| v as f64),
            );
        }

        let hits = self.query(COMMITS, query, limit, filter.build()).await?;
        Ok(hits
            .into_iter()
            .map(|hit| CommitHit {
                sha: str_field(&hit.payload, "sha"),
                score: hit.score,
                author: str_field(&hit.payload, "author"),
                timestamp: i64_field(&hit.payload, "timestamp"),
                summary: str_field(&hit.payload, "content"),
                files: string_list(&hit.payload, "files"),
                insertions: i64_field(&hit.payload, "insertions") as u64,
                deletions: i64_field(&hit.payload, "deletions") as u64,
                project: str_field(&hit.payload, "project"),
            })
            .collect())
    }
}

fn str_field(payload: &Payload, key: &str) -> String {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn f32_field(payload: &Payload, key: &str) -> f32 {
    payload.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0) as f32
}

fn i64_field(payload: &Payload, key: &str) -> i64 {
    payload.get(key).and_then(|v| v.as_i64()).unwrap_or(0)
}

fn string_list(payload: &Payload, key: &str) -> Vec<String> {
    payload
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use calm_embedding::Embedder;
    use calm_schema::collections::SEMANTIC_DIM;
    use calm_store::{EmbeddedStore, PointRecord};
    use serde_json::json;

    async fn seeded() -> Result<UnifiedSearcher> {
        let store = Arc::new(EmbeddedStore::in_memory());
        let registry = EmbeddingRegistry::mock();
        store.create_collection(MEMORIES, SEMANTIC_DIM).await?;

        let items = [
            ("m1", "prefer explicit error types over panics", "preference", 0.8, vec!["errors"]),
            ("m2", "the build uses cargo workspaces", "fact", 0.5, vec!["build"]),
            ("m3", "decided to keep the embedded store default", "decision", 0.9, vec!["storage", "errors"]),
        ];
        for (id, content, category, importance, tags) in items {
            let vector = registry
                .for_collection(MEMORIES)
                .embed_one(content)
                .await?;
            let payload = json!({
                "content": content,
                "category": category,
                "importance": importance,
                "tags": tags,
                "created_at": 1_700_000_000,
                "project": "calm",
            })
            .as_object()
            .cloned()
            .unwrap();
            store
                .upsert(MEMORIES, PointRecord { id: id.into(), vector, payload })
                .await?;
        }
        Ok(UnifiedSearcher::new(store, registry))
    }

    #[tokio::test]
    async fn memory_search_applies_filters() -> Result<()> {
        let searcher = seeded().await?;

        let all = searcher
            .search_memories("error types", 10, MemoryFilters::default())
            .await?;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, "m1", "closest match should rank first");

        let prefs = searcher
            .search_memories(
                "error types",
                10,
                MemoryFilters { category: Some("preference".into()), ..Default::default() },
            )
            .await?;
        assert_eq!(prefs.len(), 1);
        assert_eq!(prefs[0].category, "preference");

        let important = searcher
            .search_memories(
                "error types",
                10,
                MemoryFilters { min_importance: Some(0.85), ..Default::default() },
            )
            .await?;
        assert_eq!(important.len(), 1);
        assert_eq!(important[0].id, "m3");

        let tagged = searcher
            .search_memories(
                "error types",
                10,
                MemoryFilters {
                    tags_any: Some(vec!["errors".into(), "missing".into()]),
                    ..Default::default()
                },
            )
            .await?;
        assert_eq!(tagged.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn empty_results_are_success() -> Result<()> {
        let searcher = seeded().await?;
        let hits = searcher
            .search_memories(
                "anything",
                10,
                MemoryFilters { category: Some("learning".into()), ..Default::default() },
            )
            .await?;
        assert!(hits.is_empty());
        Ok(())
    }
}
