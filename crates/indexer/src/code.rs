//! File and directory indexing into the `code_units` collection.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use ignore::WalkBuilder;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use calm_embedding::EmbeddingRegistry;
use calm_schema::collections::CODE_UNITS;
use calm_schema::memory::content_id;
use calm_schema::{CalmError, EmbedRole, Result};
use calm_store::{scroll_all, FileCheckpoint, Filter, MetadataStore, Payload, PointRecord, VectorStore};

use crate::parse::{parse_units, CodeUnit, Language};

#[derive(Debug, Clone)]
pub struct IndexFileReport {
    pub file_path: String,
    pub units_indexed: usize,
    /// True when the checkpoint hash matched and nothing was re-parsed.
    pub skipped: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IndexDirectoryReport {
    pub files_seen: usize,
    pub files_indexed: usize,
    pub files_skipped: usize,
    pub units_indexed: usize,
}

pub struct CodeIndexer {
    store: Arc<dyn VectorStore>,
    registry: EmbeddingRegistry,
    meta: Arc<MetadataStore>,
}

impl CodeIndexer {
    pub fn new(
        store: Arc<dyn VectorStore>,
        registry: EmbeddingRegistry,
        meta: Arc<MetadataStore>,
    ) -> Self {
        Self { store, registry, meta }
    }

    /// Parse one file and upsert its units, removing units that no longer
    /// exist. A matching checkpoint hash short-circuits the whole thing.
    pub async fn index_file(&self, project: &str, path: &Path) -> Result<IndexFileReport> {
        let file_path = path.to_string_lossy().to_string();
        let language = Language::from_path(path).ok_or_else(|| {
            CalmError::validation(format!("unsupported file type: {file_path}"))
        })?;

        let source = fs::read_to_string(path)
            .map_err(|err| CalmError::not_found(format!("reading {file_path}: {err}")))?;
        let hash = file_hash(&source);
        let mtime = fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        if let Some(checkpoint) = self.meta.file_checkpoint(project, &file_path)? {
            if checkpoint.hash == hash {
                debug!(file = %file_path, "checkpoint hash matched, skipping");
                return Ok(IndexFileReport {
                    file_path,
                    units_indexed: checkpoint.unit_count as usize,
                    skipped: true,
                });
            }
        }

        let units = parse_units(language, &source)?;
        self.replace_file_units(project, &file_path, language, &hash, &units).await?;
        self.meta.set_file_checkpoint(
            project,
            &file_path,
            &FileCheckpoint { hash, mtime, unit_count: units.len() as u32 },
        )?;

        info!(file = %file_path, units = units.len(), "file indexed");
        Ok(IndexFileReport { file_path, units_indexed: units.len(), skipped: false })
    }

    /// Walk a directory (gitignore-aware) and index every supported file.
    pub async fn index_directory(&self, project: &str, root: &Path) -> Result<IndexDirectoryReport> {
        let mut report = IndexDirectoryReport::default();
        let walker = WalkBuilder::new(root).hidden(true).build();
        for dir_entry in walker {
            let dir_entry = match dir_entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(error = %err, "walk entry error, skipping");
                    continue;
                }
            };
            let path = dir_entry.path();
            if !path.is_file() || Language::from_path(path).is_none() {
                continue;
            }
            report.files_seen += 1;
            match self.index_file(project, path).await {
                Ok(file_report) if file_report.skipped => report.files_skipped += 1,
                Ok(file_report) => {
                    report.files_indexed += 1;
                    report.units_indexed += file_report.units_indexed;
                }
                Err(err) => {
                    debug!(file = %path.display(), error = %err, "file skipped on error");
                }
            }
        }
        info!(
            project,
            seen = report.files_seen,
            indexed = report.files_indexed,
            skipped = report.files_skipped,
            "directory indexed"
        );
        Ok(report)
    }

    /// Drop a file's units from the index, e.g. after deletion.
    pub async fn delete_file_units(&self, project: &str, file_path: &str) -> Result<usize> {
        let filter = Filter::new().eq("project", project).eq("file_path", file_path);
        let existing = scroll_all(self.store.as_ref(), CODE_UNITS, Some(&filter)).await?;
        for point in &existing {
            self.store.delete(CODE_UNITS, &point.id).await?;
        }
        self.meta.remove_file_checkpoint(project, file_path)?;
        Ok(existing.len())
    }

    async fn replace_file_units(
        &self,
        project: &str,
        file_path: &str,
        language: Language,
        hash: &str,
        units: &[CodeUnit],
    ) -> Result<()> {
        // Stale ids first: units renamed or removed since the last pass.
        let filter = Filter::new().eq("project", project).eq("file_path", file_path);
        let existing = scroll_all(self.store.as_ref(), CODE_UNITS, Some(&filter)).await?;
        let fresh_ids: std::collections::HashSet<String> = units
            .iter()
            .map(|u| unit_id(project, file_path, &u.qualified_name))
            .collect();
        for point in existing {
            if !fresh_ids.contains(&point.id) {
                self.store.delete(CODE_UNITS, &point.id).await?;
            }
        }

        if units.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = units
            .iter()
            .map(|u| format!("{} {}\n{}", u.unit_type, u.qualified_name, u.snippet))
            .collect();
        let vectors = self.registry.embed_many(EmbedRole::Code, &texts).await?;

        for (unit, vector) in units.iter().zip(vectors) {
            let mut payload = Payload::new();
            payload.insert("project".into(), json!(project));
            payload.insert("file_path".into(), json!(file_path));
            payload.insert("qualified_name".into(), json!(unit.qualified_name));
            payload.insert("unit_type".into(), json!(unit.unit_type));
            payload.insert("language".into(), json!(language.as_str()));
            payload.insert("signature".into(), json!(unit.signature));
            payload.insert("start_line".into(), json!(unit.start_line));
            payload.insert("end_line".into(), json!(unit.end_line));
            payload.insert("file_hash".into(), json!(hash));
            self.store
                .upsert(
                    CODE_UNITS,
                    PointRecord {
                        id: unit_id(project, file_path, &unit.qualified_name),
                        vector,
                        payload,
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Checkpoint summary for one project: `(file_path, unit_count)` pairs.
    pub fn status(&self, project: &str) -> Result<Vec<(String, u32)>> {
        Ok(self
            .meta
            .checkpoints_for_project(project)?
            .into_iter()
            .map(|(path, checkpoint)| (path, checkpoint.unit_count))
            .collect())
    }
}

fn unit_id(project: &str, file_path: &str, qualified_name: &str) -> String {
    content_id(&[project, file_path, qualified_name])
}

fn file_hash(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}
