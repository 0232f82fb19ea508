//! Durable structured metadata sidecar backed by [`redb`].
//!
//! Holds everything that must be listable without vector I/O: memory shadow
//! records, the GHAP metadata index, per-file indexing checkpoints, and the
//! last-indexed commit sha per project. Single writer (redb write
//! transactions); readers only ever see committed state.
//!
//! | Table                | Key                              | Value                      |
//! |----------------------|----------------------------------|----------------------------|
//! | `memories_meta`      | memory id                        | JSON `MemoryRecord`        |
//! | `ghap_meta`          | entry id                         | JSON `GhapMeta`            |
//! | `file_checkpoints`   | `{project}\u{1f}{file_path}`     | bincode `FileCheckpoint`   |
//! | `commit_checkpoints` | project                          | sha string                 |

use std::path::{Path, PathBuf};

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::info;

use calm_schema::{
    CalmError, ConfidenceTier, Domain, MemoryRecord, OutcomeStatus, Result, Strategy,
};

const MEMORIES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("memories_meta");
const GHAP_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("ghap_meta");
const FILE_CHECKPOINTS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("file_checkpoints");
const COMMIT_CHECKPOINTS_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("commit_checkpoints");

/// Separator between project and file path in checkpoint keys.
const KEY_SEP: char = '\u{1f}';

/// Per-file indexing checkpoint: skip re-parsing when the hash matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCheckpoint {
    pub hash: String,
    pub mtime: i64,
    pub unit_count: u32,
}

/// Compact index record for one resolved GHAP entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GhapMeta {
    pub entry_id: String,
    pub session_id: String,
    pub domain: Domain,
    pub strategy: Strategy,
    pub outcome_status: OutcomeStatus,
    pub confidence_tier: ConfidenceTier,
    pub iteration_count: u32,
    pub created_at: i64,
    pub captured_at: i64,
}

pub struct MetadataStore {
    db: Database,
    path: PathBuf,
}

fn meta_err(context: &str, err: impl std::fmt::Display) -> CalmError {
    CalmError::Store(format!("{context}: {err}"))
}

impl MetadataStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path)
            .map_err(|err| meta_err("opening metadata store", err))?;

        // Ensure tables exist.
        {
            let tx = db.begin_write().map_err(|err| meta_err("begin write", err))?;
            tx.open_table(MEMORIES_TABLE).map_err(|err| meta_err("open table", err))?;
            tx.open_table(GHAP_TABLE).map_err(|err| meta_err("open table", err))?;
            tx.open_table(FILE_CHECKPOINTS_TABLE)
                .map_err(|err| meta_err("open table", err))?;
            tx.open_table(COMMIT_CHECKPOINTS_TABLE)
                .map_err(|err| meta_err("open table", err))?;
            tx.commit().map_err(|err| meta_err("commit", err))?;
        }
        info!(path = %path.display(), "metadata store opened");
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn put_raw(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &[u8],
    ) -> Result<()> {
        let tx = self.db.begin_write().map_err(|err| meta_err("begin write", err))?;
        {
            let mut tbl = tx.open_table(table).map_err(|err| meta_err("open table", err))?;
            tbl.insert(key, value).map_err(|err| meta_err("insert", err))?;
        }
        tx.commit().map_err(|err| meta_err("commit", err))?;
        Ok(())
    }

    fn get_raw(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> Result<Option<Vec<u8>>> {
        let tx = self.db.begin_read().map_err(|err| meta_err("begin read", err))?;
        let tbl = tx.open_table(table).map_err(|err| meta_err("open table", err))?;
        Ok(tbl
            .get(key)
            .map_err(|err| meta_err("get", err))?
            .map(|v| v.value().to_vec()))
    }

    fn remove_raw(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> Result<()> {
        let tx = self.db.begin_write().map_err(|err| meta_err("begin write", err))?;
        {
            let mut tbl = tx.open_table(table).map_err(|err| meta_err("open table", err))?;
            tbl.remove(key).map_err(|err| meta_err("remove", err))?;
        }
        tx.commit().map_err(|err| meta_err("commit", err))?;
        Ok(())
    }

    // ── Memory shadow records ─────────────────────────────────────────────────

    pub fn put_memory(&self, record: &MemoryRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)
            .map_err(|err| meta_err("encoding memory record", err))?;
        self.put_raw(MEMORIES_TABLE, &record.id, &bytes)
    }

    pub fn get_memory(&self, id: &str) -> Result<Option<MemoryRecord>> {
        match self.get_raw(MEMORIES_TABLE, id)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes)
                    .map_err(|err| meta_err("decoding memory record", err))?,
            )),
        }
    }

    pub fn delete_memory(&self, id: &str) -> Result<()> {
        self.remove_raw(MEMORIES_TABLE, id)
    }

    /// Paginated listing in id order, optionally narrowed by category and
    /// project. Never touches the vector store.
    pub fn list_memories(
        &self,
        offset: usize,
        limit: usize,
        category: Option<&str>,
        project: Option<&str>,
    ) -> Result<Vec<MemoryRecord>> {
        let tx = self.db.begin_read().map_err(|err| meta_err("begin read", err))?;
        let tbl = tx
            .open_table(MEMORIES_TABLE)
            .map_err(|err| meta_err("open table", err))?;
        let mut out = Vec::new();
        let mut skipped = 0usize;
        for item in tbl.iter().map_err(|err| meta_err("iterate", err))? {
            let (_, value) = item.map_err(|err| meta_err("iterate", err))?;
            let record: MemoryRecord = serde_json::from_slice(value.value())
                .map_err(|err| meta_err("decoding memory record", err))?;
            if let Some(category) = category {
                if record.category.as_str() != category {
                    continue;
                }
            }
            if let Some(project) = project {
                if record.project.as_deref() != Some(project) {
                    continue;
                }
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            out.push(record);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    pub fn count_memories(&self) -> Result<u64> {
        let tx = self.db.begin_read().map_err(|err| meta_err("begin read", err))?;
        let tbl = tx
            .open_table(MEMORIES_TABLE)
            .map_err(|err| meta_err("open table", err))?;
        Ok(tbl.len().map_err(|err| meta_err("len", err))?)
    }

    // ── GHAP metadata index ───────────────────────────────────────────────────

    pub fn put_ghap_meta(&self, meta: &GhapMeta) -> Result<()> {
        let bytes =
            serde_json::to_vec(meta).map_err(|err| meta_err("encoding ghap meta", err))?;
        self.put_raw(GHAP_TABLE, &meta.entry_id, &bytes)
    }

    pub fn get_ghap_meta(&self, entry_id: &str) -> Result<Option<GhapMeta>> {
        match self.get_raw(GHAP_TABLE, entry_id)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes)
                    .map_err(|err| meta_err("decoding ghap meta", err))?,
            )),
        }
    }

    pub fn list_ghap_meta(&self) -> Result<Vec<GhapMeta>> {
        let tx = self.db.begin_read().map_err(|err| meta_err("begin read", err))?;
        let tbl = tx.open_table(GHAP_TABLE).map_err(|err| meta_err("open table", err))?;
        let mut out = Vec::new();
        for item in tbl.iter().map_err(|err| meta_err("iterate", err))? {
            let (_, value) = item.map_err(|err| meta_err("iterate", err))?;
            out.push(
                serde_json::from_slice(value.value())
                    .map_err(|err| meta_err("decoding ghap meta", err))?,
            );
        }
        Ok(out)
    }

    // ── File indexing checkpoints ─────────────────────────────────────────────

    fn checkpoint_key(project: &str, file_path: &str) -> String {
        format!("{project}{KEY_SEP}{file_path}")
    }

    pub fn file_checkpoint(&self, project: &str, file_path: &str) -> Result<Option<FileCheckpoint>> {
        let key = Self::checkpoint_key(project, file_path);
        match self.get_raw(FILE_CHECKPOINTS_TABLE, &key)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes)
                    .map_err(|err| meta_err("decoding checkpoint", err))?,
            )),
        }
    }

    pub fn set_file_checkpoint(
        &self,
        project: &str,
        file_path: &str,
        checkpoint: &FileCheckpoint,
    ) -> Result<()> {
        let key = Self::checkpoint_key(project, file_path);
        let bytes = bincode::serialize(checkpoint)
            .map_err(|err| meta_err("encoding checkpoint", err))?;
        self.put_raw(FILE_CHECKPOINTS_TABLE, &key, &bytes)
    }

    pub fn remove_file_checkpoint(&self, project: &str, file_path: &str) -> Result<()> {
        let key = Self::checkpoint_key(project, file_path);
        self.remove_raw(FILE_CHECKPOINTS_TABLE, &key)
    }

    /// All checkpoints for one project as `(file_path, checkpoint)` pairs.
    pub fn checkpoints_for_project(&self, project: &str) -> Result<Vec<(String, FileCheckpoint)>> {
        let prefix = format!("{project}{KEY_SEP}");
        let tx = self.db.begin_read().map_err(|err| meta_err("begin read", err))?;
        let tbl = tx
            .open_table(FILE_CHECKPOINTS_TABLE)
            .map_err(|err| meta_err("open table", err))?;
        let mut out = Vec::new();
        for item in tbl.iter().map_err(|err| meta_err("iterate", err))? {
            let (key, value) = item.map_err(|err| meta_err("iterate", err))?;
            let key = key.value();
            if let Some(file_path) = key.strip_prefix(prefix.as_str()) {
                let checkpoint = bincode::deserialize(value.value())
                    .map_err(|err| meta_err("decoding checkpoint", err))?;
                out.push((file_path.to_string(), checkpoint));
            }
        }
        Ok(out)
    }

    // ── Commit checkpoints ────────────────────────────────────────────────────

    pub fn last_indexed_commit(&self, project: &str) -> Result<Option<String>> {
        let tx = self.db.begin_read().map_err(|err| meta_err("begin read", err))?;
        let tbl = tx
            .open_table(COMMIT_CHECKPOINTS_TABLE)
            .map_err(|err| meta_err("open table", err))?;
        Ok(tbl
            .get(project)
            .map_err(|err| meta_err("get", err))?
            .map(|v| v.value().to_string()))
    }

    pub fn set_last_indexed_commit(&self, project: &str, sha: &str) -> Result<()> {
        let tx = self.db.begin_write().map_err(|err| meta_err("begin write", err))?;
        {
            let mut tbl = tx
                .open_table(COMMIT_CHECKPOINTS_TABLE)
                .map_err(|err| meta_err("open table", err))?;
            tbl.insert(project, sha).map_err(|err| meta_err("insert", err))?;
        }
        tx.commit().map_err(|err| meta_err("commit", err))?;
        Ok(())
    }
}
