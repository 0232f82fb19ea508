//! Incremental git-history indexing into the `commits` collection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{Repository, Sort};
use serde_json::json;
use tracing::info;

use calm_embedding::EmbeddingRegistry;
use calm_schema::collections::COMMITS;
use calm_schema::{CalmError, EmbedRole, Result};
use calm_store::{MetadataStore, Payload, PointRecord, VectorStore};

#[derive(Debug, Clone, Default)]
pub struct IndexCommitsReport {
    pub commits_indexed: usize,
    /// Head sha recorded as the new checkpoint, if the walk saw anything.
    pub head: Option<String>,
}

/// Everything worth keeping from one commit, collected on the blocking pool
/// where the repository handle lives.
struct CommitData {
    sha: String,
    author: String,
    author_email: String,
    timestamp: i64,
    summary: String,
    files: Vec<String>,
    insertions: u64,
    deletions: u64,
}

pub struct CommitIndexer {
    store: Arc<dyn VectorStore>,
    registry: EmbeddingRegistry,
    meta: Arc<MetadataStore>,
}

impl CommitIndexer {
    pub fn new(
        store: Arc<dyn VectorStore>,
        registry: EmbeddingRegistry,
        meta: Arc<MetadataStore>,
    ) -> Self {
        Self { store, registry, meta }
    }

    /// Walk from HEAD back to the last indexed sha (or `limit` commits) and
    /// upsert each new commit. Newest-first; the checkpoint advances to HEAD
    /// once the batch lands.
    pub async fn index_commits(
        &self,
        project: &str,
        repo_path: &Path,
        limit: usize,
    ) -> Result<IndexCommitsReport> {
        let stop_at = self.meta.last_indexed_commit(project)?;
        let path: PathBuf = repo_path.to_path_buf();
        let commits = tokio::task::spawn_blocking(move || collect_commits(&path, stop_at, limit))
            .await
            .map_err(|err| CalmError::Store(format!("commit walk task failed: {err}")))??;

        if commits.is_empty() {
            return Ok(IndexCommitsReport::default());
        }
        let head = commits.first().map(|c| c.sha.clone());

        let texts: Vec<String> = commits.iter().map(embed_text).collect();
        let vectors = self.registry.embed_many(EmbedRole::Semantic, &texts).await?;
        for ((commit, vector), text) in commits.iter().zip(vectors).zip(&texts) {
            let mut payload = Payload::new();
            payload.insert("sha".into(), json!(commit.sha));
            payload.insert("author".into(), json!(commit.author));
            payload.insert("author_email".into(), json!(commit.author_email));
            payload.insert("timestamp".into(), json!(commit.timestamp));
            payload.insert("files".into(), json!(commit.files));
            payload.insert("insertions".into(), json!(commit.insertions));
            payload.insert("deletions".into(), json!(commit.deletions));
            payload.insert("project".into(), json!(project));
            payload.insert("content".into(), json!(text));
            self.store
                .upsert(
                    COMMITS,
                    PointRecord { id: commit.sha.clone(), vector, payload },
                )
                .await?;
        }

        if let Some(head_sha) = &head {
            self.meta.set_last_indexed_commit(project, head_sha)?;
        }
        info!(project, commits = commits.len(), "commit history indexed");
        Ok(IndexCommitsReport { commits_indexed: commits.len(), head })
    }
}

fn collect_commits(
    repo_path: &Path,
    stop_at: Option<String>,
    limit: usize,
) -> Result<Vec<CommitData>> {
    let repo = Repository::open(repo_path)
        .map_err(|err| CalmError::not_found(format!("opening repo {}: {err}", repo_path.display())))?;
    let mut walk = repo
        .revwalk()
        .map_err(|err| CalmError::Store(format!("revwalk: {err}")))?;
    walk.push_head()
        .map_err(|err| CalmError::Store(format!("no HEAD to walk: {err}")))?;
    walk.set_sorting(Sort::TIME)
        .map_err(|err| CalmError::Store(format!("revwalk sort: {err}")))?;

    let mut commits = Vec::new();
    for oid in walk {
        let oid = oid.map_err(|err| CalmError::Store(format!("revwalk step: {err}")))?;
        let sha = oid.to_string();
        if stop_at.as_deref() == Some(sha.as_str()) || commits.len() >= limit {
            break;
        }
        let commit = repo
            .find_commit(oid)
            .map_err(|err| CalmError::Store(format!("loading commit {sha}: {err}")))?;

        // Diff against the first parent; the root commit diffs against empty.
        let tree = commit.tree().ok();
        let parent_tree = commit.parent(0).ok().and_then(|p| p.tree().ok());
        let diff = repo
            .diff_tree_to_tree(parent_tree.as_ref(), tree.as_ref(), None)
            .map_err(|err| CalmError::Store(format!("diffing {sha}: {err}")))?;
        let stats = diff
            .stats()
            .map_err(|err| CalmError::Store(format!("diff stats {sha}: {err}")))?;
        let files: Vec<String> = diff
            .deltas()
            .filter_map(|delta| {
                delta
                    .new_file()
                    .path()
                    .or_else(|| delta.old_file().path())
                    .map(|p| p.to_string_lossy().to_string())
            })
            .collect();

        let author = commit.author();
        commits.push(CommitData {
            sha,
            author: author.name().unwrap_or("unknown").to_string(),
            author_email: author.email().unwrap_or("").to_string(),
            timestamp: commit.time().seconds(),
            summary: commit.message().unwrap_or("").trim().to_string(),
            files,
            insertions: stats.insertions() as u64,
            deletions: stats.deletions() as u64,
        });
    }
    Ok(commits)
}

fn embed_text(commit: &CommitData) -> String {
    let mut text = commit.summary.clone();
    if !commit.files.is_empty() {
        text.push_str("\nFiles: ");
        text.push_str(&commit.files.join(", "));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use calm_schema::collections::SEMANTIC_DIM;
    use calm_store::{scroll_all, EmbeddedStore};
    use git2::Signature;
    use std::fs;
    use std::path::Path;

    fn commit_file(repo: &Repository, name: &str, contents: &str, message: &str) -> Result<String> {
        let workdir = repo.workdir().unwrap();
        fs::write(workdir.join(name), contents)?;
        let mut index = repo.index()?;
        index.add_path(Path::new(name))?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let signature = Signature::now("Dev One", "dev@example.com")?;
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let oid = repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
        Ok(oid.to_string())
    }

    async fn fixture(dir: &Path) -> Result<(Arc<EmbeddedStore>, CommitIndexer)> {
        let store = Arc::new(EmbeddedStore::in_memory());
        store.create_collection(COMMITS, SEMANTIC_DIM).await?;
        let meta = Arc::new(MetadataStore::open(dir.join("meta.redb"))?);
        let indexer = CommitIndexer::new(store.clone(), EmbeddingRegistry::mock(), meta);
        Ok((store, indexer))
    }

    #[tokio::test]
    async fn indexes_history_then_only_new_commits() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo_dir = dir.path().join("repo");
        fs::create_dir_all(&repo_dir)?;
        let repo = Repository::init(&repo_dir)?;
        commit_file(&repo, "a.txt", "one", "add a")?;
        let second = commit_file(&repo, "b.txt", "two", "add b file")?;

        let (store, indexer) = fixture(dir.path()).await?;
        let first_run = indexer.index_commits("calm", &repo_dir, 100).await?;
        assert_eq!(first_run.commits_indexed, 2);
        assert_eq!(first_run.head.as_deref(), Some(second.as_str()));

        // Nothing new: the checkpoint stops the walk immediately.
        let second_run = indexer.index_commits("calm", &repo_dir, 100).await?;
        assert_eq!(second_run.commits_indexed, 0);

        // One more commit: only it gets indexed.
        let third = commit_file(&repo, "c.txt", "three", "add c file")?;
        let third_run = indexer.index_commits("calm", &repo_dir, 100).await?;
        assert_eq!(third_run.commits_indexed, 1);
        assert_eq!(third_run.head.as_deref(), Some(third.as_str()));

        let points = scroll_all(store.as_ref(), COMMITS, None).await?;
        assert_eq!(points.len(), 3);
        let payload = &points.iter().find(|p| p.id == second).unwrap().payload;
        assert_eq!(payload["author"], "Dev One");
        assert_eq!(payload["files"], serde_json::json!(["b.txt"]));
        assert!(payload["insertions"].as_u64().unwrap() >= 1);
        Ok(())
    }
}
