use std::path::PathBuf;

use serde_json::{json, Value};

use calm_schema::Result;

use crate::args::Args;
use crate::services::Services;

pub async fn index_file(services: &Services, args: &Args<'_>) -> Result<Value> {
    let project = args.text("project", 200)?;
    let path = PathBuf::from(args.text("path", 4096)?);
    let report = services.code_indexer.index_file(&project, &path).await?;
    Ok(json!({
        "file_path": report.file_path,
        "units_indexed": report.units_indexed,
        "skipped": report.skipped,
    }))
}

pub async fn index_directory(services: &Services, args: &Args<'_>) -> Result<Value> {
    let project = args.text("project", 200)?;
    let path = PathBuf::from(args.text("path", 4096)?);
    let report = services.code_indexer.index_directory(&project, &path).await?;
    Ok(json!({
        "files_seen": report.files_seen,
        "files_indexed": report.files_indexed,
        "files_skipped": report.files_skipped,
        "units_indexed": report.units_indexed,
    }))
}

pub async fn search_code(services: &Services, args: &Args<'_>) -> Result<Value> {
    let query = args.query()?;
    let limit = args.limit(10)?;
    let hits = services
        .searcher
        .search_code(
            &query,
            limit,
            args.opt_string("project", 200)?,
            args.opt_string("language", 50)?,
            args.opt_string("unit_type", 50)?,
        )
        .await?;
    Ok(json!({"results": hits}))
}

pub async fn delete_file_units(services: &Services, args: &Args<'_>) -> Result<Value> {
    let project = args.text("project", 200)?;
    let file_path = args.text("file_path", 4096)?;
    let removed = services.code_indexer.delete_file_units(&project, &file_path).await?;
    Ok(json!({"units_removed": removed}))
}

pub async fn index_status(services: &Services, args: &Args<'_>) -> Result<Value> {
    let project = args.text("project", 200)?;
    let files: Vec<Value> = services
        .code_indexer
        .status(&project)?
        .into_iter()
        .map(|(file_path, unit_count)| json!({"file_path": file_path, "unit_count": unit_count}))
        .collect();
    Ok(json!({
        "project": project,
        "files": files,
        "last_indexed_commit": services.meta.last_indexed_commit(&project)?,
    }))
}

pub async fn index_commits(services: &Services, args: &Args<'_>) -> Result<Value> {
    let project = args.text("project", 200)?;
    let repo_path = PathBuf::from(args.text("repo_path", 4096)?);
    let limit = args.limit(500)?;
    let report = services
        .commit_indexer
        .index_commits(&project, &repo_path, limit)
        .await?;
    Ok(json!({
        "commits_indexed": report.commits_indexed,
        "head": report.head,
    }))
}

pub async fn search_commits(services: &Services, args: &Args<'_>) -> Result<Value> {
    let query = args.query()?;
    let limit = args.limit(10)?;
    let hits = services
        .searcher
        .search_commits(
            &query,
            limit,
            args.opt_string("author", 200)?,
            args.opt_i64("since")?,
            args.opt_i64("until")?,
        )
        .await?;
    Ok(json!({"results": hits}))
}
