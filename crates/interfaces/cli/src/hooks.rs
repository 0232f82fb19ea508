//! Hook entry points.
//!
//! Hooks run on every tool call and session start, so they talk to the
//! journal directory directly: no daemon round-trip, no embedder, no vector
//! store. Output is a single JSON line for the hook script to consume.

use anyhow::Result;
use serde_json::{json, Value};

use calm_config::CalmConfig;
use calm_journal::JournalStore;

pub async fn session_start(config: &CalmConfig) -> Result<Value> {
    let journal = JournalStore::open(config.journal_dir())?;
    let info = journal.start_session().await?;

    // Surface the orphan (or a corrupt current file) exactly once.
    let orphan = match journal.get_orphaned_ghap().await {
        Ok(entry) => json!(entry),
        Err(err) => json!({"error": {"type": err.kind(), "message": err.to_string()}}),
    };
    Ok(json!({
        "session_id": info.session_id,
        "orphan": orphan,
    }))
}

pub async fn pre_tool(config: &CalmConfig) -> Result<Value> {
    let journal = JournalStore::open(config.journal_dir())?;
    let count = journal.increment_tool_count().await?;
    let check_in = journal.should_check_in(config.check_in_frequency).await?;
    Ok(json!({
        "tool_count": count,
        "check_in": check_in,
    }))
}

pub async fn check_in(config: &CalmConfig) -> Result<Value> {
    let journal = JournalStore::open(config.journal_dir())?;
    journal.reset_tool_count().await?;
    Ok(json!({"tool_count": 0}))
}
