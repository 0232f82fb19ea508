use chrono::Utc;
use serde_json::{json, Value};

use calm_schema::collections::MEMORIES;
use calm_schema::{CalmError, EmbedRole, MemoryCategory, MemoryRecord, Result};
use calm_search::MemoryFilters;
use calm_store::{Payload, PointRecord};

use crate::args::{Args, CONTENT_MAX};
use crate::services::Services;

fn memory_payload(record: &MemoryRecord) -> Payload {
    let mut payload = Payload::new();
    payload.insert("content".into(), json!(record.content));
    payload.insert("category".into(), json!(record.category.as_str()));
    payload.insert("importance".into(), json!(record.importance));
    payload.insert("tags".into(), json!(record.tags));
    payload.insert("created_at".into(), json!(record.created_at));
    payload.insert("project".into(), json!(record.project));
    payload
}

async fn write_memory(services: &Services, record: &MemoryRecord) -> Result<()> {
    let vector = services
        .registry
        .embed_one(EmbedRole::Semantic, &record.content)
        .await?;
    services
        .store
        .upsert(
            MEMORIES,
            PointRecord { id: record.id.clone(), vector, payload: memory_payload(record) },
        )
        .await?;
    services.meta.put_memory(record)?;
    Ok(())
}

pub async fn store_memory(services: &Services, args: &Args<'_>) -> Result<Value> {
    let max = services.config.memory_content_max_length.min(CONTENT_MAX);
    let content = args.text("content", max)?;
    let category: MemoryCategory = args.parsed("category")?;
    let importance = args.importance()?;
    let tags = args.tags()?;
    let project = args.opt_string("project", 200)?;

    let record = MemoryRecord {
        id: MemoryRecord::derive_id(&content, project.as_deref()),
        content,
        category,
        importance,
        tags,
        created_at: Utc::now().timestamp(),
        project,
    };
    write_memory(services, &record).await?;
    Ok(json!(record))
}

pub async fn get_memory(services: &Services, args: &Args<'_>) -> Result<Value> {
    let id = args.text("id", 100)?;
    let record = services
        .meta
        .get_memory(&id)?
        .ok_or_else(|| CalmError::not_found(format!("memory '{id}'")))?;
    Ok(json!(record))
}

pub async fn list_memories(services: &Services, args: &Args<'_>) -> Result<Value> {
    let offset = args.offset()?;
    let limit = args.limit(20)?;
    let category = args.opt_parsed::<MemoryCategory>("category")?;
    let project = args.opt_string("project", 200)?;
    let records = services.meta.list_memories(
        offset,
        limit,
        category.map(|c| c.as_str()),
        project.as_deref(),
    )?;
    Ok(json!({
        "memories": records,
        "total": services.meta.count_memories()?,
    }))
}

pub async fn update_memory(services: &Services, args: &Args<'_>) -> Result<Value> {
    let id = args.text("id", 100)?;
    let mut record = services
        .meta
        .get_memory(&id)?
        .ok_or_else(|| CalmError::not_found(format!("memory '{id}'")))?;

    let max = services.config.memory_content_max_length.min(CONTENT_MAX);
    if let Some(content) = args.opt_string("content", max)? {
        record.content = content;
    }
    if let Some(category) = args.opt_parsed::<MemoryCategory>("category")? {
        record.category = category;
    }
    if let Some(importance) = args.opt_f32("importance")? {
        if !(0.0..=1.0).contains(&importance) {
            return Err(CalmError::validation(
                "field 'importance' must be within [0, 1]".to_string(),
            ));
        }
        record.importance = importance;
    }
    if let Some(tags) = args.opt_tags()? {
        // A supplied empty array clears the tags.
        record.tags = tags;
    }

    // The id stays stable across updates even though it was derived from the
    // original content.
    write_memory(services, &record).await?;
    Ok(json!(record))
}

pub async fn delete_memory(services: &Services, args: &Args<'_>) -> Result<Value> {
    let id = args.text("id", 100)?;
    services.store.delete(MEMORIES, &id).await?;
    services.meta.delete_memory(&id)?;
    Ok(json!({"deleted": id}))
}

pub async fn search_memories(services: &Services, args: &Args<'_>) -> Result<Value> {
    let query = args.query()?;
    let limit = args.limit(10)?;
    let filters = MemoryFilters {
        category: args.opt_parsed::<MemoryCategory>("category")?.map(|c| c.as_str().to_string()),
        min_importance: args.opt_f32("min_importance")?,
        tags_any: args.string_list("tags_any")?,
    };
    let hits = services.searcher.search_memories(&query, limit, filters).await?;
    Ok(json!({"results": hits}))
}
