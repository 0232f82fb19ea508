use serde_json::{json, Value};

use calm_schema::Result;

use crate::args::Args;
use crate::services::Services;

pub async fn start_session(services: &Services, _args: &Args<'_>) -> Result<Value> {
    let info = services.journal.start_session().await?;
    Ok(json!({
        "session_id": info.session_id,
        "has_orphan": info.has_orphan,
    }))
}

pub async fn get_session(services: &Services, _args: &Args<'_>) -> Result<Value> {
    Ok(json!({
        "session_id": services.journal.current_session_id().await?,
        "tool_count": services.journal.tool_count().await?,
    }))
}

pub async fn increment_tool_count(services: &Services, _args: &Args<'_>) -> Result<Value> {
    Ok(json!({"count": services.journal.increment_tool_count().await?}))
}

pub async fn should_check_in(services: &Services, args: &Args<'_>) -> Result<Value> {
    let frequency = match args.opt_i64("frequency")? {
        None => services.config.check_in_frequency,
        Some(v) if v >= 0 => v as u64,
        Some(_) => {
            return Err(calm_schema::CalmError::validation(
                "field 'frequency' must be non-negative".to_string(),
            ))
        }
    };
    Ok(json!({
        "check_in": services.journal.should_check_in(frequency).await?,
        "frequency": frequency,
    }))
}

pub async fn reset_tool_count(services: &Services, _args: &Args<'_>) -> Result<Value> {
    services.journal.reset_tool_count().await?;
    Ok(json!({"count": 0}))
}
