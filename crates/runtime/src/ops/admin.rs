use serde_json::{json, Value};

use calm_schema::collections::ALL_COLLECTIONS;
use calm_schema::Result;

use crate::args::Args;
use crate::services::Services;

pub async fn health_check(services: &Services, _args: &Args<'_>) -> Result<Value> {
    // A cheap store round-trip proves the backend is reachable.
    let memories = services
        .store
        .count(calm_schema::collections::MEMORIES, None)
        .await?;
    Ok(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "memories": memories,
    }))
}

pub async fn collection_stats(services: &Services, _args: &Args<'_>) -> Result<Value> {
    let mut stats = serde_json::Map::new();
    for name in ALL_COLLECTIONS {
        stats.insert(name.to_string(), json!(services.store.count(name, None).await?));
    }
    Ok(json!({"collections": stats}))
}

pub async fn show_config(services: &Services, _args: &Args<'_>) -> Result<Value> {
    serde_json::to_value(services.config.as_ref())
        .map_err(|err| calm_schema::CalmError::Store(format!("encoding config: {err}")))
}
