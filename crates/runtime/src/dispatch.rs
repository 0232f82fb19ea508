use serde_json::Value;
use tracing::warn;

use calm_schema::{CalmError, Result};

use crate::args::Args;
use crate::ops;
use crate::services::Services;

/// Every operation the dispatcher exposes, grouped by family.
pub const OPERATIONS: &[&str] = &[
    // memories
    "store_memory",
    "get_memory",
    "list_memories",
    "update_memory",
    "delete_memory",
    "search_memories",
    // code index
    "index_file",
    "index_directory",
    "search_code",
    "delete_file_units",
    "index_status",
    // commits
    "index_commits",
    "search_commits",
    // ghap
    "create_ghap",
    "update_ghap",
    "resolve_ghap",
    "get_current_ghap",
    "get_orphaned_ghap",
    "adopt_orphan",
    "abandon_orphan",
    "list_session_entries",
    // experiences
    "search_experiences",
    "persist_experience",
    "experience_stats",
    // clustering
    "run_clustering",
    "get_clusters",
    "cluster_status",
    // values
    "validate_value",
    "store_value",
    "list_values",
    "search_values",
    "delete_value",
    // context
    "assemble_context",
    "premortem_context",
    // session
    "start_session",
    "get_session",
    "increment_tool_count",
    "should_check_in",
    "reset_tool_count",
    // admin
    "health_check",
    "collection_stats",
    "show_config",
];

/// Run one named operation. Transient store/embed failures are retried once
/// before surfacing; every other error bubbles immediately.
pub async fn dispatch(services: &Services, op: &str, raw_args: &Value) -> Result<Value> {
    let mut retried = false;
    loop {
        match run(services, op, raw_args).await {
            Err(err) if err.is_transient() && !retried => {
                warn!(op, error = %err, "transient failure, retrying once");
                retried = true;
            }
            outcome => return outcome,
        }
    }
}

async fn run(services: &Services, op: &str, raw_args: &Value) -> Result<Value> {
    let args = Args::new(raw_args)?;
    match op {
        "store_memory" => ops::memories::store_memory(services, &args).await,
        "get_memory" => ops::memories::get_memory(services, &args).await,
        "list_memories" => ops::memories::list_memories(services, &args).await,
        "update_memory" => ops::memories::update_memory(services, &args).await,
        "delete_memory" => ops::memories::delete_memory(services, &args).await,
        "search_memories" => ops::memories::search_memories(services, &args).await,

        "index_file" => ops::index::index_file(services, &args).await,
        "index_directory" => ops::index::index_directory(services, &args).await,
        "search_code" => ops::index::search_code(services, &args).await,
        "delete_file_units" => ops::index::delete_file_units(services, &args).await,
        "index_status" => ops::index::index_status(services, &args).await,
        "index_commits" => ops::index::index_commits(services, &args).await,
        "search_commits" => ops::index::search_commits(services, &args).await,

        "create_ghap" => ops::ghap::create_ghap(services, &args).await,
        "update_ghap" => ops::ghap::update_ghap(services, &args).await,
        "resolve_ghap" => ops::ghap::resolve_ghap(services, &args).await,
        "get_current_ghap" => ops::ghap::get_current_ghap(services, &args).await,
        "get_orphaned_ghap" => ops::ghap::get_orphaned_ghap(services, &args).await,
        "adopt_orphan" => ops::ghap::adopt_orphan(services, &args).await,
        "abandon_orphan" => ops::ghap::abandon_orphan(services, &args).await,
        "list_session_entries" => ops::ghap::list_session_entries(services, &args).await,

        "search_experiences" => ops::learn::search_experiences(services, &args).await,
        "persist_experience" => ops::learn::persist_experience(services, &args).await,
        "experience_stats" => ops::learn::experience_stats(services, &args).await,
        "run_clustering" => ops::learn::run_clustering(services, &args).await,
        "get_clusters" => ops::learn::get_clusters(services, &args).await,
        "cluster_status" => ops::learn::cluster_status(services, &args).await,
        "validate_value" => ops::learn::validate_value(services, &args).await,
        "store_value" => ops::learn::store_value(services, &args).await,
        "list_values" => ops::learn::list_values(services, &args).await,
        "search_values" => ops::learn::search_values(services, &args).await,
        "delete_value" => ops::learn::delete_value(services, &args).await,

        "assemble_context" => ops::context::assemble_context(services, &args).await,
        "premortem_context" => ops::context::premortem_context(services, &args).await,

        "start_session" => ops::session::start_session(services, &args).await,
        "get_session" => ops::session::get_session(services, &args).await,
        "increment_tool_count" => ops::session::increment_tool_count(services, &args).await,
        "should_check_in" => ops::session::should_check_in(services, &args).await,
        "reset_tool_count" => ops::session::reset_tool_count(services, &args).await,

        "health_check" => ops::admin::health_check(services, &args).await,
        "collection_stats" => ops::admin::collection_stats(services, &args).await,
        "show_config" => ops::admin::show_config(services, &args).await,

        unknown => Err(CalmError::not_found(format!("unknown operation '{unknown}'"))),
    }
}

/// Convert an error into the wire-level error object.
pub fn error_body(err: &CalmError) -> Value {
    serde_json::json!({
        "error": {
            "type": err.kind(),
            "message": err.to_string(),
        }
    })
}
