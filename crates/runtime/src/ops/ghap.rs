use serde_json::{json, Value};

use calm_journal::{ResolveGhap, UpdateGhap};
use calm_schema::{
    CalmError, Domain, GhapEntry, Lesson, OutcomeStatus, Result, RootCause, Strategy,
};
use calm_store::GhapMeta;

use crate::args::Args;
use crate::services::Services;

/// Mirror a resolved entry into the metadata index.
pub(crate) fn record_meta(services: &Services, entry: &GhapEntry) -> Result<()> {
    let Some(outcome) = &entry.outcome else {
        return Ok(());
    };
    services.meta.put_ghap_meta(&GhapMeta {
        entry_id: entry.id.clone(),
        session_id: entry.session_id.clone(),
        domain: entry.domain,
        strategy: entry.strategy,
        outcome_status: outcome.status,
        confidence_tier: entry
            .confidence_tier
            .unwrap_or(calm_schema::ConfidenceTier::Bronze),
        iteration_count: entry.iteration_count,
        created_at: entry.created_at.timestamp(),
        captured_at: outcome.captured_at.timestamp(),
    })
}

pub async fn create_ghap(services: &Services, args: &Args<'_>) -> Result<Value> {
    let domain: Domain = args.parsed("domain")?;
    let strategy: Strategy = args.parsed("strategy")?;
    let goal = args.ghap_field("goal")?;
    let hypothesis = args.ghap_field("hypothesis")?;
    let action = args.ghap_field("action")?;
    let prediction = args.ghap_field("prediction")?;

    let entry = services
        .journal
        .create_ghap(domain, strategy, goal, hypothesis, action, prediction)
        .await?;
    Ok(json!(entry))
}

pub async fn update_ghap(services: &Services, args: &Args<'_>) -> Result<Value> {
    let update = UpdateGhap {
        hypothesis: args.opt_ghap_field("hypothesis")?,
        action: args.opt_ghap_field("action")?,
        prediction: args.opt_ghap_field("prediction")?,
        strategy: args.opt_parsed::<Strategy>("strategy")?,
        note: args.opt_note()?,
    };
    let entry = services.journal.update_ghap(update).await?;
    Ok(json!(entry))
}

pub async fn resolve_ghap(services: &Services, args: &Args<'_>) -> Result<Value> {
    let status: OutcomeStatus = args.parsed("status")?;
    let result = args.text("result", 2000)?;
    let auto_captured = args.bool_or("auto_captured", false)?;
    let surprise = args.opt_surprise()?;
    let root_cause = args
        .object("root_cause")?
        .map(|map| -> Result<RootCause> {
            let raw = Value::Object(map.clone());
            let nested = Args::new(&raw)?;
            Ok(RootCause {
                category: nested.text("category", 100)?,
                description: nested.text("description", 2000)?,
            })
        })
        .transpose()?;
    let lesson = args
        .object("lesson")?
        .map(|map| -> Result<Lesson> {
            let raw = Value::Object(map.clone());
            let nested = Args::new(&raw)?;
            Ok(Lesson {
                what_worked: nested.text("what_worked", 1000)?,
                takeaway: nested.text("takeaway", 1000)?,
            })
        })
        .transpose()?;

    let entry = services
        .journal
        .resolve_ghap(ResolveGhap { status, result, auto_captured, surprise, root_cause, lesson })
        .await?;
    let report = services.persister.persist(&entry).await?;
    record_meta(services, &entry)?;
    Ok(json!({
        "entry": entry,
        "axes_written": report.axes_written,
        "axes_failed": report.axes_failed,
    }))
}

pub async fn get_current_ghap(services: &Services, _args: &Args<'_>) -> Result<Value> {
    Ok(json!({"current": services.journal.get_current_ghap().await?}))
}

pub async fn get_orphaned_ghap(services: &Services, _args: &Args<'_>) -> Result<Value> {
    Ok(json!({"orphan": services.journal.get_orphaned_ghap().await?}))
}

pub async fn adopt_orphan(services: &Services, _args: &Args<'_>) -> Result<Value> {
    let entry = services.journal.adopt_orphan().await?;
    Ok(json!(entry))
}

pub async fn abandon_orphan(services: &Services, args: &Args<'_>) -> Result<Value> {
    let reason = args.text("reason", 2000)?;
    let entry = services.journal.abandon_orphan(reason).await?;
    // Abandoned entries still join the experience pool, at the lowest weight.
    let report = services.persister.persist(&entry).await?;
    record_meta(services, &entry)?;
    Ok(json!({
        "entry": entry,
        "axes_written": report.axes_written,
    }))
}

pub async fn list_session_entries(services: &Services, _args: &Args<'_>) -> Result<Value> {
    let entries = services.journal.list_session_entries().await?;
    Ok(json!({"entries": entries}))
}

/// Shared by `persist_experience`: look an entry up in the current session
/// log by id.
pub(crate) async fn find_session_entry(services: &Services, entry_id: &str) -> Result<GhapEntry> {
    services
        .journal
        .list_session_entries()
        .await?
        .into_iter()
        .filter(|entry| entry.is_resolved())
        .find(|entry| entry.id == entry_id)
        .ok_or_else(|| {
            CalmError::not_found(format!(
                "resolved entry '{entry_id}' not found in the current session log"
            ))
        })
}
