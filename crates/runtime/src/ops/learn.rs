use std::collections::BTreeMap;

use serde_json::{json, Value};

use calm_learn::cluster::MIN_AXIS_MEMBERS;
use calm_schema::collections::ghap_collection;
use calm_schema::value::cluster_id;
use calm_schema::{Axis, Domain, OutcomeStatus, Result, Strategy};
use calm_search::ExperienceFilters;
use calm_store::scroll_all;

use crate::args::Args;
use crate::ops::ghap::{find_session_entry, record_meta};
use crate::services::{ClusterSummary, Services};

pub async fn search_experiences(services: &Services, args: &Args<'_>) -> Result<Value> {
    let query = args.query()?;
    let limit = args.limit(10)?;
    let axis = args.opt_parsed::<Axis>("axis")?.unwrap_or(Axis::Full);
    let filters = ExperienceFilters {
        domain: args.opt_parsed::<Domain>("domain")?,
        strategy: args.opt_parsed::<Strategy>("strategy")?,
        outcome: args.opt_parsed::<OutcomeStatus>("outcome")?,
    };
    let hits = services
        .searcher
        .search_experiences(&query, limit, axis, filters)
        .await?;
    Ok(json!({"results": hits}))
}

/// Manual recovery for a crash between axis upserts: re-project a resolved
/// entry from the session log.
pub async fn persist_experience(services: &Services, args: &Args<'_>) -> Result<Value> {
    let entry_id = args.text("entry_id", 100)?;
    let entry = find_session_entry(services, &entry_id).await?;
    let report = services.persister.persist(&entry).await?;
    record_meta(services, &entry)?;
    Ok(json!({
        "entry_id": report.entry_id,
        "axes_written": report.axes_written,
        "axes_failed": report.axes_failed,
    }))
}

pub async fn experience_stats(services: &Services, _args: &Args<'_>) -> Result<Value> {
    let all = services.meta.list_ghap_meta()?;
    let mut by_outcome: BTreeMap<&str, usize> = BTreeMap::new();
    let mut by_tier: BTreeMap<&str, usize> = BTreeMap::new();
    let mut by_domain: BTreeMap<&str, usize> = BTreeMap::new();
    for meta in &all {
        *by_outcome.entry(meta.outcome_status.as_str()).or_default() += 1;
        *by_tier.entry(meta.confidence_tier.as_str()).or_default() += 1;
        *by_domain.entry(meta.domain.as_str()).or_default() += 1;
    }
    Ok(json!({
        "total": all.len(),
        "by_outcome": by_outcome,
        "by_tier": by_tier,
        "by_domain": by_domain,
    }))
}

pub async fn run_clustering(services: &Services, args: &Args<'_>) -> Result<Value> {
    let axis: Axis = args.parsed("axis")?;
    let clusters = services.clusterer.run(axis).await?;

    let summaries: Vec<ClusterSummary> = clusters
        .iter()
        .map(|info| ClusterSummary {
            cluster_id: cluster_id(axis, info.label),
            label: info.label,
            size: info.size,
        })
        .collect();
    services.clusters.lock().await.insert(axis, summaries.clone());

    Ok(json!({
        "axis": axis.as_str(),
        "clusters": summaries
            .iter()
            .map(|s| json!({"cluster_id": s.cluster_id, "label": s.label, "size": s.size}))
            .collect::<Vec<_>>(),
    }))
}

pub async fn get_clusters(services: &Services, args: &Args<'_>) -> Result<Value> {
    let axis: Axis = args.parsed("axis")?;

    let cached = services.clusters.lock().await.get(&axis).cloned();
    let summaries = match cached {
        Some(summaries) => summaries,
        // After a restart the labels in the store are still authoritative;
        // rebuild summaries (with fresh cluster ids) from the payloads.
        None => {
            let members =
                scroll_all(services.store.as_ref(), ghap_collection(axis), None).await?;
            let field = calm_learn::cluster::cluster_label_field(axis);
            let mut sizes: BTreeMap<i64, usize> = BTreeMap::new();
            for point in members {
                if let Some(label) = point.payload.get(&field).and_then(|v| v.as_i64()) {
                    if label >= 0 {
                        *sizes.entry(label).or_default() += 1;
                    }
                }
            }
            let summaries: Vec<ClusterSummary> = sizes
                .into_iter()
                .map(|(label, size)| ClusterSummary {
                    cluster_id: cluster_id(axis, label),
                    label,
                    size,
                })
                .collect();
            services
                .clusters
                .lock()
                .await
                .insert(axis, summaries.clone());
            summaries
        }
    };

    Ok(json!({
        "axis": axis.as_str(),
        "clusters": summaries
            .iter()
            .map(|s| json!({"cluster_id": s.cluster_id, "label": s.label, "size": s.size}))
            .collect::<Vec<_>>(),
    }))
}

pub async fn cluster_status(services: &Services, _args: &Args<'_>) -> Result<Value> {
    let mut axes = Vec::new();
    let runs = services.clusters.lock().await;
    for axis in Axis::ALL {
        let members = services
            .store
            .count(ghap_collection(*axis), None)
            .await?;
        axes.push(json!({
            "axis": axis.as_str(),
            "members": members,
            "min_members": MIN_AXIS_MEMBERS,
            "ready": members as usize >= MIN_AXIS_MEMBERS,
            "clusters": runs.get(axis).map(|c| c.len()),
        }));
    }
    Ok(json!({"axes": axes}))
}

pub async fn validate_value(services: &Services, args: &Args<'_>) -> Result<Value> {
    let text = args.text("text", 2000)?;
    let cluster = args.text("cluster_id", 200)?;
    let verdict = services.values.validate(&text, &cluster).await?;
    Ok(json!({
        "valid": verdict.valid,
        "distance": verdict.distance,
        "threshold": verdict.threshold,
        "reason": verdict.reason,
    }))
}

pub async fn store_value(services: &Services, args: &Args<'_>) -> Result<Value> {
    let text = args.text("text", 2000)?;
    let cluster = args.text("cluster_id", 200)?;
    let record = services.values.store(&text, &cluster).await?;
    Ok(json!(record))
}

pub async fn list_values(services: &Services, args: &Args<'_>) -> Result<Value> {
    let axis = args.opt_parsed::<Axis>("axis")?;
    let values = services.values.list(axis).await?;
    Ok(json!({"values": values}))
}

pub async fn search_values(services: &Services, args: &Args<'_>) -> Result<Value> {
    let query = args.query()?;
    let limit = args.limit(10)?;
    let axis = args.opt_parsed::<Axis>("axis")?;
    let hits = services.searcher.search_values(&query, limit, axis).await?;
    Ok(json!({"results": hits}))
}

pub async fn delete_value(services: &Services, args: &Args<'_>) -> Result<Value> {
    let id = args.text("id", 100)?;
    services
        .store
        .delete(calm_schema::collections::VALUES, &id)
        .await?;
    Ok(json!({"deleted": id}))
}
