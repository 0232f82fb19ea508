use serde_json::{json, Value};

use calm_schema::{CalmError, Result};
use calm_search::{AssembleMode, ContextSource};

use crate::args::Args;
use crate::services::Services;

const DEFAULT_TOKEN_BUDGET: usize = 2000;
const TOKEN_BUDGET_RANGE: std::ops::RangeInclusive<i64> = 100..=100_000;

fn token_budget(args: &Args<'_>) -> Result<usize> {
    match args.opt_i64("token_budget")? {
        None => Ok(DEFAULT_TOKEN_BUDGET),
        Some(v) if TOKEN_BUDGET_RANGE.contains(&v) => Ok(v as usize),
        Some(_) => Err(CalmError::validation(format!(
            "field 'token_budget' must be within [{}, {}]",
            TOKEN_BUDGET_RANGE.start(),
            TOKEN_BUDGET_RANGE.end()
        ))),
    }
}

fn sources(args: &Args<'_>) -> Result<Vec<ContextSource>> {
    match args.string_list("sources")? {
        None => Ok(ContextSource::ORDERED.to_vec()),
        Some(names) => {
            if names.is_empty() {
                return Err(CalmError::validation(
                    "field 'sources' must name at least one source".to_string(),
                ));
            }
            names.iter().map(|name| name.parse()).collect()
        }
    }
}

async fn run(
    services: &Services,
    args: &Args<'_>,
    mode: AssembleMode,
) -> Result<Value> {
    let query = args.query()?;
    let assembled = services
        .assembler
        .assemble(&query, &sources(args)?, token_budget(args)?, mode)
        .await?;
    Ok(json!({
        "context": assembled.markdown,
        "counts": assembled.counts,
        "estimated_tokens": assembled.estimated_tokens,
    }))
}

pub async fn assemble_context(services: &Services, args: &Args<'_>) -> Result<Value> {
    let mode = args
        .opt_parsed::<AssembleMode>("mode")?
        .unwrap_or(AssembleMode::Normal);
    run(services, args, mode).await
}

/// Shorthand for `assemble_context` with mode fixed to premortem.
pub async fn premortem_context(services: &Services, args: &Args<'_>) -> Result<Value> {
    run(services, args, AssembleMode::Premortem).await
}
