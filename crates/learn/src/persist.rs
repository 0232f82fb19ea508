//! Projection of resolved GHAP entries into the per-axis collections.
//!
//! Each resolved entry becomes 2–4 points sharing the entry id: `full` and
//! `strategy` always, `surprise` and `root_cause` only for falsified
//! outcomes carrying those annotations. The `full` write must succeed or the
//! whole persist fails; the remaining axes are best-effort and recoverable
//! by re-persisting the entry.

use std::fmt::Write as _;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use calm_embedding::EmbeddingRegistry;
use calm_schema::collections::ghap_collection;
use calm_schema::{Axis, CalmError, ConfidenceTier, EmbedRole, GhapEntry, OutcomeStatus, Result};
use calm_store::{Payload, PointRecord, VectorStore};

/// What a persist run wrote, axis by axis.
#[derive(Debug, Clone)]
pub struct PersistReport {
    pub entry_id: String,
    pub axes_written: Vec<Axis>,
    pub axes_failed: Vec<Axis>,
}

pub struct ObservationPersister {
    store: Arc<dyn VectorStore>,
    registry: EmbeddingRegistry,
}

impl ObservationPersister {
    pub fn new(store: Arc<dyn VectorStore>, registry: EmbeddingRegistry) -> Self {
        Self { store, registry }
    }

    /// Embed and upsert every applicable axis of a resolved entry.
    pub async fn persist(&self, entry: &GhapEntry) -> Result<PersistReport> {
        let outcome = entry.outcome.as_ref().ok_or_else(|| {
            CalmError::InvalidState("only resolved GHAP entries can be persisted".to_string())
        })?;

        let mut axes: Vec<(Axis, String)> = vec![
            (Axis::Full, render_full(entry)),
            (Axis::Strategy, render_strategy(entry)),
        ];
        if outcome.status == OutcomeStatus::Falsified {
            if let Some(surprise) = entry.surprise.as_deref().filter(|s| !s.is_empty()) {
                axes.push((Axis::Surprise, surprise.to_string()));
            }
            if let Some(root_cause) = &entry.root_cause {
                axes.push((Axis::RootCause, render_root_cause(entry, root_cause)));
            }
        }

        // One batch per persist; all axes share the semantic role.
        let texts: Vec<String> = axes.iter().map(|(_, text)| text.clone()).collect();
        let vectors = self.registry.embed_many(EmbedRole::Semantic, &texts).await?;

        let mut report = PersistReport {
            entry_id: entry.id.clone(),
            axes_written: Vec::new(),
            axes_failed: Vec::new(),
        };

        for ((axis, text), vector) in axes.into_iter().zip(vectors) {
            let point = PointRecord {
                id: entry.id.clone(),
                vector,
                payload: axis_payload(entry, axis, &text),
            };
            match self.store.upsert(ghap_collection(axis), point).await {
                Ok(()) => report.axes_written.push(axis),
                // The full axis is the anchor every invariant hangs off.
                Err(err) if axis == Axis::Full => return Err(err),
                Err(err) => {
                    warn!(
                        entry_id = %entry.id,
                        axis = %axis,
                        error = %err,
                        "axis upsert failed; entry can be re-persisted"
                    );
                    report.axes_failed.push(axis);
                }
            }
        }
        Ok(report)
    }
}

// ── Axis templates ────────────────────────────────────────────────────────────

fn render_full(entry: &GhapEntry) -> String {
    let outcome = entry.outcome.as_ref();
    let status = outcome.map(|o| o.status.as_str()).unwrap_or("PENDING");
    let result = outcome.map(|o| o.result.as_str()).unwrap_or("");
    let mut text = format!(
        "Domain: {} | Strategy: {} | Goal: {} | Hypothesis: {} | Action: {} | Prediction: {} | Outcome: {} — {}",
        entry.domain,
        entry.strategy,
        entry.goal,
        entry.current.hypothesis,
        entry.current.action,
        entry.current.prediction,
        status,
        result,
    );
    if let Some(surprise) = entry.surprise.as_deref().filter(|s| !s.is_empty()) {
        let _ = write!(text, " [Surprise: {surprise}]");
    }
    if let Some(root_cause) = &entry.root_cause {
        let _ = write!(text, " [Root: {}: {}]", root_cause.category, root_cause.description);
    }
    if let Some(lesson) = &entry.lesson {
        let _ = write!(text, " [Lesson: {} — {}]", lesson.what_worked, lesson.takeaway);
    }
    text
}

fn render_strategy(entry: &GhapEntry) -> String {
    let status = entry
        .outcome
        .as_ref()
        .map(|o| o.status.as_str())
        .unwrap_or("PENDING");
    format!(
        "Strategy: {} applied to: {}. Hypothesis: {}. Iterations: {}. Outcome: {}.",
        entry.strategy, entry.goal, entry.current.hypothesis, entry.iteration_count, status,
    )
}

fn render_root_cause(entry: &GhapEntry, root_cause: &calm_schema::RootCause) -> String {
    format!(
        "{}: {}. Context: {}. Hypothesis was: {}.",
        root_cause.category, root_cause.description, entry.goal, entry.current.hypothesis,
    )
}

// ── Payload ───────────────────────────────────────────────────────────────────

/// Common fields carried by every ghap_* point, plus the axis-specific
/// rendered content. The full axis additionally mirrors the entry fields.
fn axis_payload(entry: &GhapEntry, axis: Axis, content: &str) -> Payload {
    let outcome = entry.outcome.as_ref();
    let mut map = Payload::new();
    map.insert("entry_id".into(), json!(entry.id));
    map.insert("session_id".into(), json!(entry.session_id));
    map.insert("domain".into(), json!(entry.domain.as_str()));
    map.insert("strategy".into(), json!(entry.strategy.as_str()));
    map.insert("outcome_status".into(), json!(outcome.map(|o| o.status.as_str())));
    map.insert(
        "confidence_tier".into(),
        json!(entry.confidence_tier.unwrap_or(ConfidenceTier::Bronze).as_str()),
    );
    map.insert("iteration_count".into(), json!(entry.iteration_count));
    map.insert("created_at".into(), json!(entry.created_at.timestamp()));
    map.insert("captured_at".into(), json!(outcome.map(|o| o.captured_at.timestamp())));
    map.insert("axis".into(), json!(axis.as_str()));
    map.insert("content".into(), json!(content));

    if axis == Axis::Full {
        map.insert("goal".into(), Value::String(entry.goal.clone()));
        map.insert("hypothesis".into(), Value::String(entry.current.hypothesis.clone()));
        map.insert("action".into(), Value::String(entry.current.action.clone()));
        map.insert("prediction".into(), Value::String(entry.current.prediction.clone()));
        if let Some(outcome) = outcome {
            map.insert("outcome_result".into(), Value::String(outcome.result.clone()));
            map.insert("auto_captured".into(), Value::Bool(outcome.auto_captured));
        }
        if let Some(surprise) = &entry.surprise {
            map.insert("surprise".into(), Value::String(surprise.clone()));
        }
        if let Some(root_cause) = &entry.root_cause {
            map.insert("root_cause_category".into(), Value::String(root_cause.category.clone()));
            map.insert(
                "root_cause_description".into(),
                Value::String(root_cause.description.clone()),
            );
        }
        if let Some(lesson) = &entry.lesson {
            map.insert("lesson_what_worked".into(), Value::String(lesson.what_worked.clone()));
            map.insert("lesson_takeaway".into(), Value::String(lesson.takeaway.clone()));
        }
    }
    map
}


#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use calm_schema::collections::{
        GHAP_FULL, GHAP_ROOT_CAUSE, GHAP_STRATEGY, GHAP_SURPRISE, SEMANTIC_DIM,
    };
    use calm_schema::{Domain, GhapCurrent, GhapOutcome, Lesson, RootCause, Strategy};
    use calm_store::EmbeddedStore;
    use chrono::Utc;

    fn entry(status: OutcomeStatus) -> GhapEntry {
        GhapEntry {
            id: "entry-1".into(),
            session_id: "session-1".into(),
            domain: Domain::Debugging,
            strategy: Strategy::TrialAndError,
            goal: "fix flaky test".into(),
            current: GhapCurrent {
                hypothesis: "the intermittent failure is caused by timing".into(),
                action: "add sleep".into(),
                prediction: "passes 3/3".into(),
            },
            history: Vec::new(),
            iteration_count: 2,
            notes: Vec::new(),
            outcome: Some(GhapOutcome {
                status,
                result: "test still failed".into(),
                auto_captured: false,
                captured_at: Utc::now(),
            }),
            surprise: Some("test isolation, not timing".into()),
            root_cause: Some(RootCause {
                category: "wrong-assumption".into(),
                description: "assumed intermittent meant timing".into(),
            }),
            lesson: Some(Lesson {
                what_worked: "checking isolation".into(),
                takeaway: "rule out shared state first".into(),
            }),
            confidence_tier: Some(ConfidenceTier::Silver),
            created_at: Utc::now(),
        }
    }

    async fn fixture() -> Result<(Arc<EmbeddedStore>, ObservationPersister)> {
        let store = Arc::new(EmbeddedStore::in_memory());
        for name in [GHAP_FULL, GHAP_STRATEGY, GHAP_SURPRISE, GHAP_ROOT_CAUSE] {
            store.create_collection(name, SEMANTIC_DIM).await?;
        }
        let persister =
            ObservationPersister::new(store.clone(), EmbeddingRegistry::mock());
        Ok((store, persister))
    }

    #[tokio::test]
    async fn falsified_entry_fans_out_to_all_four_axes() -> Result<()> {
        let (store, persister) = fixture().await?;
        let report = persister.persist(&entry(OutcomeStatus::Falsified)).await?;

        assert_eq!(report.axes_written.len(), 4);
        assert!(report.axes_failed.is_empty());
        for name in [GHAP_FULL, GHAP_STRATEGY, GHAP_SURPRISE, GHAP_ROOT_CAUSE] {
            let stored = store.get(name, "entry-1").await?;
            assert!(stored.is_some(), "{name} should hold the entry");
            let payload = stored.unwrap().payload;
            assert_eq!(payload["entry_id"], "entry-1");
            assert_eq!(payload["outcome_status"], "FALSIFIED");
        }
        Ok(())
    }

    #[tokio::test]
    async fn confirmed_entry_writes_only_full_and_strategy() -> Result<()> {
        let (store, persister) = fixture().await?;
        let report = persister.persist(&entry(OutcomeStatus::Confirmed)).await?;

        assert_eq!(report.axes_written, vec![Axis::Full, Axis::Strategy]);
        assert!(store.get(GHAP_SURPRISE, "entry-1").await?.is_none());
        assert!(store.get(GHAP_ROOT_CAUSE, "entry-1").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn unresolved_entry_is_rejected() -> Result<()> {
        let (_store, persister) = fixture().await?;
        let mut unresolved = entry(OutcomeStatus::Confirmed);
        unresolved.outcome = None;
        let err = persister.persist(&unresolved).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
        Ok(())
    }

    #[tokio::test]
    async fn missing_secondary_collection_is_best_effort() -> Result<()> {
        // Only full + strategy exist; surprise/root_cause upserts fail and are
        // reported, not fatal.
        let store = Arc::new(EmbeddedStore::in_memory());
        store.create_collection(GHAP_FULL, SEMANTIC_DIM).await?;
        store.create_collection(GHAP_STRATEGY, SEMANTIC_DIM).await?;
        let persister =
            ObservationPersister::new(store.clone(), EmbeddingRegistry::mock());

        let report = persister.persist(&entry(OutcomeStatus::Falsified)).await?;
        assert_eq!(report.axes_written, vec![Axis::Full, Axis::Strategy]);
        assert_eq!(report.axes_failed, vec![Axis::Surprise, Axis::RootCause]);
        Ok(())
    }

    #[test]
    fn templates_match_the_documented_shapes() {
        let e = entry(OutcomeStatus::Falsified);
        let full = render_full(&e);
        assert!(full.starts_with("Domain: debugging | Strategy: trial_and_error | Goal: fix flaky test"));
        assert!(full.contains("Outcome: FALSIFIED — test still failed"));
        assert!(full.contains("[Surprise: test isolation, not timing]"));
        assert!(full.contains("[Root: wrong-assumption:"));
        assert!(full.contains("[Lesson: checking isolation"));

        let strategy = render_strategy(&e);
        assert_eq!(
            strategy,
            "Strategy: trial_and_error applied to: fix flaky test. Hypothesis: the intermittent failure is caused by timing. Iterations: 2. Outcome: FALSIFIED."
        );

        let root = render_root_cause(&e, e.root_cause.as_ref().unwrap());
        assert!(root.starts_with("wrong-assumption: assumed intermittent meant timing."));
        assert!(root.ends_with("Hypothesis was: the intermittent failure is caused by timing."));
    }
}
