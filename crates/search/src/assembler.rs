//! Parallel multi-source context assembly under a token budget.
//!
//! One search per requested source runs concurrently; a failed source is
//! logged and skipped. Survivors go through two dedup passes (stable key,
//! then fuzzy text ratio), are budgeted per source by configured weights,
//! and render into a fixed-order markdown block. Token cost is estimated at
//! one token per four characters throughout.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::DateTime;
use futures::future::join_all;
use similar::TextDiff;
use tracing::warn;

use calm_config::CalmConfig;
use calm_schema::{Axis, CalmError, OutcomeStatus, Result};

use crate::searcher::{ExperienceFilters, UnifiedSearcher};

/// Per-source result limit in normal mode.
const DEFAULT_SOURCE_LIMIT: usize = 20;
/// Premortem pulls more experiences and fewer of everything else.
const PREMORTEM_EXPERIENCE_LIMIT: usize = 40;
const PREMORTEM_OTHER_LIMIT: usize = 8;
/// Give up on a source once fewer than this many tokens remain.
const MIN_ITEM_TOKENS: usize = 8;
/// Per-line rendering cost (bullet, date prefix, newline) charged on top of
/// the item text itself.
const LINE_OVERHEAD_TOKENS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContextSource {
    Memories,
    Values,
    Experiences,
    Code,
    Commits,
}

impl ContextSource {
    /// Section order in the rendered output.
    pub const ORDERED: &'static [ContextSource] = &[
        ContextSource::Memories,
        ContextSource::Values,
        ContextSource::Experiences,
        ContextSource::Code,
        ContextSource::Commits,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ContextSource::Memories => "memories",
            ContextSource::Values => "values",
            ContextSource::Experiences => "experiences",
            ContextSource::Code => "code",
            ContextSource::Commits => "commits",
        }
    }

    fn heading(self) -> &'static str {
        match self {
            ContextSource::Memories => "Memories",
            ContextSource::Values => "Values",
            ContextSource::Experiences => "Experiences",
            ContextSource::Code => "Code",
            ContextSource::Commits => "Commits",
        }
    }
}

impl fmt::Display for ContextSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextSource {
    type Err = CalmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContextSource::ORDERED
            .iter()
            .copied()
            .find(|source| source.as_str() == s)
            .ok_or_else(|| {
                CalmError::validation(format!(
                    "unknown context source '{s}', expected one of: memories, values, experiences, code, commits"
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssembleMode {
    #[default]
    Normal,
    /// Surface falsified experiences grouped by axis, recency-ranked.
    Premortem,
}

impl FromStr for AssembleMode {
    type Err = CalmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(AssembleMode::Normal),
            "premortem" => Ok(AssembleMode::Premortem),
            other => Err(CalmError::validation(format!(
                "unknown mode '{other}', expected 'normal' or 'premortem'"
            ))),
        }
    }
}

/// The assembled markdown plus per-source item counts.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub markdown: String,
    pub counts: BTreeMap<String, usize>,
    pub estimated_tokens: usize,
}

/// One candidate line, normalized across sources.
#[derive(Debug, Clone)]
struct ContextItem {
    source: ContextSource,
    /// Stable dedup key: entry id, `path:line`, sha, or point id.
    key: String,
    score: f32,
    text: String,
    /// Unix seconds, for premortem recency ordering.
    captured_at: i64,
    /// Premortem grouping key (the falsification axis).
    group: Option<String>,
}

pub struct ContextAssembler {
    searcher: UnifiedSearcher,
    config: Arc<CalmConfig>,
}

impl ContextAssembler {
    pub fn new(searcher: UnifiedSearcher, config: Arc<CalmConfig>) -> Self {
        Self { searcher, config }
    }

    pub async fn assemble(
        &self,
        query: &str,
        sources: &[ContextSource],
        token_budget: usize,
        mode: AssembleMode,
    ) -> Result<AssembledContext> {
        // 1. Parallel fetch, one search per source; failures are survivable.
        let fetches = sources
            .iter()
            .map(|source| self.fetch_source(query, *source, mode));
        let mut items: Vec<ContextItem> = Vec::new();
        for (source, outcome) in sources.iter().zip(join_all(fetches).await) {
            match outcome {
                Ok(fetched) => items.extend(fetched),
                Err(err) => {
                    warn!(source = %source, error = %err, "context source failed; continuing without it");
                }
            }
        }

        // 2. Dedup: exact key pass, then fuzzy text pass, per source.
        items.sort_by(|a, b| {
            a.source
                .cmp(&b.source)
                .then(b.score.total_cmp(&a.score))
                .then(a.key.cmp(&b.key))
        });
        let items = dedup_by_key(items);
        let items = self.dedup_fuzzy(items);

        // 3. Budget split over the sources that actually produced items.
        let mut per_source: BTreeMap<ContextSource, Vec<ContextItem>> = BTreeMap::new();
        for item in items {
            per_source.entry(item.source).or_default().push(item);
        }
        let overhead = estimate_tokens(&format!("# Context for: {query}"))
            + per_source.len() * 4;
        let item_budget = token_budget.saturating_sub(overhead);
        let total_weight: f32 = per_source
            .keys()
            .map(|source| self.source_weight(*source))
            .sum();

        let mut sections: BTreeMap<ContextSource, Vec<ContextItem>> = BTreeMap::new();
        for (source, mut candidates) in per_source {
            let share = if total_weight > 0.0 {
                self.source_weight(source) / total_weight
            } else {
                0.0
            };
            let source_budget = (item_budget as f32 * share).floor() as usize;
            if mode == AssembleMode::Premortem && source == ContextSource::Experiences {
                candidates.sort_by(|a, b| {
                    a.group.cmp(&b.group).then(b.captured_at.cmp(&a.captured_at))
                });
            }
            sections.insert(source, self.pick_within_budget(candidates, source_budget));
        }

        // 4. Render in fixed section order.
        let markdown = render(query, &sections, mode);
        let counts = sections
            .iter()
            .map(|(source, items)| (source.as_str().to_string(), items.len()))
            .collect();
        let estimated_tokens = estimate_tokens(&markdown);
        Ok(AssembledContext { markdown, counts, estimated_tokens })
    }

    fn source_weight(&self, source: ContextSource) -> f32 {
        self.config
            .source_weights
            .get(source.as_str())
            .copied()
            .unwrap_or(1.0)
            .max(0.0)
    }

    async fn fetch_source(
        &self,
        query: &str,
        source: ContextSource,
        mode: AssembleMode,
    ) -> Result<Vec<ContextItem>> {
        let premortem = mode == AssembleMode::Premortem;
        let limit = match (premortem, source) {
            (true, ContextSource::Experiences) => PREMORTEM_EXPERIENCE_LIMIT,
            (true, _) => PREMORTEM_OTHER_LIMIT,
            (false, _) => DEFAULT_SOURCE_LIMIT,
        };

        match source {
            ContextSource::Memories => {
                let hits = self
                    .searcher
                    .search_memories(query, limit, Default::default())
                    .await?;
                Ok(hits
                    .into_iter()
                    .map(|hit| ContextItem {
                        source,
                        key: hit.id.clone(),
                        score: hit.score,
                        text: format!("[{}] {} (importance {:.2})", hit.category, hit.content, hit.importance),
                        captured_at: hit.created_at,
                        group: None,
                    })
                    .collect())
            }
            ContextSource::Values => {
                let hits = self.searcher.search_values(query, limit, None).await?;
                Ok(hits
                    .into_iter()
                    .map(|hit| ContextItem {
                        source,
                        key: hit.id.clone(),
                        score: hit.score,
                        text: format!("{} (axis: {})", hit.text, hit.axis),
                        captured_at: 0,
                        group: None,
                    })
                    .collect())
            }
            ContextSource::Experiences => self.fetch_experiences(query, limit, premortem).await,
            ContextSource::Code => {
                let hits = self
                    .searcher
                    .search_code(query, limit, None, None, None)
                    .await?;
                Ok(hits
                    .into_iter()
                    .map(|hit| ContextItem {
                        source,
                        key: format!("{}:{}", hit.file_path, hit.start_line),
                        score: hit.score,
                        text: format!(
                            "`{}` ({}:{}): {}",
                            hit.qualified_name, hit.file_path, hit.start_line, hit.signature
                        ),
                        captured_at: 0,
                        group: None,
                    })
                    .collect())
            }
            ContextSource::Commits => {
                let hits = self
                    .searcher
                    .search_commits(query, limit, None, None, None)
                    .await?;
                Ok(hits
                    .into_iter()
                    .map(|hit| ContextItem {
                        source,
                        key: hit.sha.clone(),
                        score: hit.score,
                        text: format!(
                            "{} {} ({})",
                            &hit.sha[..hit.sha.len().min(8)],
                            hit.summary,
                            hit.author
                        ),
                        captured_at: hit.timestamp,
                        group: None,
                    })
                    .collect())
            }
        }
    }

    /// Normal mode reads the full axis; premortem sweeps every axis for
    /// falsified entries so they can be grouped by failure projection.
    async fn fetch_experiences(
        &self,
        query: &str,
        limit: usize,
        premortem: bool,
    ) -> Result<Vec<ContextItem>> {
        let axes: &[Axis] = if premortem {
            &[Axis::Surprise, Axis::RootCause, Axis::Strategy, Axis::Full]
        } else {
            &[Axis::Full]
        };
        let outcome = premortem.then_some(OutcomeStatus::Falsified);

        let mut items = Vec::new();
        for axis in axes {
            let hits = self
                .searcher
                .search_experiences(
                    query,
                    limit,
                    *axis,
                    ExperienceFilters { outcome, ..Default::default() },
                )
                .await?;
            items.extend(hits.into_iter().map(|hit| ContextItem {
                source: ContextSource::Experiences,
                key: hit.entry_id.clone(),
                score: hit.score,
                text: format!("[{}] {}", hit.outcome_status, hit.content),
                captured_at: hit.captured_at,
                group: premortem.then(|| hit.axis.clone()),
            }));
        }
        Ok(items)
    }

    /// Drop items whose rendered text is nearly identical to an already-kept
    /// item of the same source. Long items are exempt from comparison.
    fn dedup_fuzzy(&self, items: Vec<ContextItem>) -> Vec<ContextItem> {
        let threshold = self.config.similarity_threshold;
        let max_len = self.config.max_fuzzy_content_length;
        let mut kept: Vec<ContextItem> = Vec::with_capacity(items.len());
        for item in items {
            let duplicate = item.text.len() <= max_len
                && kept.iter().any(|existing| {
                    existing.source == item.source
                        && existing.text.len() <= max_len
                        && TextDiff::from_chars(existing.text.as_str(), item.text.as_str())
                            .ratio()
                            >= threshold
                });
            if !duplicate {
                kept.push(item);
            }
        }
        kept
    }

    /// Greedy score-descending pick. A single item may take at most
    /// `max_item_fraction` of the source budget; oversized items are
    /// truncated at a sentence boundary.
    fn pick_within_budget(
        &self,
        candidates: Vec<ContextItem>,
        source_budget: usize,
    ) -> Vec<ContextItem> {
        let item_cap =
            ((source_budget as f32 * self.config.max_item_fraction).floor() as usize).max(1);
        let mut remaining = source_budget;
        let mut picked = Vec::new();

        for mut item in candidates {
            if remaining < MIN_ITEM_TOKENS {
                break;
            }
            let allowed = item_cap.min(remaining.saturating_sub(LINE_OVERHEAD_TOKENS));
            if allowed == 0 {
                break;
            }
            let cost = estimate_tokens(&item.text);
            let cost = if cost > allowed {
                item.text = truncate_to_tokens(&item.text, allowed);
                estimate_tokens(&item.text)
            } else {
                cost
            };
            if cost == 0 || cost + LINE_OVERHEAD_TOKENS > remaining {
                continue;
            }
            remaining -= cost + LINE_OVERHEAD_TOKENS;
            picked.push(item);
        }
        picked
    }
}

fn dedup_by_key(items: Vec<ContextItem>) -> Vec<ContextItem> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert((item.source, item.key.clone())))
        .collect()
}

/// ceil(chars / 4)
fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Cut to at most `max_tokens`, preferring the last sentence boundary in the
/// allowed window, falling back to a word boundary.
fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    let max_chars = max_tokens.saturating_mul(4);
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let window: String = text.chars().take(max_chars).collect();
    let sentence_end = window
        .rmatch_indices(['.', '!', '?'])
        .map(|(idx, sep)| idx + sep.len())
        .next()
        .filter(|end| *end * 2 >= window.len());
    match sentence_end {
        Some(end) => window[..end].to_string(),
        None => match window.rfind(' ').filter(|idx| *idx * 2 >= window.len()) {
            Some(idx) => window[..idx].to_string(),
            None => window,
        },
    }
}

fn render(
    query: &str,
    sections: &BTreeMap<ContextSource, Vec<ContextItem>>,
    mode: AssembleMode,
) -> String {
    let mut out = format!("# Context for: {query}\n");
    for source in ContextSource::ORDERED {
        let Some(items) = sections.get(source) else {
            continue;
        };
        if items.is_empty() {
            continue;
        }
        out.push_str(&format!("\n## {}\n", source.heading()));
        if mode == AssembleMode::Premortem && *source == ContextSource::Experiences {
            render_premortem_experiences(&mut out, items);
        } else {
            for item in items {
                out.push_str(&format!("- {}\n", item.text));
            }
        }
    }
    out
}

/// Premortem experiences are grouped by the axis that surfaced them and
/// listed most-recent first inside each group.
fn render_premortem_experiences(out: &mut String, items: &[ContextItem]) {
    let mut groups: BTreeMap<&str, Vec<&ContextItem>> = BTreeMap::new();
    for item in items {
        groups
            .entry(item.group.as_deref().unwrap_or("full"))
            .or_default()
            .push(item);
    }
    for (axis, mut members) in groups {
        members.sort_by(|a, b| b.captured_at.cmp(&a.captured_at));
        out.push_str(&format!("### Failures by {axis}\n"));
        for item in members {
            let date = DateTime::from_timestamp(item.captured_at, 0)
                .map(|ts| ts.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "unknown".to_string());
            out.push_str(&format!("- ({date}) {}\n", item.text));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(source: ContextSource, key: &str, score: f32, text: &str) -> ContextItem {
        ContextItem {
            source,
            key: key.to_string(),
            score,
            text: text.to_string(),
            captured_at: 0,
            group: None,
        }
    }

    fn assembler_with(config: CalmConfig) -> ContextAssembler {
        use calm_embedding::EmbeddingRegistry;
        use calm_store::EmbeddedStore;
        let store = Arc::new(EmbeddedStore::in_memory());
        let searcher = UnifiedSearcher::new(store, EmbeddingRegistry::mock());
        ContextAssembler::new(searcher, Arc::new(config))
    }

    #[test]
    fn key_dedup_keeps_first_occurrence() {
        let items = vec![
            item(ContextSource::Memories, "a", 0.9, "first"),
            item(ContextSource::Memories, "a", 0.5, "second"),
            item(ContextSource::Code, "a", 0.5, "other source, same key"),
        ];
        let kept = dedup_by_key(items);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].text, "first");
    }

    #[test]
    fn fuzzy_dedup_drops_near_identical_text() {
        let assembler = assembler_with(CalmConfig::default());
        let items = vec![
            item(ContextSource::Memories, "a", 0.9, "prefer explicit error types in rust code"),
            item(ContextSource::Memories, "b", 0.8, "prefer explicit error types in rust code!"),
            item(ContextSource::Memories, "c", 0.7, "an entirely different note about builds"),
        ];
        let kept = assembler.dedup_fuzzy(items);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].key, "a");
        assert_eq!(kept[1].key, "c");
    }

    #[test]
    fn fuzzy_dedup_skips_oversized_items() {
        let mut config = CalmConfig::default();
        config.max_fuzzy_content_length = 16;
        let assembler = assembler_with(config);
        let long = "x".repeat(64);
        let items = vec![
            item(ContextSource::Memories, "a", 0.9, &long),
            item(ContextSource::Memories, "b", 0.8, &long),
        ];
        assert_eq!(assembler.dedup_fuzzy(items).len(), 2);
    }

    #[test]
    fn budget_pick_respects_item_cap_and_total() {
        let assembler = assembler_with(CalmConfig::default());
        let long_text = "word ".repeat(200);
        let candidates = vec![
            item(ContextSource::Memories, "a", 0.9, &long_text),
            item(ContextSource::Memories, "b", 0.8, &long_text),
            item(ContextSource::Memories, "c", 0.7, &long_text),
            item(ContextSource::Memories, "d", 0.6, &long_text),
            item(ContextSource::Memories, "e", 0.5, &long_text),
        ];
        let budget = 100;
        let picked = assembler.pick_within_budget(candidates, budget);
        let total: usize = picked.iter().map(|i| estimate_tokens(&i.text)).sum();
        assert!(total <= budget, "total {total} exceeded budget {budget}");
        for picked_item in &picked {
            assert!(estimate_tokens(&picked_item.text) <= 25);
        }
        assert!(picked.len() >= 4, "cap should allow roughly four items");
    }

    #[test]
    fn truncation_prefers_sentence_boundaries() {
        let text = "First sentence here. Second sentence follows. Third one is cut.";
        let cut = truncate_to_tokens(text, 12);
        assert!(cut.ends_with('.'));
        assert!(cut.len() < text.len());
        assert!(estimate_tokens(&cut) <= 12);
    }

    #[test]
    fn truncation_falls_back_to_word_boundary() {
        let text = "no sentence punctuation just a very long run of words that keeps going";
        let cut = truncate_to_tokens(text, 8);
        assert!(estimate_tokens(&cut) <= 8);
        assert!(!cut.ends_with(char::is_whitespace));
    }

    #[test]
    fn sections_render_in_fixed_order() {
        let mut sections = BTreeMap::new();
        sections.insert(
            ContextSource::Commits,
            vec![item(ContextSource::Commits, "c", 0.5, "abc123 fix race (dev)")],
        );
        sections.insert(
            ContextSource::Memories,
            vec![item(ContextSource::Memories, "m", 0.9, "[fact] remembered thing (importance 0.50)")],
        );
        let markdown = render("q", &sections, AssembleMode::Normal);
        let memories_at = markdown.find("## Memories").unwrap();
        let commits_at = markdown.find("## Commits").unwrap();
        assert!(memories_at < commits_at);
        assert!(markdown.starts_with("# Context for: q"));
    }

    #[test]
    fn premortem_groups_by_axis_and_ranks_by_recency() {
        let mut items = vec![
            ContextItem {
                source: ContextSource::Experiences,
                key: "e1".into(),
                score: 0.9,
                text: "[FALSIFIED] older surprise".into(),
                captured_at: 100,
                group: Some("surprise".into()),
            },
            ContextItem {
                source: ContextSource::Experiences,
                key: "e2".into(),
                score: 0.2,
                text: "[FALSIFIED] newer surprise".into(),
                captured_at: 200,
                group: Some("surprise".into()),
            },
            ContextItem {
                source: ContextSource::Experiences,
                key: "e3".into(),
                score: 0.5,
                text: "[FALSIFIED] root cause entry".into(),
                captured_at: 150,
                group: Some("root_cause".into()),
            },
        ];
        items.sort_by(|a, b| a.key.cmp(&b.key));
        let mut sections = BTreeMap::new();
        sections.insert(ContextSource::Experiences, items);

        let markdown = render("q", &sections, AssembleMode::Premortem);
        let newer = markdown.find("newer surprise").unwrap();
        let older = markdown.find("older surprise").unwrap();
        assert!(newer < older, "recency ordering within group");
        assert!(markdown.contains("### Failures by surprise"));
        assert!(markdown.contains("### Failures by root_cause"));
    }
}
