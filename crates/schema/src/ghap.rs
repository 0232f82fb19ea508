//! The GHAP (Goal/Hypothesis/Action/Prediction) entry model.
//!
//! A GHAP entry is the unit of experience learning: created when the agent
//! states a hypothesis, revised as it iterates, and resolved exactly once
//! with a terminal outcome. Resolved entries are projected onto up to four
//! axes (`full`, `strategy`, `surprise`, `root_cause`) for search and
//! clustering.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CalmError;

/// Maximum length of the hypothesis, action, prediction, and goal fields.
pub const GHAP_FIELD_MAX: usize = 1000;
/// Maximum length of the surprise annotation.
pub const SURPRISE_MAX: usize = 2000;

/// A hypothesis shorter than this is treated as vague when grading
/// confidence: it cannot have named a concrete mechanism.
const VAGUE_HYPOTHESIS_CHARS: usize = 30;

// ── Enumerated fields ─────────────────────────────────────────────────────────

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident, $rename:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = $rename)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CalmError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(CalmError::Validation(format!(
                        concat!("unknown ", stringify!($name), " '{}', expected one of: {}"),
                        other,
                        $name::ALL
                            .iter()
                            .map(|v| v.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                    ))),
                }
            }
        }
    };
}

wire_enum!(
    /// Problem domain the agent was working in when the GHAP was created.
    Domain, "snake_case", {
        Debugging => "debugging",
        Implementation => "implementation",
        Refactoring => "refactoring",
        Testing => "testing",
        Configuration => "configuration",
        Performance => "performance",
        Integration => "integration",
        Research => "research",
        Other => "other",
    }
);

wire_enum!(
    /// Approach the agent committed to for testing the hypothesis.
    Strategy, "snake_case", {
        BinarySearch => "binary_search",
        RootCauseAnalysis => "root_cause_analysis",
        TrialAndError => "trial_and_error",
        Incremental => "incremental",
        Rewrite => "rewrite",
        ResearchFirst => "research_first",
        DivideAndConquer => "divide_and_conquer",
        InstrumentFirst => "instrument_first",
        Other => "other",
    }
);

wire_enum!(
    /// Terminal status of a resolved GHAP.
    OutcomeStatus, "SCREAMING_SNAKE_CASE", {
        Confirmed => "CONFIRMED",
        Falsified => "FALSIFIED",
        Abandoned => "ABANDONED",
    }
);

wire_enum!(
    /// Quality grade of a resolved entry, used as the clustering weight.
    ConfidenceTier, "SCREAMING_SNAKE_CASE", {
        Gold => "GOLD",
        Silver => "SILVER",
        Bronze => "BRONZE",
        Abandoned => "ABANDONED",
    }
);

wire_enum!(
    /// One of the four searchable/clusterable projections of a resolved GHAP.
    Axis, "snake_case", {
        Full => "full",
        Strategy => "strategy",
        Surprise => "surprise",
        RootCause => "root_cause",
    }
);

impl ConfidenceTier {
    /// Weight of a member of this tier in a weighted cluster centroid.
    pub fn centroid_weight(self) -> f32 {
        match self {
            ConfidenceTier::Gold => 1.0,
            ConfidenceTier::Silver => 0.8,
            ConfidenceTier::Bronze => 0.5,
            ConfidenceTier::Abandoned => 0.2,
        }
    }
}

// ── Entry structure ───────────────────────────────────────────────────────────

/// The live hypothesis/action/prediction triple of an active entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhapCurrent {
    pub hypothesis: String,
    pub action: String,
    pub prediction: String,
}

/// A superseded triple, pushed onto `history` by an update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GhapRevision {
    pub hypothesis: String,
    pub action: String,
    pub prediction: String,
    pub revised_at: DateTime<Utc>,
}

/// Terminal outcome recorded at resolve time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GhapOutcome {
    pub status: OutcomeStatus,
    pub result: String,
    /// True when the outcome was captured automatically by a hook rather
    /// than stated by the agent.
    pub auto_captured: bool,
    pub captured_at: DateTime<Utc>,
}

/// Why a falsified hypothesis was wrong.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCause {
    pub category: String,
    pub description: String,
}

/// What to carry forward from a resolved entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    pub what_worked: String,
    pub takeaway: String,
}

/// A GHAP entry as stored in `current_ghap.json` and the session log, and as
/// mirrored into vector-store payloads after resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GhapEntry {
    pub id: String,
    pub session_id: String,
    pub domain: Domain,
    pub strategy: Strategy,
    pub goal: String,
    pub current: GhapCurrent,
    #[serde(default)]
    pub history: Vec<GhapRevision>,
    #[serde(default)]
    pub iteration_count: u32,
    /// Free-form progress notes attached by updates.
    #[serde(default)]
    pub notes: Vec<String>,
    pub outcome: Option<GhapOutcome>,
    pub surprise: Option<String>,
    pub root_cause: Option<RootCause>,
    pub lesson: Option<Lesson>,
    pub confidence_tier: Option<ConfidenceTier>,
    pub created_at: DateTime<Utc>,
}

impl GhapEntry {
    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }

    /// Whether the entry carries at least one post-hoc annotation.
    pub fn has_annotation(&self) -> bool {
        self.surprise.as_deref().is_some_and(|s| !s.is_empty())
            || self.root_cause.is_some()
            || self.lesson.is_some()
    }

    /// Whether the annotations are complete for the resolved status:
    /// a lesson always, plus a surprise or root cause when falsified.
    pub fn annotations_complete(&self) -> bool {
        let lesson_ok = self.lesson.is_some();
        match self.outcome.as_ref().map(|o| o.status) {
            Some(OutcomeStatus::Falsified) => {
                lesson_ok
                    && (self.surprise.as_deref().is_some_and(|s| !s.is_empty())
                        || self.root_cause.is_some())
            }
            _ => lesson_ok,
        }
    }

    /// Grade the resolved entry. Must only be called once `outcome` is set.
    ///
    /// GOLD: outcome auto-captured with an annotation attached in the same
    /// session. SILVER: manually resolved with complete annotations.
    /// BRONZE: vague hypothesis or ambiguous resolution. ABANDONED mirrors
    /// the outcome status.
    pub fn computed_tier(&self) -> ConfidenceTier {
        let Some(outcome) = &self.outcome else {
            return ConfidenceTier::Bronze;
        };
        if outcome.status == OutcomeStatus::Abandoned {
            return ConfidenceTier::Abandoned;
        }
        if self.hypothesis_is_vague() {
            return ConfidenceTier::Bronze;
        }
        if outcome.auto_captured && self.has_annotation() {
            return ConfidenceTier::Gold;
        }
        if self.annotations_complete() {
            return ConfidenceTier::Silver;
        }
        ConfidenceTier::Bronze
    }

    fn hypothesis_is_vague(&self) -> bool {
        self.current.hypothesis.trim().chars().count() < VAGUE_HYPOTHESIS_CHARS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved_entry(status: OutcomeStatus, auto_captured: bool) -> GhapEntry {
        GhapEntry {
            id: "e1".into(),
            session_id: "s1".into(),
            domain: Domain::Debugging,
            strategy: Strategy::RootCauseAnalysis,
            goal: "fix the flaky integration test".into(),
            current: GhapCurrent {
                hypothesis: "the test leaks a tempdir that collides across parallel runs".into(),
                action: "isolate tempdirs per test".into(),
                prediction: "test passes 10/10".into(),
            },
            history: Vec::new(),
            iteration_count: 0,
            notes: Vec::new(),
            outcome: Some(GhapOutcome {
                status,
                result: "observed".into(),
                auto_captured,
                captured_at: Utc::now(),
            }),
            surprise: None,
            root_cause: None,
            lesson: None,
            confidence_tier: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn enum_round_trips_match_wire_values() {
        assert_eq!(Domain::Debugging.as_str(), "debugging");
        assert_eq!("root_cause_analysis".parse::<Strategy>().unwrap(), Strategy::RootCauseAnalysis);
        assert_eq!(
            serde_json::to_string(&OutcomeStatus::Falsified).unwrap(),
            "\"FALSIFIED\""
        );
        assert_eq!("root_cause".parse::<Axis>().unwrap(), Axis::RootCause);
        assert!("no_such_domain".parse::<Domain>().is_err());
    }

    #[test]
    fn abandoned_outcome_always_grades_abandoned() {
        let mut entry = resolved_entry(OutcomeStatus::Abandoned, false);
        entry.lesson = Some(Lesson {
            what_worked: "nothing".into(),
            takeaway: "scope down".into(),
        });
        assert_eq!(entry.computed_tier(), ConfidenceTier::Abandoned);
    }

    #[test]
    fn auto_captured_with_annotation_grades_gold() {
        let mut entry = resolved_entry(OutcomeStatus::Falsified, true);
        entry.surprise = Some("the failure was test isolation, not timing".into());
        assert_eq!(entry.computed_tier(), ConfidenceTier::Gold);
    }

    #[test]
    fn manual_resolve_with_complete_annotations_grades_silver() {
        let mut entry = resolved_entry(OutcomeStatus::Falsified, false);
        entry.root_cause = Some(RootCause {
            category: "wrong-assumption".into(),
            description: "assumed intermittent meant timing".into(),
        });
        entry.lesson = Some(Lesson {
            what_worked: "checking isolation first".into(),
            takeaway: "rule out shared state before timing".into(),
        });
        assert_eq!(entry.computed_tier(), ConfidenceTier::Silver);
    }

    #[test]
    fn vague_hypothesis_grades_bronze() {
        let mut entry = resolved_entry(OutcomeStatus::Confirmed, true);
        entry.current.hypothesis = "timing issue".into();
        entry.lesson = Some(Lesson {
            what_worked: "sleep".into(),
            takeaway: "sleep more".into(),
        });
        assert_eq!(entry.computed_tier(), ConfidenceTier::Bronze);
    }

    #[test]
    fn manual_resolve_without_annotations_grades_bronze() {
        let entry = resolved_entry(OutcomeStatus::Confirmed, false);
        assert_eq!(entry.computed_tier(), ConfidenceTier::Bronze);
    }

    #[test]
    fn tier_weights_are_ordered() {
        assert!(ConfidenceTier::Gold.centroid_weight() > ConfidenceTier::Silver.centroid_weight());
        assert!(ConfidenceTier::Silver.centroid_weight() > ConfidenceTier::Bronze.centroid_weight());
        assert!(
            ConfidenceTier::Bronze.centroid_weight() > ConfidenceTier::Abandoned.centroid_weight()
        );
    }
}
