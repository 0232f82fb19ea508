//! Collection names, embedding roles, and the axis→collection routing table.
//!
//! Field names and enumerated payload values in these collections are part of
//! the wire contract: adding fields is backward compatible, renaming is not.

use serde::{Deserialize, Serialize};

use crate::ghap::Axis;

pub const MEMORIES: &str = "memories";
pub const CODE_UNITS: &str = "code_units";
pub const COMMITS: &str = "commits";
pub const GHAP_FULL: &str = "ghap_full";
pub const GHAP_STRATEGY: &str = "ghap_strategy";
pub const GHAP_SURPRISE: &str = "ghap_surprise";
pub const GHAP_ROOT_CAUSE: &str = "ghap_root_cause";
pub const VALUES: &str = "values";

/// Every collection the service manages, in creation order.
pub const ALL_COLLECTIONS: &[&str] = &[
    MEMORIES,
    CODE_UNITS,
    COMMITS,
    GHAP_FULL,
    GHAP_STRATEGY,
    GHAP_SURPRISE,
    GHAP_ROOT_CAUSE,
    VALUES,
];

/// Dimension of the `code` embedding role.
pub const CODE_DIM: usize = 384;
/// Dimension of the `semantic` embedding role.
pub const SEMANTIC_DIM: usize = 768;

/// The two named embedding roles. Every collection maps to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedRole {
    Code,
    Semantic,
}

impl EmbedRole {
    pub fn dimension(self) -> usize {
        match self {
            EmbedRole::Code => CODE_DIM,
            EmbedRole::Semantic => SEMANTIC_DIM,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EmbedRole::Code => "code",
            EmbedRole::Semantic => "semantic",
        }
    }
}

/// Role routing: `code_units` embeds with the code model, everything else
/// (memories, commits, GHAP axes, values) with the semantic model.
pub fn role_for_collection(name: &str) -> EmbedRole {
    if name == CODE_UNITS {
        EmbedRole::Code
    } else {
        EmbedRole::Semantic
    }
}

pub fn dimension_for_collection(name: &str) -> usize {
    role_for_collection(name).dimension()
}

/// Collection holding points for the given GHAP axis.
pub fn ghap_collection(axis: Axis) -> &'static str {
    match axis {
        Axis::Full => GHAP_FULL,
        Axis::Strategy => GHAP_STRATEGY,
        Axis::Surprise => GHAP_SURPRISE,
        Axis::RootCause => GHAP_ROOT_CAUSE,
    }
}
