use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CalmError;

/// Category of a stored memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    Fact,
    Preference,
    Decision,
    Note,
    Learning,
}

impl MemoryCategory {
    pub const ALL: &'static [MemoryCategory] = &[
        MemoryCategory::Fact,
        MemoryCategory::Preference,
        MemoryCategory::Decision,
        MemoryCategory::Note,
        MemoryCategory::Learning,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryCategory::Fact => "fact",
            MemoryCategory::Preference => "preference",
            MemoryCategory::Decision => "decision",
            MemoryCategory::Note => "note",
            MemoryCategory::Learning => "learning",
        }
    }
}

impl fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryCategory {
    type Err = CalmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MemoryCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                CalmError::Validation(format!(
                    "unknown category '{s}', expected one of: fact, preference, decision, note, learning"
                ))
            })
    }
}

/// A semantic memory as mirrored between the vector payload and the metadata
/// store shadow record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub content: String,
    pub category: MemoryCategory,
    pub importance: f32,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Unix seconds.
    pub created_at: i64,
    #[serde(default)]
    pub project: Option<String>,
}

impl MemoryRecord {
    /// Stable content-derived id: same content and project always map to the
    /// same point, so re-storing is an upsert, not a duplicate.
    pub fn derive_id(content: &str, project: Option<&str>) -> String {
        content_id(&[content, project.unwrap_or("")])
    }
}

/// SHA-256 over `\x1f`-separated parts, truncated to a 32-hex-char id.
pub fn content_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hasher
        .finalize()
        .iter()
        .take(16)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_ids_are_stable_and_project_scoped() {
        let a = MemoryRecord::derive_id("prefer explicit error types", Some("calm"));
        let b = MemoryRecord::derive_id("prefer explicit error types", Some("calm"));
        let c = MemoryRecord::derive_id("prefer explicit error types", Some("other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn categories_parse_from_wire_strings() {
        assert_eq!("preference".parse::<MemoryCategory>().unwrap(), MemoryCategory::Preference);
        assert!("opinion".parse::<MemoryCategory>().is_err());
    }
}
