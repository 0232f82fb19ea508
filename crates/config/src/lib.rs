use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Prefix shared by every environment override, e.g. `CALM_VECTOR_STORE_URL`.
const ENV_PREFIX: &str = "CALM_";

/// Service configuration, loaded from `{calm_dir}/config.yaml` with
/// individual keys overridable by `CALM_*` environment variables.
///
/// Key names are part of the installation contract; hook scripts and the
/// installer reference them by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalmConfig {
    /// Home directory for all on-disk state (journal, vector files, redb).
    pub calm_dir: PathBuf,
    /// Qdrant URL. Empty selects the embedded file-backed store.
    pub vector_store_url: String,
    /// Embedding model for the 384-dim `code` role.
    pub code_model: String,
    /// Embedding model for the 768-dim `semantic` role.
    pub semantic_model: String,
    /// Relative weight of each context source when splitting a token budget.
    pub source_weights: HashMap<String, f32>,
    /// Fuzzy-dedup ratio at or above which two rendered items are duplicates.
    pub similarity_threshold: f32,
    /// Cap on a single item's share of its source budget.
    pub max_item_fraction: f32,
    /// Items longer than this are exempt from fuzzy comparison.
    pub max_fuzzy_content_length: usize,
    pub memory_content_max_length: usize,
    /// Embedding batch size for bulk indexing.
    pub batch_size: usize,
    /// Tool-call count at which hooks should check in.
    pub check_in_frequency: u64,
    pub socket_path: String,
    pub log_level: String,
}

impl Default for CalmConfig {
    fn default() -> Self {
        let calm_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".calm");
        Self {
            calm_dir,
            vector_store_url: String::new(),
            code_model: "all-minilm-l6-v2".to_string(),
            semantic_model: "nomic-embed-text-v1.5".to_string(),
            source_weights: default_source_weights(),
            similarity_threshold: 0.85,
            max_item_fraction: 0.25,
            max_fuzzy_content_length: 2000,
            memory_content_max_length: 10_000,
            batch_size: 32,
            check_in_frequency: 10,
            socket_path: "/tmp/calm.sock".to_string(),
            log_level: "info".to_string(),
        }
    }
}

fn default_source_weights() -> HashMap<String, f32> {
    HashMap::from([
        ("memories".to_string(), 1.0),
        ("values".to_string(), 0.8),
        ("experiences".to_string(), 1.0),
        ("code".to_string(), 0.8),
        ("commits".to_string(), 0.4),
    ])
}

impl CalmConfig {
    /// Load from the default location: `$CALM_DIR/config.yaml` or
    /// `~/.calm/config.yaml`.
    pub fn load() -> Result<Self> {
        let dir = env::var("CALM_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default().calm_dir);
        Self::load_from(dir.join("config.yaml"))
    }

    /// Load from an explicit path. A missing file yields defaults; a present
    /// but unparseable file is an error. Environment overrides are applied
    /// after the file in both cases.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = match fs::read_to_string(path.as_ref()) {
            Ok(raw) => serde_yaml::from_str(&raw)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = serde_yaml::to_string(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.calm_dir.join("journal")
    }

    pub fn vector_dir(&self) -> PathBuf {
        self.calm_dir.join("vector")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.calm_dir.join("meta.redb")
    }

    pub fn uses_embedded_store(&self) -> bool {
        self.vector_store_url.is_empty()
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_override("DIR") {
            self.calm_dir = PathBuf::from(v);
        }
        if let Some(v) = env_override("VECTOR_STORE_URL") {
            self.vector_store_url = v;
        }
        if let Some(v) = env_override("CODE_MODEL") {
            self.code_model = v;
        }
        if let Some(v) = env_override("SEMANTIC_MODEL") {
            self.semantic_model = v;
        }
        if let Some(v) = env_override("SOCKET_PATH") {
            self.socket_path = v;
        }
        if let Some(v) = env_override("LOG") {
            self.log_level = v;
        }
        parse_override("SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        parse_override("MAX_ITEM_FRACTION", &mut self.max_item_fraction);
        parse_override("MAX_FUZZY_CONTENT_LENGTH", &mut self.max_fuzzy_content_length);
        parse_override("MEMORY_CONTENT_MAX_LENGTH", &mut self.memory_content_max_length);
        parse_override("BATCH_SIZE", &mut self.batch_size);
        parse_override("CHECK_IN_FREQUENCY", &mut self.check_in_frequency);
    }
}

fn env_override(key: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .filter(|v| !v.is_empty())
}

fn parse_override<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Some(raw) = env_override(key) {
        if let Ok(parsed) = raw.parse::<T>() {
            *slot = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = CalmConfig::load_from(dir.path().join("nope.yaml"))?;
        assert_eq!(config.similarity_threshold, 0.85);
        assert_eq!(config.max_item_fraction, 0.25);
        assert_eq!(config.memory_content_max_length, 10_000);
        assert!(config.uses_embedded_store());
        Ok(())
    }

    #[test]
    fn partial_yaml_keeps_defaults_for_absent_keys() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yaml");
        fs::write(&path, "vector_store_url: http://localhost:6334\nbatch_size: 8\n")?;
        let config = CalmConfig::load_from(&path)?;
        assert_eq!(config.vector_store_url, "http://localhost:6334");
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.code_model, "all-minilm-l6-v2");
        assert!(!config.uses_embedded_store());
        Ok(())
    }

    #[test]
    fn config_round_trips_through_yaml() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yaml");
        let mut config = CalmConfig::default();
        config.source_weights.insert("code".into(), 2.5);
        config.save_to(&path)?;
        let loaded = CalmConfig::load_from(&path)?;
        assert_eq!(loaded.source_weights.get("code"), Some(&2.5));
        Ok(())
    }

    #[test]
    fn derived_paths_live_under_calm_dir() {
        let mut config = CalmConfig::default();
        config.calm_dir = PathBuf::from("/srv/calm");
        assert_eq!(config.journal_dir(), PathBuf::from("/srv/calm/journal"));
        assert_eq!(config.vector_dir(), PathBuf::from("/srv/calm/vector"));
        assert_eq!(config.metadata_path(), PathBuf::from("/srv/calm/meta.redb"));
    }
}
