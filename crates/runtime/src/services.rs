use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use calm_config::CalmConfig;
use calm_embedding::EmbeddingRegistry;
use calm_indexer::{CodeIndexer, CommitIndexer};
use calm_journal::JournalStore;
use calm_learn::{ExperienceClusterer, ObservationPersister, ValueStore};
use calm_schema::collections::{dimension_for_collection, ALL_COLLECTIONS};
use calm_schema::{Axis, Result};
use calm_search::{ContextAssembler, UnifiedSearcher};
use calm_store::{EmbeddedStore, MetadataStore, QdrantStore, VectorStore};

/// Summary of one cluster from the most recent run for an axis. The
/// composed `cluster_id` is what `validate_value` consumes.
#[derive(Debug, Clone)]
pub struct ClusterSummary {
    pub cluster_id: String,
    pub label: i64,
    pub size: usize,
}

/// Everything the dispatcher needs, wired once at startup.
pub struct Services {
    pub config: Arc<CalmConfig>,
    pub registry: EmbeddingRegistry,
    pub store: Arc<dyn VectorStore>,
    pub meta: Arc<MetadataStore>,
    pub journal: Arc<JournalStore>,
    pub persister: ObservationPersister,
    pub clusterer: ExperienceClusterer,
    pub values: ValueStore,
    pub searcher: UnifiedSearcher,
    pub assembler: ContextAssembler,
    pub code_indexer: CodeIndexer,
    pub commit_indexer: CommitIndexer,
    /// Cluster ids handed out by the latest run per axis; labels are only
    /// valid until the next run, so this is session-scoped state.
    pub clusters: Mutex<HashMap<Axis, Vec<ClusterSummary>>>,
}

impl Services {
    /// Production wiring: real embedders, store chosen by config.
    pub async fn initialize(config: CalmConfig) -> Result<Self> {
        let registry = EmbeddingRegistry::from_config(&config)?;
        let store: Arc<dyn VectorStore> = if config.uses_embedded_store() {
            Arc::new(EmbeddedStore::open(config.vector_dir())?)
        } else {
            Arc::new(QdrantStore::connect(&config.vector_store_url)?)
        };
        Self::with_backends(config, registry, store).await
    }

    /// Wiring with injected backends. Tests pass a mock registry and an
    /// in-memory store through here.
    pub async fn with_backends(
        config: CalmConfig,
        registry: EmbeddingRegistry,
        store: Arc<dyn VectorStore>,
    ) -> Result<Self> {
        for name in ALL_COLLECTIONS {
            store
                .create_collection(name, dimension_for_collection(name))
                .await?;
        }
        let meta = Arc::new(MetadataStore::open(config.metadata_path())?);
        let journal = Arc::new(JournalStore::open(config.journal_dir())?);
        let config = Arc::new(config);

        let searcher = UnifiedSearcher::new(store.clone(), registry.clone());
        let services = Self {
            persister: ObservationPersister::new(store.clone(), registry.clone()),
            clusterer: ExperienceClusterer::new(store.clone()),
            values: ValueStore::new(store.clone(), registry.clone()),
            assembler: ContextAssembler::new(searcher.clone(), config.clone()),
            code_indexer: CodeIndexer::new(store.clone(), registry.clone(), meta.clone()),
            commit_indexer: CommitIndexer::new(store.clone(), registry.clone(), meta.clone()),
            searcher,
            config,
            registry,
            store,
            meta,
            journal,
            clusters: Mutex::new(HashMap::new()),
        };
        info!("services initialized");
        Ok(services)
    }
}
