//! Embedding backends and the role registry.
//!
//! Two named roles exist: `code` (384-dim, code snippets and signatures) and
//! `semantic` (768-dim, everything else). The registry owns one embedder per
//! role and routes collections to roles; batched calls never mix roles.

use std::sync::Arc;

use async_trait::async_trait;

use calm_config::CalmConfig;
use calm_schema::{CalmError, EmbedRole, Result};

mod model;
mod mock;

pub use mock::MockEmbedder;
pub use model::FastembedEmbedder;

/// A text-to-vector backend for one embedding role.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch. Returns one vector per input, in order.
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Output dimensionality of every vector this embedder produces.
    fn dimension(&self) -> usize;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_many(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| CalmError::Embed("backend returned no vector".to_string()))
    }
}

/// Routes each embedding role to its backend.
#[derive(Clone)]
pub struct EmbeddingRegistry {
    code: Arc<dyn Embedder>,
    semantic: Arc<dyn Embedder>,
}

impl EmbeddingRegistry {
    /// Build a registry from two backends, checking their dimensions against
    /// the role contract (code=384, semantic=768).
    pub fn new(code: Arc<dyn Embedder>, semantic: Arc<dyn Embedder>) -> Result<Self> {
        for (role, embedder) in [
            (EmbedRole::Code, &code),
            (EmbedRole::Semantic, &semantic),
        ] {
            if embedder.dimension() != role.dimension() {
                return Err(CalmError::Embed(format!(
                    "{} embedder produces {}-dim vectors, role requires {}",
                    role.as_str(),
                    embedder.dimension(),
                    role.dimension()
                )));
            }
        }
        Ok(Self { code, semantic })
    }

    /// Real backends from config. Models load lazily on first call.
    pub fn from_config(config: &CalmConfig) -> Result<Self> {
        let code = FastembedEmbedder::new(
            &config.code_model,
            EmbedRole::Code.dimension(),
            config.batch_size,
        )?;
        let semantic = FastembedEmbedder::new(
            &config.semantic_model,
            EmbedRole::Semantic.dimension(),
            config.batch_size,
        )?;
        Self::new(Arc::new(code), Arc::new(semantic))
    }

    /// Deterministic mock backends for both roles. Test-only wiring.
    pub fn mock() -> Self {
        Self {
            code: Arc::new(MockEmbedder::new(EmbedRole::Code.dimension())),
            semantic: Arc::new(MockEmbedder::new(EmbedRole::Semantic.dimension())),
        }
    }

    pub fn for_role(&self, role: EmbedRole) -> &Arc<dyn Embedder> {
        match role {
            EmbedRole::Code => &self.code,
            EmbedRole::Semantic => &self.semantic,
        }
    }

    pub fn for_collection(&self, collection: &str) -> &Arc<dyn Embedder> {
        self.for_role(calm_schema::collections::role_for_collection(collection))
    }

    pub async fn embed_one(&self, role: EmbedRole, text: &str) -> Result<Vec<f32>> {
        self.for_role(role).embed_one(text).await
    }

    pub async fn embed_many(&self, role: EmbedRole, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.for_role(role).embed_many(texts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_routes_collections_to_roles() -> anyhow::Result<()> {
        let registry = EmbeddingRegistry::mock();
        assert_eq!(registry.for_collection("code_units").dimension(), 384);
        assert_eq!(registry.for_collection("memories").dimension(), 768);
        assert_eq!(registry.for_collection("ghap_strategy").dimension(), 768);

        let v = registry.embed_one(EmbedRole::Semantic, "hello world").await?;
        assert_eq!(v.len(), 768);
        Ok(())
    }

    #[tokio::test]
    async fn registry_rejects_dimension_mismatch() {
        let wrong = Arc::new(MockEmbedder::new(128));
        let ok = Arc::new(MockEmbedder::new(768));
        assert!(EmbeddingRegistry::new(wrong, ok).is_err());
    }
}
