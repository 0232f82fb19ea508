use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::OnceCell;
use tracing::info;

use calm_schema::{CalmError, Result};

use crate::Embedder;

/// Wall-clock bound on a single embed batch, model load included.
const EMBED_TIMEOUT: Duration = Duration::from_secs(30);

/// Real embedder over a local fastembed (ONNX) model.
///
/// The model is loaded lazily on first use and every execution runs on the
/// blocking pool, keeping the request executor free. CPU execution only.
pub struct FastembedEmbedder {
    model_name: String,
    model: EmbeddingModel,
    dimension: usize,
    batch_size: usize,
    cell: OnceCell<Arc<Mutex<TextEmbedding>>>,
}

impl FastembedEmbedder {
    pub fn new(model_name: &str, dimension: usize, batch_size: usize) -> Result<Self> {
        let model = resolve_model(model_name)?;
        Ok(Self {
            model_name: model_name.to_string(),
            model,
            dimension,
            batch_size: batch_size.max(1),
            cell: OnceCell::new(),
        })
    }

    async fn backend(&self) -> Result<Arc<Mutex<TextEmbedding>>> {
        self.cell
            .get_or_try_init(|| async {
                let name = self.model_name.clone();
                let which = self.model.clone();
                let loaded = tokio::task::spawn_blocking(move || {
                    TextEmbedding::try_new(
                        InitOptions::new(which).with_show_download_progress(false),
                    )
                    .map_err(|err| CalmError::Embed(format!("loading model '{name}': {err}")))
                })
                .await
                .map_err(|err| CalmError::Embed(format!("model load task failed: {err}")))??;
                info!(model = %self.model_name, dim = self.dimension, "embedding model loaded");
                Ok(Arc::new(Mutex::new(loaded)))
            })
            .await
            .cloned()
    }
}

#[async_trait]
impl Embedder for FastembedEmbedder {
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let backend = self.backend().await?;
        let batch = self.batch_size;
        let owned: Vec<String> = texts.to_vec();
        let task = tokio::task::spawn_blocking(move || {
            backend
                .lock()
                .map_err(|err| CalmError::Embed(format!("embedding model lock poisoned: {err}")))?
                .embed(owned, Some(batch))
                .map_err(|err| CalmError::Embed(err.to_string()))
        });

        let vectors = tokio::time::timeout(EMBED_TIMEOUT, task)
            .await
            .map_err(|_| {
                CalmError::Embed(format!("embedding timed out after {EMBED_TIMEOUT:?}"))
            })?
            .map_err(|err| CalmError::Embed(format!("embedding task failed: {err}")))??;

        if let Some(first) = vectors.first() {
            if first.len() != self.dimension {
                return Err(CalmError::Embed(format!(
                    "model '{}' produced {}-dim vectors, expected {}",
                    self.model_name,
                    first.len(),
                    self.dimension
                )));
            }
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Map a configured model name to a fastembed model. Only models whose
/// output dimension matches one of the two roles are listed.
fn resolve_model(name: &str) -> Result<EmbeddingModel> {
    match name.to_ascii_lowercase().as_str() {
        "all-minilm-l6-v2" => Ok(EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(EmbeddingModel::BGEBaseENV15),
        "nomic-embed-text-v1.5" => Ok(EmbeddingModel::NomicEmbedTextV15),
        other => Err(CalmError::Embed(format!(
            "unknown embedding model '{other}' (supported: all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, nomic-embed-text-v1.5)"
        ))),
    }
}
