use async_trait::async_trait;
use sha2::{Digest, Sha256};

use calm_schema::Result;

use crate::Embedder;

/// Deterministic hash-seeded embedder. The only variant permitted in tests.
///
/// Each token is hashed into a handful of vector slots, so texts sharing
/// tokens produce correlated vectors and unrelated texts are near-orthogonal.
/// Output is L2-normalized.
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= 2)
        {
            let digest = Sha256::digest(token.as_bytes());
            for chunk in digest.chunks_exact(8).take(3) {
                let raw = u64::from_le_bytes(chunk.try_into().unwrap());
                let slot = (raw % self.dimension as u64) as usize;
                let sign = if (raw >> 32) & 1 == 0 { 1.0 } else { -1.0 };
                vector[slot] += sign;
            }
        }
        if vector.iter().all(|v| *v == 0.0) {
            vector[0] = 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
