//! Embedders: OpenAI Embeddings API and a deterministic offline fallback.

use async_openai::{
    config::OpenAIConfig,
    types::embeddings::{CreateEmbeddingRequest, EmbeddingInput},
    Client,
};
use async_trait::async_trait;

use crate::rag::RagError;

/// Produces fixed-size float vectors from text. Vectors are expected to be
/// L2-normalized so inner product doubles as cosine similarity.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input text, same order.
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, RagError>;

    /// Dimension of returned vectors.
    fn dimension(&self) -> usize;
}

/// OpenAI Embeddings client. Default model `text-embedding-3-small`.
pub struct OpenAiEmbedder {
    config: OpenAIConfig,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbedder {
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        let dimensions = Self::model_dimensions(&model);
        Self {
            config: OpenAIConfig::new(),
            model,
            dimensions,
        }
    }

    pub fn with_config(config: OpenAIConfig, model: impl Into<String>) -> Self {
        let model = model.into();
        let dimensions = Self::model_dimensions(&model);
        Self {
            config,
            model,
            dimensions,
        }
    }

    fn model_dimensions(model: &str) -> usize {
        match model {
            "text-embedding-3-large" => 3072,
            _ => 1536,
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, RagError> {
        let client = Client::with_config(self.config.clone());
        let request = CreateEmbeddingRequest {
            input: EmbeddingInput::StringArray(texts.iter().map(|t| t.to_string()).collect()),
            model: self.model.clone(),
            ..Default::default()
        };
        let response = client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| RagError::Embedding(e.to_string()))?;
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }

    fn dimension(&self) -> usize {
        self.dimensions
    }
}

/// Deterministic embedder for tests and keyless deployments: hashed
/// bag-of-words buckets, L2-normalized. Similar texts share buckets, which is
/// enough for relevance ordering in fixtures.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

fn bucket(token: &str, dimension: usize) -> usize {
    // FNV-1a; stable across runs and platforms.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in token.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % dimension as u64) as usize
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, RagError> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0f32; self.dimension];
                for token in text
                    .to_lowercase()
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|t| !t.is_empty())
                {
                    v[bucket(token, self.dimension)] += 1.0;
                }
                let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > 0.0 {
                    for x in &mut v {
                        *x /= norm;
                    }
                }
                v
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: hash embeddings are deterministic and normalized.
    #[tokio::test]
    async fn hash_embedder_deterministic_and_normalized() {
        let e = HashEmbedder::default();
        let a = e.embed(&["rust borrow checker"]).await.unwrap();
        let b = e.embed(&["rust borrow checker"]).await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    /// **Scenario**: shared vocabulary scores higher than disjoint vocabulary.
    #[tokio::test]
    async fn hash_embedder_orders_by_overlap() {
        let e = HashEmbedder::default();
        let vectors = e
            .embed(&[
                "the rust compiler",
                "rust compiler diagnostics",
                "gardening tips for spring",
            ])
            .await
            .unwrap();
        let dot = |a: &[f32], b: &[f32]| -> f32 { a.iter().zip(b).map(|(x, y)| x * y).sum() };
        assert!(dot(&vectors[0], &vectors[1]) > dot(&vectors[0], &vectors[2]));
    }

    /// **Scenario**: empty text embeds to the zero vector without panicking.
    #[tokio::test]
    async fn hash_embedder_empty_text() {
        let e = HashEmbedder::default();
        let v = e.embed(&[""]).await.unwrap();
        assert!(v[0].iter().all(|x| *x == 0.0));
    }
}
