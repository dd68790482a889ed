//! Text embedding for the retrieval pipeline.
//!
//! Two backends implement the [`Embedder`] trait: [`LocalEmbedder`], which
//! lazily loads an in-process model on first use, and [`HttpEmbedder`], which
//! calls an OpenAI-compatible `/embeddings` endpoint. Both produce
//! unit-normalized vectors of a fixed dimension and preserve input order for
//! batch calls. Neither caches; hot embeddings are cached by the retriever.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::wealthcoach::error::CoreError;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding model failed to load: {0}")]
    ModelLoad(String),

    #[error("input must be a non-empty string")]
    EmptyInput,

    #[error("embedding request failed: {0}")]
    Upstream(String),
}

impl From<EmbeddingError> for CoreError {
    fn from(e: EmbeddingError) -> Self {
        match e {
            EmbeddingError::ModelLoad(msg) => CoreError::Fatal(msg),
            EmbeddingError::EmptyInput => CoreError::Input(e.to_string()),
            EmbeddingError::Upstream(msg) => CoreError::Transient(msg),
        }
    }
}

/// Encodes text into fixed-dimension dense vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single string. Fails with [`EmbeddingError::EmptyInput`] on
    /// empty input.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed a batch. Results are returned in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Dimension of the produced vectors.
    fn dimensions(&self) -> usize;
}

fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let magnitude: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for x in vector.iter_mut() {
            *x /= magnitude;
        }
    }
    vector
}

// ---------------------------------------------------------------------------
// Local embedder
// ---------------------------------------------------------------------------

/// Deterministic in-process embedding model.
///
/// Tokens are folded into the vector through a rolling hash projection, so
/// texts sharing vocabulary land close under cosine similarity. Good enough
/// for tests and small deployments; production setups point the retriever at
/// an [`HttpEmbedder`] instead.
struct HashProjectionModel {
    dimensions: usize,
}

impl HashProjectionModel {
    fn load(dimensions: usize) -> Result<Self, EmbeddingError> {
        if dimensions == 0 {
            return Err(EmbeddingError::ModelLoad(
                "embedding dimension must be positive".to_string(),
            ));
        }
        Ok(Self { dimensions })
    }

    fn encode(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let lowered = text.to_lowercase();
        for (i, word) in lowered.split_whitespace().enumerate() {
            let hash = word
                .chars()
                .fold(0u32, |acc, c| acc.wrapping_add(c as u32).wrapping_mul(31));
            for j in 0..8u32 {
                let spread = j.wrapping_mul(2_654_435_761);
                let idx = (hash.wrapping_add(spread) % self.dimensions as u32) as usize;
                vector[idx] += 1.0 / (i + 1) as f32;
            }
        }
        normalize(vector)
    }
}

/// Embedder whose model is loaded on the first `embed` call.
///
/// Loading is serialized: at most one loader is in flight, and every other
/// caller waits for it and then reuses the loaded model. The model is
/// immutable after load.
pub struct LocalEmbedder {
    dimensions: usize,
    model: OnceCell<Arc<HashProjectionModel>>,
}

impl LocalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            model: OnceCell::new(),
        }
    }

    async fn model(&self) -> Result<Arc<HashProjectionModel>, EmbeddingError> {
        let model = self
            .model
            .get_or_try_init(|| async {
                log::info!(
                    "loading local embedding model (dim={})",
                    self.dimensions
                );
                HashProjectionModel::load(self.dimensions).map(Arc::new)
            })
            .await?;
        Ok(model.clone())
    }

    /// Whether the model has been loaded yet. Exposed so health checks can
    /// report without forcing a load.
    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let model = self.model().await?;
        Ok(model.encode(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let model = self.model().await?;
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            if text.trim().is_empty() {
                return Err(EmbeddingError::EmptyInput);
            }
            out.push(model.encode(text));
        }
        Ok(out)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ---------------------------------------------------------------------------
// HTTP embedder
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

/// Embedder backed by an OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbedder {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
}

impl HttpEmbedder {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            dimensions,
        }
    }

    async fn call(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let request = EmbeddingsRequest {
            input: inputs,
            model: &self.model,
        };

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| EmbeddingError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Upstream(format!(
                "HTTP {} from {}: {}",
                status, url, body
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Upstream(format!("invalid response body: {}", e)))?;

        // Providers may reorder rows; the index field restores input order.
        let mut rows = parsed.data;
        rows.sort_by_key(|row| row.index);
        if rows.len() != inputs.len() {
            return Err(EmbeddingError::Upstream(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                rows.len()
            )));
        }
        Ok(rows
            .into_iter()
            .map(|row| normalize(row.embedding))
            .collect())
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let mut vectors = self.call(&[text.to_string()]).await?;
        Ok(vectors.remove(0))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::EmptyInput);
        }
        self.call(texts).await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_embedder_loads_lazily() {
        let embedder = LocalEmbedder::new(384);
        assert!(!embedder.is_loaded());

        let vector = embedder.embed("retirement savings account").await.unwrap();
        assert!(embedder.is_loaded());
        assert_eq!(vector.len(), 384);

        let magnitude: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 0.01, "vector must be unit-normalized");
    }

    #[tokio::test]
    async fn empty_input_is_rejected_before_load() {
        let embedder = LocalEmbedder::new(16);
        assert!(matches!(
            embedder.embed("   ").await,
            Err(EmbeddingError::EmptyInput)
        ));
    }

    #[tokio::test]
    async fn zero_dimension_fails_as_model_load() {
        let embedder = LocalEmbedder::new(0);
        assert!(matches!(
            embedder.embed("hello").await,
            Err(EmbeddingError::ModelLoad(_))
        ));
    }

    #[tokio::test]
    async fn batch_preserves_input_order() {
        let embedder = LocalEmbedder::new(64);
        let texts = vec![
            "stocks".to_string(),
            "bonds".to_string(),
            "stocks".to_string(),
        ];
        let vectors = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0], vectors[2], "identical inputs embed identically");
        assert_ne!(vectors[0], vectors[1]);
    }

    #[tokio::test]
    async fn similar_texts_score_higher() {
        let embedder = LocalEmbedder::new(128);
        let a = embedder.embed("retirement account savings").await.unwrap();
        let b = embedder.embed("savings for retirement account").await.unwrap();
        let c = embedder.embed("chocolate cake recipe").await.unwrap();

        let dot = |x: &[f32], y: &[f32]| -> f32 { x.iter().zip(y).map(|(a, b)| a * b).sum() };
        assert!(dot(&a, &b) > dot(&a, &c));
    }
}
