//! Vector storage for indexed knowledge-base passages.
//!
//! The store holds `(id, content, metadata, embedding)` rows and answers
//! cosine-similarity top-k queries. Population happens through an external
//! ingestion pipeline (or the startup seeding path in the binary); the chat
//! core only reads.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wealthcoach::error::CoreError;

/// Upper bound applied to the `k` parameter of a similarity search.
pub const K_MAX: usize = 50;

#[derive(Debug, Error)]
pub enum VectorStoreError {
    /// The backing store cannot be reached. Retriable; the retriever falls
    /// back to an empty result.
    #[error("vector store unavailable: {0}")]
    Unavailable(String),

    /// Corrupt state such as a dimension mismatch. Fatal; must be surfaced.
    #[error("vector store corrupt: {0}")]
    Corrupt(String),
}

impl From<VectorStoreError> for CoreError {
    fn from(e: VectorStoreError) -> Self {
        match e {
            VectorStoreError::Unavailable(msg) => CoreError::Transient(msg),
            VectorStoreError::Corrupt(msg) => CoreError::Fatal(msg),
        }
    }
}

/// An indexed passage. Created at ingestion and replaced by id only, never
/// mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub embedding: Vec<f32>,
}

impl Document {
    /// The citation string carried in `metadata.source`, if present.
    pub fn source(&self) -> Option<&str> {
        self.metadata.get("source").and_then(|v| v.as_str())
    }
}

/// A document paired with its similarity to the query.
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: f32,
}

/// Contract for vector storage backends.
///
/// Implementations may be an HNSW-indexed SQL table or an in-process index;
/// callers only rely on this interface.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace documents by id.
    async fn upsert(&self, docs: Vec<Document>) -> Result<(), VectorStoreError>;

    /// Remove every document. Administrative action.
    async fn delete_all(&self) -> Result<(), VectorStoreError>;

    /// Number of stored documents.
    async fn count(&self) -> Result<usize, VectorStoreError>;

    /// Top-k rows whose cosine similarity to `query` is strictly greater
    /// than `threshold`, ordered by similarity descending with ties broken
    /// by id ascending. `k` is clamped to `[1, K_MAX]`; `threshold` is
    /// clamped to `[0.0, 1.0]` and a threshold of zero disables filtering.
    async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredDocument>, VectorStoreError>;
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
    }
}

/// In-process nearest-neighbor index over a flat map.
///
/// A linear scan is fine at knowledge-base sizes this serves; larger corpora
/// move to an HNSW-indexed table behind the same trait.
pub struct InMemoryVectorStore {
    rows: Arc<RwLock<HashMap<String, Document>>>,
    dimensions: usize,
}

impl InMemoryVectorStore {
    pub fn new(dimensions: usize) -> Self {
        Self {
            rows: Arc::new(RwLock::new(HashMap::new())),
            dimensions,
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, docs: Vec<Document>) -> Result<(), VectorStoreError> {
        let mut rows = self
            .rows
            .write()
            .map_err(|e| VectorStoreError::Unavailable(e.to_string()))?;
        for doc in docs {
            if doc.embedding.len() != self.dimensions {
                return Err(VectorStoreError::Corrupt(format!(
                    "document {} has dimension {}, store expects {}",
                    doc.id,
                    doc.embedding.len(),
                    self.dimensions
                )));
            }
            rows.insert(doc.id.clone(), doc);
        }
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), VectorStoreError> {
        let mut rows = self
            .rows
            .write()
            .map_err(|e| VectorStoreError::Unavailable(e.to_string()))?;
        rows.clear();
        Ok(())
    }

    async fn count(&self) -> Result<usize, VectorStoreError> {
        let rows = self
            .rows
            .read()
            .map_err(|e| VectorStoreError::Unavailable(e.to_string()))?;
        Ok(rows.len())
    }

    async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredDocument>, VectorStoreError> {
        if query.len() != self.dimensions {
            return Err(VectorStoreError::Corrupt(format!(
                "query has dimension {}, store expects {}",
                query.len(),
                self.dimensions
            )));
        }

        let k = k.clamp(1, K_MAX);
        let threshold = threshold.clamp(0.0, 1.0);

        let rows = self
            .rows
            .read()
            .map_err(|e| VectorStoreError::Unavailable(e.to_string()))?;

        let mut scored: Vec<ScoredDocument> = rows
            .values()
            .map(|doc| ScoredDocument {
                score: cosine_similarity(&doc.embedding, query),
                document: doc.clone(),
            })
            .filter(|s| threshold == 0.0 || s.score > threshold)
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document.id.cmp(&b.document.id))
        });
        scored.truncate(k);

        Ok(scored)
    }
}
