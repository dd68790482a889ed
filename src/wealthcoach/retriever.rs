//! Retrieval-augmented grounding: turns a user question into top-k passages
//! plus source citations.
//!
//! The retriever checks the embedding cache before encoding the query, runs
//! the similarity search, and post-processes the rows into an ordered
//! document list bounded by a combined context budget. Store unavailability
//! degrades to an empty result; corrupt state is surfaced.

use std::sync::Arc;
use std::time::Duration;

use crate::wealthcoach::cache::{keys, CacheClient};
use crate::wealthcoach::embedding::Embedder;
use crate::wealthcoach::error::CoreError;
use crate::wealthcoach::vector_store::{ScoredDocument, VectorStore, VectorStoreError};

/// Transient result of one retrieval. Lives for the duration of a request.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    /// Retained passages, highest similarity first, truncated to the context
    /// budget.
    pub documents: Vec<ScoredDocument>,
    /// Distinct `metadata.source` strings of the retained passages, in
    /// result order, first occurrence kept.
    pub sources: Vec<String>,
    /// True when the store was unreachable and retrieval was skipped.
    pub degraded: bool,
}

impl RetrievalResult {
    /// Ids of the retained documents, in order. Feeds the response-cache
    /// fingerprint.
    pub fn document_ids(&self) -> Vec<String> {
        self.documents
            .iter()
            .map(|s| s.document.id.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Query-to-passages retriever over an [`Embedder`] and a [`VectorStore`].
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    cache: Arc<dyn CacheClient>,
    max_ctx_chars: usize,
    embedding_ttl: Duration,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        cache: Arc<dyn CacheClient>,
        max_ctx_chars: usize,
        embedding_ttl: Duration,
    ) -> Self {
        Self {
            embedder,
            store,
            cache,
            max_ctx_chars,
            embedding_ttl,
        }
    }

    /// Retrieve the top-k passages above `threshold` for `query`.
    ///
    /// Zero rows above threshold is an empty result, not an error.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        threshold: f32,
    ) -> Result<RetrievalResult, CoreError> {
        let query_vec = self.query_embedding(query).await?;

        let rows = match self.store.similarity_search(&query_vec, top_k, threshold).await {
            Ok(rows) => rows,
            Err(VectorStoreError::Unavailable(msg)) => {
                log::warn!("retrieval degraded, vector store unavailable: {}", msg);
                return Ok(RetrievalResult {
                    degraded: true,
                    ..RetrievalResult::default()
                });
            }
            Err(e) => return Err(e.into()),
        };

        Ok(self.assemble(rows))
    }

    async fn query_embedding(&self, query: &str) -> Result<Vec<f32>, CoreError> {
        let key = keys::embedding_key(query);
        if let Some(bytes) = self.cache.get(&key).await {
            if let Ok(vector) = serde_json::from_slice::<Vec<f32>>(&bytes) {
                if vector.len() == self.embedder.dimensions() {
                    return Ok(vector);
                }
                // Stale entry from a different schema; drop and re-embed.
                self.cache.delete(&key).await;
            }
        }

        let vector = self.embedder.embed(query).await.map_err(CoreError::from)?;
        if let Ok(bytes) = serde_json::to_vec(&vector) {
            self.cache.set(&key, &bytes, self.embedding_ttl).await;
        }
        Ok(vector)
    }

    /// Keep documents in similarity order until the next one would exceed
    /// the combined character budget; the truncated tail contributes no
    /// sources.
    fn assemble(&self, rows: Vec<ScoredDocument>) -> RetrievalResult {
        let mut documents = Vec::new();
        let mut sources = Vec::new();
        let mut used_chars = 0usize;

        for row in rows {
            let len = row.document.content.len();
            if !documents.is_empty() && used_chars + len > self.max_ctx_chars {
                break;
            }
            used_chars += len;
            if let Some(source) = row.document.source() {
                if !sources.iter().any(|s| s == source) {
                    sources.push(source.to_string());
                }
            }
            documents.push(row);
            if used_chars >= self.max_ctx_chars {
                break;
            }
        }

        RetrievalResult {
            documents,
            sources,
            degraded: false,
        }
    }
}
