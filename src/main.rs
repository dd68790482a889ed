//! Server binary: wires the cache, conversation store, retriever, and LLM
//! client into the chat service and serves the HTTP/WebSocket surface.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use wealthcoach::auth::SharedSecretVerifier;
use wealthcoach::background::BackgroundWriter;
use wealthcoach::cache::{CacheClient, MemoryCache, RedisCache};
use wealthcoach::chat_service::ChatService;
use wealthcoach::client_wrapper::LlmClient;
use wealthcoach::clients::common::shared_http_client;
use wealthcoach::clients::openai::OpenAiClient;
use wealthcoach::config::Settings;
use wealthcoach::conversation::{ConversationStore, SqliteConversationStore};
use wealthcoach::embedding::{Embedder, HttpEmbedder, LocalEmbedder};
use wealthcoach::http_api::{router, AppState};
use wealthcoach::rate_limit::RateLimiter;
use wealthcoach::retriever::Retriever;
use wealthcoach::vector_store::{Document, InMemoryVectorStore, VectorStore};
use wealthcoach::ws::ConnectionRegistry;

/// One knowledge-base entry as read from `KNOWLEDGE_BASE_PATH`. Embeddings
/// are computed at load time; pre-embedded corpora arrive through the
/// external ingestion pipeline instead.
#[derive(Deserialize)]
struct KnowledgeEntry {
    id: String,
    content: String,
    source: String,
    #[serde(default)]
    category: Option<String>,
}

async fn seed_knowledge_base(
    path: &str,
    embedder: &dyn Embedder,
    store: &dyn VectorStore,
) -> Result<usize, Box<dyn std::error::Error>> {
    let raw = tokio::fs::read_to_string(path).await?;
    let entries: Vec<KnowledgeEntry> = serde_json::from_str(&raw)?;

    let texts: Vec<String> = entries.iter().map(|e| e.content.clone()).collect();
    let vectors = embedder.embed_batch(&texts).await?;

    let docs: Vec<Document> = entries
        .into_iter()
        .zip(vectors)
        .map(|(entry, embedding)| {
            let mut metadata = std::collections::HashMap::new();
            metadata.insert("source".to_string(), serde_json::json!(entry.source));
            if let Some(category) = entry.category {
                metadata.insert("category".to_string(), serde_json::json!(category));
            }
            Document {
                id: entry.id,
                content: entry.content,
                metadata,
                embedding,
            }
        })
        .collect();

    let count = docs.len();
    store.upsert(docs).await?;
    Ok(count)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    wealthcoach::init_logger();

    let settings = Settings::from_env()?.into_shared();
    if settings.auth_secret.is_empty() {
        log::warn!("AUTH_SECRET is empty; every token will be rejected");
    }

    let cache: Arc<dyn CacheClient> = match settings.redis_url.as_deref() {
        Some(url) => {
            let redis = RedisCache::connect(url, settings.cache_op_timeout()).await?;
            log::info!("cache: redis at {}", url);
            Arc::new(redis)
        }
        None => {
            log::info!("cache: in-process (set REDIS_URL for a shared cache)");
            Arc::new(MemoryCache::new())
        }
    };

    let store: Arc<dyn ConversationStore> =
        Arc::new(SqliteConversationStore::connect(&settings.database_url).await?);
    log::info!("conversation store: {}", settings.database_url);

    let embedder: Arc<dyn Embedder> = match settings.embedding_base_url.as_deref() {
        Some(base_url) => {
            log::info!("embeddings: {} ({})", base_url, settings.embedding_model);
            Arc::new(HttpEmbedder::new(
                shared_http_client().clone(),
                base_url,
                settings.llm_api_key.clone(),
                settings.embedding_model.clone(),
                settings.embedding_dim,
            ))
        }
        None => {
            log::info!(
                "embeddings: in-process model (dim={})",
                settings.embedding_dim
            );
            Arc::new(LocalEmbedder::new(settings.embedding_dim))
        }
    };
    let vectors: Arc<dyn VectorStore> =
        Arc::new(InMemoryVectorStore::new(settings.embedding_dim));

    if let Some(path) = settings.knowledge_base_path.as_deref() {
        let count = seed_knowledge_base(path, embedder.as_ref(), vectors.as_ref()).await?;
        log::info!("seeded {} knowledge-base documents from {}", count, path);
    }

    let retriever = Arc::new(Retriever::new(
        embedder,
        vectors.clone(),
        cache.clone(),
        settings.rag_max_ctx_chars,
        Duration::from_secs(settings.embedding_cache_ttl_secs),
    ));

    let llm: Arc<dyn LlmClient> = Arc::new(
        OpenAiClient::new(
            shared_http_client().clone(),
            settings.llm_base_url.clone(),
            settings.llm_api_key.clone(),
            settings.llm_model.clone(),
        )
        .with_response_cache(
            cache.clone(),
            Duration::from_secs(settings.response_cache_ttl_secs),
        ),
    );

    let (writer, writer_handle) = BackgroundWriter::spawn(store.clone(), cache.clone(), 256);

    let chat = ChatService::new(
        settings.clone(),
        cache.clone(),
        store.clone(),
        retriever,
        llm.clone(),
        writer,
    );

    let state = AppState {
        settings: settings.clone(),
        chat,
        store,
        cache: cache.clone(),
        vectors,
        llm,
        verifier: Arc::new(SharedSecretVerifier::new(settings.auth_secret.clone())),
        rate_limiter: Arc::new(RateLimiter::new(
            cache.clone(),
            settings.chat_limit_per_minute,
        )),
        registry: Arc::new(ConnectionRegistry::new(settings.max_conn_per_user)),
    };

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    log::info!(
        "wealthcoach listening on http://{} (model: {})",
        settings.bind_addr,
        settings.llm_model
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("shutdown signal received");
        })
        .await?;

    // The server owned the last submission handles through AppState; once it
    // returns, draining the queue is all that stands between us and exit.
    writer_handle.await?;
    log::info!("background writer drained, exiting");
    Ok(())
}
