//! Chat turn orchestration.
//!
//! One turn runs as: validate → concurrent profile/history/RAG prefetch
//! under a deadline → prompt assembly → response-cache replay or LLM stream
//! → deferred persistence. The service owns nothing durable; it coordinates
//! the cache, the conversation store, the retriever, and the LLM client.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use crate::wealthcoach::background::{AssistantRecord, BackgroundWriter, TurnRecord};
use crate::wealthcoach::cache::{keys, CacheClient};
use crate::wealthcoach::client_wrapper::{CompletionOpts, LlmClient, Message, TokenUsage};
use crate::wealthcoach::config::Settings;
use crate::wealthcoach::conversation::{ChatMessage, ConversationStore, UserProfile};
use crate::wealthcoach::error::CoreError;
use crate::wealthcoach::prompt;
use crate::wealthcoach::retriever::{RetrievalResult, Retriever};

use futures_util::StreamExt;

/// A user turn as submitted over HTTP or the streaming endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "default_true")]
    pub use_rag: bool,
    #[serde(default = "default_true")]
    pub use_history: bool,
}

fn default_true() -> bool {
    true
}

/// Events of one streamed turn, in emission order: `Session` first, then
/// zero or more `Delta`s, then exactly one `Done` or `Error`.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Session {
        session_id: String,
    },
    Delta {
        content: String,
    },
    Done {
        /// Final delta, folded into the terminal frame so a turn with N
        /// deltas costs exactly N response frames on the wire.
        content: String,
        /// Full concatenated response text.
        response: String,
        sources: Vec<String>,
        cached: bool,
        usage: Option<TokenUsage>,
        degraded: bool,
    },
    Error {
        message: String,
    },
}

/// Response of the synchronous HTTP variant.
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub response: String,
    pub sources: Vec<String>,
    pub cached: bool,
    pub usage: Option<TokenUsage>,
    pub degraded: bool,
}

/// Consumer side of one streamed turn. Dropping the handle cancels the
/// in-flight generation; the upstream producer notices at its next delta.
#[derive(Debug)]
pub struct StreamingHandle {
    pub session_id: String,
    rx: mpsc::Receiver<ChatEvent>,
}

impl StreamingHandle {
    pub async fn next_event(&mut self) -> Option<ChatEvent> {
        self.rx.recv().await
    }
}

#[derive(Serialize, Deserialize)]
struct HistorySnapshot {
    user_id: String,
    messages: Vec<ChatMessage>,
}

struct PreparedTurn {
    messages: Vec<Message>,
    sources: Vec<String>,
    cache_key: String,
    degraded: bool,
}

#[derive(Clone)]
pub struct ChatService {
    settings: Arc<Settings>,
    cache: Arc<dyn CacheClient>,
    store: Arc<dyn ConversationStore>,
    retriever: Arc<Retriever>,
    llm: Arc<dyn LlmClient>,
    writer: BackgroundWriter,
}

impl ChatService {
    pub fn new(
        settings: Arc<Settings>,
        cache: Arc<dyn CacheClient>,
        store: Arc<dyn ConversationStore>,
        retriever: Arc<Retriever>,
        llm: Arc<dyn LlmClient>,
        writer: BackgroundWriter,
    ) -> Self {
        Self {
            settings,
            cache,
            store,
            retriever,
            llm,
            writer,
        }
    }

    fn validate(&self, message: &str) -> Result<(), CoreError> {
        if message.trim().is_empty() {
            return Err(CoreError::Input("message must not be empty".to_string()));
        }
        let chars = message.chars().count();
        if chars > self.settings.message_max_chars {
            return Err(CoreError::Input(format!(
                "message is {} characters, limit is {}",
                chars, self.settings.message_max_chars
            )));
        }
        Ok(())
    }

    /// Start a streamed turn. Validation failures surface immediately and
    /// touch no dependency; everything else happens on a spawned task that
    /// feeds the returned handle.
    pub fn send_message(
        &self,
        user_id: &str,
        request: ChatRequest,
        profile_hint: Option<UserProfile>,
    ) -> Result<StreamingHandle, CoreError> {
        self.validate(&request.message)?;

        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let (tx, rx) = mpsc::channel(32);
        let service = self.clone();
        let user_id = user_id.to_string();
        let task_session = session_id.clone();
        tokio::spawn(async move {
            service
                .run_turn(user_id, request, task_session, profile_hint, tx)
                .await;
        });

        Ok(StreamingHandle { session_id, rx })
    }

    /// Synchronous variant: same pipeline, single response. The response
    /// cache is consulted and filled by the LLM client on this path.
    pub async fn sync_message(
        &self,
        user_id: &str,
        request: ChatRequest,
    ) -> Result<ChatResponse, CoreError> {
        self.validate(&request.message)?;

        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let prepared = self
            .prepare(user_id, &request, &session_id, None)
            .await?;

        let opts = CompletionOpts {
            cache_key: Some(prepared.cache_key.clone()),
        };
        let completion = self
            .llm
            .complete(&prepared.messages, &opts)
            .await
            .map_err(CoreError::from)?;

        self.writer
            .submit(TurnRecord {
                user_id: user_id.to_string(),
                session_id: session_id.clone(),
                user_message: request.message.clone(),
                assistant: Some(AssistantRecord {
                    content: completion.content.clone(),
                    sources_count: prepared.sources.len() as i64,
                    cached: completion.cached,
                    tokens_used: completion
                        .usage
                        .as_ref()
                        .map(|u| u.total_tokens as i64),
                }),
                cache_entry: None,
            })
            .await;

        Ok(ChatResponse {
            session_id,
            response: completion.content,
            sources: prepared.sources,
            cached: completion.cached,
            usage: completion.usage,
            degraded: prepared.degraded,
        })
    }

    async fn run_turn(
        &self,
        user_id: String,
        request: ChatRequest,
        session_id: String,
        profile_hint: Option<UserProfile>,
        tx: mpsc::Sender<ChatEvent>,
    ) {
        // The session id goes out before any prefetch so clients can render
        // the conversation shell while the pipeline warms up.
        if tx
            .send(ChatEvent::Session {
                session_id: session_id.clone(),
            })
            .await
            .is_err()
        {
            return;
        }

        let prepared = match self
            .prepare(&user_id, &request, &session_id, profile_hint)
            .await
        {
            Ok(prepared) => prepared,
            Err(e) => {
                log::error!("turn preparation failed for {}: {}", user_id, e);
                let _ = tx
                    .send(ChatEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        // Replay a completed response when the fingerprint matches. The
        // model is never invoked, but the turn is still recorded.
        if let Some(bytes) = self.cache.get(&prepared.cache_key).await {
            if let Ok(text) = String::from_utf8(bytes) {
                let _ = tx
                    .send(ChatEvent::Done {
                        content: text.clone(),
                        response: text.clone(),
                        sources: prepared.sources.clone(),
                        cached: true,
                        usage: None,
                        degraded: prepared.degraded,
                    })
                    .await;
                self.persist(
                    &user_id,
                    &session_id,
                    &request.message,
                    Some(AssistantRecord {
                        content: text,
                        sources_count: prepared.sources.len() as i64,
                        cached: true,
                        tokens_used: None,
                    }),
                    None,
                )
                .await;
                return;
            }
        }

        let mut stream = match self.llm.complete_stream(&prepared.messages).await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("llm stream failed to start for {}: {}", user_id, e);
                let _ = tx
                    .send(ChatEvent::Error {
                        message: CoreError::from(e).to_string(),
                    })
                    .await;
                self.persist(&user_id, &session_id, &request.message, None, None)
                    .await;
                return;
            }
        };

        let mut full = String::new();
        let mut pending: Option<String> = None;
        let mut canceled = false;
        let mut failed = false;

        loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    if !chunk.content.is_empty() {
                        full.push_str(&chunk.content);
                        if let Some(prev) = pending.replace(chunk.content) {
                            if tx.send(ChatEvent::Delta { content: prev }).await.is_err() {
                                canceled = true;
                                break;
                            }
                        }
                    }
                    if chunk.finish_reason.is_some() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    log::error!("llm stream error mid-turn for {}: {}", user_id, e);
                    let _ = tx
                        .send(ChatEvent::Error {
                            message: CoreError::from(e).to_string(),
                        })
                        .await;
                    failed = true;
                    break;
                }
                None => break,
            }
        }
        // Dropping the stream here tears down the upstream request, which
        // bounds cancellation latency to one chunk interval.
        drop(stream);

        if canceled || failed {
            // Partial output is neither cached nor persisted; the user's
            // message is.
            self.persist(&user_id, &session_id, &request.message, None, None)
                .await;
            return;
        }

        let _ = tx
            .send(ChatEvent::Done {
                content: pending.unwrap_or_default(),
                response: full.clone(),
                sources: prepared.sources.clone(),
                cached: false,
                usage: None,
                degraded: prepared.degraded,
            })
            .await;

        self.persist(
            &user_id,
            &session_id,
            &request.message,
            Some(AssistantRecord {
                content: full.clone(),
                sources_count: prepared.sources.len() as i64,
                cached: false,
                tokens_used: None,
            }),
            Some((
                prepared.cache_key,
                full,
                std::time::Duration::from_secs(self.settings.response_cache_ttl_secs),
            )),
        )
        .await;
    }

    async fn persist(
        &self,
        user_id: &str,
        session_id: &str,
        user_message: &str,
        assistant: Option<AssistantRecord>,
        cache_entry: Option<(String, String, std::time::Duration)>,
    ) {
        self.writer
            .submit(TurnRecord {
                user_id: user_id.to_string(),
                session_id: session_id.to_string(),
                user_message: user_message.to_string(),
                assistant,
                cache_entry,
            })
            .await;
    }

    async fn prepare(
        &self,
        user_id: &str,
        request: &ChatRequest,
        session_id: &str,
        profile_hint: Option<UserProfile>,
    ) -> Result<PreparedTurn, CoreError> {
        let deadline = self.settings.prefetch_timeout();

        let profile_fut = async {
            if profile_hint.is_some() {
                return profile_hint;
            }
            match timeout(deadline, self.fetch_profile(user_id)).await {
                Ok(profile) => profile,
                Err(_) => {
                    log::warn!("profile prefetch timed out for {}", user_id);
                    None
                }
            }
        };

        let history_fut = async {
            if !request.use_history {
                return Vec::new();
            }
            match timeout(deadline, self.fetch_history(user_id, session_id)).await {
                Ok(history) => history,
                Err(_) => {
                    log::warn!("history prefetch timed out for session {}", session_id);
                    Vec::new()
                }
            }
        };

        let rag_fut = async {
            if !request.use_rag {
                return Ok(RetrievalResult::default());
            }
            match timeout(
                deadline,
                self.retriever.retrieve(
                    &request.message,
                    self.settings.rag_top_k,
                    self.settings.rag_threshold,
                ),
            )
            .await
            {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(e @ CoreError::Fatal(_))) => Err(e),
                Ok(Err(e)) => {
                    log::warn!("retrieval degraded for {}: {}", user_id, e);
                    Ok(RetrievalResult {
                        degraded: true,
                        ..RetrievalResult::default()
                    })
                }
                Err(_) => {
                    log::warn!("retrieval timed out for {}", user_id);
                    Ok(RetrievalResult {
                        degraded: true,
                        ..RetrievalResult::default()
                    })
                }
            }
        };

        let (profile, history, rag) = tokio::join!(profile_fut, history_fut, rag_fut);
        let rag = rag?;

        let history_pairs: Vec<(String, String)> = history
            .iter()
            .map(|m| (m.role.clone(), m.content.clone()))
            .collect();
        let fingerprint = keys::context_fingerprint(&history_pairs, &rag.document_ids());
        let cache_key = keys::response_key(&request.message, &fingerprint);

        let messages = prompt::assemble(
            profile.as_ref(),
            &rag.documents,
            &history,
            &request.message,
            self.settings.token_budget_in,
        );

        Ok(PreparedTurn {
            messages,
            sources: rag.sources,
            cache_key,
            degraded: rag.degraded,
        })
    }

    async fn fetch_profile(&self, user_id: &str) -> Option<UserProfile> {
        let key = keys::profile_key(user_id);
        if let Some(bytes) = self.cache.get(&key).await {
            if let Ok(profile) = serde_json::from_slice::<UserProfile>(&bytes) {
                return Some(profile);
            }
        }

        match self.store.load_profile(user_id).await {
            Ok(Some(profile)) => {
                if let Ok(bytes) = serde_json::to_vec(&profile) {
                    self.cache
                        .set(
                            &key,
                            &bytes,
                            std::time::Duration::from_secs(
                                self.settings.profile_cache_ttl_secs,
                            ),
                        )
                        .await;
                }
                Some(profile)
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("profile load degraded for {}: {}", user_id, e);
                None
            }
        }
    }

    async fn fetch_history(&self, user_id: &str, session_id: &str) -> Vec<ChatMessage> {
        let key = keys::history_key(session_id);
        if let Some(bytes) = self.cache.get(&key).await {
            if let Ok(snapshot) = serde_json::from_slice::<HistorySnapshot>(&bytes) {
                // The key is session-scoped; the embedded owner check keeps a
                // guessed session id from replaying someone else's history.
                if snapshot.user_id == user_id {
                    return snapshot.messages;
                }
                log::warn!(
                    "history snapshot owner mismatch for session {}",
                    session_id
                );
            }
        }

        match self
            .store
            .recent_messages(session_id, user_id, self.settings.history_n)
            .await
        {
            Ok(messages) => {
                if !messages.is_empty() {
                    let snapshot = HistorySnapshot {
                        user_id: user_id.to_string(),
                        messages: messages.clone(),
                    };
                    if let Ok(bytes) = serde_json::to_vec(&snapshot) {
                        self.cache
                            .set(
                                &key,
                                &bytes,
                                std::time::Duration::from_secs(
                                    self.settings.history_cache_ttl_secs,
                                ),
                            )
                            .await;
                    }
                }
                messages
            }
            Err(e) => {
                log::warn!(
                    "history load degraded for session {}: {}",
                    session_id,
                    e
                );
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wealthcoach::cache::MemoryCache;
    use crate::wealthcoach::clients::mock::ScriptedLlmClient;
    use crate::wealthcoach::conversation::SqliteConversationStore;
    use crate::wealthcoach::embedding::LocalEmbedder;
    use crate::wealthcoach::vector_store::InMemoryVectorStore;
    use std::time::Duration;

    async fn service_with(llm: Arc<ScriptedLlmClient>) -> ChatService {
        let settings = Settings::default().into_shared();
        let cache: Arc<MemoryCache> = Arc::new(MemoryCache::new());
        let store: Arc<dyn ConversationStore> = Arc::new(
            SqliteConversationStore::connect("sqlite::memory:")
                .await
                .unwrap(),
        );
        let embedder = Arc::new(LocalEmbedder::new(settings.embedding_dim));
        let vectors = Arc::new(InMemoryVectorStore::new(settings.embedding_dim));
        let retriever = Arc::new(Retriever::new(
            embedder,
            vectors,
            cache.clone(),
            settings.rag_max_ctx_chars,
            Duration::from_secs(settings.embedding_cache_ttl_secs),
        ));
        let (writer, _handle) = BackgroundWriter::spawn(store.clone(), cache.clone(), 64);
        ChatService::new(settings, cache, store, retriever, llm, writer)
    }

    fn request(message: &str) -> ChatRequest {
        ChatRequest {
            message: message.to_string(),
            session_id: None,
            use_rag: false,
            use_history: false,
        }
    }

    #[tokio::test]
    async fn empty_message_fails_without_touching_dependencies() {
        let llm = Arc::new(ScriptedLlmClient::new(vec!["never"]));
        let service = service_with(llm.clone()).await;

        let err = service
            .send_message("u1", request("   "), None)
            .unwrap_err();
        assert!(matches!(err, CoreError::Input(_)));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn oversize_message_is_rejected() {
        let llm = Arc::new(ScriptedLlmClient::new(vec!["never"]));
        let service = service_with(llm).await;
        let long = "x".repeat(2001);
        assert!(service.send_message("u1", request(&long), None).is_err());
    }

    #[tokio::test]
    async fn turn_emits_session_deltas_then_done() {
        let llm = Arc::new(ScriptedLlmClient::new(vec!["A ", "401k ", "account."]));
        let service = service_with(llm).await;

        let mut handle = service
            .send_message("u1", request("What is a 401k?"), None)
            .unwrap();

        match handle.next_event().await.unwrap() {
            ChatEvent::Session { session_id } => assert_eq!(session_id, handle.session_id),
            other => panic!("expected session event, got {:?}", other),
        }

        let mut assembled = String::new();
        let mut frames = 0;
        loop {
            match handle.next_event().await.unwrap() {
                ChatEvent::Delta { content } => {
                    frames += 1;
                    assembled.push_str(&content);
                }
                ChatEvent::Done {
                    content,
                    response,
                    cached,
                    ..
                } => {
                    frames += 1;
                    assembled.push_str(&content);
                    assert!(!cached);
                    assert_eq!(response, "A 401k account.");
                    break;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        // Three deltas cost exactly three frames; the last carries done.
        assert_eq!(frames, 3);
        assert_eq!(assembled, "A 401k account.");
    }

    #[tokio::test]
    async fn second_identical_turn_is_served_from_cache() {
        let llm = Arc::new(ScriptedLlmClient::new(vec!["Answer."]));
        let service = service_with(llm.clone()).await;

        let mut first = service
            .send_message("u1", request("What is an ETF?"), None)
            .unwrap();
        let mut done_seen = false;
        while let Some(event) = first.next_event().await {
            if let ChatEvent::Done { cached, .. } = event {
                assert!(!cached);
                done_seen = true;
            }
        }
        assert!(done_seen);
        assert_eq!(llm.call_count(), 1);

        // The cache write is deferred; give the background writer a moment.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut second = service
            .send_message("u1", request("what   is an ETF??"), None)
            .unwrap();
        let mut replayed = false;
        while let Some(event) = second.next_event().await {
            if let ChatEvent::Done {
                cached, response, ..
            } = event
            {
                assert!(cached);
                assert_eq!(response, "Answer.");
                replayed = true;
            }
        }
        assert!(replayed);
        assert_eq!(llm.call_count(), 1, "cached replay must not invoke the model");
    }

    #[tokio::test]
    async fn llm_failure_surfaces_error_event() {
        let llm = Arc::new(ScriptedLlmClient::unavailable());
        let service = service_with(llm).await;

        let mut handle = service
            .send_message("u1", request("hello"), None)
            .unwrap();
        let mut saw_error = false;
        while let Some(event) = handle.next_event().await {
            if let ChatEvent::Error { .. } = event {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn sync_variant_returns_full_response() {
        let llm = Arc::new(ScriptedLlmClient::new(vec!["Spread ", "your risk."]));
        let service = service_with(llm).await;

        let response = service
            .sync_message("u1", request("Why diversify?"))
            .await
            .unwrap();
        assert_eq!(response.response, "Spread your risk.");
        assert!(!response.cached);
        assert!(response.sources.is_empty());
    }
}
