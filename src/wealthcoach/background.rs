//! Deferred persistence for completed chat turns.
//!
//! Turn durability must never sit on the streaming critical path, so the
//! chat service hands finished turns to a bounded background writer. Jobs
//! for one turn are applied in order (session resolution, user message,
//! assistant message, cache write); failures are logged and never surfaced
//! to the client. The writer outlives the tasks that feed it and is drained
//! before process shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::wealthcoach::cache::CacheClient;
use crate::wealthcoach::conversation::{ConversationStore, MessageMeta};
use crate::wealthcoach::error::CoreError;

/// Assistant half of a finished turn.
#[derive(Debug, Clone)]
pub struct AssistantRecord {
    pub content: String,
    pub sources_count: i64,
    pub cached: bool,
    pub tokens_used: Option<i64>,
}

/// One completed (or canceled) turn to persist.
///
/// A canceled or failed turn carries no assistant record and no cache entry:
/// the user message is still kept, half-answers are not.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub user_id: String,
    pub session_id: String,
    pub user_message: String,
    pub assistant: Option<AssistantRecord>,
    /// `(key, value, ttl)` response-cache write, independent of the message
    /// appends.
    pub cache_entry: Option<(String, String, Duration)>,
}

/// Handle for submitting turns to the background writer.
#[derive(Clone)]
pub struct BackgroundWriter {
    tx: mpsc::Sender<TurnRecord>,
}

impl BackgroundWriter {
    /// Spawn the writer task. Returns the submission handle and the join
    /// handle the binary awaits during shutdown; the task exits once every
    /// submission handle is dropped and the queue is drained.
    pub fn spawn(
        store: Arc<dyn ConversationStore>,
        cache: Arc<dyn CacheClient>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<TurnRecord>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = persist_turn(store.as_ref(), cache.as_ref(), &record).await {
                    log::error!(
                        "background persistence failed for session {}: {}",
                        record.session_id,
                        e
                    );
                }
            }
            log::debug!("background writer drained");
        });
        (Self { tx }, handle)
    }

    /// Queue a turn for persistence. Waits for queue room rather than
    /// dropping durable writes; callers invoke this after the response has
    /// already been delivered.
    pub async fn submit(&self, record: TurnRecord) {
        if self.tx.send(record).await.is_err() {
            log::error!("background writer is gone, dropping turn record");
        }
    }
}

async fn persist_turn(
    store: &dyn ConversationStore,
    cache: &dyn CacheClient,
    record: &TurnRecord,
) -> Result<(), CoreError> {
    let session_id = match store
        .find_or_create_session(&record.user_id, Some(&record.session_id))
        .await
    {
        Ok(id) => id,
        // The id belongs to someone else; give the turn its own session
        // instead of leaking anything across users.
        Err(CoreError::NotFound) => store.find_or_create_session(&record.user_id, None).await?,
        Err(e) => return Err(e),
    };

    store
        .append_message(
            &session_id,
            "user",
            &record.user_message,
            MessageMeta::default(),
        )
        .await?;

    if let Some(assistant) = &record.assistant {
        store
            .append_message(
                &session_id,
                "assistant",
                &assistant.content,
                MessageMeta {
                    tokens_used: assistant.tokens_used,
                    cost: None,
                    sources_count: assistant.sources_count,
                    cached: assistant.cached,
                },
            )
            .await?;
    }

    if let Some((key, value, ttl)) = &record.cache_entry {
        cache.set(key, value.as_bytes(), *ttl).await;
    }

    Ok(())
}
