//! Persistent conversation history: users own sessions, sessions own an
//! append-only list of messages.
//!
//! Ownership is enforced at every read: a session accessed by a user who
//! does not own it behaves exactly like a session that does not exist, so
//! existence never leaks across users.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

use crate::wealthcoach::error::CoreError;

/// Optional per-user record consumed only to personalize the system prompt.
/// Mutated by out-of-scope flows; the chat core treats it as read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub name: Option<String>,
    pub preferences: Option<String>,
    pub risk_tolerance: Option<String>,
}

/// A conversation container owned by exactly one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An append-only message record. The message list of a session is the
/// ground truth of the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub tokens_used: Option<i64>,
    pub cost: Option<f64>,
    pub sources_count: i64,
    pub cached: bool,
}

/// Metadata attached to an appended message.
#[derive(Debug, Clone, Default)]
pub struct MessageMeta {
    pub tokens_used: Option<i64>,
    pub cost: Option<f64>,
    pub sources_count: i64,
    pub cached: bool,
}

/// One row of the session listing: the session plus a preview derived from
/// its first user message and the total message count.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session: ChatSession,
    pub preview: Option<String>,
    pub message_count: i64,
}

/// Persistent mapping of user → sessions → ordered messages.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Resolve or create a session for `user_id`.
    ///
    /// A provided id that exists and is owned by the user is returned as-is;
    /// one that exists under another user fails with `NotFound` (never
    /// revealing existence); an unknown id is claimed as a new session with
    /// that id; no id creates a fresh session.
    async fn find_or_create_session(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<String, CoreError>;

    /// Append a message, atomically bumping the session's last-activity
    /// timestamp. Returns the new message id.
    async fn append_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        meta: MessageMeta,
    ) -> Result<String, CoreError>;

    /// Sessions of `user_id` ordered by last activity descending, each with
    /// preview and message count, computed in a single aggregated query.
    async fn list_sessions(
        &self,
        user_id: &str,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<SessionSummary>, CoreError>;

    /// Messages of an owned session, oldest first. Foreign sessions yield
    /// `NotFound`.
    async fn list_messages(
        &self,
        session_id: &str,
        user_id: &str,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, CoreError>;

    /// The last `n` messages of an owned session, oldest first. An unknown
    /// session yields an empty list; a foreign one yields `NotFound`.
    async fn recent_messages(
        &self,
        session_id: &str,
        user_id: &str,
        n: usize,
    ) -> Result<Vec<ChatMessage>, CoreError>;

    async fn load_profile(&self, user_id: &str) -> Result<Option<UserProfile>, CoreError>;

    /// Profile writes belong to out-of-scope flows; exposed for seeding and
    /// tests.
    async fn upsert_profile(&self, profile: &UserProfile) -> Result<(), CoreError>;
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        title TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_sessions_user_updated
        ON sessions(user_id, updated_at DESC)",
    "CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        tokens_used INTEGER,
        cost REAL,
        sources_count INTEGER NOT NULL DEFAULT 0,
        cached INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_session_created
        ON messages(session_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_messages_session_role
        ON messages(session_id, role)",
    "CREATE TABLE IF NOT EXISTS profiles (
        user_id TEXT PRIMARY KEY,
        name TEXT,
        preferences TEXT,
        risk_tolerance TEXT
    )",
];

/// Conversation store over a SQLite pool. Message rows carry millisecond
/// timestamps; insertion order (rowid) breaks timestamp ties so concurrent
/// appends are never reordered ambiguously.
pub struct SqliteConversationStore {
    pool: SqlitePool,
}

type MessageRow = (
    String,
    String,
    String,
    String,
    i64,
    Option<i64>,
    Option<f64>,
    i64,
    i64,
);

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn row_to_message(row: MessageRow) -> ChatMessage {
    let (id, session_id, role, content, created_at, tokens_used, cost, sources_count, cached) =
        row;
    ChatMessage {
        id,
        session_id,
        role,
        content,
        created_at: millis_to_datetime(created_at),
        tokens_used,
        cost,
        sources_count,
        cached: cached != 0,
    }
}

fn db_err(e: sqlx::Error) -> CoreError {
    CoreError::Transient(format!("conversation store error: {}", e))
}

impl SqliteConversationStore {
    /// Connect and create the schema when missing. In-memory databases are
    /// pinned to a single pooled connection so every caller sees the same
    /// database.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(db_err)?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await.map_err(db_err)?;
        }
        Ok(Self { pool })
    }

    async fn session_owner(&self, session_id: &str) -> Result<Option<String>, CoreError> {
        let owner: Option<(String,)> =
            sqlx::query_as("SELECT user_id FROM sessions WHERE id = ?1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(owner.map(|(user_id,)| user_id))
    }

    async fn create_session(&self, user_id: &str, session_id: &str) -> Result<(), CoreError> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT OR IGNORE INTO sessions (id, user_id, title, created_at, updated_at)
             VALUES (?1, ?2, NULL, ?3, ?3)",
        )
        .bind(session_id)
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn find_or_create_session(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<String, CoreError> {
        match session_id {
            Some(id) => match self.session_owner(id).await? {
                Some(owner) if owner == user_id => Ok(id.to_string()),
                Some(_) => Err(CoreError::NotFound),
                None => {
                    self.create_session(user_id, id).await?;
                    // A concurrent claim of the same id may have won the
                    // insert; re-check ownership rather than trusting it.
                    match self.session_owner(id).await? {
                        Some(owner) if owner == user_id => Ok(id.to_string()),
                        _ => Err(CoreError::NotFound),
                    }
                }
            },
            None => {
                let id = Uuid::new_v4().to_string();
                self.create_session(user_id, &id).await?;
                Ok(id)
            }
        }
    }

    async fn append_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        meta: MessageMeta,
    ) -> Result<String, CoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        let title: Option<String> = if role == "user" {
            Some(content.chars().take(60).collect())
        } else {
            None
        };

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            "INSERT INTO messages
                (id, session_id, role, content, created_at, tokens_used, cost, sources_count, cached)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&id)
        .bind(session_id)
        .bind(role)
        .bind(content)
        .bind(now)
        .bind(meta.tokens_used)
        .bind(meta.cost)
        .bind(meta.sources_count)
        .bind(if meta.cached { 1i64 } else { 0i64 })
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "UPDATE sessions SET updated_at = ?1, title = COALESCE(title, ?2) WHERE id = ?3",
        )
        .bind(now)
        .bind(&title)
        .bind(session_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(id)
    }

    async fn list_sessions(
        &self,
        user_id: &str,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<SessionSummary>, CoreError> {
        // Single aggregated statement: preview and count come from
        // correlated subqueries, never from per-session follow-ups.
        let rows: Vec<(String, String, Option<String>, i64, i64, Option<String>, i64)> =
            sqlx::query_as(
                "SELECT s.id, s.user_id, s.title, s.created_at, s.updated_at,
                        (SELECT m.content FROM messages m
                          WHERE m.session_id = s.id AND m.role = 'user'
                          ORDER BY m.created_at ASC, m.rowid ASC LIMIT 1) AS preview,
                        (SELECT COUNT(*) FROM messages m
                          WHERE m.session_id = s.id) AS message_count
                 FROM sessions s
                 WHERE s.user_id = ?1
                 ORDER BY s.updated_at DESC
                 LIMIT ?2 OFFSET ?3",
            )
            .bind(user_id)
            .bind(limit.max(0))
            .bind(skip.max(0))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(
                |(id, user_id, title, created_at, updated_at, preview, message_count)| {
                    SessionSummary {
                        session: ChatSession {
                            id,
                            user_id,
                            title,
                            created_at: millis_to_datetime(created_at),
                            updated_at: millis_to_datetime(updated_at),
                        },
                        preview: preview.map(|p| p.chars().take(120).collect()),
                        message_count,
                    }
                },
            )
            .collect())
    }

    async fn list_messages(
        &self,
        session_id: &str,
        user_id: &str,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, CoreError> {
        match self.session_owner(session_id).await? {
            Some(owner) if owner == user_id => {}
            _ => return Err(CoreError::NotFound),
        }

        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, session_id, role, content, created_at,
                    tokens_used, cost, sources_count, cached
             FROM messages
             WHERE session_id = ?1
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?2 OFFSET ?3",
        )
        .bind(session_id)
        .bind(limit.max(0))
        .bind(skip.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(row_to_message).collect())
    }

    async fn recent_messages(
        &self,
        session_id: &str,
        user_id: &str,
        n: usize,
    ) -> Result<Vec<ChatMessage>, CoreError> {
        match self.session_owner(session_id).await? {
            Some(owner) if owner == user_id => {}
            Some(_) => return Err(CoreError::NotFound),
            None => return Ok(Vec::new()),
        }

        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, session_id, role, content, created_at,
                    tokens_used, cost, sources_count, cached
             FROM (SELECT * FROM messages
                    WHERE session_id = ?1
                    ORDER BY created_at DESC, rowid DESC
                    LIMIT ?2)
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(session_id)
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(row_to_message).collect())
    }

    async fn load_profile(&self, user_id: &str) -> Result<Option<UserProfile>, CoreError> {
        let row: Option<(String, Option<String>, Option<String>, Option<String>)> =
            sqlx::query_as(
                "SELECT user_id, name, preferences, risk_tolerance
                 FROM profiles WHERE user_id = ?1",
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(|(user_id, name, preferences, risk_tolerance)| UserProfile {
            user_id,
            name,
            preferences,
            risk_tolerance,
        }))
    }

    async fn upsert_profile(&self, profile: &UserProfile) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO profiles (user_id, name, preferences, risk_tolerance)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                name = excluded.name,
                preferences = excluded.preferences,
                risk_tolerance = excluded.risk_tolerance",
        )
        .bind(&profile.user_id)
        .bind(&profile.name)
        .bind(&profile.preferences)
        .bind(&profile.risk_tolerance)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteConversationStore {
        SqliteConversationStore::connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn session_creation_and_reuse() {
        let store = store().await;
        let id = store.find_or_create_session("u1", None).await.unwrap();
        let same = store
            .find_or_create_session("u1", Some(&id))
            .await
            .unwrap();
        assert_eq!(id, same);
    }

    #[tokio::test]
    async fn foreign_session_is_not_found() {
        let store = store().await;
        let id = store.find_or_create_session("u1", None).await.unwrap();

        let err = store
            .find_or_create_session("u2", Some(&id))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound));

        let err = store.list_messages(&id, "u2", 0, 50).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound));

        let err = store.recent_messages(&id, "u2", 10).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound));
    }

    #[tokio::test]
    async fn unknown_session_id_is_claimed() {
        let store = store().await;
        let id = store
            .find_or_create_session("u1", Some("client-chosen-id"))
            .await
            .unwrap();
        assert_eq!(id, "client-chosen-id");
    }

    #[tokio::test]
    async fn messages_keep_insertion_order() {
        let store = store().await;
        let session = store.find_or_create_session("u1", None).await.unwrap();

        store
            .append_message(&session, "user", "question", MessageMeta::default())
            .await
            .unwrap();
        store
            .append_message(
                &session,
                "assistant",
                "answer",
                MessageMeta {
                    sources_count: 1,
                    ..MessageMeta::default()
                },
            )
            .await
            .unwrap();

        let messages = store.list_messages(&session, "u1", 0, 50).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].sources_count, 1);
        assert!(messages[0].created_at <= messages[1].created_at);
    }

    #[tokio::test]
    async fn list_sessions_carries_preview_and_count() {
        let store = store().await;
        let s1 = store.find_or_create_session("u1", None).await.unwrap();
        store
            .append_message(&s1, "user", "first question", MessageMeta::default())
            .await
            .unwrap();
        store
            .append_message(&s1, "assistant", "first answer", MessageMeta::default())
            .await
            .unwrap();

        let s2 = store.find_or_create_session("u1", None).await.unwrap();
        store
            .append_message(&s2, "user", "newer question", MessageMeta::default())
            .await
            .unwrap();

        let summaries = store.list_sessions("u1", 0, 20).await.unwrap();
        assert_eq!(summaries.len(), 2);
        // Most recent activity first.
        assert_eq!(summaries[0].session.id, s2);
        assert_eq!(summaries[0].preview.as_deref(), Some("newer question"));
        assert_eq!(summaries[0].message_count, 1);
        assert_eq!(summaries[1].preview.as_deref(), Some("first question"));
        assert_eq!(summaries[1].message_count, 2);
        // Title defaults to the first user message.
        assert_eq!(summaries[1].session.title.as_deref(), Some("first question"));
    }

    #[tokio::test]
    async fn append_updates_last_activity() {
        let store = store().await;
        let session = store.find_or_create_session("u1", None).await.unwrap();
        let before = store.list_sessions("u1", 0, 1).await.unwrap()[0]
            .session
            .updated_at;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .append_message(&session, "user", "bump", MessageMeta::default())
            .await
            .unwrap();

        let after = store.list_sessions("u1", 0, 1).await.unwrap()[0]
            .session
            .updated_at;
        assert!(after > before);
    }

    #[tokio::test]
    async fn recent_messages_windows_oldest_first() {
        let store = store().await;
        let session = store.find_or_create_session("u1", None).await.unwrap();
        for i in 0..15 {
            store
                .append_message(&session, "user", &format!("m{}", i), MessageMeta::default())
                .await
                .unwrap();
        }

        let recent = store.recent_messages(&session, "u1", 10).await.unwrap();
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].content, "m5");
        assert_eq!(recent[9].content, "m14");

        let empty = store.recent_messages("no-such", "u1", 10).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn file_backed_store_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("conversations.db").display()
        );

        let session = {
            let store = SqliteConversationStore::connect(&url).await.unwrap();
            let session = store.find_or_create_session("u1", None).await.unwrap();
            store
                .append_message(&session, "user", "persisted?", MessageMeta::default())
                .await
                .unwrap();
            session
        };

        let reopened = SqliteConversationStore::connect(&url).await.unwrap();
        let messages = reopened.list_messages(&session, "u1", 0, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "persisted?");
    }

    #[tokio::test]
    async fn profile_round_trip() {
        let store = store().await;
        assert!(store.load_profile("u1").await.unwrap().is_none());

        store
            .upsert_profile(&UserProfile {
                user_id: "u1".to_string(),
                name: Some("Priya".to_string()),
                preferences: None,
                risk_tolerance: Some("moderate".to_string()),
            })
            .await
            .unwrap();

        let profile = store.load_profile("u1").await.unwrap().unwrap();
        assert_eq!(profile.name.as_deref(), Some("Priya"));
        assert_eq!(profile.risk_tolerance.as_deref(), Some("moderate"));
    }
}
