//! REST surface: synchronous chat, server-streamed chat, session browsing,
//! and health probes.
//!
//! Authentication is a bearer token in the `Authorization` header; the
//! WebSocket endpoint at `/ws/chat` instead authenticates in-band (see
//! [`crate::wealthcoach::ws`]).

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::json;

use crate::wealthcoach::auth::TokenVerifier;
use crate::wealthcoach::cache::CacheClient;
use crate::wealthcoach::chat_service::{ChatRequest, ChatService};
use crate::wealthcoach::client_wrapper::LlmClient;
use crate::wealthcoach::config::Settings;
use crate::wealthcoach::conversation::ConversationStore;
use crate::wealthcoach::error::CoreError;
use crate::wealthcoach::rate_limit::RateLimiter;
use crate::wealthcoach::vector_store::VectorStore;
use crate::wealthcoach::ws::{server_frame, ws_chat_handler, ConnectionRegistry};

/// Shared handles for every request. Request-scoped data (the user id, the
/// turn being served) is passed explicitly; these are the process-wide
/// dependencies only.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub chat: ChatService,
    pub store: Arc<dyn ConversationStore>,
    pub cache: Arc<dyn CacheClient>,
    pub vectors: Arc<dyn VectorStore>,
    pub llm: Arc<dyn LlmClient>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub rate_limiter: Arc<RateLimiter>,
    pub registry: Arc<ConnectionRegistry>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/chat/message", post(chat_message))
        .route("/chat/message/stream", post(chat_message_stream))
        .route("/chat/sessions", get(list_sessions))
        .route("/chat/sessions/{id}/messages", get(list_session_messages))
        .route("/ws/chat", get(ws_chat_handler))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Newtype so [`CoreError`] can travel through axum's response machinery.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({ "error": self.0.to_string() });
        if let CoreError::RateLimited { retry_after_secs } = &self.0 {
            body["retry_after_secs"] = json!(retry_after_secs);
        }
        (status, Json(body)).into_response()
    }
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let header_value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = header_value
        .strip_prefix("Bearer ")
        .ok_or(ApiError(CoreError::Auth))?;
    state.verifier.verify(token).await.map_err(ApiError)
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

async fn chat_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let user_id = authenticate(&state, &headers).await?;
    state.rate_limiter.check(&user_id).await?;

    let response = state.chat.sync_message(&user_id, request).await?;
    Ok(Json(response).into_response())
}

async fn chat_message_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let user_id = authenticate(&state, &headers).await?;
    state.rate_limiter.check(&user_id).await?;

    let mut handle = state.chat.send_message(&user_id, request, None)?;

    let stream = async_stream::stream! {
        while let Some(event) = handle.next_event().await {
            let frame = server_frame(event);
            let data = serde_json::to_string(&frame).unwrap_or_default();
            yield Ok(Event::default().data(data));
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    skip: i64,
    #[serde(default)]
    limit: Option<i64>,
}

impl Pagination {
    fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }
}

async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<Pagination>,
) -> Result<Response, ApiError> {
    let user_id = authenticate(&state, &headers).await?;
    let sessions = state
        .store
        .list_sessions(&user_id, page.skip.max(0), page.limit())
        .await?;
    Ok(Json(json!({ "sessions": sessions })).into_response())
}

async fn list_session_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(page): Query<Pagination>,
) -> Result<Response, ApiError> {
    let user_id = authenticate(&state, &headers).await?;
    let messages = state
        .store
        .list_messages(&session_id, &user_id, page.skip.max(0), page.limit())
        .await?;
    Ok(Json(json!({ "messages": messages })).into_response())
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Fast liveness probe. Touches neither the LLM nor the vector store.
async fn health() -> Response {
    Json(json!({ "status": "healthy" })).into_response()
}

/// Dependency reachability report. Never triggers a model load.
async fn health_detailed(State(state): State<AppState>) -> Response {
    let (cache_ok, vectors, llm) = tokio::join!(
        state.cache.ping(),
        state.vectors.count(),
        state.llm.ping(),
    );

    let vector_status = match vectors {
        Ok(count) => format!("ok ({} documents)", count),
        Err(e) => format!("unreachable: {}", e),
    };
    let llm_status = match llm {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("unreachable: {}", e),
    };
    let cache_status = if cache_ok { "ok" } else { "unreachable" };

    let healthy = cache_ok && vector_status.starts_with("ok") && llm_status == "ok";
    Json(json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "model": state.llm.model_name(),
        "dependencies": {
            "cache": cache_status,
            "vector_store": vector_status,
            "llm": llm_status,
        }
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_defaults_and_caps() {
        let page = Pagination {
            skip: 0,
            limit: None,
        };
        assert_eq!(page.limit(), 20);

        let page = Pagination {
            skip: 0,
            limit: Some(500),
        };
        assert_eq!(page.limit(), 100);

        let page = Pagination {
            skip: 0,
            limit: Some(0),
        };
        assert_eq!(page.limit(), 1);
    }

    #[test]
    fn rate_limit_error_carries_retry_hint() {
        let response = ApiError(CoreError::RateLimited {
            retry_after_secs: 17,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn not_found_maps_to_404() {
        let response = ApiError(CoreError::NotFound).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
