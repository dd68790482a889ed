//! Bidirectional streaming endpoint at `/ws/chat`.
//!
//! The transport carries JSON frames tagged by `type`. A handle moves
//! through `INIT → AUTHENTICATED → ACTIVE → CLOSED`: the first frame must be
//! `authenticate` (anything else closes the transport), authentication must
//! arrive within the auth timeout, and once active each `message` frame runs
//! one chat cycle. Turns on a handle are serialized; a second `message`
//! queues until the current turn finishes. Heartbeats are answered
//! out-of-band at any point after authentication.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::{SecondsFormat, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::wealthcoach::chat_service::{ChatEvent, ChatRequest, StreamingHandle};
use crate::wealthcoach::conversation::UserProfile;
use crate::wealthcoach::http_api::AppState;

/// Close status sent when a pre-auth frame is not `authenticate`.
pub const CLOSE_AUTH_REQUIRED: u16 = 4401;
/// Close status for failed token verification.
pub const CLOSE_AUTH_FAILED: u16 = 4403;
/// Close status when the auth timer fires in `INIT`.
pub const CLOSE_AUTH_TIMEOUT: u16 = 4408;
/// Close status when the per-user handle cap is exceeded.
pub const CLOSE_TOO_MANY_CONNECTIONS: u16 = 4429;

/// Outgoing frame buffer; a consumer that falls this many frames behind has
/// its in-flight turn canceled rather than growing the buffer.
const OUT_BUFFER_FRAMES: usize = 64;

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Client → server frames. Unknown `type` tags fail deserialization and are
/// rejected rather than ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Authenticate {
        token: String,
    },
    Message {
        content: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    Ping,
}

/// Server → client frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected {
        message: String,
        timestamp: String,
    },
    SessionId {
        session_id: String,
        timestamp: String,
    },
    Response {
        content: String,
        done: bool,
        cached: bool,
        timestamp: String,
    },
    Error {
        message: String,
    },
    Pong,
}

fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Map a chat-cycle event onto the wire frame shared by the WebSocket and
/// SSE surfaces.
pub fn server_frame(event: ChatEvent) -> ServerFrame {
    match event {
        ChatEvent::Session { session_id } => ServerFrame::SessionId {
            session_id,
            timestamp: now_iso8601(),
        },
        ChatEvent::Delta { content } => ServerFrame::Response {
            content,
            done: false,
            cached: false,
            timestamp: now_iso8601(),
        },
        ChatEvent::Done {
            content, cached, ..
        } => ServerFrame::Response {
            content,
            done: true,
            cached,
            timestamp: now_iso8601(),
        },
        ChatEvent::Error { message } => ServerFrame::Error { message },
    }
}

// ---------------------------------------------------------------------------
// Connection registry
// ---------------------------------------------------------------------------

/// Process-wide count of live handles per user, capped at a configured
/// maximum. Guards are RAII: dropping one releases the slot.
pub struct ConnectionRegistry {
    max_per_user: usize,
    counts: Mutex<HashMap<String, usize>>,
}

impl ConnectionRegistry {
    pub fn new(max_per_user: usize) -> Self {
        Self {
            max_per_user,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Claim a slot for `user_id`, or `None` when the cap is reached.
    pub fn acquire(self: &Arc<Self>, user_id: &str) -> Option<ConnectionGuard> {
        let mut counts = self.counts.lock().ok()?;
        let count = counts.entry(user_id.to_string()).or_insert(0);
        if *count >= self.max_per_user {
            return None;
        }
        *count += 1;
        Some(ConnectionGuard {
            registry: self.clone(),
            user_id: user_id.to_string(),
        })
    }

    pub fn active(&self, user_id: &str) -> usize {
        self.counts
            .lock()
            .map(|counts| counts.get(user_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn release(&self, user_id: &str) {
        if let Ok(mut counts) = self.counts.lock() {
            if let Some(count) = counts.get_mut(user_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    counts.remove(user_id);
                }
            }
        }
    }
}

pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    user_id: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.release(&self.user_id);
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub async fn ws_chat_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

enum InitOutcome {
    Token(String),
    BadFrame,
    Gone,
}

async fn close_with(sink: &mut SplitSink<WebSocket, WsMessage>, code: u16, reason: &'static str) {
    let _ = sink
        .send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    // INIT: exactly one auth timer per handle; whatever arrives first (an
    // authenticate frame, a foreign frame, or the timer) decides the fate.
    let init = timeout(
        Duration::from_secs(state.settings.auth_timeout_secs),
        read_first_frame(&mut stream),
    )
    .await;

    let token = match init {
        Err(_) => {
            close_with(&mut sink, CLOSE_AUTH_TIMEOUT, "authentication timeout").await;
            return;
        }
        Ok(InitOutcome::Gone) => return,
        Ok(InitOutcome::BadFrame) => {
            close_with(&mut sink, CLOSE_AUTH_REQUIRED, "authenticate first").await;
            return;
        }
        Ok(InitOutcome::Token(token)) => token,
    };

    let user_id = match state.verifier.verify(&token).await {
        Ok(user_id) => user_id,
        Err(_) => {
            close_with(&mut sink, CLOSE_AUTH_FAILED, "authentication failed").await;
            return;
        }
    };

    let _guard = match state.registry.acquire(&user_id) {
        Some(guard) => guard,
        None => {
            close_with(&mut sink, CLOSE_TOO_MANY_CONNECTIONS, "too many connections").await;
            return;
        }
    };

    // The profile is loaded once and kept for the connection's lifetime; it
    // greets the user here and seeds every turn's personalization below.
    let profile: Option<UserProfile> = state.store.load_profile(&user_id).await.ok().flatten();
    let greeting = match profile.as_ref().and_then(|p| p.name.as_deref()) {
        Some(name) => format!("Connected. Welcome back, {}!", name),
        None => "Connected. Ask me anything about your finances.".to_string(),
    };

    log::info!("ws handle active for user {}", user_id);

    // Dedicated writer task: the coordinator below never blocks on the
    // socket directly, and the bounded channel is the back-pressure gauge.
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(OUT_BUFFER_FRAMES);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(_) => continue,
            };
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let _ = out_tx
        .send(ServerFrame::Connected {
            message: greeting,
            timestamp: now_iso8601(),
        })
        .await;

    run_active(&state, &user_id, profile, &mut stream, &out_tx).await;

    drop(out_tx);
    let _ = writer.await;
    log::info!("ws handle closed for user {}", user_id);
}

async fn read_first_frame(stream: &mut SplitStream<WebSocket>) -> InitOutcome {
    loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                return match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Ok(ClientFrame::Authenticate { token }) => InitOutcome::Token(token),
                    _ => InitOutcome::BadFrame,
                };
            }
            // Transport-level heartbeats are not application frames.
            Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
            Some(Ok(WsMessage::Close(_))) | None => return InitOutcome::Gone,
            Some(Ok(_)) => return InitOutcome::BadFrame,
            Some(Err(_)) => return InitOutcome::Gone,
        }
    }
}

enum Forward {
    Continue,
    Terminal,
    Canceled,
}

async fn run_active(
    state: &AppState,
    user_id: &str,
    profile: Option<UserProfile>,
    stream: &mut SplitStream<WebSocket>,
    out_tx: &mpsc::Sender<ServerFrame>,
) {
    let mut current: Option<StreamingHandle> = None;
    let mut queue: VecDeque<(String, Option<String>)> = VecDeque::new();

    loop {
        if current.is_none() {
            if let Some((content, session_id)) = queue.pop_front() {
                current = start_turn(state, user_id, profile.clone(), content, session_id, out_tx)
                    .await;
            }
        }

        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(text.as_str()) {
                            Ok(ClientFrame::Ping) => {
                                if out_tx.send(ServerFrame::Pong).await.is_err() {
                                    break;
                                }
                            }
                            Ok(ClientFrame::Authenticate { .. }) => {
                                let _ = out_tx
                                    .send(ServerFrame::Error {
                                        message: "already authenticated".to_string(),
                                    })
                                    .await;
                            }
                            Ok(ClientFrame::Message { content, session_id }) => {
                                if current.is_some() {
                                    queue.push_back((content, session_id));
                                } else {
                                    current = start_turn(
                                        state, user_id, profile.clone(), content, session_id,
                                        out_tx,
                                    )
                                    .await;
                                }
                            }
                            Err(e) => {
                                let _ = out_tx
                                    .send(ServerFrame::Error {
                                        message: format!("unsupported frame: {}", e),
                                    })
                                    .await;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {
                        let _ = out_tx
                            .send(ServerFrame::Error {
                                message: "unsupported frame".to_string(),
                            })
                            .await;
                    }
                }
            }
            event = next_turn_event(&mut current), if current.is_some() => {
                match event {
                    Some(event) => match forward_event(event, out_tx).await {
                        Forward::Continue => {}
                        Forward::Terminal => current = None,
                        Forward::Canceled => {
                            // Buffer overran: drop the turn, then tell the
                            // client once there is room again.
                            current = None;
                            let _ = out_tx
                                .send(ServerFrame::Error {
                                    message: "client too slow, response canceled".to_string(),
                                })
                                .await;
                        }
                    },
                    None => current = None,
                }
            }
        }
    }
    // Dropping an in-flight handle here cancels the upstream LLM stream.
}

async fn next_turn_event(current: &mut Option<StreamingHandle>) -> Option<ChatEvent> {
    match current.as_mut() {
        Some(handle) => handle.next_event().await,
        None => None,
    }
}

async fn start_turn(
    state: &AppState,
    user_id: &str,
    profile: Option<UserProfile>,
    content: String,
    session_id: Option<String>,
    out_tx: &mpsc::Sender<ServerFrame>,
) -> Option<StreamingHandle> {
    if let Err(e) = state.rate_limiter.check(user_id).await {
        let _ = out_tx
            .send(ServerFrame::Error {
                message: e.to_string(),
            })
            .await;
        return None;
    }

    let request = ChatRequest {
        message: content,
        session_id,
        use_rag: true,
        use_history: true,
    };
    match state.chat.send_message(user_id, request, profile) {
        Ok(handle) => Some(handle),
        Err(e) => {
            let _ = out_tx
                .send(ServerFrame::Error {
                    message: e.to_string(),
                })
                .await;
            None
        }
    }
}

async fn forward_event(event: ChatEvent, out_tx: &mpsc::Sender<ServerFrame>) -> Forward {
    let terminal = matches!(event, ChatEvent::Done { .. } | ChatEvent::Error { .. });
    let frame = server_frame(event);

    if terminal {
        if out_tx.send(frame).await.is_err() {
            return Forward::Canceled;
        }
        return Forward::Terminal;
    }

    // Deltas use try_send so a stalled consumer surfaces as back-pressure
    // instead of unbounded buffering.
    match out_tx.try_send(frame) {
        Ok(()) => Forward::Continue,
        Err(mpsc::error::TrySendError::Full(_)) => Forward::Canceled,
        Err(mpsc::error::TrySendError::Closed(_)) => Forward::Canceled,
    }
}
