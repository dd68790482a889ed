//! Live-socket tests of the bidirectional endpoint: handshake, lifecycle,
//! turn serialization, and rate limiting against a real listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use wealthcoach::auth::SharedSecretVerifier;
use wealthcoach::background::BackgroundWriter;
use wealthcoach::cache::MemoryCache;
use wealthcoach::chat_service::ChatService;
use wealthcoach::clients::mock::ScriptedLlmClient;
use wealthcoach::config::Settings;
use wealthcoach::conversation::{ConversationStore, SqliteConversationStore, UserProfile};
use wealthcoach::embedding::LocalEmbedder;
use wealthcoach::http_api::{router, AppState};
use wealthcoach::rate_limit::RateLimiter;
use wealthcoach::retriever::Retriever;
use wealthcoach::vector_store::InMemoryVectorStore;
use wealthcoach::ws::ConnectionRegistry;

const SECRET: &str = "test-secret";

async fn spawn_server(
    mut settings: Settings,
    llm: Arc<ScriptedLlmClient>,
) -> (SocketAddr, Arc<dyn ConversationStore>) {
    settings.auth_secret = SECRET.to_string();
    let settings = settings.into_shared();

    let cache = Arc::new(MemoryCache::new());
    let store: Arc<dyn ConversationStore> = Arc::new(
        SqliteConversationStore::connect("sqlite::memory:")
            .await
            .unwrap(),
    );
    let vectors = Arc::new(InMemoryVectorStore::new(settings.embedding_dim));
    let retriever = Arc::new(Retriever::new(
        Arc::new(LocalEmbedder::new(settings.embedding_dim)),
        vectors.clone(),
        cache.clone(),
        settings.rag_max_ctx_chars,
        Duration::from_secs(settings.embedding_cache_ttl_secs),
    ));
    let (writer, _writer_handle) = BackgroundWriter::spawn(store.clone(), cache.clone(), 64);
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
        store: store.clone(),
        cache: cache.clone(),
        vectors,
        llm,
        verifier: Arc::new(SharedSecretVerifier::new(SECRET)),
        rate_limiter: Arc::new(RateLimiter::new(
            cache.clone(),
            settings.chat_limit_per_minute,
        )),
        registry: Arc::new(ConnectionRegistry::new(settings.max_conn_per_user)),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    (addr, store)
}

fn token_for(user_id: &str) -> String {
    SharedSecretVerifier::new(SECRET).mint(user_id, 600)
}

type Client = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(addr: SocketAddr) -> Client {
    let (client, _response) =
        tokio_tungstenite::connect_async(format!("ws://{}/ws/chat", addr))
            .await
            .unwrap();
    client
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed unexpectedly")
            .expect("transport error")
        {
            WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

async fn expect_close_code(client: &mut Client, expected: u16) {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for close")
        {
            Some(Ok(WsMessage::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), expected);
                return;
            }
            Some(Ok(WsMessage::Close(None))) => panic!("close carried no status"),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => panic!("connection ended without a close frame"),
        }
    }
}

async fn authenticate(client: &mut Client, user_id: &str) -> Value {
    client
        .send(WsMessage::Text(
            json!({"type": "authenticate", "token": token_for(user_id)})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
    let connected = next_json(client).await;
    assert_eq!(connected["type"], "connected");
    connected
}

async fn send_message(client: &mut Client, content: &str) {
    client
        .send(WsMessage::Text(
            json!({"type": "message", "content": content}).to_string().into(),
        ))
        .await
        .unwrap();
}

// S6 — a silent client is closed with the auth-timeout status, and no
// connected frame is ever sent.
#[tokio::test]
async fn silent_connection_times_out() {
    wealthcoach::init_logger();
    let mut settings = Settings::default();
    settings.auth_timeout_secs = 1;
    let (addr, _store) = spawn_server(settings, Arc::new(ScriptedLlmClient::new(vec![]))).await;

    let mut client = connect(addr).await;
    expect_close_code(&mut client, 4408).await;
}

#[tokio::test]
async fn first_frame_must_authenticate() {
    let (addr, _store) = spawn_server(
        Settings::default(),
        Arc::new(ScriptedLlmClient::new(vec![])),
    )
    .await;

    let mut client = connect(addr).await;
    send_message(&mut client, "hi").await;
    expect_close_code(&mut client, 4401).await;
}

#[tokio::test]
async fn invalid_token_closes_with_auth_failed() {
    let (addr, _store) = spawn_server(
        Settings::default(),
        Arc::new(ScriptedLlmClient::new(vec![])),
    )
    .await;

    let mut client = connect(addr).await;
    client
        .send(WsMessage::Text(
            json!({"type": "authenticate", "token": "u1.9999999999.forged"})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
    expect_close_code(&mut client, 4403).await;
}

// S1 over the wire: connected frame, session_id event, response frames with
// done on the last, concatenation intact.
#[tokio::test]
async fn full_turn_streams_over_the_socket() {
    wealthcoach::init_logger();
    let deltas = vec!["A ", "401k ", "is ", "a ", "retirement ", "account."];
    let (addr, store) = spawn_server(
        Settings::default(),
        Arc::new(ScriptedLlmClient::new(deltas)),
    )
    .await;

    let mut client = connect(addr).await;
    authenticate(&mut client, "u1").await;
    send_message(&mut client, "What is a 401k?").await;

    let session_frame = next_json(&mut client).await;
    assert_eq!(session_frame["type"], "session_id");
    let session_id = session_frame["session_id"].as_str().unwrap().to_string();
    assert!(session_frame["timestamp"].as_str().unwrap().ends_with('Z'));

    let mut assembled = String::new();
    let mut frames = 0;
    loop {
        let frame = next_json(&mut client).await;
        assert_eq!(frame["type"], "response");
        frames += 1;
        assembled.push_str(frame["content"].as_str().unwrap());
        if frame["done"].as_bool().unwrap() {
            assert_eq!(frame["cached"], false);
            break;
        }
    }
    assert_eq!(frames, 6);
    assert_eq!(assembled, "A 401k is a retirement account.");

    // The assistant record matches what went over the wire.
    let mut persisted = Vec::new();
    for _ in 0..100 {
        if let Ok(messages) = store.list_messages(&session_id, "u1", 0, 10).await {
            if messages.len() == 2 {
                persisted = messages;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(persisted[1].content, assembled);
}

#[tokio::test]
async fn ping_is_answered_out_of_band() {
    let (addr, _store) = spawn_server(
        Settings::default(),
        Arc::new(ScriptedLlmClient::new(vec!["x"])),
    )
    .await;

    let mut client = connect(addr).await;
    authenticate(&mut client, "u1").await;

    client
        .send(WsMessage::Text(json!({"type": "ping"}).to_string().into()))
        .await
        .unwrap();
    let frame = next_json(&mut client).await;
    assert_eq!(frame["type"], "pong");
}

#[tokio::test]
async fn unknown_frame_type_yields_error_frame() {
    let (addr, _store) = spawn_server(
        Settings::default(),
        Arc::new(ScriptedLlmClient::new(vec!["x"])),
    )
    .await;

    let mut client = connect(addr).await;
    authenticate(&mut client, "u1").await;

    client
        .send(WsMessage::Text(
            json!({"type": "subscribe", "topic": "prices"}).to_string().into(),
        ))
        .await
        .unwrap();
    let frame = next_json(&mut client).await;
    assert_eq!(frame["type"], "error");
}

// S5 (trip only) — the frame over the per-minute limit is answered with a
// rate error and never consumes a generation.
#[tokio::test]
async fn over_limit_message_gets_rate_error() {
    let mut settings = Settings::default();
    settings.chat_limit_per_minute = 1;
    let llm = Arc::new(ScriptedLlmClient::new(vec!["ok"]));
    let (addr, _store) = spawn_server(settings, llm.clone()).await;

    let mut client = connect(addr).await;
    authenticate(&mut client, "u1").await;

    send_message(&mut client, "first").await;
    loop {
        let frame = next_json(&mut client).await;
        if frame["type"] == "response" && frame["done"] == true {
            break;
        }
    }
    assert_eq!(llm.call_count(), 1);

    send_message(&mut client, "second").await;
    let frame = next_json(&mut client).await;
    assert_eq!(frame["type"], "error");
    assert!(frame["message"].as_str().unwrap().contains("rate"));
    assert_eq!(llm.call_count(), 1, "rejected frame must not reach the model");
}

#[tokio::test]
async fn connection_cap_is_enforced_per_user() {
    let mut settings = Settings::default();
    settings.max_conn_per_user = 1;
    let (addr, _store) = spawn_server(settings, Arc::new(ScriptedLlmClient::new(vec![]))).await;

    let mut first = connect(addr).await;
    authenticate(&mut first, "u1").await;

    let mut second = connect(addr).await;
    second
        .send(WsMessage::Text(
            json!({"type": "authenticate", "token": token_for("u1")})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
    expect_close_code(&mut second, 4429).await;

    // A different user still connects fine.
    let mut other = connect(addr).await;
    authenticate(&mut other, "u2").await;
}

// Two message frames on one handle are served strictly one after the other;
// deltas never interleave across turns.
#[tokio::test]
async fn concurrent_messages_are_serialized() {
    let llm = Arc::new(
        ScriptedLlmClient::new(vec!["alpha ", "beta ", "gamma"])
            .with_delay(Duration::from_millis(20)),
    );
    let (addr, _store) = spawn_server(Settings::default(), llm).await;

    let mut client = connect(addr).await;
    authenticate(&mut client, "u1").await;

    send_message(&mut client, "first question").await;
    send_message(&mut client, "second question").await;

    let mut turns_completed = 0;
    let mut in_turn = false;
    while turns_completed < 2 {
        let frame = next_json(&mut client).await;
        match frame["type"].as_str().unwrap() {
            "session_id" => {
                assert!(!in_turn, "a new turn started before the previous finished");
                in_turn = true;
            }
            "response" => {
                assert!(in_turn, "response frame outside a turn");
                if frame["done"] == true {
                    in_turn = false;
                    turns_completed += 1;
                }
            }
            "error" => panic!("unexpected error frame: {}", frame),
            other => panic!("unexpected frame type {}", other),
        }
    }
}

// The profile loaded at authentication personalizes the greeting for the
// connection's lifetime.
#[tokio::test]
async fn greeting_uses_the_stored_profile() {
    let (addr, store) = spawn_server(
        Settings::default(),
        Arc::new(ScriptedLlmClient::new(vec![])),
    )
    .await;
    store
        .upsert_profile(&UserProfile {
            user_id: "u1".to_string(),
            name: Some("Priya".to_string()),
            preferences: None,
            risk_tolerance: None,
        })
        .await
        .unwrap();

    let mut client = connect(addr).await;
    let connected = authenticate(&mut client, "u1").await;
    assert!(connected["message"].as_str().unwrap().contains("Priya"));
}
