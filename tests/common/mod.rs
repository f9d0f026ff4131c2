//! Shared harness: a real server on an ephemeral port plus raw WebSocket clients.
#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use story_collab::config::Config;
use story_collab::routes::create_app;
use story_collab::services::persistence::MemoryGateway;
use story_collab::ws::{HubSettings, SessionHub};
use story_collab::AppState;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const SECRET: &str = "integration-secret";

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub hub: Arc<SessionHub>,
    pub gateway: Arc<MemoryGateway>,
}

impl TestServer {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

pub fn test_config() -> Config {
    Config {
        jwt_secret: Some(SECRET.to_string()),
        ..Config::default()
    }
}

pub async fn start_server() -> TestServer {
    start_server_with(test_config()).await
}

pub async fn start_server_with(config: Config) -> TestServer {
    let gateway = Arc::new(MemoryGateway::new());
    let hub = Arc::new(SessionHub::new(gateway.clone(), HubSettings::from(&config)));
    let state = Arc::new(AppState { config: Arc::new(config), hub: hub.clone() });
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, hub, gateway }
}

/// Mint a credential the way the account service does.
pub fn token(user_id: i64, username: &str) -> String {
    let claims = json!({
        "id": user_id,
        "username": username,
        "exp": chrono::Utc::now().timestamp() + 3600,
    });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

/// Open a session and consume the `connected` greeting.
pub async fn join(server: &TestServer, user_id: i64, username: &str, story_id: Option<i64>) -> Ws {
    let mut url = format!("{}?token={}", server.ws_url(), token(user_id, username));
    if let Some(story_id) = story_id {
        url.push_str(&format!("&storyId={story_id}"));
    }
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let greeting = recv(&mut ws).await;
    assert_eq!(greeting["type"], "connected");
    assert_eq!(greeting["userId"], user_id);
    ws
}

pub async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Next JSON text frame, skipping control frames.
pub async fn recv(ws: &mut Ws) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("transport error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Assert no text frame arrives within `ms`.
pub async fn expect_silence(ws: &mut Ws, ms: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected frame: {}", text.as_str()),
            Ok(Some(Ok(_))) => continue,
            Ok(other) => panic!("connection ended: {other:?}"),
        }
    }
}
