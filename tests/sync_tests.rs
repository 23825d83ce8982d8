//! Push channel against a live server on an ephemeral port.

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use ticktrack::api::AppState;
use ticktrack::config::{Config, StorageBackend};
use tokio::net::TcpStream;
use tower::ServiceExt;
use tokio_tungstenite::tungstenite::{Message, client::IntoClientRequest};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> Config {
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Memory;
    config.security.argon2_memory_cost_kib = 1024;
    config.security.argon2_time_cost = 1;
    config.sync.tick_interval_ms = 100;
    config.observability.metrics_enabled = false;
    config
}

async fn spawn_server() -> (Arc<AppState>, SocketAddr) {
    let state = ticktrack::api::create_app_state_from_config(test_config(), None)
        .await
        .expect("failed to create app state");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = ticktrack::api::router(state.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (state, addr)
}

async fn connect(addr: SocketAddr, token: &str) -> Client {
    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {token}").parse().unwrap(),
    );
    let (client, _) = connect_async(request).await.expect("websocket handshake");
    client
}

async fn send(client: &mut Client, message: Value) {
    client
        .send(Message::Text(message.to_string().into()))
        .await
        .unwrap();
}

/// Next JSON text frame, skipping control frames.
async fn recv(client: &mut Client) -> Value {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<Value>(text.as_str()).unwrap();
                }
                Some(Ok(_)) => {}
                other => panic!("connection ended: {other:?}"),
            }
        }
    })
    .await
    .expect("message within timeout")
}

async fn expect_closed(client: &mut Client) {
    let next = tokio::time::timeout(Duration::from_secs(3), client.next())
        .await
        .expect("close within timeout");
    assert!(
        matches!(next, None | Some(Ok(Message::Close(_)) | Err(_))),
        "expected the connection to close, got {next:?}"
    );
}

/// Skips tick messages until a frame of the given type arrives.
async fn recv_type(client: &mut Client, kind: &str) -> Value {
    loop {
        let message = recv(client).await;
        if message["type"] == kind {
            return message;
        }
    }
}

#[tokio::test]
async fn init_returns_all_timers_then_ticks_follow() {
    let (state, addr) = spawn_server().await;
    let login = state.auth.signup("alice", "secret1").await.unwrap();
    let done = state.timers.start(login.user_id, "done").await.unwrap();
    state.timers.start(login.user_id, "running").await.unwrap();
    state.timers.stop(login.user_id, done.id).await.unwrap();

    let sync = state.sync.clone().spawn();
    let mut client = connect(addr, login.session_token.as_str()).await;

    send(&mut client, json!({ "type": "init" })).await;
    let all = recv_type(&mut client, "all_timers").await;
    assert_eq!(all["activeTimers"].as_array().unwrap().len(), 1);
    assert_eq!(all["oldTimers"].as_array().unwrap().len(), 1);
    assert_eq!(all["oldTimers"][0]["description"], "done");

    let first = recv_type(&mut client, "active_timers").await;
    let second = recv_type(&mut client, "active_timers").await;
    assert_eq!(first["activeTimers"][0]["description"], "running");
    assert!(
        second["activeTimers"][0]["progress"].as_i64().unwrap()
            >= first["activeTimers"][0]["progress"].as_i64().unwrap()
    );

    sync.abort();
}

#[tokio::test]
async fn all_channels_of_a_user_receive_the_same_tick() {
    let (state, addr) = spawn_server().await;
    let login = state.auth.signup("alice", "secret1").await.unwrap();
    state.timers.start(login.user_id, "shared").await.unwrap();

    let mut laptop = connect(addr, login.session_token.as_str()).await;
    let mut phone = connect(addr, login.session_token.as_str()).await;

    send(&mut laptop, json!({ "type": "init" })).await;
    send(&mut phone, json!({ "type": "init" })).await;
    recv_type(&mut laptop, "all_timers").await;
    recv_type(&mut phone, "all_timers").await;

    let report = state.sync.tick().await;
    assert_eq!(report.delivered, 2);

    let a = recv(&mut laptop).await;
    let b = recv(&mut phone).await;
    assert_eq!(a["type"], "active_timers");
    assert_eq!(a, b);
}

#[tokio::test]
async fn all_timers_request_does_not_subscribe() {
    let (state, addr) = spawn_server().await;
    let login = state.auth.signup("alice", "secret1").await.unwrap();

    let mut client = connect(addr, login.session_token.as_str()).await;
    send(&mut client, json!({ "type": "all_timers" })).await;
    let reply = recv(&mut client).await;

    assert_eq!(reply["type"], "all_timers");
    assert_eq!(state.sync.registry().subscriber_count().await, 0);
}

#[tokio::test]
async fn malformed_frames_are_ignored() {
    let (state, addr) = spawn_server().await;
    let login = state.auth.signup("alice", "secret1").await.unwrap();

    let mut client = connect(addr, login.session_token.as_str()).await;
    send(&mut client, json!("not an object")).await;
    send(&mut client, json!({ "type": "self_destruct" })).await;
    send(&mut client, json!({ "type": "all_timers" })).await;

    // The only reply is to the valid frame.
    assert_eq!(recv(&mut client).await["type"], "all_timers");
}

#[tokio::test]
async fn claiming_another_user_id_is_refused() {
    let (state, addr) = spawn_server().await;
    let alice = state.auth.signup("alice", "secret1").await.unwrap();
    let bob = state.auth.signup("bob", "secret2").await.unwrap();

    let mut client = connect(addr, alice.session_token.as_str()).await;
    send(
        &mut client,
        json!({ "type": "init", "userId": bob.user_id.value() }),
    )
    .await;

    let reply = recv(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(state.sync.registry().subscriber_count().await, 0);

    send(
        &mut client,
        json!({ "type": "init", "userId": alice.user_id.value() }),
    )
    .await;
    assert_eq!(recv(&mut client).await["type"], "all_timers");
    assert_eq!(state.sync.registry().subscriber_count().await, 1);
}

#[tokio::test]
async fn closing_the_socket_unsubscribes() {
    let (state, addr) = spawn_server().await;
    let login = state.auth.signup("alice", "secret1").await.unwrap();

    let mut client = connect(addr, login.session_token.as_str()).await;
    send(&mut client, json!({ "type": "init" })).await;
    recv_type(&mut client, "all_timers").await;
    assert_eq!(state.sync.registry().subscriber_count().await, 1);

    client.close(None).await.unwrap();

    tokio::time::timeout(Duration::from_secs(3), async {
        while state.sync.registry().subscriber_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("subscription removed after close");
}

#[tokio::test]
async fn upgrade_without_session_is_rejected() {
    let (_, addr) = spawn_server().await;
    let result = connect_async(format!("ws://{addr}/ws")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn logout_ends_the_push_channel() {
    let (state, addr) = spawn_server().await;
    let login = state.auth.signup("alice", "secret1").await.unwrap();
    state.timers.start(login.user_id, "secret work").await.unwrap();

    let mut client = connect(addr, login.session_token.as_str()).await;
    send(&mut client, json!({ "type": "init" })).await;
    recv_type(&mut client, "all_timers").await;

    state.auth.logout(&login.session_token).await.unwrap();
    state.sync.tick().await;

    // No timer data after the session is gone, only the error and a close.
    let reply = recv(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert!(reply.get("activeTimers").is_none());
    expect_closed(&mut client).await;

    tokio::time::timeout(Duration::from_secs(3), async {
        while state.sync.registry().subscriber_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("subscription removed after logout");
}

#[tokio::test]
async fn http_logout_drops_subscriptions_of_that_session_only() {
    let (state, addr) = spawn_server().await;
    let laptop = state.auth.signup("alice", "secret1").await.unwrap();
    let phone = state.auth.login("alice", "secret1").await.unwrap();

    let mut laptop_ws = connect(addr, laptop.session_token.as_str()).await;
    let mut phone_ws = connect(addr, phone.session_token.as_str()).await;
    send(&mut laptop_ws, json!({ "type": "init" })).await;
    send(&mut phone_ws, json!({ "type": "init" })).await;
    recv_type(&mut laptop_ws, "all_timers").await;
    recv_type(&mut phone_ws, "all_timers").await;

    let response = ticktrack::api::router(state.clone())
        .oneshot(
            axum::http::Request::builder()
                .uri("/logout")
                .header(
                    "Authorization",
                    format!("Bearer {}", laptop.session_token.as_str()),
                )
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);

    // Dropped from the registry before the next tick runs.
    assert_eq!(state.sync.registry().subscriber_count().await, 1);
    let report = state.sync.tick().await;
    assert_eq!(report.delivered, 1);

    assert_eq!(recv(&mut laptop_ws).await["type"], "error");
    expect_closed(&mut laptop_ws).await;
    assert_eq!(recv(&mut phone_ws).await["type"], "active_timers");
}

#[tokio::test]
async fn revoked_session_cannot_request_timers() {
    let (state, addr) = spawn_server().await;
    let login = state.auth.signup("alice", "secret1").await.unwrap();

    let mut client = connect(addr, login.session_token.as_str()).await;
    send(&mut client, json!({ "type": "all_timers" })).await;
    assert_eq!(recv(&mut client).await["type"], "all_timers");

    assert_eq!(state.auth.revoke_sessions("alice").await.unwrap(), 1);

    send(&mut client, json!({ "type": "all_timers" })).await;
    let reply = recv(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert!(reply.get("oldTimers").is_none());
    expect_closed(&mut client).await;
}
