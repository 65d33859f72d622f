//! Integration tests for the control-plane state machine, driven over a
//! real WebSocket pair.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use portico_control::{SessionHandler, TunnelRegistry};
use portico_proto::{ControlMessage, MessageKind};
use portico_transport::{ChannelConfig, ControlChannel, TransportIo};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type ClientWs = WebSocketStream<TransportIo>;

/// Stand up a handler over an in-process WebSocket pair and hand back the
/// client end plus the shared registry.
async fn start_handler(domain: &str) -> (Arc<TunnelRegistry>, ClientWs) {
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);

    let server_ws =
        WebSocketStream::from_raw_socket(Box::new(server_io) as TransportIo, Role::Server, None)
            .await;
    let client_ws =
        WebSocketStream::from_raw_socket(Box::new(client_io) as TransportIo, Role::Client, None)
            .await;

    let registry = Arc::new(TunnelRegistry::new());
    let handler = SessionHandler::new(registry.clone(), domain.to_string());

    let (channel, control_rx) = ControlChannel::start(
        server_ws,
        "127.0.0.1:0".parse().unwrap(),
        ChannelConfig::default(),
    );
    tokio::spawn(async move {
        handler.run(channel, control_rx).await;
    });

    (registry, client_ws)
}

async fn send(client: &mut ClientWs, json: &str) {
    client.send(Message::Text(json.to_string())).await.unwrap();
}

async fn recv_control(client: &mut ClientWs) -> ControlMessage {
    loop {
        let frame = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for reply")
            .expect("connection ended")
            .expect("websocket error");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            // Keepalive frames may interleave with replies
            _ => continue,
        }
    }
}

fn register_json(subdomain: &str) -> String {
    format!(
        r#"{{"type":"register","timestamp":"2026-01-01T00:00:00Z","data":{{"subdomain":"{}","local_addr":"localhost:3000","local_port":3000}}}}"#,
        subdomain
    )
}

#[tokio::test]
async fn test_register_with_random_subdomain() {
    let (registry, mut client) = start_handler("example.test").await;

    send(
        &mut client,
        r#"{"type":"register","timestamp":"2026-01-01T00:00:00Z","data":{"local_addr":"localhost:3000","local_port":3000}}"#,
    )
    .await;

    let reply = recv_control(&mut client).await;
    assert_eq!(reply.kind, MessageKind::Success);

    let data = reply.data.unwrap();
    let sub = data["subdomain"].as_str().unwrap();
    assert_eq!(sub.len(), 8);
    assert!(sub.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(
        data["full_domain"].as_str().unwrap(),
        format!("{}.example.test", sub)
    );
    assert_eq!(data["local_addr"].as_str().unwrap(), "localhost:3000");
    assert!(data["tunnel_id"].as_str().unwrap().len() > 30);

    assert_eq!(registry.count(), 1);
}

#[tokio::test]
async fn test_register_custom_subdomain() {
    let (registry, mut client) = start_handler("example.test").await;

    send(&mut client, &register_json("myapp")).await;

    let reply = recv_control(&mut client).await;
    assert_eq!(reply.kind, MessageKind::Success);
    let data = reply.data.unwrap();
    assert_eq!(data["subdomain"], "myapp");
    assert_eq!(data["full_domain"], "myapp.example.test");
    assert_eq!(
        data["message"],
        "Tunnel created: https://myapp.example.test -> localhost:3000"
    );

    assert!(registry.get("myapp").is_some());
}

#[tokio::test]
async fn test_register_normalizes_subdomain() {
    let (registry, mut client) = start_handler("example.test").await;

    send(&mut client, &register_json("  MyApp ")).await;

    let reply = recv_control(&mut client).await;
    assert_eq!(reply.kind, MessageKind::Success);
    assert_eq!(reply.data.unwrap()["subdomain"], "myapp");
    assert!(registry.get("myapp").is_some());
}

#[tokio::test]
async fn test_reserved_subdomain_rejected() {
    let (registry, mut client) = start_handler("example.test").await;

    send(&mut client, &register_json("admin")).await;

    let reply = recv_control(&mut client).await;
    assert_eq!(reply.kind, MessageKind::Error);
    assert_eq!(reply.error.as_deref(), Some("subdomain 'admin' is reserved"));
    assert_eq!(registry.count(), 0);

    // The session survives a rejected registration
    send(&mut client, &register_json("fine")).await;
    assert_eq!(recv_control(&mut client).await.kind, MessageKind::Success);
}

#[tokio::test]
async fn test_invalid_subdomain_rejected() {
    let (_registry, mut client) = start_handler("example.test").await;

    send(&mut client, &register_json("-bad")).await;
    let reply = recv_control(&mut client).await;
    assert_eq!(reply.kind, MessageKind::Error);
    assert_eq!(
        reply.error.as_deref(),
        Some("subdomain must contain only lowercase letters, numbers, and hyphens")
    );
}

#[tokio::test]
async fn test_second_register_rejected() {
    let (registry, mut client) = start_handler("example.test").await;

    send(&mut client, &register_json("myapp")).await;
    assert_eq!(recv_control(&mut client).await.kind, MessageKind::Success);

    send(&mut client, &register_json("other")).await;
    let reply = recv_control(&mut client).await;
    assert_eq!(reply.kind, MessageKind::Error);
    assert_eq!(reply.error.as_deref(), Some("already registered"));

    // The original registration is untouched
    assert!(registry.get("myapp").is_some());
    assert!(registry.get("other").is_none());
}

#[tokio::test]
async fn test_unregister_then_reregister() {
    let (registry, mut client) = start_handler("example.test").await;

    send(&mut client, &register_json("myapp")).await;
    assert_eq!(recv_control(&mut client).await.kind, MessageKind::Success);

    send(
        &mut client,
        r#"{"type":"unregister","timestamp":"2026-01-01T00:00:00Z"}"#,
    )
    .await;
    let reply = recv_control(&mut client).await;
    assert_eq!(reply.kind, MessageKind::Success);
    assert_eq!(
        reply.data.unwrap()["message"],
        "Tunnel unregistered successfully"
    );
    assert_eq!(registry.count(), 0);

    // Back in the handshaking state: the same name can be claimed again
    send(&mut client, &register_json("myapp")).await;
    assert_eq!(recv_control(&mut client).await.kind, MessageKind::Success);
    assert_eq!(registry.count(), 1);
}

#[tokio::test]
async fn test_unregister_without_tunnel() {
    let (_registry, mut client) = start_handler("example.test").await;

    send(
        &mut client,
        r#"{"type":"unregister","timestamp":"2026-01-01T00:00:00Z"}"#,
    )
    .await;

    let reply = recv_control(&mut client).await;
    assert_eq!(reply.kind, MessageKind::Error);
    assert_eq!(reply.error.as_deref(), Some("no tunnel registered"));
}

#[tokio::test]
async fn test_ping_answered_with_pong() {
    let (_registry, mut client) = start_handler("example.test").await;

    send(
        &mut client,
        r#"{"type":"ping","timestamp":"2026-01-01T00:00:00Z"}"#,
    )
    .await;

    let reply = recv_control(&mut client).await;
    assert_eq!(reply.kind, MessageKind::Pong);
}

#[tokio::test]
async fn test_unknown_message_type() {
    let (_registry, mut client) = start_handler("example.test").await;

    send(
        &mut client,
        r#"{"type":"frobnicate","timestamp":"2026-01-01T00:00:00Z"}"#,
    )
    .await;

    let reply = recv_control(&mut client).await;
    assert_eq!(reply.kind, MessageKind::Error);
    assert_eq!(reply.error.as_deref(), Some("unknown message type"));
}

#[tokio::test]
async fn test_data_messages_ignored() {
    let (_registry, mut client) = start_handler("example.test").await;

    send(
        &mut client,
        r#"{"type":"data","timestamp":"2026-01-01T00:00:00Z"}"#,
    )
    .await;
    send(
        &mut client,
        r#"{"type":"ping","timestamp":"2026-01-01T00:00:00Z"}"#,
    )
    .await;

    // The only reply is the pong; the data message produced none
    let reply = recv_control(&mut client).await;
    assert_eq!(reply.kind, MessageKind::Pong);
}

#[tokio::test]
async fn test_disconnect_cleans_up_registration() {
    let (registry, mut client) = start_handler("example.test").await;

    send(&mut client, &register_json("myapp")).await;
    assert_eq!(recv_control(&mut client).await.kind, MessageKind::Success);
    assert_eq!(registry.count(), 1);

    client.close(None).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while registry.get("myapp").is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "registration not cleaned up after disconnect"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
