// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! The chat client against a real WebSocket backend on localhost.
//!
//! A minimal `tokio-tungstenite` server stands in for the backend: it
//! records the request URI of every handshake and hands the accepted
//! stream to the test, which plays the server side by hand.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use socialchat::client::{ChatClient, ChatSettings, ClientEvent};
use socialchat::config::ReconnectConfig;
use socialchat::transport::websocket::WsConnector;
use socialchat_proto::id::UserId;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};

const WAIT: Duration = Duration::from_secs(5);

struct Accepted {
    uri: String,
    ws: WebSocketStream<TcpStream>,
}

struct Backend {
    origin: String,
    connections: mpsc::UnboundedReceiver<Accepted>,
}

impl Backend {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let uri = Arc::new(Mutex::new(String::new()));
                let slot = Arc::clone(&uri);
                let callback = move |req: &Request, resp: Response| {
                    *slot.lock() = req.uri().to_string();
                    Ok::<_, ErrorResponse>(resp)
                };
                let Ok(ws) = accept_hdr_async(stream, callback).await else {
                    continue;
                };
                let uri = uri.lock().clone();
                if tx.send(Accepted { uri, ws }).is_err() {
                    break;
                }
            }
        });

        Self {
            origin: format!("http://{addr}/"),
            connections,
        }
    }

    async fn accept(&mut self) -> Accepted {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for a client connection")
            .expect("backend listener stopped")
    }
}

type Client = ChatClient<WsConnector>;

fn client_for(origin: &str, reconnect: ReconnectConfig) -> (Client, mpsc::Receiver<ClientEvent>) {
    let settings = ChatSettings {
        backend_origin: Some(origin.to_string()),
        reconnect,
        ..ChatSettings::default()
    };
    ChatClient::over_websocket(settings, WAIT)
}

/// Skip events until one matches `wanted`.
async fn wait_for(
    events: &mut mpsc::Receiver<ClientEvent>,
    wanted: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for client event")
}

async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
    let frame = tokio::time::timeout(WAIT, ws.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("client went away")
        .unwrap();
    match frame {
        Message::Text(text) => text.as_str().to_string(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn exchanges_frames_with_backend() {
    let mut backend = Backend::start().await;
    let (client, mut events) = client_for(&backend.origin, ReconnectConfig::default());

    client.connect("secret-token").unwrap();
    let mut conn = backend.accept().await;
    assert_eq!(conn.uri, "/ws?token=secret-token");
    wait_for(&mut events, |e| matches!(e, ClientEvent::Connected)).await;
    assert!(client.is_connected());

    let bob = UserId::new("bob");
    assert!(client.send_text_message(&bob, "hello bob"));
    let sent: serde_json::Value = serde_json::from_str(&next_text(&mut conn.ws).await).unwrap();
    assert_eq!(
        sent,
        serde_json::json!({"action": "send", "receiverId": "bob", "content": "hello bob"})
    );

    let reply = serde_json::json!({
        "type": "text",
        "senderId": 7,
        "receiverId": "alice",
        "content": "hi alice",
        "timestamp": 1_714_557_600_000_i64,
        "messageId": "m-1",
    });
    conn.ws.send(Message::text(reply.to_string())).await.unwrap();

    let ClientEvent::MessageReceived(message) =
        wait_for(&mut events, |e| matches!(e, ClientEvent::MessageReceived(_))).await
    else {
        unreachable!()
    };
    assert_eq!(message.sender_id, Some(UserId::new("7")));
    assert_eq!(message.timestamp.timestamp_millis(), 1_714_557_600_000);
    assert_eq!(message.extra.get("messageId"), Some(&serde_json::json!("m-1")));

    let alice = UserId::new("alice");
    let conversation = client.get_conversation_messages(Some(&UserId::from(7_u64)), Some(&alice));
    assert_eq!(conversation.len(), 1);
    assert_eq!(conversation[0].content.as_deref(), Some("hi alice"));
}

#[tokio::test]
async fn dropped_connection_is_retried_with_same_token() {
    let mut backend = Backend::start().await;
    let reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(100),
        ..ReconnectConfig::default()
    };
    let (client, mut events) = client_for(&backend.origin, reconnect);

    client.connect("tok").unwrap();
    let first = backend.accept().await;
    wait_for(&mut events, |e| matches!(e, ClientEvent::Connected)).await;

    // Vanish without a closing handshake.
    drop(first.ws);
    let event = wait_for(&mut events, |e| {
        matches!(e, ClientEvent::Disconnected { .. })
    })
    .await;
    assert!(matches!(
        event,
        ClientEvent::Disconnected {
            code: 1006,
            retry_in: Some(d)
        } if d == Duration::from_millis(100)
    ));

    let second = backend.accept().await;
    assert_eq!(second.uri, first.uri);
    wait_for(&mut events, |e| matches!(e, ClientEvent::Connected)).await;
    assert!(client.is_connected());
}

#[tokio::test]
async fn normal_close_from_backend_is_final() {
    let mut backend = Backend::start().await;
    let reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(50),
        ..ReconnectConfig::default()
    };
    let (client, mut events) = client_for(&backend.origin, reconnect);

    client.connect("tok").unwrap();
    let mut conn = backend.accept().await;
    wait_for(&mut events, |e| matches!(e, ClientEvent::Connected)).await;

    conn.ws
        .close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }))
        .await
        .unwrap();
    tokio::spawn(async move { while conn.ws.next().await.is_some() {} });

    let event = wait_for(&mut events, |e| {
        matches!(e, ClientEvent::Disconnected { .. })
    })
    .await;
    assert!(matches!(
        event,
        ClientEvent::Disconnected {
            code: 1000,
            retry_in: None
        }
    ));

    let again = tokio::time::timeout(Duration::from_millis(500), backend.connections.recv()).await;
    assert!(again.is_err(), "client reconnected after a normal close");
    assert!(!client.is_connected());
}

#[tokio::test]
async fn disconnect_sends_normal_close() {
    let mut backend = Backend::start().await;
    let (client, mut events) = client_for(&backend.origin, ReconnectConfig::default());

    client.connect("tok").unwrap();
    let mut conn = backend.accept().await;
    wait_for(&mut events, |e| matches!(e, ClientEvent::Connected)).await;

    client.disconnect();
    let frame = tokio::time::timeout(WAIT, conn.ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match frame {
        Message::Close(Some(close)) => assert_eq!(u16::from(close.code), 1000),
        other => panic!("expected close frame, got {other:?}"),
    }
    assert!(!client.send_text_message(&UserId::new("bob"), "after close"));
}

#[tokio::test]
async fn unreachable_backend_reports_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let reconnect = ReconnectConfig {
        max_attempts: Some(0),
        ..ReconnectConfig::default()
    };
    let (client, mut events) = client_for(&format!("http://{addr}"), reconnect);

    client.connect("tok").unwrap();
    wait_for(&mut events, |e| matches!(e, ClientEvent::TransportFailed { .. })).await;
    let event = wait_for(&mut events, |e| {
        matches!(e, ClientEvent::Disconnected { .. })
    })
    .await;
    assert!(matches!(
        event,
        ClientEvent::Disconnected {
            code: 1006,
            retry_in: None
        }
    ));
    assert!(!client.is_connected());
}
