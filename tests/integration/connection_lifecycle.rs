// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Connection manager lifecycle over the loopback connector.
//!
//! Covers idempotent connect, reconnect after an unclean close, the
//! suppression of reconnects after `disconnect`, the send guard, and
//! resilience to malformed inbound frames. Timer behaviour is checked with
//! tokio's paused clock, so elapsed times are exact.

use std::sync::Arc;
use std::time::Duration;

use socialchat::client::{ChatClient, ChatSettings, ClientEvent, ConnectionState};
use socialchat::config::ReconnectConfig;
use socialchat::transport::loopback::{LoopbackConnector, RemoteSocket};
use socialchat::transport::{ABNORMAL_CLOSURE, NORMAL_CLOSURE, Outbound};
use socialchat_proto::frame::OutboundFrame;
use socialchat_proto::id::UserId;
use tokio::sync::mpsc;
use tokio::time::Instant;

type Client = ChatClient<Arc<LoopbackConnector>>;

struct Harness {
    client: Client,
    events: mpsc::Receiver<ClientEvent>,
    connector: Arc<LoopbackConnector>,
    remotes: mpsc::UnboundedReceiver<RemoteSocket>,
}

fn harness_with(reconnect: ReconnectConfig) -> Harness {
    let (connector, remotes) = LoopbackConnector::new();
    let connector = Arc::new(connector);
    let settings = ChatSettings {
        backend_origin: Some("https://api.example.com/".to_string()),
        reconnect,
        ..ChatSettings::default()
    };
    let (client, events) = ChatClient::new(Arc::clone(&connector), settings);
    Harness {
        client,
        events,
        connector,
        remotes,
    }
}

fn harness() -> Harness {
    harness_with(ReconnectConfig::default())
}

impl Harness {
    async fn next_event(&mut self) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(120), self.events.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("event channel closed")
    }

    async fn next_remote(&mut self) -> RemoteSocket {
        tokio::time::timeout(Duration::from_secs(120), self.remotes.recv())
            .await
            .expect("timed out waiting for a socket")
            .expect("connector dropped")
    }

    /// Connect and complete the handshake.
    async fn open(&mut self, token: &str) -> RemoteSocket {
        self.client.connect(token).unwrap();
        let remote = self.next_remote().await;
        remote.open();
        assert!(matches!(self.next_event().await, ClientEvent::Connected));
        remote
    }
}

#[tokio::test(start_paused = true)]
async fn connect_twice_while_connecting_creates_one_socket() {
    let mut h = harness();

    h.client.connect("tok").unwrap();
    h.client.connect("tok").unwrap();

    assert_eq!(h.connector.opened(), 1);
    assert_eq!(h.client.state(), ConnectionState::Connecting);

    let remote = h.next_remote().await;
    remote.open();
    assert!(matches!(h.next_event().await, ClientEvent::Connected));

    h.client.connect("other-token").unwrap();
    assert_eq!(h.connector.opened(), 1);
    assert!(h.client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn socket_url_carries_token() {
    let mut h = harness();
    h.client.connect("abc.def").unwrap();
    let remote = h.next_remote().await;
    assert_eq!(
        remote.url().as_str(),
        "wss://api.example.com/ws?token=abc.def"
    );
}

#[tokio::test(start_paused = true)]
async fn abnormal_close_reconnects_once_after_fixed_delay() {
    let mut h = harness();
    let first = h.open("tok").await;

    let closed_at = Instant::now();
    first.close(ABNORMAL_CLOSURE);
    match h.next_event().await {
        ClientEvent::Disconnected { code, retry_in } => {
            assert_eq!(code, ABNORMAL_CLOSURE);
            assert_eq!(retry_in, Some(Duration::from_secs(3)));
        }
        other => panic!("expected Disconnected, got {other:?}"),
    }
    assert!(!h.client.is_connected());
    assert_eq!(h.client.state(), ConnectionState::Closed);

    let second = h.next_remote().await;
    assert!(closed_at.elapsed() >= Duration::from_secs(3));
    assert_eq!(second.url(), first.url());
    assert_eq!(h.client.state(), ConnectionState::Connecting);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connector.opened(), 2);
    assert!(h.remotes.try_recv().is_err());

    second.open();
    assert!(matches!(h.next_event().await, ClientEvent::Connected));
}

#[tokio::test(start_paused = true)]
async fn error_alone_does_not_reconnect() {
    let mut h = harness();
    let remote = h.open("tok").await;

    remote.fail("connection reset");
    assert!(matches!(
        h.next_event().await,
        ClientEvent::TransportFailed { .. }
    ));
    assert_eq!(h.client.state(), ConnectionState::Closed);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.connector.opened(), 1);

    remote.close(ABNORMAL_CLOSURE);
    assert!(matches!(
        h.next_event().await,
        ClientEvent::Disconnected {
            retry_in: Some(_),
            ..
        }
    ));
    let _second = h.next_remote().await;
    assert_eq!(h.connector.opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn normal_close_does_not_reconnect() {
    let mut h = harness();
    let remote = h.open("tok").await;

    remote.close(NORMAL_CLOSURE);
    assert!(matches!(
        h.next_event().await,
        ClientEvent::Disconnected {
            code: NORMAL_CLOSURE,
            retry_in: None
        }
    ));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connector.opened(), 1);
    assert_eq!(h.client.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn disconnect_suppresses_reconnect() {
    let mut h = harness();
    let mut remote = h.open("tok").await;

    h.client.disconnect();
    assert!(matches!(
        h.next_event().await,
        ClientEvent::Disconnected {
            code: NORMAL_CLOSURE,
            retry_in: None
        }
    ));
    assert_eq!(
        remote.next_outbound().await,
        Some(Outbound::Close {
            code: NORMAL_CLOSURE
        })
    );

    // Whatever the socket reports afterwards, nothing reconnects.
    remote.close(ABNORMAL_CLOSURE);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connector.opened(), 1);
    assert_eq!(h.client.state(), ConnectionState::Closed);

    // Second disconnect is a no-op.
    h.client.disconnect();
    assert!(h.events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_reconnect() {
    let mut h = harness();
    let remote = h.open("tok").await;

    remote.close(ABNORMAL_CLOSURE);
    assert!(matches!(
        h.next_event().await,
        ClientEvent::Disconnected {
            retry_in: Some(_),
            ..
        }
    ));

    h.client.disconnect();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connector.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_after_disconnect_opens_new_socket() {
    let mut h = harness();
    let _first = h.open("tok").await;
    h.client.disconnect();

    let second = h.open("tok-2").await;
    assert_eq!(h.connector.opened(), 2);
    assert_eq!(
        second.url().query(),
        Some("token=tok-2")
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_gives_up_after_max_attempts() {
    let mut h = harness_with(ReconnectConfig {
        max_attempts: Some(1),
        ..ReconnectConfig::default()
    });
    let first = h.open("tok").await;

    first.close(ABNORMAL_CLOSURE);
    assert!(matches!(
        h.next_event().await,
        ClientEvent::Disconnected {
            retry_in: Some(_),
            ..
        }
    ));

    // The retry never completes its handshake.
    let second = h.next_remote().await;
    second.close(ABNORMAL_CLOSURE);
    assert!(matches!(
        h.next_event().await,
        ClientEvent::Disconnected { retry_in: None, .. }
    ));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn backoff_grows_until_a_socket_opens() {
    let mut h = harness_with(ReconnectConfig {
        initial_delay: Duration::from_secs(1),
        backoff_multiplier: 2,
        max_delay: Duration::from_secs(60),
        max_attempts: None,
    });
    let first = h.open("tok").await;

    let mut delays = Vec::new();
    let mut current = first;
    for _ in 0..3 {
        current.close(ABNORMAL_CLOSURE);
        match h.next_event().await {
            ClientEvent::Disconnected { retry_in, .. } => delays.push(retry_in),
            other => panic!("expected Disconnected, got {other:?}"),
        }
        current = h.next_remote().await;
    }
    assert_eq!(
        delays,
        vec![
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(2)),
            Some(Duration::from_secs(4)),
        ]
    );

    // A successful open resets the schedule.
    current.open();
    assert!(matches!(h.next_event().await, ClientEvent::Connected));
    current.close(ABNORMAL_CLOSURE);
    assert!(matches!(
        h.next_event().await,
        ClientEvent::Disconnected {
            retry_in: Some(d),
            ..
        } if d == Duration::from_secs(1)
    ));
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_discarded() {
    let mut h = harness();
    let remote = h.open("tok").await;

    remote.push_text("definitely not json");
    remote.push_text(r#"{"content":"no type"}"#);
    remote.push_text(r#"["type","text"]"#);
    remote.push_text(r#"{"type":"text","senderId":"bob","receiverId":"alice","content":"hi"}"#);

    for _ in 0..3 {
        assert!(matches!(
            h.next_event().await,
            ClientEvent::FrameRejected { .. }
        ));
    }
    match h.next_event().await {
        ClientEvent::MessageReceived(message) => {
            assert_eq!(message.content.as_deref(), Some("hi"));
        }
        other => panic!("expected MessageReceived, got {other:?}"),
    }
    assert_eq!(h.client.message_count(), 1);
    assert!(h.client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn send_requires_open_socket() {
    let mut h = harness();
    let bob = UserId::new("bob");

    assert!(!h.client.send_text_message(&bob, "too early"));

    h.client.connect("tok").unwrap();
    let mut remote = h.next_remote().await;
    assert!(!h.client.send_text_message(&bob, "still connecting"));

    remote.open();
    assert!(matches!(h.next_event().await, ClientEvent::Connected));
    assert!(h.client.send_text_message(&bob, "hi"));
    assert_eq!(
        remote.sent_texts(),
        vec![r#"{"action":"send","receiverId":"bob","content":"hi"}"#.to_string()]
    );

    h.client.disconnect();
    assert!(!h.client.send_text_message(&bob, "too late"));
    assert!(!h.client.send_message(&OutboundFrame::GetHistory {
        receiver_id: bob,
        page: 1,
        page_size: 50,
    }));
}

#[tokio::test(start_paused = true)]
async fn frames_after_disconnect_are_not_stored() {
    let mut h = harness();
    let remote = h.open("tok").await;

    h.client.disconnect();
    remote.push_text(r#"{"type":"text","senderId":"bob","receiverId":"alice","content":"late"}"#);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.client.message_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn store_survives_reconnect() {
    let mut h = harness();
    let first = h.open("tok").await;

    first.push_text(r#"{"type":"text","senderId":"bob","receiverId":"alice","content":"kept"}"#);
    assert!(matches!(
        h.next_event().await,
        ClientEvent::MessageReceived(_)
    ));

    first.close(ABNORMAL_CLOSURE);
    let _ = h.next_event().await;
    let second = h.next_remote().await;
    second.open();
    assert!(matches!(h.next_event().await, ClientEvent::Connected));

    let alice = UserId::new("alice");
    let bob = UserId::new("bob");
    let conversation = h.client.get_conversation_messages(Some(&bob), Some(&alice));
    assert_eq!(conversation.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn vanished_socket_counts_as_abnormal_close() {
    let mut h = harness();
    let remote = h.open("tok").await;

    drop(remote);
    assert!(matches!(
        h.next_event().await,
        ClientEvent::Disconnected {
            code: ABNORMAL_CLOSURE,
            retry_in: Some(_)
        }
    ));
    let _again = h.next_remote().await;
    assert_eq!(h.connector.opened(), 2);
}
