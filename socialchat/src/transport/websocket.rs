//! WebSocket connector backed by `tokio-tungstenite`.
//!
//! Each call to [`WsConnector::open`] spawns a pump task that owns the
//! socket: it performs the handshake (bounded by the connect timeout),
//! forwards text frames as [`SocketEvent::Text`], writes [`Outbound`]
//! commands, and always finishes with exactly one [`SocketEvent::Closed`].

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{
    ABNORMAL_CLOSURE, Connector, NO_STATUS_RECEIVED, NORMAL_CLOSURE, Outbound, SocketEvent,
    SocketHandle,
};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Default timeout for the WebSocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the server to answer our close frame.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens real WebSocket connections.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    /// Create a connector with the given handshake timeout.
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Connector for WsConnector {
    fn open(&self, url: &Url) -> SocketHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(
            url.clone(),
            self.connect_timeout,
            outbound_rx,
            events_tx,
        ));
        SocketHandle {
            outbound: outbound_tx,
            events: events_rx,
        }
    }
}

/// What woke the pump loop.
enum Step {
    Command(Option<Outbound>),
    Incoming(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
}

async fn pump(
    url: Url,
    connect_timeout: Duration,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    let stream = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            tracing::warn!(host = ?url.host_str(), err = %e, "chat WebSocket connect failed");
            let _ = events.send(SocketEvent::Error(format!("connect failed: {e}")));
            let _ = events.send(SocketEvent::Closed {
                code: ABNORMAL_CLOSURE,
            });
            return;
        }
        Err(_) => {
            tracing::warn!(host = ?url.host_str(), "chat WebSocket connect timed out");
            let _ = events.send(SocketEvent::Error("connect timed out".to_string()));
            let _ = events.send(SocketEvent::Closed {
                code: ABNORMAL_CLOSURE,
            });
            return;
        }
    };

    tracing::debug!(host = ?url.host_str(), "chat WebSocket open");
    let _ = events.send(SocketEvent::Opened);
    let code = run_open(stream, &mut outbound, &events).await;
    let _ = events.send(SocketEvent::Closed { code });
    tracing::debug!(code, "chat WebSocket pump exiting");
}

/// Drive an open socket until it closes, returning the close code.
async fn run_open(
    stream: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    events: &mpsc::UnboundedSender<SocketEvent>,
) -> u16 {
    let (mut sink, mut reader) = stream.split();

    loop {
        let step = tokio::select! {
            cmd = outbound.recv() => Step::Command(cmd),
            msg = reader.next() => Step::Incoming(msg),
        };

        match step {
            Step::Command(Some(Outbound::Text(text))) => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    tracing::warn!(err = %e, "chat WebSocket send failed");
                    let _ = events.send(SocketEvent::Error(format!("send failed: {e}")));
                    return ABNORMAL_CLOSURE;
                }
            }
            Step::Command(Some(Outbound::Close { code })) => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: Utf8Bytes::from_static(""),
                };
                if sink.send(Message::Close(Some(frame))).await.is_err() {
                    return ABNORMAL_CLOSURE;
                }
                let _ = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
                    while let Some(Ok(msg)) = reader.next().await {
                        if msg.is_close() {
                            break;
                        }
                    }
                })
                .await;
                return code;
            }
            Step::Command(None) => {
                // Every handle dropped: close quietly.
                let _ = sink.close().await;
                return NORMAL_CLOSURE;
            }
            Step::Incoming(Some(Ok(Message::Text(text)))) => {
                if events.send(SocketEvent::Text(text.as_str().to_owned())).is_err() {
                    let _ = sink.close().await;
                    return NORMAL_CLOSURE;
                }
            }
            Step::Incoming(Some(Ok(Message::Close(frame)))) => {
                let code = frame.map_or(NO_STATUS_RECEIVED, |f| u16::from(f.code));
                tracing::info!(code, "chat WebSocket closed by server");
                return code;
            }
            Step::Incoming(Some(Ok(Message::Binary(_)))) => {
                tracing::debug!("ignoring binary frame");
            }
            Step::Incoming(Some(Ok(_))) => {
                // Ping/pong are answered by tungstenite.
            }
            Step::Incoming(Some(Err(e))) => {
                tracing::warn!(err = %e, "chat WebSocket read error");
                let _ = events.send(SocketEvent::Error(format!("read failed: {e}")));
                return ABNORMAL_CLOSURE;
            }
            Step::Incoming(None) => {
                tracing::info!("chat WebSocket stream ended without close frame");
                return ABNORMAL_CLOSURE;
            }
        }
    }
}
