//! Socket layer for the chat client.
//!
//! A [`Connector`] turns an endpoint URL into a [`SocketHandle`]: an outbound
//! command channel plus a stream of [`SocketEvent`]s that mirrors the
//! browser WebSocket callbacks (open, message, error, close). The client
//! state machine only ever talks to this handle, so the same logic runs over
//! a real socket or an in-process loopback.
//!
//! Implementations:
//! - [`websocket::WsConnector`]: `tokio-tungstenite` client socket
//! - [`loopback::LoopbackConnector`]: channel-backed socket for tests

pub mod endpoint;
pub mod loopback;
pub mod websocket;

use std::sync::Arc;

use tokio::sync::mpsc;
use url::Url;

/// Close code for a normal, intentional closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when the connection dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code reported when the peer sent a close frame without a status.
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// Lifecycle and data events produced by an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// The handshake completed; frames can now be sent.
    Opened,
    /// A text frame arrived.
    Text(String),
    /// The socket failed. A [`SocketEvent::Closed`] always follows.
    Error(String),
    /// The socket is closed. No further events are produced.
    Closed {
        /// WebSocket close code.
        code: u16,
    },
}

/// Commands accepted by an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Transmit a text frame.
    Text(String),
    /// Start the closing handshake with the given code.
    Close {
        /// WebSocket close code.
        code: u16,
    },
}

/// Both ends of a socket as seen by the client.
///
/// Dropping `outbound` closes the socket with [`NORMAL_CLOSURE`].
#[derive(Debug)]
pub struct SocketHandle {
    /// Commands toward the socket.
    pub outbound: mpsc::UnboundedSender<Outbound>,
    /// Events from the socket.
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Opens sockets to the chat backend.
///
/// `open` must not block: the connection is established in the background
/// and reported through [`SocketEvent::Opened`] or
/// [`SocketEvent::Error`] + [`SocketEvent::Closed`]. Implementations may
/// spawn tokio tasks, so `open` must be called inside a runtime.
pub trait Connector: Send + Sync + 'static {
    /// Begin connecting to `url`.
    fn open(&self, url: &Url) -> SocketHandle;
}

impl<C: Connector + ?Sized> Connector for Arc<C> {
    fn open(&self, url: &Url) -> SocketHandle {
        (**self).open(url)
    }
}
