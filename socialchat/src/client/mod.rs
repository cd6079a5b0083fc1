//! Chat connection manager and the conversation API used by UI code.
//!
//! [`ChatClient`] owns one logical WebSocket session at a time. It opens the
//! socket through a [`Connector`], files every inbound frame into its
//! [`MessageStore`](crate::store::MessageStore), and reconnects after an
//! unclean close for as long as the session token is retained.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──connect──▶ Connecting ──opened──▶ Open
//!                        │                   │
//!                        └──error/close──────┴──▶ Closed ──(delay, token kept,
//!                                                   ▲        code != 1000)──▶ Connecting
//!                                  disconnect ──────┘
//! ```
//!
//! Every socket is tagged with the generation of the `connect` that created
//! it. `disconnect` bumps the generation, so events from a retired socket are
//! ignored and can never schedule a reconnect.
//!
//! Failures never propagate to the caller as panics: sends report `false`,
//! the connection status is polled with [`ChatClient::is_connected`], and
//! the optional [`ClientEvent`] stream carries the details.

mod state;

pub use state::ConnectionState;

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

use socialchat_proto::frame::{self, FrameError, OutboundFrame};
use socialchat_proto::id::UserId;

use crate::config::ReconnectConfig;
use crate::history::{HistoryTracker, HistoryWindow};
use crate::store::Message;
use crate::transport::endpoint::{self, EndpointError};
use crate::transport::websocket::WsConnector;
use crate::transport::{ABNORMAL_CLOSURE, Connector, NORMAL_CLOSURE, Outbound, SocketEvent};

use state::{Link, Shared, Socket};

/// Errors returned by [`ChatClient::connect`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The token was empty.
    #[error("no session token supplied")]
    MissingToken,

    /// The WebSocket endpoint could not be derived from the configuration.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Why an outbound frame was not handed to the socket.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// No socket is open.
    #[error("socket is not open")]
    NotConnected,

    /// The frame could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(#[from] FrameError),

    /// The socket task exited before the frame could be queued.
    #[error("socket task has gone away")]
    SocketGone,
}

/// Notifications emitted by the [`ChatClient`] for UI consumption.
///
/// Delivery is best-effort: when the channel is full the event is dropped.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The socket opened.
    Connected,
    /// The socket closed.
    Disconnected {
        /// WebSocket close code.
        code: u16,
        /// When a reconnect is scheduled, the delay before it starts.
        retry_in: Option<Duration>,
    },
    /// The socket reported an error; a close follows.
    TransportFailed {
        /// Description of the failure.
        reason: String,
    },
    /// A frame was accepted into the message store.
    MessageReceived(Arc<Message>),
    /// A frame was discarded because it was malformed or untyped.
    FrameRejected {
        /// Description of the problem.
        reason: String,
    },
}

/// Static settings of a [`ChatClient`].
#[derive(Debug, Clone)]
pub struct ChatSettings {
    /// Backend origin the WebSocket URL is derived from.
    pub backend_origin: Option<String>,
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,
    /// Lifetime of history request markers; `None` keeps them for the
    /// whole session.
    pub history_marker_ttl: Option<Duration>,
    /// Capacity of the [`ClientEvent`] channel.
    pub event_buffer: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            backend_origin: None,
            reconnect: ReconnectConfig::default(),
            history_marker_ttl: None,
            event_buffer: 256,
        }
    }
}

/// Real-time chat session manager.
///
/// Cheap to clone; clones share the same connection and store.
pub struct ChatClient<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ChatClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C> {
    connector: C,
    settings: ChatSettings,
    shared: Mutex<Shared>,
    events: mpsc::Sender<ClientEvent>,
}

impl ChatClient<WsConnector> {
    /// Create a client that connects over real WebSockets.
    #[must_use]
    pub fn over_websocket(
        settings: ChatSettings,
        connect_timeout: Duration,
    ) -> (Self, mpsc::Receiver<ClientEvent>) {
        Self::new(WsConnector::new(connect_timeout), settings)
    }
}

impl<C: Connector> ChatClient<C> {
    /// Create an idle client.
    ///
    /// Returns the client and the receiver for its [`ClientEvent`]s.
    #[must_use]
    pub fn new(connector: C, settings: ChatSettings) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (events, rx) = mpsc::channel(settings.event_buffer.max(1));
        let shared = Shared::new(HistoryTracker::with_ttl(settings.history_marker_ttl));
        let inner = Inner {
            connector,
            settings,
            shared: Mutex::new(shared),
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().link.state()
    }

    /// Whether the socket is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Open a session with `token`.
    ///
    /// A no-op while a socket is already connecting or open. The token is
    /// retained for automatic reconnection until [`disconnect`](Self::disconnect).
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`ConnectError::MissingToken`] if `token` is blank.
    /// - [`ConnectError::Endpoint`] if no usable backend origin is configured.
    ///
    /// In both cases nothing is attempted and the state is unchanged.
    pub fn connect(&self, token: &str) -> Result<(), ConnectError> {
        if token.trim().is_empty() {
            tracing::warn!("connect called without a token");
            return Err(ConnectError::MissingToken);
        }
        let url = endpoint::websocket_url(self.inner.settings.backend_origin.as_deref(), token)
            .inspect_err(|e| tracing::warn!(err = %e, "cannot build chat endpoint"))?;

        let mut shared = self.inner.shared.lock();
        if matches!(shared.link, Link::Connecting(_) | Link::Open(_)) {
            tracing::debug!(state = ?shared.link.state(), "connect ignored, socket already active");
            return Ok(());
        }
        self.inner.open_socket(&mut shared, token.to_string(), &url);
        Ok(())
    }

    /// Close the session with the normal-closure code and forget the token,
    /// which suppresses any reconnect. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let had_socket = {
            let mut shared = self.inner.shared.lock();
            shared.token = None;
            shared.attempts = 0;
            shared.cancel_reconnect();
            shared.generation += 1;
            match std::mem::replace(&mut shared.link, Link::Closed) {
                Link::Connecting(socket) | Link::Open(socket) => {
                    let _ = socket.outbound.send(Outbound::Close {
                        code: NORMAL_CLOSURE,
                    });
                    true
                }
                Link::Idle => {
                    shared.link = Link::Idle;
                    false
                }
                Link::Closed => false,
            }
        };

        if had_socket {
            tracing::info!("disconnected from chat backend");
            self.inner.emit(ClientEvent::Disconnected {
                code: NORMAL_CLOSURE,
                retry_in: None,
            });
        }
    }

    /// Disconnect and reset everything tied to the logged-in user: history
    /// markers and stored messages.
    pub fn logout(&self) {
        self.disconnect();
        let mut shared = self.inner.shared.lock();
        shared.history.clear();
        shared.store.clear();
        tracing::info!("chat session reset");
    }

    /// Send a frame over the open socket.
    ///
    /// Returns `false` (and logs) when no socket is open.
    pub fn send_message(&self, frame: &OutboundFrame) -> bool {
        let shared = self.inner.shared.lock();
        delivered(dispatch(&shared.link, frame))
    }

    /// Send a text message to `receiver`.
    ///
    /// Returns `false` when not connected; UI code should surface that to
    /// the user.
    pub fn send_text_message(&self, receiver: &UserId, content: &str) -> bool {
        if receiver.is_blank() {
            tracing::warn!("refusing to send a message without a receiver");
            return false;
        }
        self.send_message(&OutboundFrame::Send {
            receiver_id: receiver.clone(),
            content: content.to_string(),
        })
    }

    /// Ask the backend to replay one page of the conversation with `peer`.
    ///
    /// Returns `true` without sending anything when the same
    /// `(peer, page, page_size)` window was already requested. Otherwise,
    /// when `me` is given, the stored conversation is cleared first so the
    /// replay does not duplicate it; the window is then recorded and the
    /// request sent.
    ///
    /// # Returns
    ///
    /// - `true` if the request was queued on the open socket, or the window
    ///   had already been requested.
    /// - `false` if the socket is not open. The window is then left
    ///   unrequested, so calling again repeats the request (after any
    ///   clearing) instead of returning `true`. Retry once connected.
    pub fn get_message_history(
        &self,
        peer: &UserId,
        page: u32,
        page_size: u32,
        me: Option<&UserId>,
    ) -> bool {
        let window = HistoryWindow::new(peer.clone(), page, page_size);
        let now = Instant::now();
        let mut shared = self.inner.shared.lock();

        if shared.history.is_loaded(&window, now) {
            tracing::debug!(peer = %peer, page, page_size, "history window already requested");
            return true;
        }

        if let Some(me) = me {
            let removed = shared.store.clear_conversation(Some(peer), Some(me));
            tracing::debug!(peer = %peer, removed, "cleared conversation before history load");
        }
        shared.history.mark_loaded(window.clone(), now);

        let frame = OutboundFrame::GetHistory {
            receiver_id: peer.clone(),
            page,
            page_size,
        };
        let result = dispatch(&shared.link, &frame);
        if result.is_err() {
            shared.history.forget(&window);
        }
        delivered(result)
    }

    /// Text messages between `peer` and `me`, oldest first.
    ///
    /// Empty when either ID is missing.
    #[must_use]
    pub fn get_conversation_messages(
        &self,
        peer: Option<&UserId>,
        me: Option<&UserId>,
    ) -> Vec<Arc<Message>> {
        self.inner.shared.lock().store.conversation(peer, me)
    }

    /// Remove every stored text message between `peer` and `me`.
    pub fn clear_conversation_messages(&self, peer: Option<&UserId>, me: Option<&UserId>) {
        let removed = self
            .inner
            .shared
            .lock()
            .store
            .clear_conversation(peer, me);
        tracing::debug!(removed, "conversation cleared");
    }

    /// Forget every requested history window.
    pub fn clear_loaded_conversations(&self) {
        self.inner.shared.lock().history.clear();
    }

    /// Number of messages in the store, of any type.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.inner.shared.lock().store.len()
    }
}

impl<C: Connector> Inner<C> {
    /// Replace the current link with a fresh socket. Caller holds the lock.
    fn open_socket(self: &Arc<Self>, shared: &mut Shared, token: String, url: &Url) {
        shared.cancel_reconnect();
        shared.generation += 1;
        let generation = shared.generation;
        shared.token = Some(token);

        let handle = self.connector.open(url);
        shared.link = Link::Connecting(Socket {
            generation,
            outbound: handle.outbound,
        });
        tracing::info!(generation, host = ?url.host_str(), "connecting to chat backend");

        tokio::spawn(Arc::clone(self).drive(generation, handle.events));
    }

    /// Feed socket events into the state machine until the socket closes.
    async fn drive(
        self: Arc<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<SocketEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if self.on_socket_event(generation, event).is_break() {
                return;
            }
        }
        // The socket vanished without reporting a close.
        self.on_closed(generation, ABNORMAL_CLOSURE);
    }

    fn on_socket_event(self: &Arc<Self>, generation: u64, event: SocketEvent) -> ControlFlow<()> {
        match event {
            SocketEvent::Opened => self.on_opened(generation),
            SocketEvent::Text(text) => self.on_text(generation, &text),
            SocketEvent::Error(reason) => self.on_error(generation, reason),
            SocketEvent::Closed { code } => {
                self.on_closed(generation, code);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn on_opened(&self, generation: u64) {
        let opened = {
            let mut shared = self.shared.lock();
            match std::mem::replace(&mut shared.link, Link::Closed) {
                Link::Connecting(socket) if socket.generation == generation => {
                    shared.link = Link::Open(socket);
                    shared.attempts = 0;
                    true
                }
                other => {
                    shared.link = other;
                    false
                }
            }
        };

        if opened {
            tracing::info!(generation, "chat socket open");
            self.emit(ClientEvent::Connected);
        }
    }

    fn on_text(&self, generation: u64, text: &str) {
        let result = {
            let mut shared = self.shared.lock();
            if shared.link.socket(generation).is_none() {
                tracing::debug!(generation, "dropping frame from a retired socket");
                return;
            }
            shared.store.ingest(text, Utc::now())
        };

        match result {
            Ok(message) => self.emit(ClientEvent::MessageReceived(message)),
            Err(e) => {
                tracing::warn!(err = %e, "discarding inbound frame");
                self.emit(ClientEvent::FrameRejected {
                    reason: e.to_string(),
                });
            }
        }
    }

    /// An error closes the link but leaves reconnection to the close event.
    fn on_error(&self, generation: u64, reason: String) {
        {
            let mut shared = self.shared.lock();
            if shared.link.socket(generation).is_none() {
                tracing::debug!(generation, reason = %reason, "error from a retired socket");
                return;
            }
            shared.link = Link::Closed;
        }
        tracing::warn!(generation, reason = %reason, "chat socket error");
        self.emit(ClientEvent::TransportFailed { reason });
    }

    fn on_closed(self: &Arc<Self>, generation: u64, code: u16) {
        let retry_in = {
            let mut shared = self.shared.lock();
            if shared.generation != generation {
                tracing::debug!(generation, code, "ignoring close of a retired socket");
                return;
            }
            shared.link = Link::Closed;

            if code == NORMAL_CLOSURE || shared.token.is_none() {
                None
            } else {
                shared.attempts = shared.attempts.saturating_add(1);
                let delay = self.settings.reconnect.delay_for(shared.attempts);
                match delay {
                    Some(delay) => self.schedule_reconnect(&mut shared, generation, delay),
                    None => tracing::warn!(
                        attempts = shared.attempts,
                        "reconnect attempts exhausted, staying offline"
                    ),
                }
                delay
            }
        };

        tracing::info!(generation, code, ?retry_in, "chat socket closed");
        self.emit(ClientEvent::Disconnected { code, retry_in });
    }

    fn schedule_reconnect(self: &Arc<Self>, shared: &mut Shared, generation: u64, delay: Duration) {
        shared.cancel_reconnect();
        let inner = Arc::clone(self);
        shared.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.reconnect(generation);
        }));
    }

    fn reconnect(self: &Arc<Self>, generation: u64) {
        let mut shared = self.shared.lock();
        // Our own handle; dropping it detaches rather than aborts.
        shared.reconnect_timer = None;

        if shared.generation != generation || !matches!(shared.link, Link::Closed) {
            tracing::debug!(generation, "reconnect superseded");
            return;
        }
        let Some(token) = shared.token.clone() else {
            tracing::debug!("token cleared, not reconnecting");
            return;
        };

        match endpoint::websocket_url(self.settings.backend_origin.as_deref(), &token) {
            Ok(url) => {
                tracing::info!(attempt = shared.attempts, "reconnecting to chat backend");
                self.open_socket(&mut shared, token, &url);
            }
            Err(e) => tracing::warn!(err = %e, "cannot rebuild chat endpoint"),
        }
    }

    fn emit(&self, event: ClientEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            tracing::debug!(?event, "client event channel full, dropping event");
        }
    }
}

/// Queue `frame` on the open socket.
fn dispatch(link: &Link, frame: &OutboundFrame) -> Result<(), SendError> {
    let Link::Open(socket) = link else {
        return Err(SendError::NotConnected);
    };
    let text = frame::encode(frame)?;
    socket
        .outbound
        .send(Outbound::Text(text))
        .map_err(|_| SendError::SocketGone)
}

fn delivered(result: Result<(), SendError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(err = %e, "outbound frame not sent");
            false
        }
    }
}
