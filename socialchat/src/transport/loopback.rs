//! Loopback connector for testing.
//!
//! [`LoopbackConnector::new`] returns the connector plus a receiver of
//! [`RemoteSocket`]s, one per `open` call. The test holds the remote end and
//! plays the backend: it opens, pushes frames, fails or closes the socket,
//! and reads what the client sent.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use url::Url;

use super::{Connector, Outbound, SocketEvent, SocketHandle};

/// In-process connector backed by `tokio::sync::mpsc` channels.
#[derive(Debug)]
pub struct LoopbackConnector {
    remotes: mpsc::UnboundedSender<RemoteSocket>,
    opened: AtomicUsize,
}

impl LoopbackConnector {
    /// Create a connector and the receiver of the remote ends it hands out.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteSocket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            remotes: tx,
            opened: AtomicUsize::new(0),
        };
        (connector, rx)
    }

    /// Number of sockets opened so far.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl Connector for LoopbackConnector {
    fn open(&self, url: &Url) -> SocketHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.opened.fetch_add(1, Ordering::SeqCst);

        let remote = RemoteSocket {
            url: url.clone(),
            events: events_tx,
            outbound: outbound_rx,
        };
        if self.remotes.send(remote).is_err() {
            tracing::debug!("loopback remote receiver dropped");
        }

        SocketHandle {
            outbound: outbound_tx,
            events: events_rx,
        }
    }
}

/// The backend side of a loopback socket.
#[derive(Debug)]
pub struct RemoteSocket {
    url: Url,
    events: mpsc::UnboundedSender<SocketEvent>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl RemoteSocket {
    /// URL the client asked for.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Complete the handshake.
    pub fn open(&self) {
        let _ = self.events.send(SocketEvent::Opened);
    }

    /// Deliver a text frame to the client.
    pub fn push_text(&self, text: impl Into<String>) {
        let _ = self.events.send(SocketEvent::Text(text.into()));
    }

    /// Report a socket error to the client.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.events.send(SocketEvent::Error(reason.into()));
    }

    /// Close the socket with `code`.
    pub fn close(&self, code: u16) {
        let _ = self.events.send(SocketEvent::Closed { code });
    }

    /// Wait for the next command the client sent.
    pub async fn next_outbound(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// Take the next command the client sent, if one is queued.
    pub fn try_next_outbound(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }

    /// Drain every queued text frame the client sent.
    pub fn sent_texts(&mut self) -> Vec<String> {
        let mut texts = Vec::new();
        while let Ok(cmd) = self.outbound.try_recv() {
            if let Outbound::Text(text) = cmd {
                texts.push(text);
            }
        }
        texts
    }
}
