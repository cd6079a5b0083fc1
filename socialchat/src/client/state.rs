//! Connection state owned by [`super::ChatClient`].

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::history::HistoryTracker;
use crate::store::MessageStore;
use crate::transport::Outbound;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection has been attempted yet.
    Idle,
    /// A socket exists but the handshake has not completed.
    Connecting,
    /// The socket is open; frames can be sent.
    Open,
    /// The last socket closed or failed.
    Closed,
}

/// The client's end of one socket.
#[derive(Debug)]
pub(crate) struct Socket {
    /// Which `connect` produced this socket.
    pub(crate) generation: u64,
    /// Commands toward the socket.
    pub(crate) outbound: mpsc::UnboundedSender<Outbound>,
}

/// Connection state with the socket handle carried by the states that own
/// one, so sending without an open socket cannot be expressed.
#[derive(Debug)]
pub(crate) enum Link {
    Idle,
    Connecting(Socket),
    Open(Socket),
    Closed,
}

impl Link {
    pub(crate) const fn state(&self) -> ConnectionState {
        match self {
            Self::Idle => ConnectionState::Idle,
            Self::Connecting(_) => ConnectionState::Connecting,
            Self::Open(_) => ConnectionState::Open,
            Self::Closed => ConnectionState::Closed,
        }
    }

    /// The socket, if it belongs to `generation`.
    pub(crate) fn socket(&self, generation: u64) -> Option<&Socket> {
        match self {
            Self::Connecting(socket) | Self::Open(socket) if socket.generation == generation => {
                Some(socket)
            }
            _ => None,
        }
    }
}

/// Everything behind the client's lock.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) link: Link,
    /// Token of the current session; `None` after `disconnect`.
    pub(crate) token: Option<String>,
    /// Generation of the most recent `connect` or `disconnect`. Socket
    /// events tagged with an older generation are ignored.
    pub(crate) generation: u64,
    /// Consecutive reconnect attempts since the last successful open.
    pub(crate) attempts: u32,
    pub(crate) reconnect_timer: Option<JoinHandle<()>>,
    pub(crate) store: MessageStore,
    pub(crate) history: HistoryTracker,
}

impl Shared {
    pub(crate) fn new(history: HistoryTracker) -> Self {
        Self {
            link: Link::Idle,
            token: None,
            generation: 0,
            attempts: 0,
            reconnect_timer: None,
            store: MessageStore::new(),
            history,
        }
    }

    pub(crate) fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }
}
