//! Deduplication of history page requests.
//!
//! The backend answers a `gethistory` command by replaying messages over the
//! socket, with nothing correlating them to the request. Asking twice for
//! the same window would therefore insert the same history twice, so each
//! requested `(peer, page, page_size)` window is remembered until the
//! session resets or, when configured, until the marker expires.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use socialchat_proto::id::UserId;

/// One requested page of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HistoryWindow {
    /// The other participant.
    pub peer: UserId,
    /// One-based page number.
    pub page: u32,
    /// Messages per page.
    pub page_size: u32,
}

impl HistoryWindow {
    /// Creates a window key.
    #[must_use]
    pub const fn new(peer: UserId, page: u32, page_size: u32) -> Self {
        Self {
            peer,
            page,
            page_size,
        }
    }
}

/// Remembers which history windows were already requested.
#[derive(Debug, Default)]
pub struct HistoryTracker {
    /// When each window was requested.
    requested: HashMap<HistoryWindow, Instant>,
    /// Markers older than this stop deduplicating. `None` keeps them forever.
    ttl: Option<Duration>,
}

impl HistoryTracker {
    /// Creates a tracker whose markers never expire.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracker whose markers expire after `ttl`.
    #[must_use]
    pub fn with_ttl(ttl: Option<Duration>) -> Self {
        Self {
            requested: HashMap::new(),
            ttl,
        }
    }

    /// Whether `window` was requested and its marker is still live at `now`.
    #[must_use]
    pub fn is_loaded(&self, window: &HistoryWindow, now: Instant) -> bool {
        self.requested.get(window).is_some_and(|at| match self.ttl {
            Some(ttl) => now.saturating_duration_since(*at) < ttl,
            None => true,
        })
    }

    /// Record `window` as requested at `now`.
    pub fn mark_loaded(&mut self, window: HistoryWindow, now: Instant) {
        self.requested.insert(window, now);
    }

    /// Drop the marker for `window`.
    pub fn forget(&mut self, window: &HistoryWindow) {
        self.requested.remove(window);
    }

    /// Drop every marker.
    pub fn clear(&mut self) {
        self.requested.clear();
    }

    /// Number of markers held, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requested.len()
    }

    /// Whether no markers are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requested.is_empty()
    }
}
