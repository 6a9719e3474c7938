use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// How a connection establishes its session.
///
/// ```rust
/// use pgpoll::prelude::*;
///
/// let cfg = DriverConfig::new("host=localhost dbname=app", 4).with_warmup(ConnectMode::NonBlocking);
/// assert_eq!(cfg.warmup, ConnectMode::NonBlocking);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectMode {
    /// Wait for the handshake to finish before returning. Only meant for pool warm-up.
    #[default]
    Blocking,
    /// Start the handshake and let `poll` finish it.
    NonBlocking,
}

/// Signal returned by every `poll` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollStatus {
    /// Work is still outstanding; poll again on a later tick.
    Pending,
    /// A result is ready, or the connection is idle with nothing queued.
    Ready,
}

impl PollStatus {
    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }

    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Observable phase of a [`Connection`](crate::connection::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnState {
    /// No live session.
    Start,
    /// Handshake in progress.
    Connecting,
    /// Live session, nothing in flight.
    Connected,
    /// Query submitted, results draining.
    Query,
    /// A complete result is stored and unread.
    Result,
    /// A cancel request is in flight for a previous query.
    Cancel,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Start => "START",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Query => "QUERY",
            Self::Result => "RESULT",
            Self::Cancel => "CANCEL",
        };
        f.write_str(name)
    }
}
