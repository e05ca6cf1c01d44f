//! Structured lifecycle events written to the shared event stream.
//!
//! Every event is serialized as one JSON object on its own line. The record carries
//! a `type` tag naming its shape and the `time` at which it was emitted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    fmt,
    io::{self, Write},
    net::SocketAddr,
    sync::{Mutex, PoisonError},
};
use uuid::Uuid;

/// Outcome of the upstream dial, carried by a connect event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectStatus {
    Connected,
    UpstreamFailed,
}

/// Which side of a session a transfer reads from or writes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Upstream,
}

impl Role {
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::Client => Self::Upstream,
            Self::Upstream => Self::Client,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Upstream => f.write_str("upstream"),
        }
    }
}

/// Emitted once per admitted session, right after the upstream dial settles.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectEvent {
    pub id: Uuid,
    pub status: ConnectStatus,
    pub client_addr: SocketAddr,
    /// Local address of the upstream socket; absent when the dial failed.
    pub proxy_addr: Option<SocketAddr>,
    /// Resolved peer address after a successful dial, the configured address otherwise.
    pub upstream_addr: String,
    pub client_at: DateTime<Utc>,
    pub upstream_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Transfer record: one per direction per connected session.
#[derive(Clone, Debug, Serialize)]
pub struct DisconnectEvent {
    pub id: Uuid,
    pub client_addr: SocketAddr,
    pub proxy_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub src: Role,
    pub dest: Role,
    pub bytes: u64,
    /// Seconds since the client connection was accepted.
    pub duration: f64,
    pub error: Option<String>,
}

/// Point-in-time view of a live session, produced by the periodic reporter.
#[derive(Clone, Debug, Serialize)]
pub struct StatusEvent {
    pub id: Uuid,
    pub client_addr: SocketAddr,
    pub proxy_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub client_at: DateTime<Utc>,
    pub upstream_at: DateTime<Utc>,
    pub duration: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SummaryEvent {
    pub connections: usize,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Connect(ConnectEvent),
    Disconnect(DisconnectEvent),
    Status(StatusEvent),
    Summary(SummaryEvent),
}

#[derive(Serialize)]
struct Record<'a> {
    #[serde(flatten)]
    event: &'a Event,
    time: DateTime<Utc>,
}

/// Elapsed seconds between two wall-clock instants, clamped at zero.
#[must_use]
pub fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).to_std().map_or(0.0, |elapsed| elapsed.as_secs_f64())
}

/// Line-delimited JSON writer shared by every session and the reporter.
///
/// Each call writes one complete record under the lock, so concurrent emitters
/// never interleave partial lines.
pub struct EventEmitter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl EventEmitter {
    pub fn new<W: Write + Send + 'static>(out: W) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }

    #[must_use]
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn emit(&self, event: &Event) -> io::Result<()> {
        self.emit_at(event, Utc::now())
    }

    /// Emits with an explicit timestamp, used when a field of the event was
    /// derived from the same instant.
    pub fn emit_at(&self, event: &Event, time: DateTime<Utc>) -> io::Result<()> {
        let mut line = serde_json::to_vec(&Record { event, time })?;
        line.push(b'\n');

        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(&line)?;
        out.flush()
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter").finish_non_exhaustive()
    }
}
