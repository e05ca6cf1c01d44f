use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::{Event, EventEmitter, StatusEvent, SummaryEvent, seconds_between};

pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Identifying and timing fields of a connected session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusEntry {
    pub id: Uuid,
    pub client_addr: SocketAddr,
    pub proxy_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub client_at: DateTime<Utc>,
    pub upstream_at: DateTime<Utc>,
}

impl StatusEntry {
    #[must_use]
    pub fn status_at(&self, now: DateTime<Utc>) -> StatusEvent {
        StatusEvent {
            id: self.id,
            client_addr: self.client_addr,
            proxy_addr: self.proxy_addr,
            upstream_addr: self.upstream_addr,
            client_at: self.client_at,
            upstream_at: self.upstream_at,
            duration: seconds_between(self.client_at, now),
        }
    }
}

/// Registry of the sessions that are live right now.
///
/// Keys are exactly the ids of sessions between their `connected` event and
/// their teardown. One lock guards the map for sessions and the reporter alike.
#[derive(Debug, Default)]
pub struct Dashboard {
    entries: Mutex<HashMap<Uuid, StatusEntry>>,
}

impl Dashboard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, StatusEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or overwrites the entry for `entry.id`.
    pub fn post(&self, entry: StatusEntry) {
        self.lock().insert(entry.id, entry);
    }

    /// Removes the entry for `id`. Returns false if it was already gone.
    pub fn remove(&self, id: &Uuid) -> bool {
        self.lock().remove(id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copies out every live entry, in no particular order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<StatusEntry> {
        self.lock().values().cloned().collect()
    }

    /// Emits one summary event followed by one status event per live session.
    ///
    /// The lock is held while emitting so the batch reflects a single instant;
    /// registrations wait for the batch to finish.
    pub fn report(&self, emitter: &EventEmitter) -> io::Result<()> {
        let entries = self.lock();
        emitter.emit(&Event::Summary(SummaryEvent {
            connections: entries.len(),
        }))?;
        for entry in entries.values() {
            let now = Utc::now();
            emitter.emit_at(&Event::Status(entry.status_at(now)), now)?;
        }
        Ok(())
    }
}

/// Reports the dashboard every `period` for the lifetime of the process.
/// The first report fires one full period after start.
pub async fn run_reporter(dashboard: Arc<Dashboard>, emitter: Arc<EventEmitter>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        debug!(connections = dashboard.len(), "Reporting live sessions");
        if let Err(e) = dashboard.report(&emitter) {
            warn!(error = %e, "Failed to write status report");
        }
    }
}
