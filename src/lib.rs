//! PROXY Protocol TCP Relay
//!
//! Accepts TCP connections that may carry a PROXY protocol header, relays them to a
//! single upstream, and writes connection lifecycle events to stdout as JSON lines.
//! Clients inside an optional CIDR are dropped before the upstream is dialed.

pub mod config;
pub mod dashboard;
pub mod event;
pub mod listener;
pub mod proxy;
pub mod security;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used types and functions
pub use config::{Args, Config, FileConfig, load_config};
pub use dashboard::{Dashboard, StatusEntry, run_reporter};
pub use event::{Event, EventEmitter, Role};
pub use listener::{ClientConn, ProxyListener, resolve_client};
pub use proxy::{BUFFER_SIZE, Relay, SessionOutcome, Transfer, TransferEnd, pipe, serve};
pub use security::AdmissionFilter;
