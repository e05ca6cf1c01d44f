use chrono::Utc;
use std::{
    io::{self, Cursor},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::watch,
    time::timeout,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dashboard::{Dashboard, StatusEntry};
use crate::event::{ConnectEvent, ConnectStatus, DisconnectEvent, Event, EventEmitter, Role};
use crate::listener::{ClientConn, ProxyListener, resolve_client};
use crate::security::AdmissionFilter;

pub const BUFFER_SIZE: usize = 32 * 1024;
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// How one direction of a session stopped.
#[derive(Debug)]
pub enum TransferEnd {
    /// The source reached end of stream.
    Eof,
    /// The session was torn down because the other direction finished.
    ClosedLocally,
    /// The peer or the network failed.
    Failed(io::Error),
}

impl TransferEnd {
    /// Error text for the transfer record. Local teardown is not an error.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        match self {
            Self::Eof | Self::ClosedLocally => None,
            Self::Failed(e) => Some(e.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct Transfer {
    pub bytes: u64,
    pub end: TransferEnd,
}

/// Copies `reader` into `writer` until end of stream, an I/O error, or until
/// `closed` turns true.
pub async fn pipe<R, W>(mut reader: R, mut writer: W, closed: &mut watch::Receiver<bool>) -> Transfer
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes = 0u64;

    let end = 'copy: loop {
        let n = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => break TransferEnd::ClosedLocally,
            result = reader.read(&mut buffer) => match result {
                Ok(0) => break TransferEnd::Eof,
                Ok(n) => n,
                Err(e) => break TransferEnd::Failed(e),
            },
        };

        // Count each partial write so a teardown mid-chunk reports what was sent.
        let mut written = 0;
        while written < n {
            let result = tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => break 'copy TransferEnd::ClosedLocally,
                result = writer.write(&buffer[written..n]) => result,
            };
            match result {
                Ok(0) => break 'copy TransferEnd::Failed(io::ErrorKind::WriteZero.into()),
                Ok(m) => {
                    written += m;
                    bytes += m as u64;
                }
                Err(e) => break 'copy TransferEnd::Failed(e),
            }
        }
    };

    Transfer { bytes, end }
}

/// Shared state of one connected session, owned by its two transfer tasks.
struct Session {
    id: Uuid,
    client_addr: SocketAddr,
    proxy_addr: SocketAddr,
    upstream_addr: SocketAddr,
    started: Instant,
    closed: watch::Sender<bool>,
    dashboard: Arc<Dashboard>,
    emitter: Arc<EventEmitter>,
}

impl Session {
    /// Deregisters the session and signals both directions to stop.
    /// Safe to call from either direction any number of times.
    fn terminate(&self) {
        if self.dashboard.remove(&self.id) {
            debug!(id = %self.id, "Session terminated");
        }
        self.closed.send_replace(true);
    }

    async fn relay<R, W>(self: Arc<Self>, src: Role, reader: R, writer: W)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut closed = self.closed.subscribe();
        let transfer = pipe(reader, writer, &mut closed).await;
        self.terminate();

        if let TransferEnd::Failed(ref e) = transfer.end {
            debug!(id = %self.id, src = %src, error = %e, "Transfer failed");
        }
        let event = Event::Disconnect(DisconnectEvent {
            id: self.id,
            client_addr: self.client_addr,
            proxy_addr: self.proxy_addr,
            upstream_addr: self.upstream_addr,
            src,
            dest: src.peer(),
            bytes: transfer.bytes,
            duration: self.started.elapsed().as_secs_f64(),
            error: transfer.end.error(),
        });
        if let Err(e) = self.emitter.emit(&event) {
            warn!(id = %self.id, error = %e, "Failed to write disconnect event");
        }
    }
}

/// Final state reached by [`Relay::handle_connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Excluded by the admission filter; nothing was emitted.
    Rejected,
    UpstreamFailed(Uuid),
    /// Relayed until one direction finished.
    Closed(Uuid),
}

/// The relay engine. One instance serves every accepted connection.
pub struct Relay {
    upstream_addr: String,
    upstream_timeout: Duration,
    filter: AdmissionFilter,
    dashboard: Arc<Dashboard>,
    emitter: Arc<EventEmitter>,
}

impl Relay {
    pub fn new(
        upstream_addr: impl Into<String>,
        upstream_timeout: Duration,
        filter: AdmissionFilter,
        dashboard: Arc<Dashboard>,
        emitter: Arc<EventEmitter>,
    ) -> Self {
        Self {
            upstream_addr: upstream_addr.into(),
            upstream_timeout,
            filter,
            dashboard,
            emitter,
        }
    }

    fn emit(&self, event: &Event) {
        if let Err(e) = self.emitter.emit(event) {
            warn!(error = %e, "Failed to write event");
        }
    }

    async fn dial<F>(&self, connect: F) -> io::Result<(TcpStream, SocketAddr, SocketAddr)>
    where
        F: Future<Output = io::Result<TcpStream>>,
    {
        let stream = timeout(self.upstream_timeout, connect)
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dial timed out after {:?}", self.upstream_timeout),
                )
            })??;
        let _ = stream.set_nodelay(true);
        let proxy_addr = stream.local_addr()?;
        let upstream_addr = stream.peer_addr()?;
        Ok((stream, proxy_addr, upstream_addr))
    }

    /// Runs one session to termination: admit, dial, register, relay.
    ///
    /// Returns once either direction finishes. The other direction unwinds on its
    /// own and still reports its transfer.
    #[tracing::instrument(skip_all, fields(client_addr = %conn.client_addr))]
    pub async fn handle_connection(&self, conn: ClientConn) -> SessionOutcome {
        self.run_session(conn, TcpStream::connect(&self.upstream_addr))
            .await
    }

    /// Session body with the upstream connect future supplied by the caller.
    /// The future is only polled once the client has been admitted.
    async fn run_session<F>(&self, conn: ClientConn, connect: F) -> SessionOutcome
    where
        F: Future<Output = io::Result<TcpStream>>,
    {
        let started = Instant::now();
        let client_at = Utc::now();
        let client_addr = conn.client_addr;

        if self.filter.is_ignored(client_addr.ip()) {
            debug!("Ignoring client inside excluded network");
            return SessionOutcome::Rejected;
        }

        let id = Uuid::new_v4();
        debug!(id = %id, upstream = %self.upstream_addr, "Dialing upstream");

        let (upstream, proxy_addr, upstream_addr) = match self.dial(connect).await {
            Ok(dialed) => dialed,
            Err(e) => {
                error!(id = %id, upstream = %self.upstream_addr, error = %e, "Couldn't dial upstream");
                self.emit(&Event::Connect(ConnectEvent {
                    id,
                    status: ConnectStatus::UpstreamFailed,
                    client_addr,
                    proxy_addr: None,
                    upstream_addr: self.upstream_addr.clone(),
                    client_at,
                    upstream_at: None,
                    error: Some(e.to_string()),
                }));
                return SessionOutcome::UpstreamFailed(id);
            }
        };
        let upstream_at = Utc::now();

        self.emit(&Event::Connect(ConnectEvent {
            id,
            status: ConnectStatus::Connected,
            client_addr,
            proxy_addr: Some(proxy_addr),
            upstream_addr: upstream_addr.to_string(),
            client_at,
            upstream_at: Some(upstream_at),
            error: None,
        }));
        self.dashboard.post(StatusEntry {
            id,
            client_addr,
            proxy_addr,
            upstream_addr,
            client_at,
            upstream_at,
        });

        let (closed, _) = watch::channel(false);
        let session = Arc::new(Session {
            id,
            client_addr,
            proxy_addr,
            upstream_addr,
            started,
            closed,
            dashboard: self.dashboard.clone(),
            emitter: self.emitter.clone(),
        });

        let _ = conn.stream.set_nodelay(true);
        let (client_read, client_write) = conn.stream.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();
        let client_read = Cursor::new(conn.preread).chain(client_read);

        let mut outbound = tokio::spawn(session.clone().relay(
            Role::Client,
            client_read,
            upstream_write,
        ));
        let mut inbound = tokio::spawn(session.clone().relay(
            Role::Upstream,
            upstream_read,
            client_write,
        ));

        tokio::select! {
            _ = &mut outbound => {},
            _ = &mut inbound => {},
        }
        session.terminate();

        SessionOutcome::Closed(id)
    }
}

/// Accepts connections forever, running each session on its own task.
/// Accept errors are logged and never stop the loop.
pub async fn serve(listener: ProxyListener, relay: Arc<Relay>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Accept error");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        let relay = relay.clone();
        let header_timeout = listener.header_timeout();
        tokio::spawn(async move {
            match resolve_client(stream, peer_addr, header_timeout).await {
                Ok(conn) => {
                    relay.handle_connection(conn).await;
                }
                Err(e) => {
                    warn!(peer_addr = %peer_addr, error = %e, "Dropping connection");
                }
            }
        });
    }
}

/// Logs the relay setup once at startup.
pub fn log_startup(listen_addr: SocketAddr, upstream_addr: &str, filter: &AdmissionFilter) {
    info!(upstream_addr = %upstream_addr, "Upstream");
    info!(listen_addr = %listen_addr, "Listening");
    if let Some(net) = filter.ignored_net() {
        info!(ignore = %net, "Ignoring clients in network");
    }
}
