//! Accepts TCP connections and strips an optional PROXY protocol preamble.
//!
//! Both v1 (text) and v2 (binary) headers are recognised. The header is read
//! inside the per-connection task, so a slow client never stalls `accept`.

use anyhow::{Context, Result};
use proxy_header::{Error as HeaderError, ParseConfig, ProxyHeader};
use std::{io, net::SocketAddr, time::Duration};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream, ToSocketAddrs},
    time::timeout,
};
use tracing::debug;

pub const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the bytes buffered while looking for the end of a header:
/// a v2 header is 16 fixed bytes plus a `u16` length of addresses and TLVs.
pub const MAX_HEADER_LEN: usize = 16 + u16::MAX as usize;

const V1_PREFIX: &[u8] = b"PROXY ";
const V2_SIGNATURE: &[u8] = b"\r\n\r\n\0\r\nQUIT\n";

/// A client connection with its PROXY header consumed.
#[derive(Debug)]
pub struct ClientConn {
    pub stream: TcpStream,
    /// Original client address from the header, or the socket peer without one.
    pub client_addr: SocketAddr,
    /// Application bytes read past the header; they belong to the client stream.
    pub preread: Vec<u8>,
}

pub struct ProxyListener {
    inner: TcpListener,
    header_timeout: Duration,
}

impl ProxyListener {
    pub async fn bind<A: ToSocketAddrs + std::fmt::Display>(
        addr: A,
        header_timeout: Duration,
    ) -> Result<Self> {
        let inner = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to address {addr}"))?;
        Ok(Self {
            inner,
            header_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    #[must_use]
    pub fn header_timeout(&self) -> Duration {
        self.header_timeout
    }

    /// Accepts the next raw socket. Pass it to [`resolve_client`] before relaying.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept().await
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Preamble {
    Absent,
    Incomplete,
    Present,
}

fn classify(buf: &[u8]) -> Preamble {
    for signature in [V1_PREFIX, V2_SIGNATURE] {
        let n = buf.len().min(signature.len());
        if buf[..n] == signature[..n] {
            return if buf.len() >= signature.len() {
                Preamble::Present
            } else {
                Preamble::Incomplete
            };
        }
    }
    Preamble::Absent
}

/// Outcome of scanning the buffered bytes for a header.
enum Scan {
    NoHeader,
    Header {
        consumed: usize,
        source: Option<SocketAddr>,
    },
}

fn scan(buf: &[u8]) -> io::Result<Option<Scan>> {
    match classify(buf) {
        Preamble::Absent => Ok(Some(Scan::NoHeader)),
        Preamble::Incomplete => Ok(None),
        Preamble::Present => match ProxyHeader::parse(buf, ParseConfig::default()) {
            Ok((header, consumed)) => Ok(Some(Scan::Header {
                consumed,
                source: header.proxied_address().map(|addr| addr.source),
            })),
            Err(HeaderError::BufferTooShort) => Ok(None),
            Err(e) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed PROXY header: {e:?}"),
            )),
        },
    }
}

/// Reads until the buffer holds a complete header or proves there is none.
async fn fill(stream: &mut TcpStream, buf: &mut Vec<u8>) -> io::Result<Scan> {
    let mut chunk = [0u8; 512];
    loop {
        if let Some(result) = scan(buf)? {
            return Ok(result);
        }
        if buf.len() >= MAX_HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "PROXY header exceeds maximum length",
            ));
        }
        let want = chunk.len().min(MAX_HEADER_LEN - buf.len());
        let n = stream.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Ok(Scan::NoHeader);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Resolves the original client address of an accepted socket.
///
/// A client that stays silent for `header_timeout` is treated as sending no header.
/// Malformed headers are returned as `InvalidData` errors.
pub async fn resolve_client(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    header_timeout: Duration,
) -> io::Result<ClientConn> {
    let mut buf = Vec::new();
    let filled = timeout(header_timeout, fill(&mut stream, &mut buf)).await;
    let scanned = match filled {
        Ok(result) => result?,
        Err(_) => {
            debug!(peer_addr = %peer_addr, buffered = buf.len(), "No PROXY header before timeout");
            Scan::NoHeader
        }
    };

    let (client_addr, preread) = match scanned {
        Scan::NoHeader => (peer_addr, buf),
        Scan::Header { consumed, source } => {
            let client_addr = source.unwrap_or(peer_addr);
            debug!(peer_addr = %peer_addr, client_addr = %client_addr, "PROXY header parsed");
            (client_addr, buf.split_off(consumed))
        }
    };

    Ok(ClientConn {
        stream,
        client_addr,
        preread,
    })
}
