//! # Node Connection
//!
//! Purpose: Own one physical channel (plain TCP or TLS) to one cluster node
//! and expose the blocking primitives the command executor needs.
//!
//! ## Design Principles
//! 1. **One Interface**: `Transport` hides whether bytes are encrypted.
//! 2. **Exact Framing**: `write` and `read_fully` always move the full length
//!    or fail; short reads never reach the decoder.
//! 3. **Idle Accounting**: Every successful use stamps `last_used`; the pool
//!    uses `is_valid` to evict stale sockets.
//! 4. **Sticky Close**: `close` is idempotent and leaves the connection
//!    permanently closed.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use tkv_common::{ClientError, ClientResult};
use tracing::debug;

use crate::tls::{TlsConnector, TlsStream};

/// Largest slice handed to a single underlying write call.
pub const WRITE_CHUNK_SIZE: usize = 8 * 1024;

/// Connect timeout applied when the caller does not provide one.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default idle budget before a pooled connection is considered stale.
pub const DEFAULT_MAX_SOCKET_IDLE: Duration = Duration::from_secs(55);

enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
}

impl Transport {
    fn tcp(&self) -> &TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(tls) => &tls.sock,
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(buf),
            Transport::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.write(buf),
            Transport::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.flush(),
            Transport::Tls(tls) => tls.flush(),
        }
    }
}

/// Single connection to a node.
///
/// A connection is owned by exactly one request at a time; all methods take
/// `&mut self` so the borrow checker enforces that.
pub struct Connection {
    transport: Option<Transport>,
    peer: SocketAddr,
    max_idle: Duration,
    // `None` is the closed sentinel.
    last_used: Option<Instant>,
}

impl Connection {
    /// Opens a plain TCP connection.
    pub fn connect(addr: SocketAddr, timeout: Duration, max_idle: Duration) -> ClientResult<Self> {
        let stream = open_stream(addr, timeout)?;
        debug!(peer = %addr, "connection opened");
        Ok(Connection::new(Transport::Plain(stream), addr, max_idle))
    }

    /// Opens a TLS connection and validates the server identity.
    pub fn connect_tls(
        addr: SocketAddr,
        connector: &TlsConnector,
        tls_name: Option<&str>,
        timeout: Duration,
        max_idle: Duration,
    ) -> ClientResult<Self> {
        let stream = open_stream(addr, timeout)?;
        // A failed handshake drops the stream, closing the socket.
        let tls = connector.handshake(stream, addr, tls_name)?;
        debug!(peer = %addr, tls_name = ?tls_name, "tls connection opened");
        Ok(Connection::new(Transport::Tls(Box::new(tls)), addr, max_idle))
    }

    fn new(transport: Transport, peer: SocketAddr, max_idle: Duration) -> Self {
        Connection {
            transport: Some(transport),
            peer,
            max_idle,
            last_used: Some(Instant::now()),
        }
    }

    /// Writes the whole buffer in chunks of at most `WRITE_CHUNK_SIZE`.
    pub fn write(&mut self, buf: &[u8]) -> ClientResult<()> {
        let transport = self.transport_mut()?;
        for chunk in buf.chunks(WRITE_CHUNK_SIZE) {
            transport.write_all(chunk)?;
        }
        transport.flush()?;
        Ok(())
    }

    /// Fills `buf` completely or fails.
    ///
    /// A zero-length read means the peer closed the stream and yields
    /// `ClientError::EndOfStream`.
    pub fn read_fully(&mut self, buf: &mut [u8]) -> ClientResult<()> {
        let transport = self.transport_mut()?;
        let mut pos = 0;
        while pos < buf.len() {
            match transport.read(&mut buf[pos..]) {
                Ok(0) => return Err(ClientError::EndOfStream),
                Ok(count) => pos += count,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Applies a read/write deadline to the socket. Zero clears it.
    pub fn set_timeout(&mut self, timeout: Duration) -> ClientResult<()> {
        let timeout = (!timeout.is_zero()).then_some(timeout);
        let stream = self.transport_mut()?.tcp();
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        Ok(())
    }

    /// Stamps the current time as the last successful use.
    pub fn update_last_used(&mut self) {
        if self.last_used.is_some() {
            self.last_used = Some(Instant::now());
        }
    }

    /// True when open and used within the idle budget.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Instant::now())
    }

    /// `is_valid` against an explicit clock reading.
    pub fn is_valid_at(&self, now: Instant) -> bool {
        match self.last_used {
            Some(last_used) => now.saturating_duration_since(last_used) <= self.max_idle,
            None => false,
        }
    }

    /// True once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.last_used.is_none()
    }

    /// True for TLS connections.
    pub fn is_secure(&self) -> bool {
        matches!(self.transport, Some(Transport::Tls(_)))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Releases the socket. Errors are logged, never returned.
    pub fn close(&mut self) {
        self.last_used = None;
        let transport = match self.transport.take() {
            Some(transport) => transport,
            None => return,
        };

        let result = match transport {
            Transport::Plain(stream) => stream.shutdown(Shutdown::Both),
            Transport::Tls(mut tls) => {
                tls.conn.send_close_notify();
                let _ = tls.conn.complete_io(&mut tls.sock);
                tls.sock.shutdown(Shutdown::Both)
            }
        };
        if let Err(err) = result {
            debug!(peer = %self.peer, error = %err, "error closing socket");
        }
    }

    fn transport_mut(&mut self) -> ClientResult<&mut Transport> {
        self.transport
            .as_mut()
            .ok_or_else(|| ClientError::Io(io::Error::new(io::ErrorKind::NotConnected, "connection closed")))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_stream(addr: SocketAddr, timeout: Duration) -> ClientResult<TcpStream> {
    // Never wait indefinitely; the retry layer reconnects later.
    let connect_timeout = if timeout.is_zero() {
        DEFAULT_CONNECT_TIMEOUT
    } else {
        timeout
    };

    let stream = TcpStream::connect_timeout(&addr, connect_timeout)
        .map_err(|err| ClientError::ConnectionSetup(format!("connect {}: {}", addr, err)))?;
    configure_stream(&stream, timeout).map_err(|err| {
        let _ = stream.shutdown(Shutdown::Both);
        ClientError::ConnectionSetup(format!("configure {}: {}", addr, err))
    })?;
    Ok(stream)
}

fn configure_stream(stream: &TcpStream, timeout: Duration) -> io::Result<()> {
    // Disable Nagle to keep request latency low for small payloads.
    stream.set_nodelay(true)?;
    if !timeout.is_zero() {
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
    }
    Ok(())
}
