use std::{
    io::{BufRead, BufReader, Write},
    net::{SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    time::Duration,
};

use tracing::debug;

use crate::error::NetError;

/// Result of a single non-blocking-ish poll of a connection's inbound side.
///
/// `NoData` means the caller's poll interval elapsed with nothing to read;
/// it is not an error and callers should simply loop back to their own
/// cancellation checks. `Closed` means the peer is gone for good.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Line(String),
    NoData,
    Closed,
}

/// Duplex byte-stream abstraction used by a `VariableServerThread`.
///
/// `read` yields one complete newline-terminated text command at a time.
/// `write` takes pre-framed bytes (ASCII or binary) and sends them whole;
/// framing itself is the caller's responsibility (see `varserver-core`'s
/// ASCII/binary encoders).
pub trait ClientConnection: Send {
    fn start(&mut self) -> Result<(), NetError>;
    fn disconnect(&mut self);
    fn read(&mut self) -> Result<ReadOutcome, NetError>;
    fn write(&mut self, bytes: &[u8]) -> Result<usize, NetError>;
    fn restart(&mut self) -> Result<(), NetError>;
    fn set_client_tag(&mut self, tag: String);
    fn client_tag(&self) -> &str;
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Blocking `std::net::TcpStream` connection.
///
/// Reads are polled on a short timeout so that `VariableServerThread`'s main
/// loop can interleave cancellation checks with `read()` without a second
/// reader thread: a `WouldBlock`/`TimedOut` read is reported as `NoData`
/// rather than an error.
pub struct TcpClientConnection {
    peer_addr: SocketAddr,
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    client_tag: String,
}

impl TcpClientConnection {
    pub const POLL_TIMEOUT: Duration = Duration::from_millis(50);

    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Self::POLL_TIMEOUT))?;
        let peer_addr = stream.peer_addr()?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { peer_addr, stream, reader, client_tag: String::new() })
    }
}

impl ClientConnection for TcpClientConnection {
    fn start(&mut self) -> Result<(), NetError> {
        Ok(())
    }

    fn disconnect(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn read(&mut self) -> Result<ReadOutcome, NetError> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\n', '\r']).to_string();
                Ok(ReadOutcome::Line(trimmed))
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(ReadOutcome::NoData)
            }
            Err(err) => {
                debug!(?err, "varserver-net: tcp read failed");
                Err(NetError::Io(err))
            }
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, NetError> {
        self.stream.write_all(bytes)?;
        Ok(bytes.len())
    }

    fn restart(&mut self) -> Result<(), NetError> {
        self.stream.set_read_timeout(Some(Self::POLL_TIMEOUT))?;
        Ok(())
    }

    fn set_client_tag(&mut self, tag: String) {
        self.client_tag = tag;
    }

    fn client_tag(&self) -> &str {
        &self.client_tag
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer_addr)
    }
}

/// In-process mock transport used by unit and integration tests.
///
/// Commands are pushed in with `push_command`; outbound frames are drained
/// with `take_written`. `close_peer` simulates the peer hanging up.
///
/// `outbound`/`closed` are `Arc<Mutex<_>>`/`Arc<AtomicBool>` rather than
/// bare fields so [`MockClientConnection::pair`] can hand out a
/// [`MockConnectionHandle`] that keeps working after the connection itself
/// has been moved into a `VariableServerSession` — exactly the case a test
/// driving a session end-to-end needs.
pub struct MockClientConnection {
    inbound: mpsc::Receiver<String>,
    inbound_tx: mpsc::Sender<String>,
    outbound: Arc<Mutex<Vec<Vec<u8>>>>,
    client_tag: String,
    closed: Arc<AtomicBool>,
}

/// A cloneable remote control for a [`MockClientConnection`], retained by a
/// test after the connection itself has been handed off to a session or
/// thread.
#[derive(Clone)]
pub struct MockConnectionHandle {
    inbound_tx: mpsc::Sender<String>,
    outbound: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: Arc<AtomicBool>,
}

impl MockConnectionHandle {
    pub fn push_command(&self, command: &str) {
        let _ = self.inbound_tx.send(command.to_string());
    }

    pub fn close_peer(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbound.lock().unwrap())
    }
}

impl MockClientConnection {
    pub fn new() -> Self {
        let (inbound_tx, inbound) = mpsc::channel();
        Self {
            inbound,
            inbound_tx,
            outbound: Arc::new(Mutex::new(Vec::new())),
            client_tag: String::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A connection plus a handle that stays usable after the connection
    /// is moved.
    pub fn pair() -> (Self, MockConnectionHandle) {
        let conn = Self::new();
        let handle = MockConnectionHandle {
            inbound_tx: conn.inbound_tx.clone(),
            outbound: conn.outbound.clone(),
            closed: conn.closed.clone(),
        };
        (conn, handle)
    }

    pub fn push_command(&self, command: &str) {
        let _ = self.inbound_tx.send(command.to_string());
    }

    pub fn close_peer(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn take_written(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbound.lock().unwrap())
    }
}

impl Default for MockClientConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientConnection for MockClientConnection {
    fn start(&mut self) -> Result<(), NetError> {
        Ok(())
    }

    fn disconnect(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn read(&mut self) -> Result<ReadOutcome, NetError> {
        match self.inbound.try_recv() {
            Ok(line) => Ok(ReadOutcome::Line(line)),
            Err(mpsc::TryRecvError::Empty) => {
                if self.closed.load(Ordering::SeqCst) {
                    Ok(ReadOutcome::Closed)
                } else {
                    Ok(ReadOutcome::NoData)
                }
            }
            Err(mpsc::TryRecvError::Disconnected) => Ok(ReadOutcome::Closed),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, NetError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetError::Closed);
        }
        self.outbound.lock().unwrap().push(bytes.to_vec());
        Ok(bytes.len())
    }

    fn restart(&mut self) -> Result<(), NetError> {
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_client_tag(&mut self, tag: String) {
        self.client_tag = tag;
    }

    fn client_tag(&self) -> &str {
        &self.client_tag
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}
