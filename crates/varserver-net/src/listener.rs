use std::{
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Mutex,
};

use tracing::{debug, info, warn};

use crate::{connection::TcpClientConnection, error::NetError};

/// Accepts inbound connections and hands raw streams to the caller.
///
/// Shutdown is cooperative: `stop()` dials the listening socket itself,
/// which unblocks a thread parked in `accept()` without needing a raw fd
/// trick or a second control channel.
pub struct ClientListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    /// The client-side address of the most recent `stop()` self-connect, so
    /// `is_stop_signal` can recognize it precisely instead of guessing from
    /// "peer is loopback" — which would also match every genuine client
    /// connecting from localhost, the common case for local testing.
    last_stop_addr: Mutex<Option<SocketAddr>>,
}

impl ClientListener {
    pub fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "varserver-net: listening");
        Ok(Self { listener, local_addr, last_stop_addr: Mutex::new(None) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Blocks until a new peer connects, then wraps it as a `TcpClientConnection`.
    ///
    /// Returns `Err` only on a genuine accept failure; a `stop()`-induced
    /// unblock surfaces as a connection from the self-dial's own ephemeral
    /// address, which the caller's loop should recognize via
    /// `is_stop_signal` and discard.
    pub fn accept(&self) -> Result<(TcpClientConnection, SocketAddr), NetError> {
        let (stream, peer) = self.listener.accept()?;
        let conn = TcpClientConnection::new(stream)?;
        Ok((conn, peer))
    }

    /// Unblocks a concurrent `accept()` by connecting a throwaway socket to
    /// the listening address. The caller is expected to check `is_stop_signal`
    /// on the accepted peer address and break out of its accept loop.
    pub fn stop(&self) {
        match TcpStream::connect(self.local_addr) {
            Ok(stream) => {
                if let Ok(addr) = stream.local_addr() {
                    *self.last_stop_addr.lock().unwrap() = Some(addr);
                }
                debug!("varserver-net: listener stop signal sent");
            }
            Err(err) => warn!(?err, "varserver-net: failed to send listener stop signal"),
        }
    }

    /// True when `peer` is exactly the address of the most recent `stop()`
    /// self-connect — not merely "some loopback address", which a genuine
    /// localhost client would also satisfy.
    pub fn is_stop_signal(&self, peer: SocketAddr) -> bool {
        *self.last_stop_addr.lock().unwrap() == Some(peer)
    }
}
