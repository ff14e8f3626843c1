//! The UDP multiplexer: one bound socket, many per-address connections.
//!
//! Real-time media stacks (ICE/DTLS/SRTP) need exactly one UDP socket per
//! local port but treat every remote peer as an isolated stream. [`UdpMux`]
//! bridges that gap: a single background receive loop routes each inbound
//! datagram by sender address into an independently readable and closable
//! [`MuxedConn`], announcing previously unseen addresses through an
//! accept-style queue.
//!
//! ## Routing discipline
//!
//! The routing table (address → connection) is mutated only under one
//! exclusive lock, shared by the receive loop, [`UdpMux::get_conn`], and
//! [`UdpMux::close`]. There is exactly one receive loop per multiplexer, so
//! datagram dispatch never races with itself, and at most one live
//! connection exists per remote address at any instant.
//!
//! ## Backpressure
//!
//! Delivery into a connection's bounded inbound queue happens while the
//! table lock is held. A full queue (slow consumer) therefore stalls the
//! entire receive loop — datagrams are never dropped, but every other
//! multiplexed connection is starved until the queue drains. Size
//! [`UdpMuxConfig::read_queue_capacity`] accordingly.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::conn::MuxedConn;
use crate::error::{MuxError, Result};

/// Default bound on a single datagram read, in bytes.
pub const DEFAULT_MTU: usize = 8192;

/// Default capacity of each connection's inbound datagram queue.
pub const DEFAULT_READ_QUEUE_CAPACITY: usize = 32;

/// Multiplexer configuration.
#[derive(Debug, Clone)]
pub struct UdpMuxConfig {
    /// Maximum datagram size a single read can return. Larger datagrams are
    /// truncated by the OS.
    pub mtu: usize,
    /// Capacity of each connection's inbound FIFO queue. When full, the
    /// receive loop blocks until the consumer drains it (see module docs).
    pub read_queue_capacity: usize,
}

impl Default for UdpMuxConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            read_queue_capacity: DEFAULT_READ_QUEUE_CAPACITY,
        }
    }
}

pub(crate) struct MuxInner {
    /// Back-reference handed to each connection for routing-table removal.
    me: Weak<MuxInner>,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: UdpMuxConfig,
    /// Routing table: at most one live connection per remote address.
    conns: Mutex<HashMap<SocketAddr, MuxedConn>>,
    accept_rx: Receiver<MuxedConn>,
    /// Dropped on close to disconnect pending and future accepts.
    accept_tx: Mutex<Option<Sender<MuxedConn>>>,
    /// Receive-loop liveness. Cleared by `close` or a fatal read error.
    running: AtomicBool,
    /// Execute-once guard for multiplexer-wide teardown.
    closed: AtomicBool,
}

impl MuxInner {
    /// Route one received datagram. Called only from the receive loop.
    fn dispatch(&self, remote_addr: SocketAddr, payload: &[u8]) {
        let conns = &mut *self.conns.lock();
        // `close` empties the table before the loop observes the cleared
        // liveness flag; a datagram racing that window must not repopulate it.
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let conn = match conns.get(&remote_addr) {
            Some(conn) => conn.clone(),
            None => self.create_conn(conns, remote_addr, true),
        };
        // The read buffer is reused across iterations, so the payload is
        // copied into a fresh allocation before it is handed off. Delivery
        // happens under the table lock: a full queue stalls the whole loop.
        if let Some(tx) = conn.sender() {
            let _ = tx.send(payload.to_vec());
        }
    }

    /// Insert a new connection for `remote_addr` into the routing table.
    /// Caller must hold the table lock. Only receive-loop creations are
    /// announced on the accept queue.
    fn create_conn(
        &self,
        conns: &mut HashMap<SocketAddr, MuxedConn>,
        remote_addr: SocketAddr,
        announce: bool,
    ) -> MuxedConn {
        let conn = MuxedConn::new(
            self.socket.clone(),
            self.local_addr,
            remote_addr,
            self.config.read_queue_capacity,
            self.me.clone(),
        );
        conns.insert(remote_addr, conn.clone());
        tracing::debug!(%remote_addr, announce, "new muxed connection");
        if announce {
            if let Some(tx) = &*self.accept_tx.lock() {
                let _ = tx.send(conn.clone());
            }
        }
        conn
    }

    /// Remove `conn` from the routing table (only if it is still the entry
    /// for its address — a successor connection is never evicted) and run
    /// its execute-once teardown.
    pub(crate) fn release(&self, conn: &MuxedConn) {
        let remote_addr = conn.remote_addr();
        {
            let mut conns = self.conns.lock();
            if conns.get(&remote_addr).is_some_and(|entry| entry == conn) {
                conns.remove(&remote_addr);
            }
        }
        if conn.shutdown(true) {
            tracing::debug!(%remote_addr, "connection closed");
        }
    }
}

/// Demultiplexes one bound UDP socket into per-address [`MuxedConn`]s.
///
/// Cheap to clone; clones share the same multiplexer, so one thread can sit
/// in [`accept`](Self::accept) while others call
/// [`get_conn`](Self::get_conn) or [`close`](Self::close).
#[derive(Clone)]
pub struct UdpMux {
    inner: Arc<MuxInner>,
}

impl UdpMux {
    /// Take ownership of a bound socket and start demultiplexing it.
    ///
    /// The background receive loop starts consuming the socket immediately,
    /// before the first call to [`accept`](Self::accept). The socket is
    /// switched to non-blocking mode so that [`close`](Self::close) can
    /// terminate the loop promptly.
    pub fn new(socket: UdpSocket, config: UdpMuxConfig) -> io::Result<Self> {
        let local_addr = socket.local_addr()?;
        socket.set_nonblocking(true)?;

        let (accept_tx, accept_rx) = crossbeam_channel::unbounded();
        let inner = Arc::new_cyclic(|me| MuxInner {
            me: me.clone(),
            socket: Arc::new(socket),
            local_addr,
            config,
            conns: Mutex::new(HashMap::new()),
            accept_rx,
            accept_tx: Mutex::new(Some(accept_tx)),
            running: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        });

        tracing::info!(
            %local_addr,
            mtu = inner.config.mtu,
            read_queue_capacity = inner.config.read_queue_capacity,
            "UDP multiplexer started"
        );

        let loop_inner = inner.clone();
        thread::spawn(move || recv_loop(loop_inner));

        Ok(Self { inner })
    }

    /// Block until a previously unseen remote address produces its first
    /// datagram, then return its connection.
    ///
    /// Connections created via [`get_conn`](Self::get_conn) are never
    /// announced here. Fails with [`MuxError::MuxClosed`] once the
    /// multiplexer has closed and all pending announcements are drained.
    pub fn accept(&self) -> Result<MuxedConn> {
        self.inner.accept_rx.recv().map_err(|_| MuxError::MuxClosed)
    }

    /// Return the connection for `remote_addr`, creating one without
    /// announcing it if no entry exists.
    ///
    /// For an address already routed — via either the accept path or a
    /// prior `get_conn` — this returns the identical connection, never a
    /// duplicate. Fails with [`MuxError::MuxClosed`] after
    /// [`close`](Self::close).
    pub fn get_conn(&self, remote_addr: SocketAddr) -> Result<MuxedConn> {
        let conns = &mut *self.inner.conns.lock();
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MuxError::MuxClosed);
        }
        Ok(match conns.get(&remote_addr) {
            Some(conn) => conn.clone(),
            None => self.inner.create_conn(conns, remote_addr, false),
        })
    }

    /// Close the multiplexer: shut down every live connection's inbound
    /// queue, empty the routing table, disconnect the accept queue, and stop
    /// the receive loop.
    ///
    /// Executes at most once; concurrent and repeated calls are no-ops.
    /// Close-channel signals of surviving connection handles are
    /// deliberately left open — only a connection's own
    /// [`close`](MuxedConn::close) disconnects them.
    pub fn close(&self) {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let released = {
            let mut conns = self.inner.conns.lock();
            for conn in conns.values() {
                conn.shutdown(false);
            }
            let released = conns.len();
            conns.clear();
            *self.inner.accept_tx.lock() = None;
            released
        };
        self.inner.running.store(false, Ordering::SeqCst);

        tracing::info!(
            local_addr = %self.inner.local_addr,
            connections = released,
            "UDP multiplexer closed"
        );
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Local address of the underlying socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }
}

/// Background receive loop: read one datagram at a time into a reusable
/// buffer and dispatch it by sender address.
///
/// Polls the liveness flag with a 50ms interval while the socket is idle so
/// that [`UdpMux::close`] can terminate it promptly. Any read error other
/// than `WouldBlock` is transport-fatal: the loop logs it and exits
/// permanently — a UDP socket failure is unrecoverable without external
/// re-binding, so there is no retry and no restart.
fn recv_loop(inner: Arc<MuxInner>) {
    let mut buf = vec![0u8; inner.config.mtu];

    while inner.running.load(Ordering::SeqCst) {
        match inner.socket.recv_from(&mut buf) {
            Ok((len, remote_addr)) => inner.dispatch(remote_addr, &buf[..len]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                tracing::error!(error = %e, "error reading remote data, receive loop terminating");
                inner.running.store(false, Ordering::SeqCst);
                return;
            }
        }
    }

    tracing::debug!("receive loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mux(config: UdpMuxConfig) -> UdpMux {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        UdpMux::new(socket, config).unwrap()
    }

    #[test]
    fn config_defaults() {
        let config = UdpMuxConfig::default();
        assert_eq!(config.mtu, 8192);
        assert_eq!(config.read_queue_capacity, 32);
    }

    #[test]
    fn get_conn_returns_identical_handle() {
        let mux = test_mux(UdpMuxConfig::default());
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let other: SocketAddr = "127.0.0.1:4001".parse().unwrap();

        let a = mux.get_conn(addr).unwrap();
        let b = mux.get_conn(addr).unwrap();
        let c = mux.get_conn(other).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.remote_addr(), addr);
        assert_eq!(a.local_addr(), mux.local_addr());

        mux.close();
    }

    #[test]
    fn get_conn_is_never_announced() {
        let mux = test_mux(UdpMuxConfig::default());
        let addr: SocketAddr = "127.0.0.1:4002".parse().unwrap();
        mux.get_conn(addr).unwrap();
        mux.close();
        // Nothing was queued for accept before the close.
        assert!(matches!(mux.accept(), Err(MuxError::MuxClosed)));
    }

    #[test]
    fn close_is_idempotent() {
        let mux = test_mux(UdpMuxConfig::default());
        assert!(!mux.is_closed());
        mux.close();
        mux.close();
        assert!(mux.is_closed());
    }

    #[test]
    fn get_conn_after_close_fails() {
        let mux = test_mux(UdpMuxConfig::default());
        mux.close();
        let addr: SocketAddr = "127.0.0.1:4003".parse().unwrap();
        assert!(matches!(mux.get_conn(addr), Err(MuxError::MuxClosed)));
    }

    #[test]
    fn dispatch_after_close_drops_datagram() {
        // A datagram racing the close window (table cleared, loop not yet
        // parked) must be dropped, not routed into a zombie connection.
        let mux = test_mux(UdpMuxConfig::default());
        let addr: SocketAddr = "127.0.0.1:4005".parse().unwrap();
        mux.close();

        mux.inner.dispatch(addr, b"late");
        assert!(mux.inner.conns.lock().is_empty());
    }

    #[test]
    fn close_shuts_down_live_conns() {
        let mux = test_mux(UdpMuxConfig::default());
        let addr: SocketAddr = "127.0.0.1:4004".parse().unwrap();
        let conn = mux.get_conn(addr).unwrap();
        mux.close();

        let mut buf = [0u8; 8];
        assert!(matches!(conn.read(&mut buf), Err(MuxError::ConnClosed)));
    }
}
