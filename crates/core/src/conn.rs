//! Per-address virtual connections over a shared UDP socket.
//!
//! A [`MuxedConn`] presents stream-like read/write semantics for exactly one
//! remote address. All connections created by the same [`UdpMux`](crate::UdpMux)
//! share its socket for sends; inbound datagrams are routed into each
//! connection's own bounded FIFO queue by the multiplexer's receive loop.
//!
//! Lifecycle: a connection is created lazily, either when the receive loop
//! sees a datagram from an unknown address (accept path) or when a caller
//! asks for an address explicitly via
//! [`UdpMux::get_conn`](crate::UdpMux::get_conn) (connect path). It is
//! destroyed by [`close`](MuxedConn::close) or when the whole multiplexer
//! closes. The open → closed transition is one-way and runs its teardown
//! exactly once, no matter how many callers race on it.

use std::fmt;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::error::{MuxError, Result};
use crate::mux::MuxInner;

/// The capability set consumed by protocol layers (ICE/DTLS-style stacks)
/// that treat each remote peer as an independent byte stream.
///
/// Deadline setters are accepted but not enforced; this transport has no
/// timeout machinery. The only way to unblock a pending [`read`](Conn::read)
/// is to close the connection (or the whole multiplexer).
pub trait Conn: Send + Sync {
    /// Block until a datagram arrives for this connection, then copy it into
    /// `buf` and return the copied length.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Send `buf` as a single datagram to this connection's remote address.
    fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Close this connection. Idempotent.
    fn close(&self);

    /// Local address of the shared underlying socket.
    fn local_addr(&self) -> SocketAddr;

    /// Remote address this connection routes to and from.
    fn remote_addr(&self) -> SocketAddr;

    /// A receiver that disconnects when this connection closes. Any number
    /// of observers may block on it without ever blocking the closer.
    fn close_channel(&self) -> Receiver<()>;

    /// No-op; deadlines are not enforced.
    fn set_deadline(&self, _deadline: Option<Instant>) {}

    /// No-op; deadlines are not enforced.
    fn set_read_deadline(&self, _deadline: Option<Instant>) {}

    /// No-op; deadlines are not enforced.
    fn set_write_deadline(&self, _deadline: Option<Instant>) {}
}

/// Mutable close state, guarded by a mutex so concurrent closers serialize.
///
/// Dropping `read_tx` disconnects the inbound queue (readers drain what is
/// left, then fail). Dropping `closed_tx` disconnects every receiver handed
/// out by [`MuxedConn::close_channel`]; nothing is ever sent on it.
struct ConnState {
    read_tx: Option<Sender<Vec<u8>>>,
    closed_tx: Option<Sender<()>>,
    closed: bool,
}

pub(crate) struct ConnInner {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    read_rx: Receiver<Vec<u8>>,
    closed_rx: Receiver<()>,
    state: Mutex<ConnState>,
    /// Non-owning back-reference, used only to remove this connection from
    /// the multiplexer's routing table on close.
    mux: Weak<MuxInner>,
}

/// A virtual connection to one remote address, multiplexed over a shared
/// UDP socket.
///
/// Cheap to clone; clones share state, so a handle returned by
/// [`UdpMux::accept`](crate::UdpMux::accept) and one returned by
/// [`UdpMux::get_conn`](crate::UdpMux::get_conn) for the same address
/// compare equal and behave identically.
#[derive(Clone)]
pub struct MuxedConn {
    inner: Arc<ConnInner>,
}

impl MuxedConn {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        queue_capacity: usize,
        mux: Weak<MuxInner>,
    ) -> Self {
        let (read_tx, read_rx) = crossbeam_channel::bounded(queue_capacity);
        let (closed_tx, closed_rx) = crossbeam_channel::bounded(1);
        Self {
            inner: Arc::new(ConnInner {
                socket,
                local_addr,
                remote_addr,
                read_rx,
                closed_rx,
                state: Mutex::new(ConnState {
                    read_tx: Some(read_tx),
                    closed_tx: Some(closed_tx),
                    closed: false,
                }),
                mux,
            }),
        }
    }

    /// Sender side of the inbound queue, used by the receive loop to deliver
    /// datagrams. `None` once the connection has been shut down.
    pub(crate) fn sender(&self) -> Option<Sender<Vec<u8>>> {
        self.inner.state.lock().read_tx.clone()
    }

    /// Execute-once teardown. Returns `true` only for the caller that
    /// performed the transition.
    ///
    /// A multiplexer-wide close passes `with_signal = false`: it closes the
    /// inbound queue but leaves the close-channel signal open, matching the
    /// original transport's teardown split.
    pub(crate) fn shutdown(&self, with_signal: bool) -> bool {
        let mut state = self.inner.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.read_tx = None;
        if with_signal {
            state.closed_tx = None;
        }
        true
    }

    /// Block until the inbound queue yields a datagram, copy it into `buf`,
    /// and return the copied length.
    ///
    /// Datagrams are all-or-nothing: one queued datagram per call, never a
    /// partial read across datagrams. A `buf` shorter than the datagram
    /// truncates it, UDP-style; the return value is then the number of
    /// bytes actually copied (`buf.len()`), not the length of the
    /// truncated datagram. Queued datagrams remain readable after
    /// [`close`](Self::close); once the queue is closed and empty, fails
    /// with [`MuxError::ConnClosed`].
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let datagram = self
            .inner
            .read_rx
            .recv()
            .map_err(|_| MuxError::ConnClosed)?;
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(n)
    }

    /// Send `buf` as one datagram to the remote address via the shared
    /// socket.
    ///
    /// Fails with [`MuxError::ConnClosed`] once this connection has closed
    /// (checked without blocking or locking). Underlying send errors pass
    /// through unmodified as [`MuxError::Io`].
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        match self.inner.closed_rx.try_recv() {
            Err(TryRecvError::Disconnected) => Err(MuxError::ConnClosed),
            _ => Ok(self.inner.socket.send_to(buf, self.inner.remote_addr)?),
        }
    }

    /// Close this connection: remove it from the multiplexer's routing
    /// table, close the inbound queue, and disconnect the close channel.
    ///
    /// Idempotent under any number of concurrent callers; the teardown
    /// effects run exactly once. A datagram arriving from the same remote
    /// address afterwards creates a brand-new connection, re-announced via
    /// [`UdpMux::accept`](crate::UdpMux::accept).
    pub fn close(&self) {
        match self.inner.mux.upgrade() {
            Some(mux) => mux.release(self),
            // Multiplexer already gone; only local teardown remains.
            None => {
                if self.shutdown(true) {
                    tracing::debug!(remote_addr = %self.inner.remote_addr, "connection closed");
                }
            }
        }
    }

    /// A receiver that disconnects when this connection closes.
    ///
    /// No message is ever sent on it; observers block in `recv()` until it
    /// returns `Err(RecvError)` on closure. Closing never blocks on
    /// observers.
    pub fn close_channel(&self) -> Receiver<()> {
        self.inner.closed_rx.clone()
    }

    /// Local address of the shared underlying socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Remote address this connection routes to and from.
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }
}

impl Conn for MuxedConn {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        MuxedConn::read(self, buf)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        MuxedConn::write(self, buf)
    }

    fn close(&self) {
        MuxedConn::close(self)
    }

    fn local_addr(&self) -> SocketAddr {
        MuxedConn::local_addr(self)
    }

    fn remote_addr(&self) -> SocketAddr {
        MuxedConn::remote_addr(self)
    }

    fn close_channel(&self) -> Receiver<()> {
        MuxedConn::close_channel(self)
    }
}

/// Handle identity: two `MuxedConn`s are equal when they share state.
impl PartialEq for MuxedConn {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for MuxedConn {}

impl fmt::Debug for MuxedConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxedConn")
            .field("local_addr", &self.inner.local_addr)
            .field("remote_addr", &self.inner.remote_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    /// A standalone connection with no owning multiplexer.
    fn orphan_conn(capacity: usize) -> MuxedConn {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let local_addr = socket.local_addr().unwrap();
        let remote_addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        MuxedConn::new(socket, local_addr, remote_addr, capacity, Weak::new())
    }

    #[test]
    fn read_returns_queued_datagram() {
        let conn = orphan_conn(4);
        conn.sender().unwrap().send(b"hello".to_vec()).unwrap();

        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn read_truncates_to_caller_buffer() {
        let conn = orphan_conn(4);
        conn.sender().unwrap().send(b"hello".to_vec()).unwrap();

        let mut buf = [0u8; 3];
        let n = conn.read(&mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf, b"hel");
    }

    #[test]
    fn read_drains_queue_after_close() {
        let conn = orphan_conn(4);
        let tx = conn.sender().unwrap();
        tx.send(b"a".to_vec()).unwrap();
        tx.send(b"b".to_vec()).unwrap();
        drop(tx);
        conn.close();

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'a');
        assert_eq!(conn.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'b');
        assert!(matches!(conn.read(&mut buf), Err(MuxError::ConnClosed)));
    }

    #[test]
    fn write_after_close_fails() {
        let conn = orphan_conn(4);
        conn.close();
        assert!(matches!(conn.write(b"x"), Err(MuxError::ConnClosed)));
    }

    #[test]
    fn close_is_idempotent() {
        let conn = orphan_conn(4);
        assert!(conn.shutdown(true));
        assert!(!conn.shutdown(true));
        conn.close();
        conn.close();
    }

    #[test]
    fn mux_close_leaves_close_channel_open() {
        // A multiplexer-wide shutdown closes the inbound queue only.
        let conn = orphan_conn(4);
        assert!(conn.shutdown(false));

        let mut buf = [0u8; 8];
        assert!(matches!(conn.read(&mut buf), Err(MuxError::ConnClosed)));
        assert!(matches!(
            conn.close_channel().try_recv(),
            Err(TryRecvError::Empty)
        ));
    }

    #[test]
    fn close_channel_unblocks_all_observers() {
        let conn = orphan_conn(4);
        let mut observers = Vec::new();
        for _ in 0..4 {
            let rx = conn.close_channel();
            observers.push(thread::spawn(move || rx.recv()));
        }
        thread::sleep(Duration::from_millis(20));
        conn.close();
        for observer in observers {
            assert!(observer.join().unwrap().is_err());
        }
    }

    #[test]
    fn conn_trait_object_capability_set() {
        let conn = orphan_conn(4);
        conn.sender().unwrap().send(b"dyn".to_vec()).unwrap();

        let dyn_conn: &dyn Conn = &conn;
        dyn_conn.set_deadline(Some(Instant::now()));
        dyn_conn.set_read_deadline(None);
        dyn_conn.set_write_deadline(None);
        assert_eq!(dyn_conn.local_addr(), conn.local_addr());
        assert_eq!(dyn_conn.remote_addr(), conn.remote_addr());

        let mut buf = [0u8; 8];
        assert_eq!(dyn_conn.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"dyn");

        let close_rx = dyn_conn.close_channel();
        dyn_conn.close();
        assert!(close_rx.recv().is_err());
        assert!(matches!(dyn_conn.write(b"x"), Err(MuxError::ConnClosed)));
        assert!(matches!(dyn_conn.read(&mut buf), Err(MuxError::ConnClosed)));
    }

    #[test]
    fn clones_share_identity() {
        let a = orphan_conn(4);
        let b = a.clone();
        let other = orphan_conn(4);
        assert_eq!(a, b);
        assert_ne!(a, other);
    }
}
