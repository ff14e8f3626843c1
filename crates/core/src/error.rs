//! Error types for the UDP multiplexer library.

/// Errors that can occur in the UDP multiplexer library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Transport**: [`Io`](Self::Io) — socket/network failures, surfaced
///   unmodified from the underlying `send_to`.
/// - **Multiplexer**: [`MuxClosed`](Self::MuxClosed) — the accept queue has
///   been closed by [`UdpMux::close`](crate::UdpMux::close).
/// - **Connection**: [`ConnClosed`](Self::ConnClosed) — a read or write on a
///   [`MuxedConn`](crate::MuxedConn) that has been closed.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The multiplexer has been closed; no further connections will be
    /// announced via [`UdpMux::accept`](crate::UdpMux::accept).
    #[error("multiplexer closed")]
    MuxClosed,

    /// The muxed connection has been closed and its inbound queue drained.
    #[error("connection closed")]
    ConnClosed,
}

/// Convenience alias for `Result<T, MuxError>`.
pub type Result<T> = std::result::Result<T, MuxError>;
