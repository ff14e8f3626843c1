pub mod conn;
pub mod error;
pub mod mux;

pub use conn::{Conn, MuxedConn};
pub use error::{MuxError, Result};
pub use mux::{DEFAULT_MTU, DEFAULT_READ_QUEUE_CAPACITY, UdpMux, UdpMuxConfig};
