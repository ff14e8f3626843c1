use clap::Parser;
use std::io;
use std::net::UdpSocket;
use std::thread;
use udpmux::{DEFAULT_MTU, UdpMux, UdpMuxConfig};

#[derive(Parser)]
#[command(
    name = "udpmux-echo",
    about = "UDP multiplexer demo: echoes every datagram back to its sender"
)]
struct Args {
    /// Bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:9500")]
    bind: String,

    /// Per-connection inbound queue capacity
    #[arg(long, default_value_t = udpmux::DEFAULT_READ_QUEUE_CAPACITY)]
    queue_capacity: usize,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let socket = match UdpSocket::bind(&args.bind) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to bind {}: {}", args.bind, e);
            return;
        }
    };

    let config = UdpMuxConfig {
        read_queue_capacity: args.queue_capacity,
        ..UdpMuxConfig::default()
    };
    let mux = match UdpMux::new(socket, config) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Failed to start multiplexer: {}", e);
            return;
        }
    };

    let acceptor = mux.clone();
    thread::spawn(move || {
        while let Ok(conn) = acceptor.accept() {
            tracing::info!(remote_addr = %conn.remote_addr(), "peer connected");
            thread::spawn(move || {
                let mut buf = vec![0u8; DEFAULT_MTU];
                loop {
                    match conn.read(&mut buf) {
                        Ok(n) => {
                            if conn.write(&buf[..n]).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                tracing::info!(remote_addr = %conn.remote_addr(), "peer closed");
            });
        }
    });

    println!("UDP echo on {} — press Enter to stop", args.bind);
    let mut input = String::new();
    io::stdin().read_line(&mut input).unwrap();

    mux.close();
}
