use std::{net::IpAddr, net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use minicat::{ConnectionMode, OverflowPolicy, Server, ServerConfig};
use tracing::Level;

#[derive(Parser, Debug)]
#[command(name = "minicat", version, about = "Acceptor/poller/worker hello-world server")]
struct Args {
    /// Interface to listen on
    #[clap(long, default_value = "0.0.0.0")]
    host: IpAddr,
    /// Port to listen on
    #[clap(short, long, default_value_t = 8090)]
    port: u16,
    /// Worker thread count
    #[clap(short, long, default_value_t = 10)]
    workers: usize,
    /// Work items that may wait for a free worker
    #[clap(long, default_value_t = minicat::config::DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,
    /// What to do when the queue is full: block, reject or unbounded
    #[clap(long, default_value = "block")]
    overflow: OverflowPolicy,
    /// one-shot closes after each response, persistent re-arms the connection
    #[clap(long, default_value = "one-shot")]
    mode: ConnectionMode,
    /// Upper bound on a single multiplexer wait, in milliseconds
    #[clap(long, default_value_t = minicat::config::DEFAULT_POLL_TIMEOUT_MS)]
    poll_timeout_ms: u64,
    /// Bytes read per request
    #[clap(long, default_value_t = minicat::config::DEFAULT_READ_BUFFER_SIZE)]
    read_buffer: usize,
    /// trace, debug, info, warn or error
    #[clap(long, default_value = "info")]
    log_level: Level,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_thread_names(true)
        .init();

    let config = ServerConfig::builder()
        .address(SocketAddr::new(args.host, args.port))
        .workers(args.workers)
        .queue_capacity(args.queue_capacity)
        .overflow(args.overflow)
        .mode(args.mode)
        .poll_timeout(Duration::from_millis(args.poll_timeout_ms))
        .read_buffer_size(args.read_buffer)
        .build();

    let server = Server::start(config)
        .with_context(|| format!("failed to start server on {}:{}", args.host, args.port))?;
    tracing::info!(addr = %server.local_addr(), "server started");

    server.wait();
    Ok(())
}
