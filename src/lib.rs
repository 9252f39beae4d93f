//! # minicat
//! A small reactor that splits connection handling across three kinds of
//! threads: one acceptor, one poller and a fixed pool of workers.
//! Built directly on [`mio`], without an async runtime.
//!
//! ## Architecture Overview
//! ```text
//! ┌──────────┐ register ┌──────────┐ WorkItem ┌──────────────┐
//! │ Acceptor │─────────▶│  Poller  │─────────▶│  ThreadPool  │
//! └──────────┘  + wake  │  (mio)   │◀─────────│   Workers    │
//!                       └──────────┘ complete └──────────────┘
//! ```
//!
//! - The [`acceptor`] owns the listening socket and hands every accepted
//!   stream to the poller.
//! - The [`poller`] is the only thread that touches `mio::Poll` and the
//!   registration table. Other threads talk to it through a lock-free queue
//!   and a [`mio::Waker`].
//! - A [`worker`] reads one request, writes one response and, by default,
//!   closes the connection.
//!
//! Each [`Connection`] carries an explicit state
//! (`New -> Registered -> InFlight -> Closed`). The poller claims a
//! connection before dispatching it and clears its read interest, so no two
//! workers ever see the same socket at once.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use minicat::{Server, ServerConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::builder()
//!         .port(9090)
//!         .workers(4)
//!         .build();
//!
//!     let server = Server::start(config)?;
//!     println!("listening on {}", server.local_addr());
//!     server.wait();
//!     Ok(())
//! }
//! ```
//!
//! Every request is answered with `HTTP/1.1 200 OK` and `Hello, World!`
//! unless a different [`ResponseHandler`] is supplied through
//! [`Server::with_handler`].

pub mod acceptor;
pub mod buffer_pool;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod handler;
pub mod poller;
pub mod stats;
pub mod thread_pool;
pub mod worker;

use std::{
    net::SocketAddr,
    sync::Arc,
    thread::{Builder, JoinHandle},
};

use tracing::{error, info};

pub use config::{ConnectionMode, OverflowPolicy, ServerConfig};
pub use connection::{ConnState, Connection, ConnectionId};
pub use error::{Result, ServerError};
pub use handler::{HelloWorld, ResponseHandler};
pub use stats::StatsSnapshot;

use crate::{
    acceptor::{Acceptor, AcceptorHandle},
    poller::{Poller, PollerHandle},
    stats::ServerStats,
};

/// Commonly used items, for `use minicat::prelude::*;`.
pub mod prelude {
    pub use crate::config::{ConnectionMode, OverflowPolicy, ServerConfig};
    pub use crate::handler::{HelloWorld, ResponseHandler};
    pub use crate::{Server, StatsSnapshot};
}

/// A running server: one acceptor thread, one poller thread and the worker
/// pool owned by the poller.
///
/// Dropping the server shuts it down the same way [`Server::shutdown`] does.
pub struct Server {
    local_addr: SocketAddr,
    stats: Arc<ServerStats>,
    acceptor: AcceptorHandle,
    poller: PollerHandle,
    acceptor_thread: Option<JoinHandle<()>>,
    poller_thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Binds `config.address` and starts serving the fixed hello-world
    /// response.
    ///
    /// ## Errors
    ///
    /// Returns [`ServerError::Bind`] when the address cannot be bound and
    /// [`ServerError::Spawn`] when a thread cannot be created.
    pub fn start(config: ServerConfig) -> Result<Self> {
        Self::with_handler(config, HelloWorld)
    }

    /// Like [`Server::start`], answering requests with `handler`.
    pub fn with_handler<H: ResponseHandler>(config: ServerConfig, handler: H) -> Result<Self> {
        let stats = Arc::new(ServerStats::new());
        let acceptor = Acceptor::bind(&config, Arc::clone(&stats))?;
        let poller = Poller::new(&config, Arc::new(handler), Arc::clone(&stats))?;

        let local_addr = acceptor.local_addr();
        let acceptor_handle = acceptor.handle();
        let poller_handle = poller.handle();

        info!(
            addr = %local_addr,
            workers = config.workers,
            mode = ?config.mode,
            overflow = ?config.overflow,
            "starting server"
        );

        let poller_thread = spawn("minicat-poller", move || {
            if let Err(e) = poller.run() {
                error!(error = %e, "poller exited with error");
            }
        })?;

        let registrar = poller_handle.clone();
        let acceptor_thread = match spawn("minicat-acceptor", move || acceptor.run(registrar)) {
            Ok(thread) => thread,
            Err(e) => {
                poller_handle.shutdown();
                let _ = poller_thread.join();
                return Err(e);
            }
        };

        Ok(Self {
            local_addr,
            stats,
            acceptor: acceptor_handle,
            poller: poller_handle,
            acceptor_thread: Some(acceptor_thread),
            poller_thread: Some(poller_thread),
        })
    }

    /// The bound address, with the real port when `0` was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stops accepting, closes every open connection, lets the workers drain
    /// and joins all threads.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    /// Blocks until the server's loops exit on their own.
    pub fn wait(mut self) {
        if let Some(thread) = self.poller_thread.take() {
            join("minicat-poller", thread);
        }
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.acceptor.stop();
        if let Some(thread) = self.acceptor_thread.take() {
            join("minicat-acceptor", thread);
        }

        self.poller.shutdown();
        if let Some(thread) = self.poller_thread.take() {
            join("minicat-poller", thread);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn spawn<F>(name: &str, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|source| ServerError::Spawn {
            name: name.to_string(),
            source,
        })
}

fn join(name: &str, thread: JoinHandle<()>) {
    if thread.join().is_err() {
        error!(thread = name, "thread panicked");
    }
}
