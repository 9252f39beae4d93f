//! The single thread that owns the multiplexer.
//!
//! ```text
//!  acceptor ──register──┐                         ┌──▶ worker ──┐
//!                       ▼                         │             │
//!              ┌─────────────────┐  readiness  ┌──┴──────────┐  │
//!              │ lock-free queue │──▶ Poller ──▶│ ThreadPool  │  │
//!              └─────────────────┘   (mio)     └─────────────┘  │
//!                       ▲                                       │
//!                       └──────────────complete─────────────────┘
//! ```
//!
//! Other threads never touch `mio::Poll` or the registration table. They push
//! a [`Request`] onto the queue and wake the poller, which applies it on its
//! next iteration. On readiness the poller claims the connection
//! (`Registered -> InFlight`) and deregisters it before submitting the work
//! item, so a second readiness report cannot dispatch the same connection
//! twice. Read interest comes back only through [`Outcome::Rearm`].

use std::{
    collections::HashMap,
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use lockfree::queue::Queue;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::ServerConfig,
    connection::{ConnState, Connection},
    error::{Result, ServerError},
    event::Readiness,
    handler::{ResponseHandler, SERVICE_UNAVAILABLE_RESPONSE},
    stats::ServerStats,
    thread_pool::ThreadPool,
    worker::{Outcome, WorkItem, Worker},
};

/// Reserved for the poller's [`Waker`]; connection ids start at 1.
pub const WAKE_TOKEN: Token = Token(0);

enum Request {
    Register(Arc<Connection>),
    Complete {
        connection: Arc<Connection>,
        outcome: Outcome,
    },
}

impl Request {
    fn into_connection(self) -> Arc<Connection> {
        match self {
            Request::Register(connection) | Request::Complete { connection, .. } => connection,
        }
    }
}

/// Cloneable, thread-safe way to talk to a running [`Poller`].
#[derive(Clone)]
pub struct PollerHandle {
    requests: Arc<Queue<Request>>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

impl PollerHandle {
    /// Queues `connection` for registration and wakes the poller so it is
    /// picked up without waiting out the poll timeout.
    pub fn register(&self, connection: Arc<Connection>) -> Result<()> {
        if self.is_shutdown() {
            return Err(ServerError::PollerGone);
        }
        self.requests.push(Request::Register(connection));
        self.waker.wake().map_err(ServerError::Io)
    }

    /// Reports a worker's verdict on `connection`.
    pub fn complete(&self, connection: Arc<Connection>, outcome: Outcome) {
        self.requests.push(Request::Complete {
            connection,
            outcome,
        });
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake poller");
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            debug!(error = %e, "failed to wake poller for shutdown");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

pub struct Poller {
    poll: Poll,
    events: Events,
    poll_timeout: Duration,
    read_buffer_size: usize,
    registrations: HashMap<Token, Arc<Connection>>,
    pool: ThreadPool<WorkItem>,
    handle: PollerHandle,
    stats: Arc<ServerStats>,
    ready: Vec<Readiness>,
}

impl Poller {
    /// Creates the multiplexer and spins up the worker pool. The pool posts
    /// every completion back through this poller's handle.
    pub fn new(
        config: &ServerConfig,
        handler: Arc<dyn ResponseHandler>,
        stats: Arc<ServerStats>,
    ) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let handle = PollerHandle {
            requests: Arc::new(Queue::new()),
            waker: Arc::new(waker),
            shutdown: Arc::new(AtomicBool::new(false)),
        };

        let worker = Worker::new(handler, config, Arc::clone(&stats));
        let completions = handle.clone();
        let pool = ThreadPool::new(
            "minicat",
            config.workers,
            config.queue_capacity,
            config.overflow,
            move |item: WorkItem| {
                let outcome = worker.process(&item);
                completions.complete(item.into_connection(), outcome);
            },
        )?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            poll_timeout: config.poll_timeout,
            read_buffer_size: config.read_buffer_size,
            registrations: HashMap::new(),
            pool,
            handle,
            stats,
            ready: Vec::with_capacity(config.events_capacity),
        })
    }

    pub fn handle(&self) -> PollerHandle {
        self.handle.clone()
    }

    /// Runs the wait/dispatch loop until [`PollerHandle::shutdown`] is called
    /// or the multiplexer fails, then closes every connection it still knows
    /// about and drains the worker pool.
    pub fn run(mut self) -> Result<()> {
        info!(workers = self.pool.workers_len(), "poller running");
        let result = self.event_loop();
        if let Err(e) = &result {
            error!(error = %e, "poller stopped on error");
        }

        let Poller {
            registrations,
            pool,
            handle,
            stats,
            ..
        } = self;

        handle.shutdown.store(true, Ordering::Release);
        for conn in registrations.into_values() {
            conn.close();
        }
        drop(pool);
        while let Some(request) = handle.requests.pop() {
            request.into_connection().close();
        }
        stats.set_active(0);

        info!("poller stopped");
        result
    }

    fn event_loop(&mut self) -> Result<()> {
        while !self.handle.is_shutdown() {
            if let Err(e) = self.poll.poll(&mut self.events, Some(self.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ServerError::Poll(e));
            }

            self.drain_requests();

            let mut ready = std::mem::take(&mut self.ready);
            ready.extend(
                self.events
                    .iter()
                    .filter(|event| event.token() != WAKE_TOKEN)
                    .map(Readiness::from),
            );
            for readiness in ready.drain(..) {
                self.on_ready(readiness);
            }
            self.ready = ready;

            self.stats.set_active(self.registrations.len());
        }
        Ok(())
    }

    fn drain_requests(&mut self) {
        while let Some(request) = self.handle.requests.pop() {
            match request {
                Request::Register(conn) => self.register(conn),
                Request::Complete {
                    connection,
                    outcome,
                } => self.complete(connection, outcome),
            }
        }
    }

    fn register(&mut self, conn: Arc<Connection>) {
        if let Err(source) = conn.register(self.poll.registry(), Interest::READABLE) {
            self.stats.record_error();
            let err = ServerError::Registration {
                conn: conn.id(),
                source,
            };
            warn!(peer = %conn.peer_addr(), error = %err, "dropping connection");
            conn.close();
            return;
        }

        conn.mark_registered();
        self.stats.record_registered();
        debug!(conn = %conn.id(), peer = %conn.peer_addr(), "registered connection");
        self.registrations.insert(conn.token(), conn);
    }

    fn on_ready(&mut self, readiness: Readiness) {
        let Some(conn) = self.registrations.get(&readiness.token()).cloned() else {
            trace!(token = ?readiness.token(), "readiness for unknown token");
            return;
        };

        if conn.state() != ConnState::Registered {
            return;
        }

        if readiness.is_read_closed() && conn.peer_closed_idle() {
            debug!(
                conn = %conn.id(),
                peer = %conn.peer_addr(),
                "client closed before sending a request"
            );
            self.stats.record_closed_idle();
            self.release(&conn);
            return;
        }

        if readiness.is_error() && !readiness.is_readable() {
            self.stats.record_error();
            warn!(conn = %conn.id(), peer = %conn.peer_addr(), "socket error, closing");
            self.release(&conn);
            return;
        }

        if !conn.begin_dispatch() {
            trace!(conn = %conn.id(), "already in flight");
            return;
        }

        // clear read interest until the worker reports back
        if let Err(source) = conn.deregister(self.poll.registry()) {
            self.stats.record_error();
            let err = ServerError::Registration {
                conn: conn.id(),
                source,
            };
            warn!(error = %err, "failed to clear read interest");
            self.release(&conn);
            return;
        }

        match self.pool.submit(WorkItem::new(conn, readiness)) {
            Ok(()) => self.stats.record_dispatched(),
            Err(rejected) => self.reject(rejected.into_inner().into_connection()),
        }
    }

    fn complete(&mut self, conn: Arc<Connection>, outcome: Outcome) {
        match outcome {
            Outcome::Close => {
                self.registrations.remove(&conn.token());
                conn.close();
                trace!(conn = %conn.id(), "registration released");
            }
            Outcome::Rearm if conn.is_closed() || self.handle.is_shutdown() => {
                self.registrations.remove(&conn.token());
                conn.close();
            }
            Outcome::Rearm => {
                if let Err(source) = conn.register(self.poll.registry(), Interest::READABLE) {
                    self.stats.record_error();
                    let err = ServerError::Registration {
                        conn: conn.id(),
                        source,
                    };
                    warn!(error = %err, "failed to re-arm connection");
                    self.registrations.remove(&conn.token());
                    conn.close();
                    return;
                }
                conn.rearm();
                trace!(conn = %conn.id(), "read interest restored");
            }
        }
    }

    /// Answers a connection the pool had no room for, then closes it.
    fn reject(&mut self, conn: Arc<Connection>) {
        warn!(
            conn = %conn.id(),
            peer = %conn.peer_addr(),
            error = %ServerError::PoolSaturated,
            "rejecting connection"
        );
        self.stats.record_rejected();

        let mut discard = vec![0u8; self.read_buffer_size];
        let sent = conn.with_stream(|stream| {
            // consume the request so closing does not reset the connection
            if let Err(e) = stream.read(&mut discard) {
                trace!(conn = %conn.id(), error = %e, "could not drain rejected request");
            }
            write_nonblocking(stream, SERVICE_UNAVAILABLE_RESPONSE)
        });
        match sent {
            Some(Ok(n)) if n == SERVICE_UNAVAILABLE_RESPONSE.len() => {}
            Some(Ok(n)) => debug!(conn = %conn.id(), written = n, "rejection truncated"),
            Some(Err(e)) => debug!(conn = %conn.id(), error = %e, "failed to write rejection"),
            None => {}
        }

        self.registrations.remove(&conn.token());
        conn.close();
    }

    fn release(&mut self, conn: &Arc<Connection>) {
        if conn.state() == ConnState::Registered {
            let _ = conn.deregister(self.poll.registry());
        }
        self.registrations.remove(&conn.token());
        conn.close();
    }
}

/// Writes as much of `data` as the socket takes without waiting. The poller
/// thread must never block on a single connection.
fn write_nonblocking(stream: &mut impl Write, data: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        match stream.write(&data[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::Shutdown,
        thread,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{
        config::ServerConfig,
        connection::tests::connection_pair,
        handler::{HelloWorld, HELLO_WORLD_RESPONSE},
    };

    fn spawn_poller(
        config: ServerConfig,
    ) -> (PollerHandle, Arc<ServerStats>, thread::JoinHandle<Result<()>>) {
        let stats = Arc::new(ServerStats::new());
        let poller = Poller::new(&config, Arc::new(HelloWorld), stats.clone()).unwrap();
        let handle = poller.handle();
        let join = thread::spawn(move || poller.run());
        (handle, stats, join)
    }

    fn wait_for(stats: &ServerStats, what: impl Fn(&crate::stats::StatsSnapshot) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !what(&stats.snapshot()) {
            assert!(Instant::now() < deadline, "timed out: {:?}", stats.snapshot());
            thread::sleep(Duration::from_millis(5));
        }
    }

    struct Trickle {
        accepted: Vec<u8>,
        room: usize,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.room).min(4);
            self.accepted.extend_from_slice(&buf[..n]);
            self.room -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_rejection_write_reports_short_write() {
        let mut full = Trickle {
            accepted: Vec::new(),
            room: usize::MAX,
        };
        let n = write_nonblocking(&mut full, SERVICE_UNAVAILABLE_RESPONSE).unwrap();
        assert_eq!(n, SERVICE_UNAVAILABLE_RESPONSE.len());
        assert_eq!(full.accepted, SERVICE_UNAVAILABLE_RESPONSE);

        let mut cramped = Trickle {
            accepted: Vec::new(),
            room: 10,
        };
        let n = write_nonblocking(&mut cramped, SERVICE_UNAVAILABLE_RESPONSE).unwrap();
        assert_eq!(n, 10);
        assert_eq!(cramped.accepted, &SERVICE_UNAVAILABLE_RESPONSE[..10]);
    }

    #[test]
    fn test_request_gets_response() {
        let (handle, stats, join) = spawn_poller(ServerConfig::builder().workers(2).build());
        let (mut client, conn) = connection_pair(1);

        handle.register(Arc::new(conn)).unwrap();
        client.write_all(b"GET / \r\n\r\n").unwrap();

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert_eq!(response, HELLO_WORLD_RESPONSE);

        wait_for(&stats, |s| s.active == 0);
        assert_eq!(stats.snapshot().dispatched, 1);

        handle.shutdown();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_registration_wakes_blocked_poll() {
        let config = ServerConfig::builder()
            .workers(1)
            .poll_timeout(Duration::from_secs(30))
            .build();
        let (handle, stats, join) = spawn_poller(config);

        // let the poller settle into its long wait
        thread::sleep(Duration::from_millis(100));

        let (mut client, conn) = connection_pair(7);
        let start = Instant::now();
        handle.register(Arc::new(conn)).unwrap();
        wait_for(&stats, |s| s.registered == 1);
        client.write_all(b"x").unwrap();

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert_eq!(response, HELLO_WORLD_RESPONSE);
        assert!(start.elapsed() < Duration::from_secs(5));

        handle.shutdown();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_idle_close_spawns_no_work() {
        let (handle, stats, join) = spawn_poller(ServerConfig::builder().workers(2).build());
        let (client, conn) = connection_pair(3);
        let conn = Arc::new(conn);

        client.shutdown(Shutdown::Both).unwrap();
        drop(client);
        thread::sleep(Duration::from_millis(50));
        handle.register(conn.clone()).unwrap();

        wait_for(&stats, |s| s.closed_idle == 1);
        let snap = stats.snapshot();
        assert_eq!(snap.dispatched, 0);
        assert_eq!(snap.responded, 0);
        wait_for(&stats, |s| s.active == 0);
        assert!(conn.is_closed());

        handle.shutdown();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_shutdown_closes_registered_connections() {
        let (handle, stats, join) = spawn_poller(ServerConfig::builder().workers(1).build());
        let (mut client, conn) = connection_pair(4);
        let conn = Arc::new(conn);

        handle.register(conn.clone()).unwrap();
        wait_for(&stats, |s| s.active == 1);

        handle.shutdown();
        join.join().unwrap().unwrap();

        assert!(conn.is_closed());
        assert!(matches!(handle.register(conn), Err(ServerError::PollerGone)));

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
