//! One request/response cycle per dispatched connection.
//!
//! A worker owns a connection only while it is `InFlight`. It performs a
//! single bounded read, treats whatever arrived as the complete request,
//! writes the handler's response in full and reports an [`Outcome`] back to
//! the poller. Failures stay inside the connection: they are logged, the
//! socket is closed and the poller is told to drop the registration.

use std::{
    io::{self, Read, Write},
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, trace, warn};

use crate::{
    buffer_pool::BufferPool,
    config::{ConnectionMode, ServerConfig},
    connection::Connection,
    error::{Result, ServerError},
    event::Readiness,
    handler::ResponseHandler,
    stats::ServerStats,
};

const WRITE_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// A connection claimed for a worker, plus the readiness that triggered it.
#[derive(Debug)]
pub struct WorkItem {
    connection: Arc<Connection>,
    readiness: Readiness,
}

impl WorkItem {
    pub fn new(connection: Arc<Connection>, readiness: Readiness) -> Self {
        Self {
            connection,
            readiness,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn into_connection(self) -> Arc<Connection> {
        self.connection
    }
}

/// What the poller should do with a connection once a worker is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Drop the registration; the connection is (or must be) closed.
    Close,
    /// Restore read interest and move the connection back to `Registered`.
    Rearm,
}

pub struct Worker {
    handler: Arc<dyn ResponseHandler>,
    buffers: BufferPool,
    mode: ConnectionMode,
    write_timeout: Duration,
    stats: Arc<ServerStats>,
}

impl Worker {
    pub fn new(
        handler: Arc<dyn ResponseHandler>,
        config: &ServerConfig,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            handler,
            buffers: BufferPool::new(config.workers, config.read_buffer_size),
            mode: config.mode,
            write_timeout: config.write_timeout,
            stats,
        }
    }

    /// Runs one cycle for `item`. Never fails: errors and handler panics are
    /// absorbed here and turned into [`Outcome::Close`].
    pub fn process(&self, item: &WorkItem) -> Outcome {
        let conn = item.connection();
        trace!(conn = %conn.id(), readiness = ?item.readiness(), "processing");

        let served = match panic::catch_unwind(AssertUnwindSafe(|| self.serve(conn))) {
            Ok(served) => served,
            Err(_) => {
                self.stats.record_error();
                error!(conn = %conn.id(), peer = %conn.peer_addr(), "response handler panicked");
                conn.close();
                return Outcome::Close;
            }
        };

        match served {
            Ok(outcome) => outcome,
            Err(ServerError::PeerClosed(id)) => {
                debug!(conn = %id, peer = %conn.peer_addr(), "client disconnected");
                conn.close();
                Outcome::Close
            }
            Err(err) => {
                self.stats.record_error();
                if err.is_connection_scoped() {
                    warn!(conn = %conn.id(), error = %err, "closing failed connection");
                } else {
                    error!(conn = %conn.id(), error = %err, "unexpected worker error");
                }
                conn.close();
                Outcome::Close
            }
        }
    }

    fn serve(&self, conn: &Connection) -> Result<Outcome> {
        let mut buffer = self.buffers.acquire();

        let read = match conn.with_stream(|stream| stream.read(&mut buffer[..])) {
            Some(read) => read,
            // closed underneath us, typically by shutdown
            None => return Ok(Outcome::Close),
        };

        let n = match read {
            Ok(0) => return Err(ServerError::PeerClosed(conn.id())),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!(conn = %conn.id(), "spurious wake-up, re-arming");
                return Ok(Outcome::Rearm);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Outcome::Rearm),
            Err(source) => {
                return Err(ServerError::Read {
                    conn: conn.id(),
                    source,
                })
            }
        };

        debug!(
            conn = %conn.id(),
            bytes = n,
            request = %String::from_utf8_lossy(&buffer[..n]),
            "received request"
        );

        let response = self.handler.respond(&buffer[..n]);
        self.write_all(conn, &response)?;
        self.stats.record_responded();
        debug!(conn = %conn.id(), bytes = response.len(), "sent response");

        match self.mode {
            ConnectionMode::OneShot => {
                conn.close();
                debug!(conn = %conn.id(), "closed connection");
                Ok(Outcome::Close)
            }
            ConnectionMode::Persistent => Ok(Outcome::Rearm),
        }
    }

    /// Writes `data` completely. The socket is non-blocking, so a full send
    /// buffer is retried until `write_timeout` runs out.
    fn write_all(&self, conn: &Connection, mut data: &[u8]) -> Result<()> {
        let deadline = Instant::now() + self.write_timeout;

        while !data.is_empty() {
            let written = conn
                .with_stream(|stream| stream.write(data))
                .unwrap_or_else(|| Err(io::ErrorKind::NotConnected.into()));

            match written {
                Ok(0) => {
                    return Err(ServerError::Write {
                        conn: conn.id(),
                        source: io::ErrorKind::WriteZero.into(),
                    })
                }
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(ServerError::WriteTimeout(conn.id()));
                    }
                    thread::sleep(WRITE_RETRY_INTERVAL);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => {
                    return Err(ServerError::Write {
                        conn: conn.id(),
                        source,
                    })
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        time::Duration,
    };

    use super::*;
    use crate::{
        connection::{tests::connection_pair, ConnState},
        handler::{HelloWorld, HELLO_WORLD_RESPONSE},
    };

    fn worker(mode: ConnectionMode) -> (Worker, Arc<ServerStats>) {
        let config = ServerConfig::builder().workers(1).mode(mode).build();
        let stats = Arc::new(ServerStats::new());
        (Worker::new(Arc::new(HelloWorld), &config, stats.clone()), stats)
    }

    fn in_flight(id: usize) -> (std::net::TcpStream, WorkItem) {
        let (client, conn) = connection_pair(id);
        assert!(conn.mark_registered());
        assert!(conn.begin_dispatch());
        let token = conn.token();
        (client, WorkItem::new(Arc::new(conn), Readiness::readable(token)))
    }

    fn read_to_end(client: &mut std::net::TcpStream) -> Vec<u8> {
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_one_shot_responds_and_closes() {
        let (worker, stats) = worker(ConnectionMode::OneShot);
        let (mut client, item) = in_flight(1);

        client.write_all(b"GET / \r\n\r\n").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(worker.process(&item), Outcome::Close);
        assert_eq!(item.connection().state(), ConnState::Closed);
        assert_eq!(read_to_end(&mut client), HELLO_WORLD_RESPONSE);
        assert_eq!(stats.snapshot().responded, 1);
    }

    #[test]
    fn test_end_of_stream_closes_without_response() {
        let (worker, stats) = worker(ConnectionMode::OneShot);
        let (client, item) = in_flight(2);

        client.shutdown(std::net::Shutdown::Write).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(worker.process(&item), Outcome::Close);
        assert!(item.connection().is_closed());
        let snap = stats.snapshot();
        assert_eq!(snap.responded, 0);
        assert_eq!(snap.errors, 0);

        let mut client = client;
        assert!(read_to_end(&mut client).is_empty());
    }

    #[test]
    fn test_spurious_wake_keeps_connection_open() {
        let (worker, _stats) = worker(ConnectionMode::OneShot);
        let (_client, item) = in_flight(3);

        assert_eq!(worker.process(&item), Outcome::Rearm);
        assert_eq!(item.connection().state(), ConnState::InFlight);
    }

    #[test]
    fn test_persistent_mode_rearms_after_response() {
        let (worker, stats) = worker(ConnectionMode::Persistent);
        let (mut client, item) = in_flight(4);

        client.write_all(b"ping").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(worker.process(&item), Outcome::Rearm);
        assert!(!item.connection().is_closed());

        let mut buf = vec![0u8; HELLO_WORLD_RESPONSE.len()];
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        client.read_exact(&mut buf).unwrap();
        assert_eq!(buf, HELLO_WORLD_RESPONSE);
        assert_eq!(stats.snapshot().responded, 1);
    }

    #[test]
    fn test_closed_connection_is_released() {
        let (worker, _stats) = worker(ConnectionMode::OneShot);
        let (_client, item) = in_flight(5);
        item.connection().close();

        assert_eq!(worker.process(&item), Outcome::Close);
    }

    #[test]
    fn test_panicking_handler_closes_connection() {
        let config = ServerConfig::builder().workers(1).build();
        let stats = Arc::new(ServerStats::new());
        let handler = |_req: &[u8]| -> Vec<u8> { panic!("handler failed") };
        let worker = Worker::new(Arc::new(handler), &config, stats.clone());
        let (mut client, item) = in_flight(7);

        client.write_all(b"boom").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(worker.process(&item), Outcome::Close);
        assert!(item.connection().is_closed());
        assert_eq!(stats.snapshot().errors, 1);
        assert!(read_to_end(&mut client).is_empty());
    }

    #[test]
    fn test_reset_by_peer_is_a_read_error() {
        let (worker, stats) = worker(ConnectionMode::OneShot);
        let (client, item) = in_flight(8);

        // unread data on the client side turns its close into a reset
        item.connection()
            .with_stream(|stream| stream.write_all(b"unsolicited"))
            .unwrap()
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        drop(client);
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(worker.process(&item), Outcome::Close);
        assert!(item.connection().is_closed());
        let snap = stats.snapshot();
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.responded, 0);
    }

    #[test]
    fn test_stalled_reader_hits_write_timeout() {
        let config = ServerConfig::builder()
            .workers(1)
            .write_timeout(Duration::from_millis(50))
            .build();
        let handler = |_req: &[u8]| vec![b'x'; 64 * 1024 * 1024];
        let worker = Worker::new(Arc::new(handler), &config, Arc::new(ServerStats::new()));
        let (mut client, item) = in_flight(9);

        client.write_all(b"GET / \r\n\r\n").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let conn = item.connection();
        let result = worker.serve(conn);
        assert!(matches!(result, Err(ServerError::WriteTimeout(id)) if id == conn.id()));

        // process closes on the same failure
        let (mut client, item) = in_flight(10);
        client.write_all(b"GET / \r\n\r\n").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(worker.process(&item), Outcome::Close);
        assert!(item.connection().is_closed());
    }

    #[test]
    fn test_request_larger_than_buffer_is_truncated() {
        let config = ServerConfig::builder()
            .workers(1)
            .read_buffer_size(4)
            .build();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let handler = move |req: &[u8]| {
            seen_clone.lock().unwrap().push(req.to_vec());
            b"ok".to_vec()
        };
        let worker = Worker::new(Arc::new(handler), &config, Arc::new(ServerStats::new()));
        let (mut client, item) = in_flight(6);

        client.write_all(b"abcdefgh").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(worker.process(&item), Outcome::Close);
        assert_eq!(seen.lock().unwrap().as_slice(), &[b"abcd".to_vec()]);
    }
}
