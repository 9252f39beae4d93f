use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use mio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    connection::{Connection, ConnectionId},
    error::{Result, ServerError},
    poller::PollerHandle,
    stats::ServerStats,
};

/// Owns the listening socket and feeds accepted connections to the poller.
pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    accept_idle: Duration,
    no_delay: bool,
    next_id: usize,
    stop: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
}

/// Stops a running [`Acceptor`] from another thread.
#[derive(Clone)]
pub struct AcceptorHandle {
    stop: Arc<AtomicBool>,
}

impl AcceptorHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

impl Acceptor {
    /// Binds the listening socket. Failing here is fatal for the server.
    pub fn bind(config: &ServerConfig, stats: Arc<ServerStats>) -> Result<Self> {
        let listener = TcpListener::bind(config.address).map_err(|source| ServerError::Bind {
            addr: config.address,
            source,
        })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            accept_idle: config.accept_idle,
            no_delay: config.no_delay,
            // 0 is the poller's waker token
            next_id: 1,
            stop: Arc::new(AtomicBool::new(false)),
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> AcceptorHandle {
        AcceptorHandle {
            stop: Arc::clone(&self.stop),
        }
    }

    /// Accept loop. Returns when stopped or when the poller goes away; the
    /// listening socket is closed on return.
    pub fn run(mut self, poller: PollerHandle) {
        info!(addr = %self.local_addr, "acceptor listening");

        while !self.stop.load(Ordering::Acquire) && !poller.is_shutdown() {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    self.stats.record_accepted();
                    if let Err(e) = stream.set_nodelay(self.no_delay) {
                        debug!(peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
                    }

                    let id = ConnectionId::new(self.next_id);
                    self.next_id += 1;
                    debug!(conn = %id, peer = %peer_addr, "accepted connection");

                    match poller.register(Arc::new(Connection::new(id, stream, peer_addr))) {
                        Ok(()) => {}
                        Err(ServerError::PollerGone) => {
                            warn!(peer = %peer_addr, "poller is gone, stopping acceptor");
                            break;
                        }
                        Err(e) => {
                            warn!(conn = %id, error = %e, "failed to hand connection to poller");
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(self.accept_idle);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.stats.record_error();
                    warn!(error = %ServerError::Accept(e), "accept failed");
                    thread::sleep(self.accept_idle);
                }
            }
        }

        info!(addr = %self.local_addr, "acceptor stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpStream;

    use super::*;
    use crate::{handler::HelloWorld, poller::Poller};

    fn loopback() -> ServerConfig {
        ServerConfig::builder()
            .address("127.0.0.1:0".parse().unwrap())
            .workers(1)
            .build()
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let acceptor = Acceptor::bind(&loopback(), Arc::new(ServerStats::new())).unwrap();
        assert_ne!(acceptor.local_addr().port(), 0);
    }

    #[test]
    fn test_bind_conflict_is_fatal() {
        let first = Acceptor::bind(&loopback(), Arc::new(ServerStats::new())).unwrap();
        let config = ServerConfig::builder().address(first.local_addr()).build();

        let err = Acceptor::bind(&config, Arc::new(ServerStats::new()))
            .err()
            .expect("second bind must fail");
        assert!(matches!(err, ServerError::Bind { addr, .. } if addr == first.local_addr()));
    }

    #[test]
    fn test_accepts_until_stopped() {
        let stats = Arc::new(ServerStats::new());
        let config = loopback();
        let poller = Poller::new(&config, Arc::new(HelloWorld), stats.clone()).unwrap();
        let poller_handle = poller.handle();
        let poller_thread = thread::spawn(move || poller.run());

        let acceptor = Acceptor::bind(&config, stats.clone()).unwrap();
        let addr = acceptor.local_addr();
        let stop = acceptor.handle();
        let acceptor_handle = poller_handle.clone();
        let acceptor_thread = thread::spawn(move || acceptor.run(acceptor_handle));

        let _a = TcpStream::connect(addr).unwrap();
        let _b = TcpStream::connect(addr).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while stats.snapshot().registered < 2 {
            assert!(std::time::Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stats.snapshot().accepted, 2);

        stop.stop();
        assert!(stop.is_stopped());
        acceptor_thread.join().unwrap();

        poller_handle.shutdown();
        poller_thread.join().unwrap().unwrap();
    }
}
