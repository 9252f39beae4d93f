//! Typed connection handle shared between the poller and one worker.
//!
//! ```text
//!   New ──register──▶ Registered ──dispatch──▶ InFlight ──close──▶ Closed
//!                          ▲                      │
//!                          └────────rearm─────────┘
//! ```
//!
//! The state lives in an atomic so the poller can claim a connection for a
//! worker with a single compare-and-swap. A connection that fails the swap is
//! already owned by a worker and must not be dispatched again.

use std::{
    fmt, io,
    net::{Shutdown, SocketAddr},
    sync::{
        atomic::{AtomicU8, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use mio::{net::TcpStream, Interest, Registry, Token};

/// Unique identifier for connections.
///
/// Ids are handed out by the acceptor in increasing order and double as the
/// poll token, so they never collide with [`WAKE_TOKEN`](crate::poller::WAKE_TOKEN).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub usize);

impl ConnectionId {
    pub fn new(id: usize) -> Self {
        ConnectionId(id)
    }

    pub fn token(&self) -> Token {
        Token(self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    New = 0,
    Registered = 1,
    InFlight = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::New,
            1 => ConnState::Registered,
            2 => ConnState::InFlight,
            _ => ConnState::Closed,
        }
    }
}

pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    state: AtomicU8,
    stream: Mutex<Option<TcpStream>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub fn new(id: ConnectionId, stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            state: AtomicU8::new(ConnState::New as u8),
            stream: Mutex::new(Some(stream)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn token(&self) -> Token {
        self.id.token()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnState::Closed
    }

    fn transition(&self, from: ConnState, to: ConnState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `New -> Registered`, after the poller added the stream to its registry.
    pub fn mark_registered(&self) -> bool {
        self.transition(ConnState::New, ConnState::Registered)
    }

    /// `Registered -> InFlight`. Returns `false` when another dispatch already
    /// owns the connection or it has been closed.
    pub fn begin_dispatch(&self) -> bool {
        self.transition(ConnState::Registered, ConnState::InFlight)
    }

    /// `InFlight -> Registered`, once read interest has been restored.
    pub fn rearm(&self) -> bool {
        self.transition(ConnState::InFlight, ConnState::Registered)
    }

    /// Moves to `Closed` and drops the socket. Returns `true` for the call
    /// that actually closed it.
    pub fn close(&self) -> bool {
        let previous =
            ConnState::from_u8(self.state.swap(ConnState::Closed as u8, Ordering::AcqRel));
        if let Some(stream) = self.lock_stream().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        previous != ConnState::Closed
    }

    /// Runs `f` against the socket, or returns `None` once the connection is
    /// closed.
    pub fn with_stream<R>(&self, f: impl FnOnce(&mut TcpStream) -> R) -> Option<R> {
        let mut guard = self.lock_stream();
        guard.as_mut().map(f)
    }

    pub(crate) fn register(&self, registry: &Registry, interest: Interest) -> io::Result<()> {
        let token = self.token();
        self.with_stream(|stream| registry.register(stream, token, interest))
            .unwrap_or_else(|| Err(io::ErrorKind::NotConnected.into()))
    }

    pub(crate) fn deregister(&self, registry: &Registry) -> io::Result<()> {
        self.with_stream(|stream| registry.deregister(stream))
            .unwrap_or(Ok(()))
    }

    /// `true` when the peer has finished its half of the stream without
    /// leaving any unread bytes behind.
    pub(crate) fn peer_closed_idle(&self) -> bool {
        let mut peeked = [0u8; 1];
        self.with_stream(|stream| matches!(stream.peek(&mut peeked), Ok(0)))
            .unwrap_or(true)
    }

    fn lock_stream(&self) -> MutexGuard<'_, Option<TcpStream>> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
