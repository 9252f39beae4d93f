use std::{net::SocketAddr, str::FromStr, time::Duration};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_ACCEPT_IDLE_MS: u64 = 5;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5_000;

/// What happens to a connection after its response has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    /// Serve exactly one request, then close.
    #[default]
    OneShot,
    /// Re-arm read interest after each response.
    Persistent,
}

/// Admission policy for the worker pool queue once it holds
/// `queue_capacity` items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// The poller waits until a worker frees a slot.
    #[default]
    Block,
    /// The connection is answered with `503 Service Unavailable` and closed.
    Reject,
    /// Ignore the capacity and keep queueing.
    Unbounded,
}

impl FromStr for ConnectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one-shot" | "oneshot" => Ok(ConnectionMode::OneShot),
            "persistent" => Ok(ConnectionMode::Persistent),
            other => Err(format!("unknown connection mode '{other}'")),
        }
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(OverflowPolicy::Block),
            "reject" => Ok(OverflowPolicy::Reject),
            "unbounded" => Ok(OverflowPolicy::Unbounded),
            other => Err(format!("unknown overflow policy '{other}'")),
        }
    }
}

/// Configuration for a [`Server`](crate::Server).
///
/// Use [`ServerConfig::builder()`] for ergonomic construction; every field
/// left unset falls back to [`ServerConfig::default()`].
///
/// ## Sizing
///
/// - workers: number of threads running read/respond/close cycles
/// - queue_capacity: work items that may wait for a worker before
///   `overflow` kicks in
/// - read_buffer_size: the single read per request never exceeds this
///
/// ## Timing
///
/// - poll_timeout: upper bound on one multiplexer wait, keeps shutdown prompt
/// - accept_idle: acceptor back-off when nothing is pending
/// - write_timeout: how long a worker keeps retrying a congested write
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub address: SocketAddr,
    /// Worker thread count
    pub workers: usize,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub mode: ConnectionMode,
    pub read_buffer_size: usize,
    /// Events drained per poll call
    pub events_capacity: usize,
    pub poll_timeout: Duration,
    pub accept_idle: Duration,
    pub write_timeout: Duration,
    /// Enable TCP_NODELAY on accepted sockets
    pub no_delay: bool,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 8090)),
            workers: default_workers(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
            mode: ConnectionMode::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            accept_idle: Duration::from_millis(DEFAULT_ACCEPT_IDLE_MS),
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            no_delay: true,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_WORKERS)
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    address: Option<SocketAddr>,
    workers: Option<usize>,
    queue_capacity: Option<usize>,
    overflow: Option<OverflowPolicy>,
    mode: Option<ConnectionMode>,
    read_buffer_size: Option<usize>,
    events_capacity: Option<usize>,
    poll_timeout: Option<Duration>,
    accept_idle: Option<Duration>,
    write_timeout: Option<Duration>,
    no_delay: Option<bool>,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address to bind to
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Shorthand for binding every interface on `port`
    pub fn port(mut self, port: u16) -> Self {
        self.address = Some(SocketAddr::from(([0, 0, 0, 0], port)));
        self
    }

    /// Set the number of worker threads (at least one is always spawned)
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = Some(policy);
        self
    }

    pub fn mode(mut self, mode: ConnectionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = Some(size);
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn accept_idle(mut self, idle: Duration) -> Self {
        self.accept_idle = Some(idle);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    /// Build the ServerConfig, clamping sizes that must be non-zero
    pub fn build(self) -> ServerConfig {
        let default = ServerConfig::default();
        ServerConfig {
            address: self.address.unwrap_or(default.address),
            workers: self.workers.unwrap_or(default.workers).max(1),
            queue_capacity: self.queue_capacity.unwrap_or(default.queue_capacity).max(1),
            overflow: self.overflow.unwrap_or(default.overflow),
            mode: self.mode.unwrap_or(default.mode),
            read_buffer_size: self
                .read_buffer_size
                .unwrap_or(default.read_buffer_size)
                .max(1),
            events_capacity: self
                .events_capacity
                .unwrap_or(default.events_capacity)
                .max(1),
            poll_timeout: self.poll_timeout.unwrap_or(default.poll_timeout),
            accept_idle: self.accept_idle.unwrap_or(default.accept_idle),
            write_timeout: self.write_timeout.unwrap_or(default.write_timeout),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
        }
    }
}
