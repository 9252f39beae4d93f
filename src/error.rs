use std::{io, net::SocketAddr, result::Result as StdResult};

use thiserror::Error;

use crate::connection::ConnectionId;

pub type Result<T> = StdResult<T, ServerError>;

/// Everything that can go wrong between binding the listener and closing the
/// last connection.
///
/// Only [`ServerError::Bind`] and [`ServerError::Spawn`] ever reach the caller
/// of [`Server::start`](crate::Server::start). The rest are scoped to one
/// connection: they are logged, the connection is closed and the loops keep
/// running.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("failed to register {conn}: {source}")]
    Registration {
        conn: ConnectionId,
        #[source]
        source: io::Error,
    },
    #[error("read from {conn} failed: {source}")]
    Read {
        conn: ConnectionId,
        #[source]
        source: io::Error,
    },
    #[error("write to {conn} failed: {source}")]
    Write {
        conn: ConnectionId,
        #[source]
        source: io::Error,
    },
    #[error("{0} closed by peer")]
    PeerClosed(ConnectionId),
    #[error("write to {0} did not drain before the deadline")]
    WriteTimeout(ConnectionId),
    #[error("worker pool saturated")]
    PoolSaturated,
    #[error("poller is no longer running")]
    PollerGone,
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ServerError {
    /// Whether the error only concerns a single connection.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            ServerError::Registration { .. }
                | ServerError::Read { .. }
                | ServerError::Write { .. }
                | ServerError::PeerClosed(_)
                | ServerError::WriteTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_scoped() {
        let conn = ConnectionId::new(7);
        let read = ServerError::Read {
            conn,
            source: io::Error::from(io::ErrorKind::ConnectionReset),
        };
        assert!(read.is_connection_scoped());
        assert!(ServerError::PeerClosed(conn).is_connection_scoped());
        assert!(!ServerError::PoolSaturated.is_connection_scoped());
        assert!(!ServerError::Accept(io::Error::from(io::ErrorKind::Other)).is_connection_scoped());
    }

    #[test]
    fn test_display_names_connection() {
        let err = ServerError::WriteTimeout(ConnectionId::new(3));
        assert_eq!(err.to_string(), "write to conn#3 did not drain before the deadline");
    }
}
