use mio::{event::Event, Token};
use std::fmt;

/// Owned snapshot of one readiness notification.
///
/// `mio::event::Event` borrows from the poller's `Events` buffer, so the
/// parts a worker cares about are copied out before the item crosses threads.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    token: Token,
    is_readable: bool,
    is_read_closed: bool,
    is_error: bool,
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("token", &self.token)
            .field("is_readable", &self.is_readable)
            .field("is_read_closed", &self.is_read_closed)
            .field("is_error", &self.is_error)
            .finish()
    }
}

impl Readiness {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.is_readable
    }

    pub fn is_read_closed(&self) -> bool {
        self.is_read_closed
    }

    pub fn is_error(&self) -> bool {
        self.is_error
    }

    #[cfg(test)]
    pub(crate) fn readable(token: Token) -> Self {
        Self {
            token,
            is_readable: true,
            is_read_closed: false,
            is_error: false,
        }
    }
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            is_readable: event.is_readable(),
            is_read_closed: event.is_read_closed(),
            is_error: event.is_error(),
        }
    }
}
