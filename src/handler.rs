use std::borrow::Cow;

/// The fixed reply every request receives from [`HelloWorld`].
pub const HELLO_WORLD_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\nHello, World!";

/// Written by the poller to connections turned away by a saturated pool.
pub const SERVICE_UNAVAILABLE_RESPONSE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n";

/// Turns one request (the raw bytes of a single read) into the bytes written
/// back before the connection is closed or re-armed.
///
/// Runs on worker threads, so implementations must not assume any thread
/// affinity.
pub trait ResponseHandler: Send + Sync + 'static {
    fn respond<'a>(&'a self, request: &[u8]) -> Cow<'a, [u8]>;
}

/// Ignores the request and answers `200 OK` with `Hello, World!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HelloWorld;

impl ResponseHandler for HelloWorld {
    fn respond<'a>(&'a self, _request: &[u8]) -> Cow<'a, [u8]> {
        Cow::Borrowed(HELLO_WORLD_RESPONSE)
    }
}

impl<F> ResponseHandler for F
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
{
    fn respond<'a>(&'a self, request: &[u8]) -> Cow<'a, [u8]> {
        Cow::Owned(self(request))
    }
}
