//! The external-collaborator contract a [`crate::connection::Connection`] is driven through.
//!
//! Establishing the underlying stream (TCP connect, TLS, reconnection policy) is the caller's
//! job; this crate only needs an opaque full-duplex byte channel. `send_bytes`/`close` are
//! deliberately synchronous: implementations queue bytes onto whatever actually does I/O (a
//! socket write task, an in-memory buffer in tests) rather than blocking the connection's own
//! event loop.
pub trait Transport: Send {
    /// Queue `bytes` for sending. Must preserve ordering relative to earlier calls.
    fn send_bytes(&mut self, bytes: &[u8]);
    /// Request that the underlying stream be closed.
    fn close(&mut self);
}

/// An in-memory transport useful for tests: every call to [`Transport::send_bytes`] appends to
/// an internal buffer the test can inspect, and `close` just flips a flag.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    pub sent: Vec<u8>,
    pub closed: bool,
}
impl Transport for MemoryTransport {
    fn send_bytes(&mut self, bytes: &[u8]) {
        self.sent.extend_from_slice(bytes);
    }
    fn close(&mut self) {
        self.closed = true;
    }
}
impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_str(&self) -> &str {
        std::str::from_utf8(&self.sent).expect("MemoryTransport only carries ASCII test fixtures")
    }

    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.sent)
    }
}
