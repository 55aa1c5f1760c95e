//! Transport boundary.
//!
//! The kernel's network stack delivers a non-blocking byte pipe; the
//! driver never sees packets, sockets, or readiness queues. Would-block
//! is a normal suspension signal: the driver parks and the event loop
//! calls back in on the next readiness event.

use core::fmt;

/// Transport error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No progress possible right now; retry on the next readiness
    /// event. Not a failure.
    WouldBlock,
    /// The peer or the kernel closed the connection.
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::WouldBlock => write!(f, "transport would block"),
            TransportError::Closed => write!(f, "transport closed"),
        }
    }
}

/// Non-blocking byte transport provided by the kernel's network stack.
pub trait Transport {
    /// Write as many of `bytes` as the transport will take right now.
    /// Returns the number written; `WouldBlock` when the write buffer
    /// has no room at all.
    fn send(&mut self, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Read available bytes into `buf`. Returns the number read;
    /// `WouldBlock` when nothing is pending.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Tear the connection down. Called on session failure and close;
    /// the default is a no-op for transports the kernel recycles itself.
    fn shutdown(&mut self) {}
}
