//! Platform error types

use core::fmt;

use crate::transport::TransportError;
use crate::trust::RejectReason;

/// Platform error type.
///
/// Every failure the adapter can report maps onto exactly one of these
/// variants; the handshake driver never surfaces a partial or ambiguous
/// result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformError {
    /// Arena exhaustion. Recoverable only by aborting the current
    /// handshake; retrying immediately cannot succeed since the arena
    /// never grows.
    OutOfMemory,
    /// Seed or reseed starvation. New sessions must be refused; existing
    /// sessions continue on their current seed until a forced reseed.
    InsufficientEntropy,
    /// Certificate chain, name, signature, or policy failure. Always
    /// fatal to the session, never retried.
    TrustRejected(RejectReason),
    /// Malformed or out-of-order handshake/record data. Always fatal.
    ProtocolFault,
    /// The transport cannot make progress right now. A normal suspension
    /// signal, not a failure: resume on the next readiness event.
    WouldBlock,
    /// The transport was closed underneath the session.
    TransportClosed,
    /// An operation was issued in a phase that does not permit it.
    InvalidState,
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::OutOfMemory => write!(f, "Arena out of memory"),
            PlatformError::InsufficientEntropy => write!(f, "Insufficient entropy collected"),
            PlatformError::TrustRejected(reason) => write!(f, "Trust rejected: {}", reason),
            PlatformError::ProtocolFault => write!(f, "TLS protocol fault"),
            PlatformError::WouldBlock => write!(f, "Operation would block"),
            PlatformError::TransportClosed => write!(f, "Transport closed"),
            PlatformError::InvalidState => write!(f, "Operation invalid in current phase"),
        }
    }
}

impl From<TransportError> for PlatformError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::WouldBlock => PlatformError::WouldBlock,
            TransportError::Closed => PlatformError::TransportClosed,
        }
    }
}

/// Result type for platform operations.
pub type Result<T> = core::result::Result<T, PlatformError>;
