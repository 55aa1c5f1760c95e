//! Cryptographic engine boundary.
//!
//! The TLS record and handshake machinery is an external library with an
//! opaque session context. This module pins down the slice of its
//! contract the driver relies on: feed it protocol bytes, drain what it
//! wants sent, step it forward, and route its certificate-verification
//! callback into the trust evaluator. Nothing here implements TLS.

use core::fmt;

use crate::trust::{ChainLink, RejectReason, TrustVerdict};

/// What the engine reported after one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// The engine needs more inbound protocol bytes before it can make
    /// progress.
    WantRead,
    /// The engine queued outbound bytes that must reach the transport.
    WantWrite,
    /// The handshake finished; application data may flow.
    HandshakeFinished,
}

/// Fatal engine-side failures. None of these are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    /// A record failed structural parsing.
    MalformedRecord,
    /// Record decryption or MAC verification failed.
    DecryptFailed,
    /// A protocol rule was violated (unexpected message, bad state).
    ProtocolViolation,
    /// The certificate verification callback rejected the chain.
    CertificateRejected(RejectReason),
    /// The platform allocator refused a request mid-handshake.
    AllocFailed,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::MalformedRecord => write!(f, "malformed record"),
            EngineError::DecryptFailed => write!(f, "decryption failed"),
            EngineError::ProtocolViolation => write!(f, "protocol violation"),
            EngineError::CertificateRejected(r) => write!(f, "certificate rejected: {}", r),
            EngineError::AllocFailed => write!(f, "engine allocation failed"),
        }
    }
}

/// Certificate verification callback the driver registers with the
/// engine: a pure function of (chain, policy, optional assumed time).
/// The expected server name is bound on the driver side.
pub trait ChainVerifier {
    /// Verify the peer's chain, leaf first.
    fn verify_chain(&mut self, chain: &[ChainLink]) -> Result<TrustVerdict, RejectReason>;
}

/// The external TLS engine behind its opaque context.
///
/// All calls are non-blocking; the engine signals missing input through
/// [`EngineStatus::WantRead`] rather than waiting.
pub trait TlsEngine {
    /// Initialize the session context and seed the engine's generator.
    /// Called once, before any handshake traffic.
    fn start(&mut self, seed: &[u8; 32]) -> Result<(), EngineError>;

    /// Hand inbound protocol bytes to the engine. Returns how many were
    /// consumed; unconsumed bytes must be offered again later.
    fn accept_inbound(&mut self, data: &[u8]) -> Result<usize, EngineError>;

    /// Move queued outbound protocol bytes into `buf`. Returns the
    /// number written; zero when nothing is queued.
    fn drain_outbound(&mut self, buf: &mut [u8]) -> usize;

    /// Advance the handshake. The peer's certificate chain, when it
    /// arrives, is routed through `verifier`; a rejection there must
    /// surface as [`EngineError::CertificateRejected`].
    fn advance(&mut self, verifier: &mut dyn ChainVerifier) -> Result<EngineStatus, EngineError>;

    /// Encrypt application plaintext into queued outbound records.
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<(), EngineError>;

    /// Decrypt buffered inbound records into `out`. Returns the number
    /// of plaintext bytes produced; zero when no complete record is
    /// buffered.
    fn decrypt(&mut self, out: &mut [u8]) -> Result<usize, EngineError>;

    /// Queue a close_notify alert for the peer.
    fn queue_close_notify(&mut self) -> Result<(), EngineError>;
}

impl From<EngineError> for crate::error::PlatformError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::CertificateRejected(r) => crate::error::PlatformError::TrustRejected(r),
            EngineError::AllocFailed => crate::error::PlatformError::OutOfMemory,
            _ => crate::error::PlatformError::ProtocolFault,
        }
    }
}
