//! Handshake driver: the TLS session state machine.
//!
//! The driver owns one engine context, one transport, and one trust
//! evaluator, and advances only when the kernel's event loop calls in —
//! there is no background thread and no call that blocks. Every entry
//! point either completes or parks on a would-block condition to be
//! resumed on the next transport-readiness event.
//!
//! Phases: `Idle -> TransportConnecting -> HandshakeInProgress ->
//! Established -> Closing -> Closed`, with `Failed` absorbing from any
//! non-terminal phase. Fatal errors are never retried; a caller that
//! observes `Failed` or `Closed` starts over with a fresh session.

use alloc::string::String;
use alloc::vec::Vec;

use crate::engine::{ChainVerifier, EngineStatus, TlsEngine};
use crate::entropy::{EntropyPool, SeededRng};
use crate::error::{PlatformError, Result};
use crate::transport::{Transport, TransportError};
use crate::trust::{ChainLink, RejectReason, SignatureBackend, TrustEvaluator, TrustVerdict};

/// Session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No connection; the only phase from which `open` is accepted.
    Idle,
    /// Waiting for the kernel to report the transport ready.
    TransportConnecting,
    /// Pumping handshake bytes between transport and engine.
    HandshakeInProgress,
    /// Handshake complete; application data flows.
    Established,
    /// Best-effort close notification in flight.
    Closing,
    /// Terminal: orderly shutdown finished.
    Closed,
    /// Terminal: fatal error; see `last_error`.
    Failed,
}

impl Phase {
    /// Whether the session can never leave this phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Closed | Phase::Failed)
    }
}

/// A single TLS client session.
///
/// Owns the engine context exclusively and destroys it on every exit
/// path (drop). Never shared across sessions; a new connection means a
/// new `Session`.
pub struct Session<T: Transport, E: TlsEngine, B: SignatureBackend> {
    transport: T,
    engine: E,
    trust: TrustEvaluator<B>,
    server_name: String,
    phase: Phase,
    rng: SeededRng,
    /// Engine output not yet accepted by the transport.
    out_pending: Vec<u8>,
    /// Transport input not yet accepted by the engine.
    in_pending: Vec<u8>,
    last_error: Option<PlatformError>,
    verdict: Option<TrustVerdict>,
}

impl<T: Transport, E: TlsEngine, B: SignatureBackend> Session<T, E, B> {
    /// Create an idle session for `server_name`.
    pub fn new(transport: T, engine: E, trust: TrustEvaluator<B>, server_name: &str) -> Self {
        Session {
            transport,
            engine,
            trust,
            server_name: String::from(server_name),
            phase: Phase::Idle,
            rng: SeededRng::new_unseeded(),
            out_pending: Vec::new(),
            in_pending: Vec::new(),
            last_error: None,
            verdict: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The error that moved the session to `Failed`, if any.
    pub fn last_error(&self) -> Option<PlatformError> {
        self.last_error
    }

    /// The trust verdict recorded during the handshake. Lets callers
    /// distinguish a clean `Trusted` from
    /// `TrustedValidityUnchecked`.
    pub fn trust_verdict(&self) -> Option<TrustVerdict> {
        self.verdict
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Start the session: seed the generator from the shared pool, set
    /// up the engine context, and wait for transport readiness.
    ///
    /// Refused with `InsufficientEntropy` while the pool is below its
    /// threshold or the generator's reseed budget cannot be renewed —
    /// the session then stays `Idle` and may be opened again once the
    /// kernel has harvested more samples.
    pub fn open(&mut self, pool: &mut EntropyPool) -> Result<()> {
        if self.phase != Phase::Idle {
            return Err(PlatformError::InvalidState);
        }

        self.rng.begin_handshake(pool)?;
        let mut seed = [0u8; 32];
        self.rng.fill(&mut seed)?;
        let started = self.engine.start(&seed);
        seed.fill(0);
        if let Err(e) = started {
            return Err(self.fail(e.into()));
        }

        self.set_phase(Phase::TransportConnecting);
        Ok(())
    }

    /// Advance the session in response to a transport-readiness event.
    ///
    /// Returns the phase after pumping; would-block conditions are
    /// absorbed (they only mean "call again on the next event").
    pub fn on_transport_ready(&mut self) -> Result<Phase> {
        match self.phase {
            Phase::TransportConnecting => {
                self.set_phase(Phase::HandshakeInProgress);
                self.pump_handshake()?;
            }
            Phase::HandshakeInProgress => self.pump_handshake()?,
            Phase::Established => match self.flush_pending() {
                Ok(()) | Err(PlatformError::WouldBlock) => {}
                Err(e) => return Err(self.fail(e)),
            },
            Phase::Idle | Phase::Closing | Phase::Closed | Phase::Failed => {}
        }
        Ok(self.phase)
    }

    /// Send application data.
    ///
    /// The whole request is either accepted (encrypted and queued; any
    /// bytes the transport does not take now are flushed on later
    /// readiness events) or the session fails. No partial success is
    /// reported.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.phase != Phase::Established {
            return Err(PlatformError::InvalidState);
        }

        if let Err(e) = self.engine.encrypt(bytes) {
            return Err(self.fail(e.into()));
        }
        self.drain_engine_outbound();
        match self.flush_pending() {
            Ok(()) | Err(PlatformError::WouldBlock) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Receive decrypted application data into `buf`.
    ///
    /// Returns the number of plaintext bytes produced, or `WouldBlock`
    /// when no complete record has arrived yet.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.phase != Phase::Established {
            return Err(PlatformError::InvalidState);
        }

        if let Err(e) = self.pull_transport_inbound() {
            return Err(self.fail(e));
        }
        if let Err(e) = self.feed_engine() {
            return Err(self.fail(e));
        }
        match self.engine.decrypt(buf) {
            Ok(0) => Err(PlatformError::WouldBlock),
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// Close the session.
    ///
    /// One best-effort close notification is attempted; failure to
    /// deliver it is not escalated — the session reaches `Closed`
    /// either way. In-flight buffers are zeroed before return.
    pub fn close(&mut self) -> Result<()> {
        match self.phase {
            Phase::Closed | Phase::Failed => return Ok(()),
            Phase::Idle => {
                self.set_phase(Phase::Closed);
                return Ok(());
            }
            _ => {}
        }

        self.set_phase(Phase::Closing);
        if self.engine.queue_close_notify().is_ok() {
            self.drain_engine_outbound();
            if let Err(e) = self.flush_pending() {
                log::debug!("[TLS Session] close_notify not delivered: {}", e);
            }
        }

        scrub(&mut self.out_pending);
        scrub(&mut self.in_pending);
        self.transport.shutdown();
        self.set_phase(Phase::Closed);
        Ok(())
    }

    // ── Internal ──

    fn pump_handshake(&mut self) -> Result<()> {
        loop {
            match self.flush_pending() {
                Ok(()) | Err(PlatformError::WouldBlock) => {}
                Err(e) => return Err(self.fail(e)),
            }

            let had_input = match self.pull_transport_inbound() {
                Ok(n) => n > 0,
                Err(e) => return Err(self.fail(e)),
            };
            if let Err(e) = self.feed_engine() {
                return Err(self.fail(e));
            }

            let (result, rejection, verdict) = {
                let mut recorder = RecordingVerifier {
                    eval: &self.trust,
                    name: &self.server_name,
                    rejection: None,
                    verdict: None,
                };
                let result = self.engine.advance(&mut recorder);
                (result, recorder.rejection, recorder.verdict)
            };
            if let Some(v) = verdict {
                self.verdict = Some(v);
            }

            match result {
                Ok(EngineStatus::HandshakeFinished) => {
                    self.drain_engine_outbound();
                    match self.flush_pending() {
                        Ok(()) | Err(PlatformError::WouldBlock) => {}
                        Err(e) => return Err(self.fail(e)),
                    }
                    self.set_phase(Phase::Established);
                    return Ok(());
                }
                Ok(EngineStatus::WantWrite) => {
                    self.drain_engine_outbound();
                }
                Ok(EngineStatus::WantRead) => {
                    self.drain_engine_outbound();
                    if !had_input {
                        // Nothing more to feed: park until the next
                        // readiness event.
                        match self.flush_pending() {
                            Ok(()) | Err(PlatformError::WouldBlock) => return Ok(()),
                            Err(e) => return Err(self.fail(e)),
                        }
                    }
                }
                Err(e) => {
                    // A trust rejection overrides whatever error code the
                    // engine wrapped around it.
                    let mapped = match rejection {
                        Some(r) => PlatformError::TrustRejected(r),
                        None => e.into(),
                    };
                    return Err(self.fail(mapped));
                }
            }
        }
    }

    /// Read everything the transport has into `in_pending`.
    fn pull_transport_inbound(&mut self) -> Result<usize> {
        let mut total = 0;
        let mut buf = [0u8; 512];
        loop {
            match self.transport.receive(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.in_pending.extend_from_slice(&buf[..n]);
                    total += n;
                }
                Err(TransportError::WouldBlock) => break,
                Err(TransportError::Closed) => return Err(PlatformError::TransportClosed),
            }
        }
        Ok(total)
    }

    /// Offer `in_pending` to the engine, keeping whatever it refuses.
    fn feed_engine(&mut self) -> Result<()> {
        while !self.in_pending.is_empty() {
            let consumed = self.engine.accept_inbound(&self.in_pending)?;
            if consumed == 0 {
                break;
            }
            self.in_pending.drain(..consumed);
        }
        Ok(())
    }

    /// Move queued engine output into `out_pending`.
    fn drain_engine_outbound(&mut self) {
        let mut chunk = [0u8; 512];
        loop {
            let n = self.engine.drain_outbound(&mut chunk);
            if n == 0 {
                break;
            }
            self.out_pending.extend_from_slice(&chunk[..n]);
        }
    }

    /// Push `out_pending` to the transport until empty or would-block.
    fn flush_pending(&mut self) -> Result<()> {
        while !self.out_pending.is_empty() {
            match self.transport.send(&self.out_pending) {
                Ok(0) | Err(TransportError::WouldBlock) => {
                    return Err(PlatformError::WouldBlock)
                }
                Ok(n) => {
                    self.out_pending.drain(..n);
                }
                Err(TransportError::Closed) => return Err(PlatformError::TransportClosed),
            }
        }
        Ok(())
    }

    /// Move to `Failed`, recording `err` and zeroing in-flight buffers.
    /// Returns `err` back for propagation.
    fn fail(&mut self, err: PlatformError) -> PlatformError {
        scrub(&mut self.out_pending);
        scrub(&mut self.in_pending);
        self.transport.shutdown();
        self.last_error = Some(err);
        self.set_phase(Phase::Failed);
        log::error!("[TLS Session] fatal: {}", err);
        err
    }

    fn set_phase(&mut self, next: Phase) {
        if self.phase != next {
            log::debug!("[TLS Session] {:?} -> {:?}", self.phase, next);
            self.phase = next;
        }
    }
}

/// Zero then drop buffered bytes that may carry secrets.
fn scrub(buf: &mut Vec<u8>) {
    for b in buf.iter_mut() {
        *b = 0;
    }
    buf.clear();
}

/// The verification callback handed to the engine: binds the evaluator
/// and the expected server name, and records the outcome so the driver
/// can override the engine's own error mapping.
struct RecordingVerifier<'a, B: SignatureBackend> {
    eval: &'a TrustEvaluator<B>,
    name: &'a str,
    rejection: Option<RejectReason>,
    verdict: Option<TrustVerdict>,
}

impl<'a, B: SignatureBackend> ChainVerifier for RecordingVerifier<'a, B> {
    fn verify_chain(
        &mut self,
        chain: &[ChainLink],
    ) -> core::result::Result<TrustVerdict, RejectReason> {
        match self.eval.evaluate(chain, self.name) {
            Ok(v) => {
                self.verdict = Some(v);
                Ok(v)
            }
            Err(r) => {
                self.rejection = Some(r);
                Err(r)
            }
        }
    }
}
