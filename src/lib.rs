//! TLS Platform Adapter for Freestanding Kernels
//!
//! This crate provides the platform services a minimal TLS 1.2 client
//! engine needs when embedded in a kernel with no filesystem, no OS
//! threads, no wall-clock time, and no standard allocator. The engine's
//! cryptography and protocol machinery stay external; this layer supplies
//! what the engine's build assumes the platform has.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            External TLS 1.2 engine           │
//! ├──────────────────────────────────────────────┤
//! │           tls_platform (this crate)          │
//! │  ┌───────┐ ┌─────────┐ ┌───────┐ ┌─────────┐ │
//! │  │ arena │ │ entropy │ │ trust │ │ session │ │
//! │  └───┬───┘ └────┬────┘ └───┬───┘ └────┬────┘ │
//! └──────┼──────────┼──────────┼──────────┼──────┘
//!        │          │          │          │
//!   fixed region  jitter    anchors   kernel net
//!                 sources   + policy   event loop
//! ```
//!
//! # Modules
//!
//! - `arena`: fixed-region allocator behind the engine's calloc/free hooks
//! - `entropy`: jitter harvesting, seed whitening, and the reseed policy
//! - `trust`: clockless certificate-chain evaluation
//! - `session`: the non-blocking handshake driver state machine
//! - `engine`: the consumed boundary of the external TLS engine
//! - `transport`: the consumed boundary of the kernel's network stack

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arena;
pub mod engine;
pub mod entropy;
pub mod error;
pub mod session;
pub mod transport;
pub mod trust;

// Re-exports for convenience
pub use arena::{ArenaStats, BoundedArena};
pub use engine::{ChainVerifier, EngineError, EngineStatus, TlsEngine};
pub use entropy::{EntropyPool, SeededRng};
pub use error::{PlatformError, Result};
pub use session::{Phase, Session};
pub use transport::{Transport, TransportError};
pub use trust::{
    ChainLink, KeyUsage, RejectReason, SignatureBackend, SignatureScheme, TrustAnchor,
    TrustEvaluator, TrustPolicy, TrustVerdict, ValidityMode,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
