//! Entropy harvesting and deterministic random-bit generation.
//!
//! The kernel has no OS entropy service, so unpredictability is gathered
//! opportunistically: timing jitter, interrupt arrival times, hardware
//! counters — whatever a driver can sample, it feeds into the pool via
//! [`EntropyPool::collect`]. Samples are never exposed directly; seed
//! material is always a SHA-256 digest over everything accumulated so far,
//! so a weak individual source cannot be read back out.
//!
//! [`SeededRng`] is the ChaCha20-based deterministic generator built on
//! top of the pool. It refuses to produce output before seeding and after
//! its reseed budget is spent, degrading to `InsufficientEntropy` instead
//! of quietly stretching a stale seed.

use core::ffi::c_void;

use sha2::{Digest, Sha256};
use spin::Mutex;

use crate::error::PlatformError;

/// Seed length in bytes (one SHA-256 digest).
pub const SEED_LEN: usize = 32;

/// Minimum credited bits before seed material may be extracted.
pub const MIN_POOL_BITS: u32 = 256;

/// Conservative entropy credit for one sample of unknown quality.
pub const BITS_PER_SAMPLE: u32 = 2;

/// Generated bytes allowed between reseeds.
pub const RESEED_BYTE_BUDGET: usize = 16 * 1024;

/// Handshakes allowed between reseeds.
pub const RESEED_HANDSHAKE_BUDGET: u32 = 4;

/// Accumulating pool of harvested unpredictability.
///
/// The accumulator is a running SHA-256 state; extraction forks the state,
/// folds in an extraction counter, and feeds the digest back into the
/// accumulator. Two sufficient collections therefore never produce the
/// same seed bytes.
pub struct EntropyPool {
    acc: Sha256,
    credited_bits: u32,
    samples: u64,
    extractions: u64,
}

impl EntropyPool {
    /// An empty pool with zero credited bits.
    pub fn new() -> Self {
        EntropyPool {
            acc: Sha256::new(),
            credited_bits: 0,
            samples: 0,
            extractions: 0,
        }
    }

    /// Feed one opportunistic sample, credited at [`BITS_PER_SAMPLE`].
    pub fn collect(&mut self, sample: &[u8]) {
        self.collect_with_credit(sample, BITS_PER_SAMPLE);
    }

    /// Feed a sample from a source whose per-sample entropy is known,
    /// e.g. a hardware RNG injected later as an additional stream.
    pub fn collect_with_credit(&mut self, sample: &[u8], bits: u32) {
        // Length-prefix each sample so sample boundaries are part of the
        // hashed transcript.
        self.acc.update((sample.len() as u64).to_le_bytes());
        self.acc.update(sample);
        self.credited_bits = self.credited_bits.saturating_add(bits);
        self.samples += 1;
    }

    /// Credited bits collected so far.
    pub fn credited_bits(&self) -> u32 {
        self.credited_bits
    }

    /// Whitened seed material, once the pool has met its threshold.
    pub fn seed_material(&mut self) -> Result<[u8; SEED_LEN], PlatformError> {
        if self.credited_bits < MIN_POOL_BITS {
            log::debug!(
                "[TLS Entropy] seed refused: {}/{} bits credited",
                self.credited_bits,
                MIN_POOL_BITS
            );
            return Err(PlatformError::InsufficientEntropy);
        }

        let mut fork = self.acc.clone();
        fork.update(b"seed-extract");
        fork.update(self.extractions.to_le_bytes());
        let digest = fork.finalize();

        let mut seed = [0u8; SEED_LEN];
        seed.copy_from_slice(&digest);

        // Fold the output back so the accumulator state moves forward.
        self.acc.update(digest);
        self.extractions += 1;
        Ok(seed)
    }

    /// Number of extractions performed; used as a DRBG nonce.
    pub fn extractions(&self) -> u64 {
        self.extractions
    }
}

impl Default for EntropyPool {
    fn default() -> Self {
        Self::new()
    }
}

// ── Deterministic random-bit generator ──────────────────────

/// ChaCha20-based generator seeded from the entropy pool.
///
/// Output is refused until the first successful seed and again once either
/// reseed budget (generated bytes or started handshakes) is spent.
pub struct SeededRng {
    state: [u32; 16],
    buffer: [u8; 64],
    buf_pos: usize,
    seeded: bool,
    generated: usize,
    handshakes: u32,
}

impl SeededRng {
    /// An unseeded generator. Refuses output until reseeded.
    pub const fn new_unseeded() -> Self {
        SeededRng {
            state: [0; 16],
            buffer: [0; 64],
            buf_pos: 64,
            seeded: false,
            generated: 0,
            handshakes: 0,
        }
    }

    /// Seed or reseed from the pool. Fails with `InsufficientEntropy`
    /// when the pool has not met its threshold; an already-seeded
    /// generator keeps its current seed in that case.
    pub fn reseed(&mut self, pool: &mut EntropyPool) -> Result<(), PlatformError> {
        let seed = pool.seed_material()?;

        // "expand 32-byte k"
        self.state[0] = 0x6170_7865;
        self.state[1] = 0x3320_646e;
        self.state[2] = 0x7962_2d32;
        self.state[3] = 0x6b20_6574;

        for i in 0..8 {
            self.state[4 + i] = u32::from_le_bytes([
                seed[i * 4],
                seed[i * 4 + 1],
                seed[i * 4 + 2],
                seed[i * 4 + 3],
            ]);
        }
        // Block counter.
        self.state[12] = 0;
        self.state[13] = 0;
        // Nonce: the pool's extraction counter, unique per seed.
        let nonce = pool.extractions().to_le_bytes();
        self.state[14] = u32::from_le_bytes([nonce[0], nonce[1], nonce[2], nonce[3]]);
        self.state[15] = u32::from_le_bytes([nonce[4], nonce[5], nonce[6], nonce[7]]);

        self.buf_pos = 64;
        self.seeded = true;
        self.generated = 0;
        self.handshakes = 0;
        log::debug!("[TLS Entropy] generator reseeded");
        Ok(())
    }

    /// Account for a new handshake; reseeds from `pool` once the
    /// handshake budget is spent. A session must not start when this
    /// fails.
    pub fn begin_handshake(&mut self, pool: &mut EntropyPool) -> Result<(), PlatformError> {
        if !self.seeded || self.handshakes >= RESEED_HANDSHAKE_BUDGET {
            self.reseed(pool)?;
        }
        self.handshakes += 1;
        Ok(())
    }

    /// Fill `dest` with generator output.
    ///
    /// Fails with `InsufficientEntropy` if unseeded or past the byte
    /// budget; the caller must reseed rather than keep drawing.
    pub fn fill(&mut self, dest: &mut [u8]) -> Result<(), PlatformError> {
        if !self.seeded {
            return Err(PlatformError::InsufficientEntropy);
        }
        if self.generated.saturating_add(dest.len()) > RESEED_BYTE_BUDGET {
            log::warn!("[TLS Entropy] byte budget spent, reseed required");
            return Err(PlatformError::InsufficientEntropy);
        }

        let mut off = 0;
        while off < dest.len() {
            if self.buf_pos >= 64 {
                self.generate_block();
            }
            let take = (64 - self.buf_pos).min(dest.len() - off);
            dest[off..off + take].copy_from_slice(&self.buffer[self.buf_pos..self.buf_pos + take]);
            self.buf_pos += take;
            off += take;
        }
        self.generated += dest.len();
        Ok(())
    }

    /// Whether the generator currently holds a live seed.
    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    fn generate_block(&mut self) {
        let mut x = self.state;
        for _ in 0..10 {
            // column rounds
            quarter_round(&mut x, 0, 4, 8, 12);
            quarter_round(&mut x, 1, 5, 9, 13);
            quarter_round(&mut x, 2, 6, 10, 14);
            quarter_round(&mut x, 3, 7, 11, 15);
            // diagonal rounds
            quarter_round(&mut x, 0, 5, 10, 15);
            quarter_round(&mut x, 1, 6, 11, 12);
            quarter_round(&mut x, 2, 7, 8, 13);
            quarter_round(&mut x, 3, 4, 9, 14);
        }
        for i in 0..16 {
            x[i] = x[i].wrapping_add(self.state[i]);
        }
        for i in 0..16 {
            self.buffer[i * 4..i * 4 + 4].copy_from_slice(&x[i].to_le_bytes());
        }
        self.state[12] = self.state[12].wrapping_add(1);
        if self.state[12] == 0 {
            self.state[13] = self.state[13].wrapping_add(1);
        }
        self.buf_pos = 0;
    }
}

#[inline]
fn quarter_round(x: &mut [u32; 16], a: usize, b: usize, c: usize, d: usize) {
    x[a] = x[a].wrapping_add(x[b]);
    x[d] ^= x[a];
    x[d] = x[d].rotate_left(16);
    x[c] = x[c].wrapping_add(x[d]);
    x[b] ^= x[c];
    x[b] = x[b].rotate_left(12);
    x[a] = x[a].wrapping_add(x[b]);
    x[d] ^= x[a];
    x[d] = x[d].rotate_left(8);
    x[c] = x[c].wrapping_add(x[d]);
    x[b] ^= x[c];
    x[b] = x[b].rotate_left(7);
}

// ── Engine hook boundary ────────────────────────────────────
//
// The engine registers one entropy source callback at DRBG init and calls
// it again on every periodic reseed. It carries a context pointer we do
// not use: the pool is process-wide because drivers and interrupt paths
// feed it long before any session exists.

/// Failure code the engine expects from a starved entropy source.
const ERR_ENTROPY_SOURCE_FAILED: i32 = -0x003C;

/// Global pool fed by the kernel's jitter sources.
static POOL: Mutex<Option<EntropyPool>> = Mutex::new(None);

/// Feed one sample into the global pool.
///
/// Safe to call from any kernel context that honors the single-owner
/// discipline (the event loop); interrupt paths hand their samples to the
/// event loop rather than locking here.
pub fn pool_collect(sample: &[u8]) {
    let mut guard = POOL.lock();
    guard.get_or_insert_with(EntropyPool::new).collect(sample);
}

/// Feed a sample with an explicit entropy credit into the global pool.
pub fn pool_collect_with_credit(sample: &[u8], bits: u32) {
    let mut guard = POOL.lock();
    guard
        .get_or_insert_with(EntropyPool::new)
        .collect_with_credit(sample, bits);
}

/// Run `f` against the global pool. Used by session drivers that seed
/// their per-session generator from the shared pool.
pub fn with_pool<R>(f: impl FnOnce(&mut EntropyPool) -> R) -> R {
    let mut guard = POOL.lock();
    f(guard.get_or_insert_with(EntropyPool::new))
}

/// Entropy source callback exported to the engine.
///
/// Writes up to `len` bytes of whitened seed material into `buf`. Reports
/// source failure while the pool is below threshold, which makes the
/// engine's DRBG init (and any periodic reseed) fail instead of running
/// on a predictable seed.
#[no_mangle]
pub extern "C" fn kernel_entropy_poll(
    _ctx: *mut c_void,
    buf: *mut u8,
    len: usize,
    olen: *mut usize,
) -> i32 {
    if buf.is_null() || olen.is_null() {
        return ERR_ENTROPY_SOURCE_FAILED;
    }

    let mut guard = POOL.lock();
    let pool = guard.get_or_insert_with(EntropyPool::new);

    let mut written = 0;
    while written < len {
        let seed = match pool.seed_material() {
            Ok(seed) => seed,
            Err(_) => {
                unsafe { *olen = 0 };
                return ERR_ENTROPY_SOURCE_FAILED;
            }
        };
        let take = (len - written).min(SEED_LEN);
        unsafe { core::ptr::copy_nonoverlapping(seed.as_ptr(), buf.add(written), take) };
        written += take;
    }
    unsafe { *olen = written };
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_pool() -> EntropyPool {
        let mut pool = EntropyPool::new();
        for i in 0..((MIN_POOL_BITS / BITS_PER_SAMPLE) as u64 + 4) {
            pool.collect(&i.to_le_bytes());
        }
        pool
    }

    #[test]
    fn test_seed_refused_below_threshold() {
        let mut pool = EntropyPool::new();
        for i in 0u64..10 {
            pool.collect(&i.to_le_bytes());
        }
        assert_eq!(pool.seed_material(), Err(PlatformError::InsufficientEntropy));
    }

    #[test]
    fn test_seed_available_above_threshold() {
        let mut pool = filled_pool();
        assert!(pool.seed_material().is_ok());
    }

    #[test]
    fn test_two_extractions_differ() {
        let mut pool = filled_pool();
        let a = pool.seed_material().unwrap();
        let b = pool.seed_material().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_independent_collections_differ() {
        let mut p1 = filled_pool();
        let mut p2 = EntropyPool::new();
        for i in 0..((MIN_POOL_BITS / BITS_PER_SAMPLE) as u64 + 4) {
            p2.collect(&(i * 3 + 1).to_le_bytes());
        }
        assert_ne!(p1.seed_material().unwrap(), p2.seed_material().unwrap());
    }

    #[test]
    fn test_unseeded_generator_refuses_output() {
        let mut rng = SeededRng::new_unseeded();
        let mut buf = [0u8; 16];
        assert_eq!(rng.fill(&mut buf), Err(PlatformError::InsufficientEntropy));
    }

    #[test]
    fn test_generator_output_changes_across_reseeds() {
        let mut pool = filled_pool();
        let mut rng = SeededRng::new_unseeded();

        rng.reseed(&mut pool).unwrap();
        let mut a = [0u8; 32];
        rng.fill(&mut a).unwrap();

        rng.reseed(&mut pool).unwrap();
        let mut b = [0u8; 32];
        rng.fill(&mut b).unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn test_byte_budget_forces_reseed() {
        let mut pool = filled_pool();
        let mut rng = SeededRng::new_unseeded();
        rng.reseed(&mut pool).unwrap();

        let mut chunk = [0u8; 1024];
        for _ in 0..(RESEED_BYTE_BUDGET / chunk.len()) {
            rng.fill(&mut chunk).unwrap();
        }
        assert_eq!(
            rng.fill(&mut chunk),
            Err(PlatformError::InsufficientEntropy)
        );

        rng.reseed(&mut pool).unwrap();
        assert!(rng.fill(&mut chunk).is_ok());
    }

    #[test]
    fn test_handshake_budget_forces_reseed() {
        let mut pool = filled_pool();
        let mut rng = SeededRng::new_unseeded();

        for _ in 0..(RESEED_HANDSHAKE_BUDGET * 2 + 1) {
            // The pool stays above threshold, so the periodic reseed
            // always succeeds and sessions keep starting.
            rng.begin_handshake(&mut pool).unwrap();
        }

        // A starved pool must refuse the handshake once the budget is
        // spent, not reuse the stale seed.
        let mut dry = EntropyPool::new();
        let mut rng = SeededRng::new_unseeded();
        assert_eq!(
            rng.begin_handshake(&mut dry),
            Err(PlatformError::InsufficientEntropy)
        );
    }

    #[test]
    fn test_entropy_hook_reports_starvation() {
        // Fresh global pool: below threshold.
        *POOL.lock() = Some(EntropyPool::new());
        let mut buf = [0u8; 32];
        let mut olen = 0usize;
        let rc = kernel_entropy_poll(
            core::ptr::null_mut(),
            buf.as_mut_ptr(),
            buf.len(),
            &mut olen,
        );
        assert_eq!(rc, ERR_ENTROPY_SOURCE_FAILED);
        assert_eq!(olen, 0);

        *POOL.lock() = Some(filled_pool());
        let rc = kernel_entropy_poll(
            core::ptr::null_mut(),
            buf.as_mut_ptr(),
            buf.len(),
            &mut olen,
        );
        assert_eq!(rc, 0);
        assert_eq!(olen, 32);
        assert!(buf.iter().any(|&b| b != 0));
    }
}
