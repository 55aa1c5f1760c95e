//! Bounded arena allocator.
//!
//! Services every dynamic-memory request the TLS engine makes out of a
//! single fixed-size region handed over at install time. The region never
//! grows: exhaustion is reported as [`PlatformError::OutOfMemory`], never
//! papered over with a hidden syscall.
//!
//! Bookkeeping is an inline offset/size record table rather than a
//! pointer-linked free list, so the partition of the region can be audited
//! by walking a plain array. Released blocks are zeroed before they become
//! reusable; combined with zeroing the whole region at install, every block
//! handed out is zero-filled, which is exactly the `calloc` contract the
//! engine expects.

use core::ffi::c_void;
use core::ptr::{self, NonNull};

use spin::Mutex;

use crate::error::PlatformError;

/// All blocks are carved on 16-byte boundaries, which covers the natural
/// alignment of every size class the engine requests.
pub const BLOCK_ALIGN: usize = 16;

/// Capacity of the inline record table. The engine's allocation pattern is
/// bursty but bounded per handshake; a full table is reported as
/// exhaustion like any other out-of-memory condition.
const MAX_RECORDS: usize = 128;

#[derive(Clone, Copy)]
struct Record {
    offset: usize,
    size: usize,
    used: bool,
}

impl Record {
    const EMPTY: Record = Record {
        offset: 0,
        size: 0,
        used: false,
    };
}

/// Usage counters for the arena.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArenaStats {
    /// Total region size in bytes.
    pub region_size: usize,
    /// Bytes currently handed out.
    pub live_bytes: usize,
    /// High-water mark of `live_bytes`.
    pub peak_bytes: usize,
    /// Largest single free block available right now.
    pub largest_free: usize,
    /// Allocation requests refused with `OutOfMemory`.
    pub failed_requests: u64,
}

/// A fixed-region first-fit allocator.
///
/// Records partition the region with no overlap; adjacent free records are
/// coalesced on release. Total outstanding allocation never exceeds the
/// region size.
pub struct BoundedArena {
    base: *mut u8,
    size: usize,
    records: [Record; MAX_RECORDS],
    len: usize,
    live_bytes: usize,
    peak_bytes: usize,
    failed_requests: u64,
}

// SAFETY: the arena exclusively owns its region; access from the engine's
// context-free C hooks is serialized by the global spin::Mutex below.
unsafe impl Send for BoundedArena {}

impl BoundedArena {
    /// Take ownership of `size` bytes at `base` and zero them.
    ///
    /// The usable region starts at the first [`BLOCK_ALIGN`] boundary at
    /// or after `base`, so every block handed out carries the natural
    /// alignment of its size class even when the caller's region does not.
    ///
    /// # Safety
    ///
    /// `base..base+size` must be valid, writable, and unused by anything
    /// else for the lifetime of the arena.
    pub unsafe fn new(base: *mut u8, size: usize) -> Self {
        let shift = base.align_offset(BLOCK_ALIGN);
        let (base, size) = if shift < size {
            (unsafe { base.add(shift) }, size - shift)
        } else {
            (base, 0)
        };
        let size = size & !(BLOCK_ALIGN - 1);
        unsafe { ptr::write_bytes(base, 0, size) };

        let mut records = [Record::EMPTY; MAX_RECORDS];
        let len = if size > 0 {
            records[0] = Record {
                offset: 0,
                size,
                used: false,
            };
            1
        } else {
            0
        };

        BoundedArena {
            base,
            size,
            records,
            len,
            live_bytes: 0,
            peak_bytes: 0,
            failed_requests: 0,
        }
    }

    /// Allocate `size` bytes, first-fit.
    ///
    /// The returned block is zero-filled and aligned to [`BLOCK_ALIGN`].
    /// Fails with `OutOfMemory` when no free record can hold the request;
    /// the arena never grows.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, PlatformError> {
        let rounded = round_up(size.max(1));

        for i in 0..self.len {
            if self.records[i].used || self.records[i].size < rounded {
                continue;
            }

            let remainder = self.records[i].size - rounded;
            if remainder > 0 && self.len < MAX_RECORDS {
                let tail = Record {
                    offset: self.records[i].offset + rounded,
                    size: remainder,
                    used: false,
                };
                self.records[i].size = rounded;
                self.insert(i + 1, tail);
            }
            // If the table is full the whole free block is handed out;
            // over-allocation keeps the partition invariant intact.

            self.records[i].used = true;
            self.live_bytes += self.records[i].size;
            self.peak_bytes = self.peak_bytes.max(self.live_bytes);

            let ptr = unsafe { self.base.add(self.records[i].offset) };
            // NonNull::new never fails here: base is non-null and the
            // offset stays inside the region.
            return NonNull::new(ptr).ok_or(PlatformError::OutOfMemory);
        }

        self.failed_requests += 1;
        log::warn!(
            "[TLS Arena] allocation of {} bytes refused (live {}/{})",
            size,
            self.live_bytes,
            self.size
        );
        Err(PlatformError::OutOfMemory)
    }

    /// Release a block previously returned by [`allocate`](Self::allocate).
    ///
    /// The block is zeroed before its record is marked free, so no key
    /// material or plaintext survives into the next allocation. Releasing
    /// a null pointer or an already-released block is a safe no-op, even
    /// after the block's boundary was coalesced away; releasing a pointer
    /// outside the region is a programming error, fatal in debug builds
    /// and ignored in release builds.
    pub fn release(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let addr = ptr as usize;
        let base = self.base as usize;
        if addr < base || addr >= base + self.size {
            debug_assert!(false, "release of pointer outside the arena region");
            log::warn!("[TLS Arena] ignoring release of foreign pointer");
            return;
        }
        let offset = addr - base;

        let Some(i) = (0..self.len).find(|&i| self.records[i].offset == offset) else {
            // Coalescing can erase the boundary of an already-released
            // block, so a stale in-region pointer may miss the table.
            log::warn!("[TLS Arena] ignoring release at non-block offset {}", offset);
            return;
        };

        if !self.records[i].used {
            // Double release: bookkeeping is already consistent.
            log::warn!("[TLS Arena] double release at offset {}", offset);
            return;
        }

        unsafe { ptr::write_bytes(self.base.add(offset), 0, self.records[i].size) };
        self.records[i].used = false;
        self.live_bytes -= self.records[i].size;
        self.coalesce(i);
    }

    /// Merge the free record at `i` with free neighbors.
    fn coalesce(&mut self, mut i: usize) {
        if i > 0 && !self.records[i - 1].used {
            self.records[i - 1].size += self.records[i].size;
            self.remove(i);
            i -= 1;
        }
        if i + 1 < self.len && !self.records[i + 1].used {
            self.records[i].size += self.records[i + 1].size;
            self.remove(i + 1);
        }
    }

    /// Current usage counters.
    pub fn stats(&self) -> ArenaStats {
        let largest_free = (0..self.len)
            .filter(|&i| !self.records[i].used)
            .map(|i| self.records[i].size)
            .max()
            .unwrap_or(0);
        ArenaStats {
            region_size: self.size,
            live_bytes: self.live_bytes,
            peak_bytes: self.peak_bytes,
            largest_free,
            failed_requests: self.failed_requests,
        }
    }

    fn insert(&mut self, idx: usize, rec: Record) {
        for j in (idx..self.len).rev() {
            self.records[j + 1] = self.records[j];
        }
        self.records[idx] = rec;
        self.len += 1;
    }

    fn remove(&mut self, idx: usize) {
        for j in idx..self.len - 1 {
            self.records[j] = self.records[j + 1];
        }
        self.len -= 1;
    }
}

#[inline]
fn round_up(size: usize) -> usize {
    (size + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1)
}

// ── Engine hook boundary ────────────────────────────────────
//
// The engine's platform-memory hooks carry no context pointer, so the
// arena they reach must be process-wide. The kernel's event loop is the
// single logical owner; the spin lock only serializes the hook calls.

/// Global arena serving the engine's calloc/free hooks.
static ARENA: Mutex<Option<BoundedArena>> = Mutex::new(None);

/// Install the global arena over `size` bytes at `base`.
///
/// Must be called once, before the engine is started.
///
/// # Safety
///
/// Same region requirements as [`BoundedArena::new`].
pub unsafe fn install(base: *mut u8, size: usize) {
    let arena = unsafe { BoundedArena::new(base, size) };
    *ARENA.lock() = Some(arena);
    log::debug!("[TLS Arena] installed {} byte region", size);
}

/// Usage counters of the global arena, if installed.
pub fn global_stats() -> Option<ArenaStats> {
    ARENA.lock().as_ref().map(|a| a.stats())
}

/// `calloc` replacement exported to the engine.
///
/// Returns a zero-filled block or null on exhaustion. The engine treats a
/// null return as its own out-of-memory error and aborts the handshake.
#[no_mangle]
pub extern "C" fn kernel_calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(total) = nmemb.checked_mul(size) else {
        return ptr::null_mut();
    };
    if total == 0 {
        return ptr::null_mut();
    }

    let mut guard = ARENA.lock();
    let Some(arena) = guard.as_mut() else {
        log::error!("[TLS Arena] kernel_calloc before install");
        return ptr::null_mut();
    };
    match arena.allocate(total) {
        Ok(p) => p.as_ptr() as *mut c_void,
        Err(_) => ptr::null_mut(),
    }
}

/// `free` replacement exported to the engine.
#[no_mangle]
pub extern "C" fn kernel_free(ptr: *mut c_void) {
    let mut guard = ARENA.lock();
    if let Some(arena) = guard.as_mut() {
        arena.release(ptr as *mut u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    fn backing(size: usize) -> Vec<u8> {
        vec![0xAA; size]
    }

    #[test]
    fn test_allocate_within_capacity() {
        let mut mem = backing(1024);
        let mut arena = unsafe { BoundedArena::new(mem.as_mut_ptr(), mem.len()) };

        let a = arena.allocate(100).unwrap();
        let b = arena.allocate(200).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert!(arena.stats().live_bytes <= 1024);
        assert_eq!(a.as_ptr() as usize % BLOCK_ALIGN, 0);
        assert_eq!(b.as_ptr() as usize % BLOCK_ALIGN, 0);
    }

    #[test]
    fn test_exhaustion_yields_out_of_memory() {
        let mut mem = backing(256);
        let mut arena = unsafe { BoundedArena::new(mem.as_mut_ptr(), mem.len()) };

        let _a = arena.allocate(128).unwrap();
        let _b = arena.allocate(112).unwrap();
        assert_eq!(arena.allocate(64), Err(PlatformError::OutOfMemory));
        assert_eq!(arena.stats().failed_requests, 1);
        // Bookkeeping must survive the refusal.
        assert!(arena.stats().live_bytes <= 256);
    }

    #[test]
    fn test_live_bytes_never_exceed_region() {
        let mut mem = backing(512);
        let mut arena = unsafe { BoundedArena::new(mem.as_mut_ptr(), mem.len()) };

        let mut held = Vec::new();
        loop {
            match arena.allocate(48) {
                Ok(p) => held.push(p),
                Err(e) => {
                    assert_eq!(e, PlatformError::OutOfMemory);
                    break;
                }
            }
            assert!(arena.stats().live_bytes <= 512);
        }
        for p in held {
            arena.release(p.as_ptr());
        }
        assert_eq!(arena.stats().live_bytes, 0);
    }

    #[test]
    fn test_released_memory_is_zeroed_on_reuse() {
        let mut mem = backing(256);
        let mut arena = unsafe { BoundedArena::new(mem.as_mut_ptr(), mem.len()) };

        let p = arena.allocate(64).unwrap();
        unsafe { ptr::write_bytes(p.as_ptr(), 0x5A, 64) };
        arena.release(p.as_ptr());

        let q = arena.allocate(64).unwrap();
        let view = unsafe { core::slice::from_raw_parts(q.as_ptr(), 64) };
        assert!(view.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fresh_blocks_are_zeroed() {
        // Backing is deliberately dirtied before install.
        let mut mem = backing(256);
        let mut arena = unsafe { BoundedArena::new(mem.as_mut_ptr(), mem.len()) };
        let p = arena.allocate(96).unwrap();
        let view = unsafe { core::slice::from_raw_parts(p.as_ptr(), 96) };
        assert!(view.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_double_release_is_harmless() {
        let mut mem = backing(256);
        let mut arena = unsafe { BoundedArena::new(mem.as_mut_ptr(), mem.len()) };

        let p = arena.allocate(32).unwrap();
        arena.release(p.as_ptr());
        arena.release(p.as_ptr());
        assert_eq!(arena.stats().live_bytes, 0);

        // The arena still functions.
        let _q = arena.allocate(32).unwrap();
    }

    #[test]
    #[should_panic]
    fn test_foreign_pointer_release_is_fatal_in_debug() {
        let mut mem = backing(256);
        let mut arena = unsafe { BoundedArena::new(mem.as_mut_ptr(), mem.len()) };
        let mut other = [0u8; 16];
        arena.release(other.as_mut_ptr());
    }

    #[test]
    fn test_coalescing_recovers_full_region() {
        let mut mem = backing(512);
        let mut arena = unsafe { BoundedArena::new(mem.as_mut_ptr(), mem.len()) };

        let a = arena.allocate(100).unwrap();
        let b = arena.allocate(100).unwrap();
        let c = arena.allocate(100).unwrap();
        arena.release(b.as_ptr());
        arena.release(a.as_ptr());
        arena.release(c.as_ptr());

        assert_eq!(arena.stats().largest_free, 512);
        // A region-sized allocation must fit again.
        let whole = arena.allocate(512).unwrap();
        arena.release(whole.as_ptr());
    }

    #[test]
    fn test_unaligned_region_still_yields_aligned_blocks() {
        let mut mem = backing(256);
        // Deliberately misaligned base: one byte past an aligned address.
        let raw = mem.as_mut_ptr();
        let base = unsafe { raw.add(raw.align_offset(BLOCK_ALIGN) + 1) };
        let mut arena = unsafe { BoundedArena::new(base, 224) };

        let a = arena.allocate(64).unwrap();
        let b = arena.allocate(24).unwrap();
        assert_eq!(a.as_ptr() as usize % BLOCK_ALIGN, 0);
        assert_eq!(b.as_ptr() as usize % BLOCK_ALIGN, 0);
        assert!(arena.stats().region_size <= 224);
    }

    #[test]
    fn test_double_release_after_coalescing_is_harmless() {
        let mut mem = backing(256);
        let mut arena = unsafe { BoundedArena::new(mem.as_mut_ptr(), mem.len()) };

        let a = arena.allocate(32).unwrap();
        let b = arena.allocate(32).unwrap();
        arena.release(b.as_ptr());
        arena.release(a.as_ptr());
        // b's record boundary was merged away; the stale release must
        // stay a no-op.
        arena.release(b.as_ptr());
        assert_eq!(arena.stats().live_bytes, 0);
        assert_eq!(arena.stats().largest_free, 256);

        let _c = arena.allocate(64).unwrap();
    }

    #[test]
    fn test_null_release_is_noop() {
        let mut mem = backing(128);
        let mut arena = unsafe { BoundedArena::new(mem.as_mut_ptr(), mem.len()) };
        arena.release(ptr::null_mut());
        assert_eq!(arena.stats().live_bytes, 0);
    }
}
