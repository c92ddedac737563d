//! ASID allocation and activation.
//!
//! TLB entries are tagged with an 8-bit address-space identifier so user
//! address spaces can coexist without a full flush on every switch. The
//! pool uses a generation scheme: when every identifier is live, the pool
//! rolls over to a new generation and address spaces re-acquire identifiers
//! lazily on their next activation, paying one full TLB flush.

use crate::lib::error::KernelError;
use spin::Mutex;

/// Hardware tag width in use. The stored field is wider so the sentinel
/// values never collide with a live masked identifier.
pub const ASID_BITS: u32 = 8;

/// Identifier reserved for global (kernel) translations.
pub const GLOBAL_ASID: u16 = 0xffff;

/// An address space that has not been activated yet.
pub const UNUSED_ASID: u16 = 0;

const FIRST_USER_ASID: u16 = 1;
const ASID_COUNT: usize = 1 << ASID_BITS;

struct AsidPool {
    bitmap: [u64; ASID_COUNT / 64],
    generation: u32,
}

impl AsidPool {
    const fn new() -> Self {
        Self {
            bitmap: [0; ASID_COUNT / 64],
            generation: 1,
        }
    }

    fn take(&mut self) -> Option<u16> {
        for asid in FIRST_USER_ASID..ASID_COUNT as u16 {
            let (word, bit) = (asid as usize / 64, asid as usize % 64);
            if self.bitmap[word] & (1 << bit) == 0 {
                self.bitmap[word] |= 1 << bit;
                return Some(asid);
            }
        }
        None
    }

    fn rollover(&mut self) {
        self.bitmap = [0; ASID_COUNT / 64];
        self.generation += 1;
    }
}

static POOL: Mutex<AsidPool> = Mutex::new(AsidPool::new());

/// Allocate a fresh identifier for a new address space.
pub fn alloc() -> Result<(u16, u32), KernelError> {
    let mut pool = POOL.lock();
    if let Some(asid) = pool.take() {
        return Ok((asid, pool.generation));
    }
    pool.rollover();
    let asid = pool.take().ok_or(KernelError::NoMemory)?;
    Ok((asid, pool.generation))
}

pub fn free(asid: u16, generation: u32) {
    let mut pool = POOL.lock();
    // identifiers from rolled-over generations are already recycled
    if generation == pool.generation && asid != UNUSED_ASID && asid != GLOBAL_ASID {
        let (word, bit) = (asid as usize / 64, asid as usize % 64);
        pool.bitmap[word] &= !(1 << bit);
    }
}

/// Refresh `(asid, generation)` for an address space about to run.
///
/// Returns the identifier to use and whether the caller must flush the TLB
/// (the identifier was recycled from an earlier generation, so stale
/// entries may carry its tag).
pub fn activate(asid: u16, generation: u32) -> (u16, u32, bool) {
    let mut pool = POOL.lock();
    if asid != UNUSED_ASID && generation == pool.generation {
        return (asid, generation, false);
    }
    let fresh = match pool.take() {
        Some(a) => a,
        None => {
            pool.rollover();
            pool.take().expect("asid pool empty after rollover")
        }
    };
    (fresh, pool.generation, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_yields_distinct_user_asids() {
        let (a, ga) = alloc().unwrap();
        let (b, gb) = alloc().unwrap();
        assert_ne!(a, UNUSED_ASID);
        assert_ne!(b, UNUSED_ASID);
        if ga == gb {
            assert_ne!(a, b);
        }
        free(a, ga);
        free(b, gb);
    }

    #[test]
    fn activation_of_live_asid_needs_no_flush() {
        let (asid, generation) = alloc().unwrap();
        let (same, _, flush) = activate(asid, generation);
        assert_eq!(same, asid);
        assert!(!flush);
        free(asid, generation);
    }

    #[test]
    fn stale_generation_forces_flush() {
        let (asid, generation) = alloc().unwrap();
        let (fresh, new_generation, flush) = activate(asid, generation.wrapping_sub(1));
        assert!(flush);
        assert_ne!(new_generation, generation.wrapping_sub(1));
        free(asid, generation);
        free(fresh, new_generation);
    }
}
