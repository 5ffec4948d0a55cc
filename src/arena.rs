//! The arena is a single process-wide address space reservation that
//! every `Area` is carved from.  Reserving it before the first orbit
//! is forked guarantees that each orbit inherits the reservation, so
//! a host range can always be paired at the same virtual address in
//! the orbit, even for areas created after the fork.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::error::Error;
use crate::error::Result;
use crate::map;

#[cfg(not(feature = "test_only_small_constants"))]
const ARENA_SIZE: usize = 1 << 32;

#[cfg(feature = "test_only_small_constants")]
const ARENA_SIZE: usize = 1 << 26;

struct Arena {
    base: usize,
    size: usize,
    /// Offset of the first byte that has not been handed out.
    next: AtomicUsize,
}

lazy_static::lazy_static! {
    static ref ARENA: Arena = {
        let base = map::reserve_region(ARENA_SIZE)
            .expect("arena address space reservation should succeed");

        Arena {
            base: base.as_ptr() as usize,
            size: ARENA_SIZE,
            next: AtomicUsize::new(0),
        }
    };
}

/// Forces the arena reservation to exist.  Called before forking an
/// orbit, so the child inherits the full reservation.
pub(crate) fn ensure_reserved() {
    lazy_static::initialize(&ARENA);
}

/// Returns whether `[base, base + size)` lies inside the arena.
pub(crate) fn contains(base: usize, size: usize) -> bool {
    let arena = &*ARENA;

    base >= arena.base && size <= arena.size && base + size <= arena.base + arena.size
}

/// Carves a page-aligned range of `size` bytes out of the arena.  The
/// pages are reserved but not yet committed.  Carved ranges are
/// immortal: areas are long-lived by contract, and address space in
/// the arena is never recycled.
#[requires(size > 0)]
#[ensures(ret.is_ok() -> ret.as_ref().unwrap().as_ptr() as usize % map::page_size() == 0,
          "Carved ranges are page-aligned")]
pub(crate) fn carve(size: usize) -> Result<NonNull<c_void>> {
    let arena = &*ARENA;
    let size = map::round_up_page(size);

    let offset = arena.next.fetch_add(size, Ordering::Relaxed);
    if offset + size > arena.size {
        // Leave `next` past the end: the arena is exhausted for good.
        return Err(Error::OutOfSpace);
    }

    Ok(NonNull::new((arena.base + offset) as *mut c_void).expect("arena ranges are non-null"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carve_is_aligned_and_disjoint() {
        let a = carve(100).expect("carve should succeed");
        let b = carve(map::page_size()).expect("carve should succeed");

        let a = a.as_ptr() as usize;
        let b = b.as_ptr() as usize;

        assert_eq!(a % map::page_size(), 0);
        assert_eq!(b % map::page_size(), 0);
        // A sub-page carve still consumes a whole page.
        assert!(b >= a + map::page_size() || a >= b + map::page_size());

        assert!(contains(a, map::page_size()));
        assert!(contains(b, map::page_size()));
    }

    #[test]
    fn carved_range_is_committable() {
        let range = carve(2 * map::page_size()).expect("carve should succeed");

        map::commit_region(range, 2 * map::page_size()).expect("commit should succeed");
        unsafe { std::ptr::write_bytes(range.as_ptr() as *mut u8, 0x5a, 2 * map::page_size()) };
        assert_eq!(unsafe { *(range.as_ptr() as *const u8) }, 0x5a);
    }
}
