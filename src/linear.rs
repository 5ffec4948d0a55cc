//! Bump allocation over an area.  The allocator is coupled to the
//! area's extent: every allocation advances `data_length`, which is
//! exactly the range the snapshot engine will transfer.  Typical use
//! is to size the useful prefix of a region dynamically, so `free` is
//! a no-op and space is reclaimed wholesale via `reset`.
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
use std::sync::Arc;

use crate::allocator::AreaAllocator;
use crate::allocator::Extent;
use crate::error::Error;
use crate::error::Result;
use crate::lock::SpinLock;

/// Allocation granule; also the alignment guarantee.
const ALIGNMENT: usize = 8;

/// With `use_meta`, this header precedes each allocation and records
/// the usable size, enabling shrink-in-place realloc.
#[repr(C)]
struct AllocMeta {
    size: usize,
}

static_assertions::const_assert_eq!(std::mem::size_of::<AllocMeta>(), ALIGNMENT);

pub(crate) struct LinearAllocator {
    start: usize,
    length: usize,
    extent: Arc<Extent>,
    lock: SpinLock,
    use_meta: bool,
}

// The allocator hands out raw addresses into a region whose lifetime
// is managed by the owning area; the spinlock serializes the bump.
unsafe impl Send for LinearAllocator {}
unsafe impl Sync for LinearAllocator {}

fn round_up_align(value: usize) -> usize {
    (value + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

impl LinearAllocator {
    pub fn new(base: NonNull<c_void>, length: usize, extent: Arc<Extent>, use_meta: bool) -> Self {
        let start = base.as_ptr() as usize;

        extent.set_start(start);
        extent.set_len(0);

        Self {
            start,
            length,
            extent,
            lock: SpinLock::new(),
            use_meta,
        }
    }

}

impl AreaAllocator for LinearAllocator {
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().as_ptr() as usize % ALIGNMENT == 0,
              "Allocations are aligned")]
    fn alloc(&self, size: usize) -> Result<NonNull<c_void>> {
        if size == 0 {
            return Err(Error::InvalidArgument("zero-sized allocation"));
        }

        let meta = if self.use_meta {
            std::mem::size_of::<AllocMeta>()
        } else {
            0
        };
        let total = round_up_align(size + meta);

        let ptr = {
            let _guard = self.lock.lock();
            let allocated = self.extent.len();

            if total > self.length - allocated {
                return Err(Error::OutOfSpace);
            }

            self.extent.set_len(allocated + total);
            self.start + allocated
        };

        if self.use_meta {
            unsafe { (ptr as *mut AllocMeta).write(AllocMeta { size }) };
        }

        Ok(NonNull::new((ptr + meta) as *mut c_void).expect("area addresses are non-null"))
    }

    fn free(&self, _ptr: NonNull<c_void>) {
        // Let it leak.
    }

    fn realloc(&self, old: Option<NonNull<c_void>>, new_size: usize) -> Result<NonNull<c_void>> {
        let old = match old {
            Some(old) if self.use_meta => old,
            _ => return self.alloc(new_size),
        };

        let meta = unsafe { &mut *(old.as_ptr() as *mut AllocMeta).offset(-1) };
        if meta.size >= new_size {
            meta.size = new_size;
            return Ok(old);
        }

        let copy = meta.size;
        let mem = self.alloc(new_size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(old.as_ptr() as *const u8, mem.as_ptr() as *mut u8, copy)
        };
        self.free(old);
        Ok(mem)
    }

    /// Forgets every allocation without touching the memory.
    fn reset(&self) -> bool {
        let _guard = self.lock.lock();

        self.extent.set_len(0);
        true
    }
}
