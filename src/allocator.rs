//! Polymorphic allocator surface for area memory.  An `Area` owns at
//! most one allocator; the allocator maintains the area's externally
//! visible used extent, which is the upper bound for snapshotting.
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::Result;

/// The populated extent of an area: `data_start` is an absolute
/// address, `data_length` the number of live bytes from it.  Updated
/// by the attached allocator, read by the snapshot engine.
pub(crate) struct Extent {
    data_start: AtomicUsize,
    data_length: AtomicUsize,
}

impl Extent {
    pub fn new(data_start: usize) -> Self {
        Self {
            data_start: AtomicUsize::new(data_start),
            data_length: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.data_start.load(Ordering::Acquire)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data_length.load(Ordering::Acquire)
    }

    pub fn set_start(&self, start: usize) {
        self.data_start.store(start, Ordering::Release);
    }

    pub fn set_len(&self, len: usize) {
        self.data_length.store(len, Ordering::Release);
    }
}

/// Allocation strategies an area can attach.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocatorMethod {
    /// Bump allocation; `free` is a no-op.  With `use_meta`, an
    /// 8-byte size header precedes each allocation and enables
    /// shrink-in-place realloc.
    Linear { use_meta: bool },
    /// Page-and-block allocation with per-page free bitmaps and
    /// multi-page support.
    Bitmap,
}

/// The operations every area allocator exposes.  Dropping the
/// allocator releases its host-side bookkeeping without touching the
/// underlying area memory.
pub trait AreaAllocator: Send + Sync {
    /// Attempts to carve `size` bytes out of the area.
    fn alloc(&self, size: usize) -> Result<NonNull<c_void>>;

    /// Returns an allocation to the area.
    fn free(&self, ptr: NonNull<c_void>);

    /// Grows or shrinks an allocation; `None` delegates to `alloc`.
    fn realloc(&self, old: Option<NonNull<c_void>>, new_size: usize) -> Result<NonNull<c_void>>;

    /// Forgets every allocation at once.  Only meaningful for the
    /// linear strategy; other allocators return false.
    fn reset(&self) -> bool {
        false
    }
}

/// Builds an allocator of the requested kind over
/// `[base, base + length)`, rewriting the extent to the strategy's
/// data start.
pub(crate) fn from_region(
    method: AllocatorMethod,
    base: NonNull<c_void>,
    length: usize,
    extent: Arc<Extent>,
) -> Result<Arc<dyn AreaAllocator>> {
    match method {
        AllocatorMethod::Linear { use_meta } => Ok(Arc::new(crate::linear::LinearAllocator::new(
            base, length, extent, use_meta,
        ))),
        AllocatorMethod::Bitmap => Ok(Arc::new(crate::bitmap::BitmapAllocator::new(
            base, length, extent,
        )?)),
    }
}
