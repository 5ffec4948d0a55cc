//! An `Area` is a page-aligned region of host memory with a snapshot
//! mode and a tracked used extent.  Orbit calls name the areas a task
//! may observe; the snapshot engine transfers exactly the pages the
//! extent covers.  Area ranges come from the global arena, so every
//! address is meaningful in both the host and any orbit.
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
use std::sync::RwLock;

use crate::allocator;
use crate::allocator::AllocatorMethod;
use crate::allocator::AreaAllocator;
use crate::allocator::Extent;
use crate::arena;
use crate::error::Error;
use crate::error::Result;
use crate::map;
use crate::mapper::get_mapper;
use crate::mapper::Mapper;

/// How an area's extent is realized in the orbit at call time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Both sides observe the content at call time; neither side's
    /// later writes are visible to the other.
    CoW,
    /// The pages are transferred to the orbit and the host loses
    /// access until `Area::reclaim`.
    Move,
    /// The pages are eagerly duplicated into the orbit.
    Copy,
}

impl Default for SnapshotMode {
    fn default() -> Self {
        SnapshotMode::CoW
    }
}

/// When created, an area is configured with a size, a snapshot mode,
/// and optionally an allocation strategy and a named mapper.
pub struct AreaConfig {
    pub size: usize,
    pub mode: SnapshotMode,
    pub method: Option<AllocatorMethod>,
    pub mapper_name: Option<String>,
}

impl AreaConfig {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            mode: SnapshotMode::default(),
            method: None,
            mapper_name: None,
        }
    }

    pub fn with_method(size: usize, method: AllocatorMethod) -> Self {
        Self {
            size,
            mode: SnapshotMode::default(),
            method: Some(method),
            mapper_name: None,
        }
    }
}

pub(crate) struct AreaInner {
    base: usize,
    length: usize,
    mode: SnapshotMode,
    mapper: &'static dyn Mapper,
    extent: Arc<Extent>,
    /// At most one attached allocator; replaceable, and destroying it
    /// does not destroy the area.
    allocator: RwLock<Option<Arc<dyn AreaAllocator>>>,
}

/// Host-side handle to an area.  Clones share the same region.
#[derive(Clone)]
pub struct Area {
    inner: Arc<AreaInner>,
}

impl Area {
    /// Attempts to create a new area for `config`.  The size is
    /// page-rounded; the range is carved from the arena and committed
    /// through the configured mapper.
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().base() % map::page_size() == 0,
              "Areas are page-aligned")]
    pub fn new(config: AreaConfig) -> Result<Area> {
        if config.size == 0 {
            return Err(Error::InvalidArgument("zero-sized area"));
        }

        let length = map::round_up_page(config.size);
        let mapper = get_mapper(config.mapper_name.as_deref())
            .map_err(|_| Error::InvalidArgument("unknown mapper"))?;

        let base = arena::carve(length)?;
        mapper.commit(base, length).map_err(Error::Io)?;

        let extent = Arc::new(Extent::new(base.as_ptr() as usize));
        let inner = Arc::new(AreaInner {
            base: base.as_ptr() as usize,
            length,
            mode: config.mode,
            mapper,
            extent,
            allocator: RwLock::new(None),
        });

        let area = Area { inner };
        if let Some(method) = config.method {
            area.attach_allocator(method)?;
        }

        Ok(area)
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.inner.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.length == 0
    }

    #[inline]
    pub fn mode(&self) -> SnapshotMode {
        self.inner.mode
    }

    /// Start of the populated extent, an absolute address.
    #[inline]
    pub fn data_start(&self) -> usize {
        self.inner.extent.start()
    }

    /// Length of the populated extent; the snapshot upper bound.
    #[inline]
    pub fn data_len(&self) -> usize {
        self.inner.extent.len()
    }

    pub(crate) fn extent(&self) -> Arc<Extent> {
        self.inner.extent.clone()
    }

    pub(crate) fn mapper(&self) -> &'static dyn Mapper {
        self.inner.mapper
    }

    /// Attaches an allocator of the given kind, replacing any current
    /// one.  The new allocator rewrites the extent.
    pub fn attach_allocator(&self, method: AllocatorMethod) -> Result<()> {
        let base = NonNull::new(self.inner.base as *mut c_void).expect("areas are non-null");
        let alloc = allocator::from_region(method, base, self.inner.length, self.extent())?;

        *self.inner.allocator.write().unwrap() = Some(alloc);
        Ok(())
    }

    /// Destroys the attached allocator.  The area and its memory
    /// survive; only the allocation bookkeeping goes away.
    pub fn detach_allocator(&self) {
        *self.inner.allocator.write().unwrap() = None;
    }

    fn allocator(&self) -> Result<Arc<dyn AreaAllocator>> {
        self.inner
            .allocator
            .read()
            .unwrap()
            .as_ref()
            .cloned()
            .ok_or(Error::NoAllocator)
    }

    /// Allocates `size` bytes from the attached allocator.
    pub fn alloc(&self, size: usize) -> Result<NonNull<c_void>> {
        self.allocator()?.alloc(size)
    }

    /// Returns an allocation to the attached allocator.
    pub fn free(&self, ptr: NonNull<c_void>) -> Result<()> {
        self.allocator()?.free(ptr);
        Ok(())
    }

    /// Reallocates through the attached allocator.
    pub fn realloc(&self, old: Option<NonNull<c_void>>, new_size: usize) -> Result<NonNull<c_void>> {
        self.allocator()?.realloc(old, new_size)
    }

    /// Resets a linear allocator: `data_length` drops to zero without
    /// touching the underlying memory.
    pub fn reset_linear(&self) -> Result<()> {
        if self.allocator()?.reset() {
            Ok(())
        } else {
            Err(Error::InvalidArgument("not a linear allocator"))
        }
    }

    /// Restores host access to an area consumed by a `Move` snapshot.
    /// The contents are whatever the mapper left behind.
    pub fn reclaim(&self) -> Result<()> {
        let base = NonNull::new(self.inner.base as *mut c_void).expect("areas are non-null");

        self.inner
            .mapper
            .reclaim(base, self.inner.length)
            .map_err(Error::Io)
    }

    /// Asserts the extent invariant:
    /// `base <= data_start && data_start + data_length <= base + length`.
    #[cfg(test)]
    pub(crate) fn check_rep(&self) {
        let start = self.data_start();
        let len = self.data_len();

        assert!(start >= self.base(), "self.base={:x}", self.base());
        assert!(start + len <= self.base() + self.len());
    }
}
