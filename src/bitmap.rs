//! Page-and-block allocation over an area.  The area is split into
//! 4096-byte pages of 32-byte blocks; each page carries a 128-bit
//! free bitmap.  Single-page requests are served by a zero-run scan
//! inside one bitmap, multi-page requests by stitching the tail of
//! one page, a run of empty pages, and the head of a final page into
//! one contiguous range.  The allocator metadata lives at the start
//! of the area itself, before the page region.
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

use log::error;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::allocator::AreaAllocator;
use crate::allocator::Extent;
use crate::error::Error;
use crate::error::Result;
use crate::lock::SpinLock;

pub const BLOCK_SIZE: usize = 32;
pub const PAGE_SIZE: usize = 4096;
pub const BLOCKS_PER_PAGE: usize = PAGE_SIZE / BLOCK_SIZE;

/// Every allocation is preceded by this header; the user pointer is
/// just past it.
#[repr(C)]
struct AllocHeader {
    blocks: usize,
    _pad: usize,
}

const ALLOC_HEADER_SIZE: usize = std::mem::size_of::<AllocHeader>();

/// Per-page metadata: a 128-bit free bitmap as two 64-bit halves, a
/// used-block counter, and a page-level lock reserved for a per-page
/// fast path.
#[repr(C)]
struct PageMeta {
    lock: SpinLock,
    used: u32,
    bitmap: [u64; 2],
}

/// Allocator header, resident at the start of the area.  The page
/// region starts page-aligned after `page_meta[npages]`.
#[repr(C)]
struct BitmapHeader {
    lock: SpinLock,
    _pad: u32,
    first_page: usize,
    npages: usize,
    /// Number of pages in the used prefix of the page region.
    /// Written under the header lock.
    allocated_pages: std::sync::atomic::AtomicUsize,
}

static_assertions::const_assert_eq!(std::mem::size_of::<AllocHeader>(), 16);
static_assertions::const_assert_eq!(std::mem::size_of::<PageMeta>(), 24);
static_assertions::const_assert_eq!(std::mem::size_of::<BitmapHeader>(), 32);
static_assertions::const_assert_eq!(PAGE_SIZE % BLOCK_SIZE, 0);
static_assertions::const_assert_eq!(BLOCKS_PER_PAGE, 128);

const fn round_up_block(value: usize) -> usize {
    (value + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1)
}

fn ctz(x: u64) -> u32 {
    x.trailing_zeros()
}

fn clz(x: u64) -> u32 {
    x.leading_zeros()
}

fn lsb_mask(bits: u32) -> u64 {
    match bits {
        0 => 0,
        bits if bits >= 64 => u64::MAX,
        bits => u64::MAX >> (64 - bits),
    }
}

fn msb_mask(bits: u32) -> u64 {
    match bits {
        0 => 0,
        bits if bits >= 64 => u64::MAX,
        bits => u64::MAX << (64 - bits),
    }
}

/// Mask of `bits` ones starting at `bits` index `shift`; the range
/// must fit in one 64-bit half.
fn half_mask(bits: u32, shift: u32) -> u64 {
    debug_assert!(bits + shift <= 64);
    lsb_mask(bits) << shift
}

impl PageMeta {
    fn empty() -> Self {
        Self {
            lock: SpinLock::new(),
            used: 0,
            bitmap: [0, 0],
        }
    }

    /// Sets `count` bits starting at bit `offset` of the 128-bit map.
    fn set_bits(&mut self, offset: usize, count: usize) {
        let (offset, count) = (offset as u32, count as u32);

        if offset < 64 {
            self.bitmap[0] |= half_mask(count.min(64 - offset), offset);
            if offset + count > 64 {
                self.bitmap[1] |= half_mask(offset + count - 64, 0);
            }
        } else {
            self.bitmap[1] |= half_mask(count, offset - 64);
        }
    }

    /// Clears `count` bits starting at bit `offset` of the 128-bit map.
    fn clear_bits(&mut self, offset: usize, count: usize) {
        let (offset, count) = (offset as u32, count as u32);

        if offset < 64 {
            self.bitmap[0] &= !half_mask(count.min(64 - offset), offset);
            if offset + count > 64 {
                self.bitmap[1] &= !half_mask(offset + count - 64, 0);
            }
        } else {
            self.bitmap[1] &= !half_mask(count, offset - 64);
        }
    }

    fn set_all(&mut self) {
        self.bitmap = [u64::MAX, u64::MAX];
    }

    fn clear_all(&mut self) {
        self.bitmap = [0, 0];
    }

    /// Consecutive zero bits at the start of the 128-bit map.
    fn zeros_at_head(&self) -> usize {
        let first = if self.bitmap[0] == 0 {
            64
        } else {
            ctz(self.bitmap[0])
        };
        let second = if first == 64 && self.bitmap[1] != 0 {
            ctz(self.bitmap[1])
        } else if first == 64 {
            64
        } else {
            0
        };

        (first + second) as usize
    }

    /// Consecutive zero bits at the end of the 128-bit map.
    fn zeros_at_tail(&self) -> usize {
        let last = if self.bitmap[1] == 0 {
            64
        } else {
            clz(self.bitmap[1])
        };
        let first = if last == 64 && self.bitmap[0] != 0 {
            clz(self.bitmap[0])
        } else if last == 64 {
            64
        } else {
            0
        };

        (first + last) as usize
    }

    /// Finds a run of `bits` zero bits anywhere in the 128-bit map
    /// and sets it.  Returns the run's first bit index.
    fn find_zeros_and_set(&mut self, bits: u32) -> Option<usize> {
        if let Some(k) = find_zeros_and_set(&mut self.bitmap[0], bits) {
            return Some(k as usize);
        }
        if let Some(k) = find_zeros_and_set(&mut self.bitmap[1], bits) {
            return Some(k as usize + 64);
        }

        // The run may straddle the two halves.
        let (lo, hi) = self.bitmap.split_at_mut(1);
        find_edge_zeros_and_set(&mut lo[0], &mut hi[0], bits).map(|k| k as usize)
    }
}

/// Finds a run of `bits` zero bits in one 64-bit half and sets it.
///
/// The scan starts at the first zero (`ctz(!bitmap)`); after a failed
/// test every zero in that hole is filled in a shadow copy, so the
/// next candidate is the following hole.
fn find_zeros_and_set(bitmap: &mut u64, bits: u32) -> Option<u32> {
    let mask = lsb_mask(bits);
    let mut shadow = *bitmap;

    let mut k = ctz(!shadow);
    while k + bits <= 64 {
        if shadow & (mask << k) == 0 {
            *bitmap |= mask << k;
            return Some(k);
        }

        shadow |= half_mask(ctz(shadow >> k).min(64 - k), k);
        k = ctz(!shadow);
    }

    None
}

/// Finds a run of `bits` zero bits spanning the boundary from the end
/// of `lo` into the start of `hi` and sets it.  Only called once the
/// per-half scans failed, so the run cannot fit in either half alone.
fn find_edge_zeros_and_set(lo: &mut u64, hi: &mut u64, bits: u32) -> Option<u32> {
    let zeros_lo = if *lo == 0 { 64 } else { clz(*lo) };
    let zeros_hi = if *hi == 0 { 64 } else { ctz(*hi) };

    if zeros_lo + zeros_hi < bits {
        return None;
    }
    let take_hi = bits - zeros_lo.min(bits);

    *lo |= msb_mask(zeros_lo.min(bits));
    *hi |= lsb_mask(take_hi);
    Some(64 - zeros_lo.min(bits))
}

pub(crate) struct BitmapAllocator {
    header: NonNull<BitmapHeader>,
    extent: Arc<Extent>,
}

// All metadata mutation happens under the header spinlock; the
// addresses point into memory owned by the area.
unsafe impl Send for BitmapAllocator {}
unsafe impl Sync for BitmapAllocator {}

impl BitmapAllocator {
    /// Lays the allocator header, page metadata, and page region out
    /// inside `[base, base + length)`.
    pub fn new(base: NonNull<c_void>, length: usize, extent: Arc<Extent>) -> Result<Self> {
        let page_size = crate::map::page_size();
        assert_eq!(page_size, PAGE_SIZE, "bitmap allocator assumes 4K pages");

        let start = base.as_ptr() as usize;
        assert_eq!(start % PAGE_SIZE, 0, "areas are page-aligned");

        let header_size = std::mem::size_of::<BitmapHeader>();
        let meta_size = std::mem::size_of::<PageMeta>();
        let length = length & !(PAGE_SIZE - 1);

        if length <= header_size + meta_size + PAGE_SIZE {
            return Err(Error::InvalidArgument("area too small for bitmap allocator"));
        }

        let mut npages = (length - header_size) / (meta_size + PAGE_SIZE);
        let first_page = loop {
            let first = start + round_up_page_const(header_size + npages * meta_size);

            if npages == 0 {
                return Err(Error::InvalidArgument("area too small for bitmap allocator"));
            }
            if first + npages * PAGE_SIZE <= start + length {
                break first;
            }
            npages -= 1;
        };

        let header = base.as_ptr() as *mut BitmapHeader;
        unsafe {
            header.write(BitmapHeader {
                lock: SpinLock::new(),
                _pad: 0,
                first_page,
                npages,
                allocated_pages: std::sync::atomic::AtomicUsize::new(0),
            });

            let metas = header.add(1) as *mut PageMeta;
            for i in 0..npages {
                metas.add(i).write(PageMeta::empty());
            }
        }

        extent.set_start(first_page);
        extent.set_len(0);

        Ok(Self {
            header: NonNull::new(header).expect("area addresses are non-null"),
            extent,
        })
    }

    fn header(&self) -> &BitmapHeader {
        unsafe { self.header.as_ref() }
    }

    /// Only call with the header lock held.
    #[allow(clippy::mut_from_ref)]
    fn meta(&self, index: usize) -> &mut PageMeta {
        debug_assert!(index < self.header().npages);

        unsafe { &mut *(self.header.as_ptr().add(1) as *mut PageMeta).add(index) }
    }

    /// Only call with the header lock held.
    fn grow_to(&self, page: usize) {
        use std::sync::atomic::Ordering;
        let header = self.header();

        if page + 1 > header.allocated_pages.load(Ordering::Relaxed) {
            header.allocated_pages.store(page + 1, Ordering::Relaxed);
            self.extent.set_len((page + 1) * PAGE_SIZE);
        }
    }

    /// Only call with the header lock held.
    fn shrink(&self) {
        use std::sync::atomic::Ordering;
        let header = self.header();

        let mut pages = header.allocated_pages.load(Ordering::Relaxed);
        while pages > 0 && self.meta(pages - 1).used == 0 {
            pages -= 1;
        }
        header.allocated_pages.store(pages, Ordering::Relaxed);
        self.extent.set_len(pages * PAGE_SIZE);
    }

    /// Maps a user pointer back to its page and block index.
    fn translate(&self, ptr: usize) -> Option<(usize, usize)> {
        let header = self.header();

        if ptr < header.first_page {
            return None;
        }

        let offset = ptr - header.first_page;
        if offset / PAGE_SIZE >= header.npages {
            return None;
        }

        Some((offset / PAGE_SIZE, (offset % PAGE_SIZE) / BLOCK_SIZE))
    }

    /// Multi-page path: the request is `m` whole pages plus `n`
    /// trailing blocks.  Candidate runs take the tail of `start_page`,
    /// `m - 1` fully empty pages, and the head of `start_page + m`;
    /// the tail/head split must cover `BLOCKS_PER_PAGE + n` blocks.
    /// First fit by ascending start page.
    fn alloc_large(&self, total: usize) -> Option<(usize, usize)> {
        let npages = self.header().npages;
        let m = total / PAGE_SIZE;
        let n = (total % PAGE_SIZE) / BLOCK_SIZE;

        let mut pagei = 0;
        while pagei + m < npages {
            let start_page = pagei;
            let end_page = pagei + m;

            let before = self.meta(start_page).zeros_at_tail();
            let after = self.meta(end_page).zeros_at_head();
            if before + after < BLOCKS_PER_PAGE + n {
                pagei = end_page;
                continue;
            }

            if let Some(used_mid) = (start_page + 1..end_page).find(|&mid| self.meta(mid).used != 0)
            {
                pagei = used_mid;
                continue;
            }

            let end_meta = self.meta(end_page);
            end_meta.set_bits(0, after);
            end_meta.used += after as u32;

            for mid in start_page + 1..end_page {
                let meta = self.meta(mid);
                meta.set_all();
                meta.used = BLOCKS_PER_PAGE as u32;
            }

            let start_block = after - n;
            let start_meta = self.meta(start_page);
            start_meta.set_bits(start_block, BLOCKS_PER_PAGE - start_block);
            start_meta.used += (BLOCKS_PER_PAGE - start_block) as u32;

            return Some((start_page, start_block));
        }

        None
    }

    /// Single-page path: first page with enough free blocks that also
    /// holds a long enough zero run.
    fn alloc_small(&self, blocks: usize) -> Option<(usize, usize)> {
        for pagei in 0..self.header().npages {
            let meta = self.meta(pagei);

            if BLOCKS_PER_PAGE - (meta.used as usize) < blocks {
                continue;
            }

            if let Some(k) = meta.find_zeros_and_set(blocks as u32) {
                meta.used += blocks as u32;
                return Some((pagei, k));
            }
        }

        None
    }
}

impl AreaAllocator for BitmapAllocator {
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().as_ptr() as usize % BLOCK_SIZE == ALLOC_HEADER_SIZE,
              "User pointers sit one header past a block boundary")]
    fn alloc(&self, size: usize) -> Result<NonNull<c_void>> {
        if size == 0 {
            return Err(Error::InvalidArgument("zero-sized allocation"));
        }

        let total = round_up_block(size + ALLOC_HEADER_SIZE);
        let blocks = total / BLOCK_SIZE;

        let _guard = self.header().lock.lock();

        let placed = if total > PAGE_SIZE {
            self.alloc_large(total)
        } else {
            self.alloc_small(blocks)
        };

        let (start_page, start_block) = match placed {
            Some(placed) => placed,
            None => {
                error!("bitmap allocation of {} bytes failed", size);
                return Err(Error::OutOfSpace);
            }
        };

        let last_page = start_page + (start_block * BLOCK_SIZE + total - 1) / PAGE_SIZE;
        self.grow_to(last_page);

        let header = self.header().first_page + start_page * PAGE_SIZE + start_block * BLOCK_SIZE;
        unsafe {
            (header as *mut AllocHeader).write(AllocHeader { blocks, _pad: 0 });
        }

        Ok(NonNull::new((header + ALLOC_HEADER_SIZE) as *mut c_void)
            .expect("area addresses are non-null"))
    }

    fn free(&self, ptr: NonNull<c_void>) {
        let addr = ptr.as_ptr() as usize;

        let (pagei, blocki) = match self.translate(addr) {
            Some(place) => place,
            None => {
                error!("bitmap free of pointer outside the area: {:x}", addr);
                return;
            }
        };

        let alloc_header = unsafe { &*((addr - ALLOC_HEADER_SIZE) as *const AllocHeader) };
        let mut blocks = alloc_header.blocks;
        let npages = self.header().npages;

        // A corrupted header would walk off the page metadata.
        let mut this_page = blocks.min(BLOCKS_PER_PAGE - blocki);
        if blocks - this_page > (npages - pagei - 1) * BLOCKS_PER_PAGE {
            error!("bitmap free: allocation spans past the page region");
            return;
        }

        let _guard = self.header().lock.lock();

        let mut pagei = pagei;
        let mut blocki = blocki;
        while blocks > 0 {
            let meta = self.meta(pagei);

            meta.used -= this_page as u32;
            if this_page == BLOCKS_PER_PAGE {
                meta.clear_all();
            } else {
                meta.clear_bits(blocki, this_page);
                blocki = 0;
            }

            blocks -= this_page;
            this_page = blocks.min(BLOCKS_PER_PAGE);
            pagei += 1;
        }

        self.shrink();
    }

    fn realloc(&self, old: Option<NonNull<c_void>>, new_size: usize) -> Result<NonNull<c_void>> {
        let old = match old {
            Some(old) => old,
            None => return self.alloc(new_size),
        };

        if self.translate(old.as_ptr() as usize).is_none() {
            return Err(Error::InvalidArgument("pointer outside the area"));
        }

        let alloc_header =
            unsafe { &*((old.as_ptr() as usize - ALLOC_HEADER_SIZE) as *const AllocHeader) };
        let old_usable = alloc_header.blocks * BLOCK_SIZE - ALLOC_HEADER_SIZE;

        let mem = self.alloc(new_size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                old.as_ptr() as *const u8,
                mem.as_ptr() as *mut u8,
                old_usable.min(new_size),
            );
        }
        self.free(old);
        Ok(mem)
    }
}

fn round_up_page_const(value: usize) -> usize {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
