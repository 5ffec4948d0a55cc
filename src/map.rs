//! Thin wrappers around the virtual memory syscalls the runtime is
//! built on.  Address space is `reserve`d up front as inaccessible
//! pages and individual ranges are later committed, discarded, or
//! protected in place; a reservation created before an orbit is
//! forked is inherited at the same addresses by the orbit.
use std::ffi::c_void;
use std::ptr::NonNull;

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("Unable to find page_size: errno={}", errno());
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Rounds `value` up to the next multiple of the page size.
#[inline]
pub fn round_up_page(value: usize) -> usize {
    let mask = page_size() - 1;

    (value + mask) & !mask
}

fn check_region(base: usize, size: usize) {
    assert!(
        (base % page_size()) == 0 && (size % page_size()) == 0,
        "Bad region base={:x} size={} page_size={}",
        base,
        size,
        page_size()
    );
}

/// Attempts to reserve an *address space* region of `size` bytes.
/// The pages are inaccessible until committed.
///
/// The `size` argument must be a multiple of the page size.
pub fn reserve_region(size: usize) -> Result<NonNull<c_void>, i32> {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };

    if ret == libc::MAP_FAILED {
        Err(errno())
    } else {
        Ok(NonNull::new(ret).expect("mmap returned a non-null region"))
    }
}

/// Releases a region of `size` bytes starting at `base` back to the
/// operating system.
pub fn release_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    check_region(base.as_ptr() as usize, size);

    if unsafe { libc::munmap(base.as_ptr(), size) } == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Backs a reserved region of `size` bytes starting at `base` with
/// demand-faulted read-write memory.  Fresh pages are zero-filled.
pub fn commit_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    check_region(base.as_ptr() as usize, size);

    let ret = unsafe { libc::mprotect(base.as_ptr(), size, libc::PROT_READ | libc::PROT_WRITE) };

    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Replaces `[base, base + size)` with fresh anonymous read-write
/// pages, regardless of what was mapped there before.  The range must
/// lie inside a previously reserved region.
pub fn commit_fresh_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    check_region(base.as_ptr() as usize, size);

    let ret = unsafe {
        libc::mmap(
            base.as_ptr(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };

    if ret == libc::MAP_FAILED {
        Err(errno())
    } else {
        assert_eq!(ret, base.as_ptr(), "MAP_FIXED moved the mapping");
        Ok(())
    }
}

/// Maps `size` bytes of `file` at exactly `base` as a shared
/// read-write mapping.  The range must lie inside a previously
/// reserved region, and the file must be at least `size` bytes long.
pub fn commit_file_region(
    file: &std::fs::File,
    base: NonNull<c_void>,
    size: usize,
) -> Result<(), i32> {
    use std::os::unix::io::AsRawFd;

    if size == 0 {
        return Ok(());
    }

    check_region(base.as_ptr() as usize, size);

    let ret = unsafe {
        libc::mmap(
            base.as_ptr(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            file.as_raw_fd(),
            0,
        )
    };

    if ret == libc::MAP_FAILED {
        Err(errno())
    } else {
        Ok(())
    }
}

/// Drops the contents of an anonymous committed region: the next read
/// observes zero-filled pages.
pub fn discard_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    check_region(base.as_ptr() as usize, size);

    if unsafe { libc::madvise(base.as_ptr(), size, libc::MADV_DONTNEED) } == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Revokes all access to a committed region.  `commit_region` undoes
/// this without losing the contents.
pub fn protect_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    check_region(base.as_ptr() as usize, size);

    if unsafe { libc::mprotect(base.as_ptr(), size, libc::PROT_NONE) } == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);

    // We only develop on platforms with 4K pages.
    assert_eq!(page_size(), 4096);
}

#[test]
fn test_round_up_page() {
    assert_eq!(round_up_page(0), 0);
    assert_eq!(round_up_page(1), page_size());
    assert_eq!(round_up_page(page_size()), page_size());
    assert_eq!(round_up_page(page_size() + 1), 2 * page_size());
}

// Reserve, commit a few subranges, scribble, discard, and release.
#[test]
fn smoke_test() {
    let region_size = 1usize << 21;
    let base = reserve_region(region_size).expect("reserve should succeed");

    let bottom = base;
    let remainder = NonNull::new((base.as_ptr() as usize + 2 * page_size()) as *mut c_void)
        .expect("Should be non-null");

    commit_region(bottom, page_size()).expect("should commit bottom");
    commit_region(remainder, region_size - 2 * page_size()).expect("should commit remainder");

    unsafe { std::ptr::write_bytes(bottom.as_ptr() as *mut u8, 42, page_size()) };
    assert_eq!(unsafe { std::ptr::read(bottom.as_ptr() as *const u8) }, 42);

    discard_region(bottom, page_size()).expect("should discard bottom");
    assert_eq!(unsafe { std::ptr::read(bottom.as_ptr() as *const u8) }, 0);

    release_region(base, region_size).expect("should release everything");
}
