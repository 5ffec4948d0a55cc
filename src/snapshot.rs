//! The snapshot engine.  At enqueue time the host copies each named
//! area's populated extent into the task record; that copy is the
//! point-in-time freeze, so later host writes are invisible to the
//! task regardless of when it is dispatched.  On the orbit side the
//! extent bytes are installed at the same virtual addresses over
//! private pages.  Eager transfer of the full extent is used for all
//! three snapshot modes; `Move` additionally discards the host pages.
use std::collections::HashSet;
use std::ffi::c_void;
use std::io;
use std::ptr::NonNull;

use crate::area::Area;
use crate::area::SnapshotMode;
use crate::error::Error;
use crate::error::Result;
use crate::map;
use crate::wire::AreaHeader;

/// One area's frozen extent, ready to travel with its task.
pub(crate) struct CapturedArea {
    pub base: u64,
    pub length: u64,
    pub mode: u8,
    pub data_start: u64,
    pub bytes: Vec<u8>,
}

pub(crate) fn mode_to_wire(mode: SnapshotMode) -> u8 {
    match mode {
        SnapshotMode::CoW => 0,
        SnapshotMode::Move => 1,
        SnapshotMode::Copy => 2,
    }
}

/// Freezes the extents of `areas`.  The host must quiesce writers to
/// the areas across the enqueue if it needs a consistent multi-area
/// view.
pub(crate) fn capture(areas: &[&Area]) -> Result<Vec<CapturedArea>> {
    let mut captured = Vec::with_capacity(areas.len());

    for area in areas {
        let data_start = area.data_start();
        let limit = area.base() + area.len() - data_start;
        let extent = map::round_up_page(area.data_len()).min(limit);

        let bytes =
            unsafe { std::slice::from_raw_parts(data_start as *const u8, extent) }.to_vec();

        if area.mode() == SnapshotMode::Move && extent > 0 {
            let start = NonNull::new(data_start as *mut c_void).expect("areas are non-null");

            area.mapper().discard(start, extent).map_err(Error::Io)?;
        }

        captured.push(CapturedArea {
            base: area.base() as u64,
            length: area.len() as u64,
            mode: mode_to_wire(area.mode()),
            data_start: data_start as u64,
            bytes,
        });
    }

    Ok(captured)
}

/// Orbit-side bookkeeping of which area ranges have been installed.
/// The first snapshot of an area overmaps its whole range with fresh
/// private pages; this both pairs ranges the host created after the
/// fork and severs any shared file backing.
pub(crate) struct InstalledAreas {
    known: HashSet<u64>,
}

impl InstalledAreas {
    pub fn new() -> Self {
        Self {
            known: HashSet::new(),
        }
    }

    /// Returns the destination address for an incoming extent,
    /// mapping the area's range first if this is its debut.
    pub fn prepare(&mut self, header: &AreaHeader) -> io::Result<*mut u8> {
        log::debug!(
            "installing area {:#x}+{:#x} mode {} extent {:#x}",
            header.base,
            header.length,
            header.mode,
            header.extent_length
        );

        if !crate::arena::contains(header.base as usize, header.length as usize) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "area outside the arena reservation",
            ));
        }

        if !self.known.contains(&header.base) {
            let base = NonNull::new(header.base as *mut c_void)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "null area base"))?;

            map::commit_fresh_region(base, header.length as usize)
                .map_err(io::Error::from_raw_os_error)?;
            self.known.insert(header.base);
        }

        Ok(header.data_start as *mut u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocatorMethod;
    use crate::area::AreaConfig;

    #[test]
    fn capture_covers_extent_only() {
        let area = Area::new(AreaConfig::with_method(
            8 * 4096,
            AllocatorMethod::Linear { use_meta: false },
        ))
        .expect("area should build");

        let p = area.alloc(100).expect("alloc should succeed");
        unsafe { std::ptr::write_bytes(p.as_ptr() as *mut u8, 0x2d, 100) };

        let captured = capture(&[&area]).expect("capture should succeed");
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].bytes.len(), map::page_size());
        assert_eq!(captured[0].bytes[0], 0x2d);
        assert_eq!(captured[0].bytes[99], 0x2d);
        assert_eq!(captured[0].bytes[100], 0);
    }

    // Host writes after the capture must not be visible in the
    // captured bytes.
    #[test]
    fn capture_is_point_in_time() {
        let area = Area::new(AreaConfig::with_method(
            4096,
            AllocatorMethod::Linear { use_meta: false },
        ))
        .expect("area should build");

        let p = area.alloc(8).expect("alloc should succeed");
        unsafe { std::ptr::write(p.as_ptr() as *mut u64, 111) };

        let captured = capture(&[&area]).expect("capture should succeed");

        unsafe { std::ptr::write(p.as_ptr() as *mut u64, 999) };

        let mut raw = [0u8; 8];
        raw.copy_from_slice(&captured[0].bytes[..8]);
        assert_eq!(u64::from_ne_bytes(raw), 111);
    }

    #[test]
    fn move_mode_discards_host_pages() {
        let config = AreaConfig {
            size: 4096,
            mode: SnapshotMode::Move,
            method: Some(AllocatorMethod::Linear { use_meta: false }),
            mapper_name: None,
        };
        let area = Area::new(config).expect("area should build");

        let p = area.alloc(8).expect("alloc should succeed");
        unsafe { std::ptr::write(p.as_ptr() as *mut u64, 77) };

        let captured = capture(&[&area]).expect("capture should succeed");

        let mut raw = [0u8; 8];
        raw.copy_from_slice(&captured[0].bytes[..8]);
        assert_eq!(u64::from_ne_bytes(raw), 77);

        // Anonymous backing reads back as zeros once moved out.
        assert_eq!(unsafe { std::ptr::read(p.as_ptr() as *const u64) }, 0);
    }

    #[test]
    fn empty_extent_captures_nothing() {
        let area = Area::new(AreaConfig::new(4096)).expect("area should build");

        let captured = capture(&[&area]).expect("capture should succeed");
        assert_eq!(captured[0].bytes.len(), 0);
    }
}
