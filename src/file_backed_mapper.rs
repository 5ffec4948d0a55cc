//! The file-backed mapper commits area memory as shared mappings of
//! private temporary files.  This lets the operating system eagerly
//! swap out cold checker data when under memory pressure.  Orbits
//! still observe private snapshots: the dispatch side severs any
//! shared backing before installing a snapshot.
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
use std::fs::File;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::mapper::Mapper;

#[derive(Debug)]
pub struct FileBackedMapper {}

lazy_static::lazy_static! {
    static ref FILE_BACKED_PATH: Mutex<Option<PathBuf>> = Default::default();
}

/// Updates the parent directory for the file-backed mapper's
/// temporary files to `path`.
pub fn set_file_backed_area_directory(path: Option<PathBuf>) {
    let mut global_path = FILE_BACKED_PATH.lock().unwrap();

    *global_path = path;
}

/// Returns a temporary File in `FILE_BACKED_PATH`, or in the global
/// `TMPDIR`.
fn get_temp_file() -> Result<File, i32> {
    let path = FILE_BACKED_PATH.lock().unwrap();

    match &*path {
        Some(dir) => tempfile::tempfile_in(dir),
        None => tempfile::tempfile(),
    }
    .map_err(|e| e.raw_os_error().unwrap_or(0))
}

#[contract_trait]
impl Mapper for FileBackedMapper {
    fn page_size(&self) -> usize {
        crate::map::page_size()
    }

    fn commit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        let tempfile = get_temp_file()?;

        // A fresh sparse file reads back as zeros.  The mapping keeps
        // the file alive after this function drops the handle.
        tempfile
            .set_len(size as u64)
            .map_err(|e| e.raw_os_error().unwrap_or(0))?;

        crate::map::commit_file_region(&tempfile, base, size)
    }

    fn discard(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        // Dropping shared pages would re-read the file contents, so a
        // discarded file-backed range loses access outright.
        crate::map::protect_region(base, size)
    }

    fn reclaim(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        crate::map::commit_region(base, size)
    }
}
