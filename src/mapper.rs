//! A `Mapper` is responsible for providing backing memory for the
//! arena ranges that `Area`s are carved from.  Each `Area` is
//! parameterised on such a `Mapper`.
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

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

#[allow(clippy::inline_fn_without_body)]
#[contract_trait]
pub trait Mapper: std::fmt::Debug + Sync {
    /// Returns the mapping granularity for this mapper.  All calls
    /// into the mapper use addresses and sizes aligned to that page
    /// size.
    ///
    /// The page size must be constant for the lifetime of a process.
    #[ensures(ret > 0 && ret & (ret - 1) == 0, "page size must be a power of 2")]
    fn page_size(&self) -> usize;

    /// Backs `[base, base + size)`, a page-aligned subrange of a
    /// reserved arena region, with read-write memory.  On successful
    /// return the range must be zero-filled.
    #[requires(size % self.page_size() == 0)]
    fn commit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32>;

    /// Makes the host lose access to a committed range: depending on
    /// the mapper, subsequent reads either observe zeros or fault.
    /// Used to consume an area that was snapshotted in `Move` mode.
    #[requires(size % self.page_size() == 0)]
    fn discard(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32>;

    /// Restores host access to a previously discarded range.  The
    /// contents are unspecified.
    #[requires(size % self.page_size() == 0)]
    fn reclaim(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32>;
}

/// The default mapper backs areas with anonymous private memory; the
/// pages are inherited copy-on-write by every orbit forked later.
#[derive(Debug)]
struct DefaultMapper {}

lazy_static::lazy_static! {
    static ref NAMED_MAPPERS: Mutex<HashMap<String, &'static dyn Mapper>> = {
        let mut map: HashMap<String, &'static dyn Mapper> = HashMap::new();

        map.insert("file".to_string(), Box::leak(Box::new(crate::file_backed_mapper::FileBackedMapper{})));
        Mutex::new(map)
    };
}

/// Upserts the mapper associated with `name`.
pub fn register_mapper(name: String, mapper: &'static dyn Mapper) {
    let mut mappers = NAMED_MAPPERS.lock().unwrap();

    mappers.insert(name, mapper);
}

/// Returns the mapper for the given `name`, if one exists, or the
/// default mapper if `name` is `None`.
///
/// # Errors
///
/// Returns `Err` if no such mapper is defined.
pub fn get_mapper(name: Option<&str>) -> Result<&'static dyn Mapper, &'static str> {
    lazy_static::lazy_static! {
        static ref DEFAULT_MAPPER: DefaultMapper = DefaultMapper{};
    }

    match name {
        Some(key) => {
            let mappers = NAMED_MAPPERS.lock().unwrap();

            Ok(*mappers.get(key).ok_or("Mapper not found")?)
        }
        None => Ok(&*DEFAULT_MAPPER),
    }
}

#[contract_trait]
impl Mapper for DefaultMapper {
    fn page_size(&self) -> usize {
        crate::map::page_size()
    }

    fn commit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        crate::map::commit_region(base, size)
    }

    fn discard(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        // Anonymous pages read back as zeros after a discard.
        crate::map::discard_region(base, size)
    }

    fn reclaim(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        // The discarded range never lost read-write access.
        let _ = (base, size);
        Ok(())
    }
}
