//! The update ADT: a typed log of records a checker emits for the
//! host to apply.  Records live in fixed-size blocks strung into a
//! queue; blocks and out-of-line payloads are allocated from a linear
//! allocator over a region carved out of the owning orbit's scratch
//! area, so the whole log is one contiguous range that can be handed
//! across the process boundary with its internal pointers intact.
use log::warn;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::allocator::AreaAllocator;
use crate::allocator::Extent;
use crate::area::Area;
use crate::error::Error;
use crate::error::Result;
use crate::linear::LinearAllocator;
use crate::map;
use crate::operation::OpToken;

/// Payloads at most this long are stored inline in the record.
pub const SMALL_DATA_MAX: usize = 16;

/// Maximum per-record payload size.
pub const ORBIT_BUFFER_MAX: usize = 1024;

/// The record kinds a checker can push, plus the two sentinels
/// iteration can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    End = 0,
    Unknown = 1,
    Any = 2,
    Modify = 3,
    Operation = 4,
}

/// One record: a tag, the payload length, a target (host address for
/// `Modify`, operation id for `Operation`), and 16 bytes that hold
/// either the payload or a pointer to its out-of-line storage.
#[repr(C)]
pub struct Record {
    kind: u8,
    _pad: [u8; 3],
    length: u32,
    target: u64,
    data: [u8; SMALL_DATA_MAX],
}

static_assertions::const_assert_eq!(std::mem::size_of::<Record>(), 32);

const BLOCK_BYTES: usize = 512;
const RECORDS_PER_BLOCK: usize = 15;

/// Blocks form a singly-linked queue; the link slot is padded to one
/// record so the block stays exactly 512 bytes.
#[repr(C)]
struct Block {
    next: *mut Block,
    _pad: [u8; 24],
    records: [Record; RECORDS_PER_BLOCK],
}

static_assertions::const_assert_eq!(std::mem::size_of::<Block>(), BLOCK_BYTES);

/// Queue bookkeeping, itself the first allocation in the update's
/// region so it travels with the records.
#[repr(C)]
struct BlockList {
    count: usize,
    /// Cursor in the first block.
    head: usize,
    /// Cursor in the last block.
    tail: usize,
    first: *mut Block,
    last: *mut Block,
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self.kind {
            0 => RecordKind::End,
            2 => RecordKind::Any,
            3 => RecordKind::Modify,
            4 => RecordKind::Operation,
            _ => RecordKind::Unknown,
        }
    }

    /// The `Modify` target address or `Operation` id.
    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize
    }

    fn payload_ptr(&self) -> *mut u8 {
        if self.payload_len() <= SMALL_DATA_MAX {
            self.data.as_ptr() as *mut u8
        } else {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&self.data[..8]);
            usize::from_ne_bytes(raw) as *mut u8
        }
    }

    /// The record's payload bytes.
    pub fn payload(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.payload_ptr(), self.payload_len()) }
    }
}

/// Compact description of an update buffer, used to rebuild it on the
/// other side of the process boundary after the region's bytes have
/// been transferred to the same addresses.
#[derive(Clone, Copy, Debug)]
pub(crate) struct UpdateDesc {
    pub data_start: u64,
    pub data_length: u64,
    pub list: u64,
}

pub struct UpdateBuffer {
    region_start: usize,
    extent: Arc<Extent>,
    /// Present on the pushing side; the receiving side only walks and
    /// pops, which needs no allocator.
    alloc: Option<LinearAllocator>,
    list: NonNull<BlockList>,
}

// The buffer owns its region exclusively until published, and the
// host side never shares one across threads concurrently.
unsafe impl Send for UpdateBuffer {}

impl UpdateBuffer {
    /// Binds a new update to the calling orbit's scratch area.  Only
    /// valid in orbit context.
    pub fn create() -> Result<UpdateBuffer> {
        let scratch = crate::dispatch::scratch_area()
            .ok_or(Error::InvalidArgument("not in orbit context"))?;

        Self::create_in(&scratch)
    }

    /// Binds a new update to the unused tail of `area`.  The area's
    /// extent is not advanced until the update is published.
    pub fn create_in(area: &Area) -> Result<UpdateBuffer> {
        let used = area.data_len();
        if used >= area.len() {
            return Err(Error::OutOfSpace);
        }

        let start = area.base() + used;
        let length = area.len() - used;

        let extent = Arc::new(Extent::new(start));
        let base = NonNull::new(start as *mut c_void).expect("area addresses are non-null");
        let alloc = LinearAllocator::new(base, length, extent.clone(), true);

        let list = alloc.alloc(std::mem::size_of::<BlockList>())?.as_ptr() as *mut BlockList;
        unsafe {
            list.write(BlockList {
                count: 0,
                head: 0,
                tail: 0,
                first: std::ptr::null_mut(),
                last: std::ptr::null_mut(),
            });
        }

        Ok(UpdateBuffer {
            region_start: start,
            extent,
            alloc: Some(alloc),
            list: NonNull::new(list).expect("allocations are non-null"),
        })
    }

    /// Rebuilds a buffer from a description received off the wire.
    ///
    /// # Safety
    ///
    /// The described region must already hold the transferred bytes
    /// at the same addresses they had on the sending side.
    pub(crate) unsafe fn from_desc(desc: &UpdateDesc) -> UpdateBuffer {
        UpdateBuffer {
            region_start: desc.data_start as usize,
            extent: Arc::new(Extent::new(desc.data_start as usize)),
            alloc: None,
            list: NonNull::new(desc.list as *mut BlockList).expect("list pointer is non-null"),
        }
    }

    pub(crate) fn describe(&self) -> UpdateDesc {
        UpdateDesc {
            data_start: self.region_start as u64,
            data_length: map::round_up_page(self.extent.len()) as u64,
            list: self.list.as_ptr() as u64,
        }
    }

    /// The region the update occupies: start address and page-rounded
    /// used length.
    pub(crate) fn used_region(&self) -> (usize, usize) {
        (self.region_start, map::round_up_page(self.extent.len()))
    }

    fn list(&self) -> &BlockList {
        unsafe { self.list.as_ref() }
    }

    pub fn is_empty(&self) -> bool {
        self.list().count == 0
    }

    pub fn len(&self) -> usize {
        self.list().count
    }

    /// Reserves the next tail record plus `size` bytes of payload
    /// storage (inline when it fits).
    fn push_allocate(&mut self, size: usize) -> Result<(&mut Record, *mut u8)> {
        if size > ORBIT_BUFFER_MAX {
            return Err(Error::InvalidArgument("record payload too large"));
        }

        let alloc = self
            .alloc
            .as_ref()
            .ok_or(Error::InvalidArgument("update buffer is read-only"))?;
        let list = self.list.as_ptr();

        let mut data = std::ptr::null_mut();
        if size > SMALL_DATA_MAX {
            data = alloc.alloc(size)?.as_ptr() as *mut u8;
        }

        unsafe {
            if (*list).last.is_null() || (*list).tail == RECORDS_PER_BLOCK {
                let block = alloc.alloc(std::mem::size_of::<Block>())?.as_ptr() as *mut Block;
                std::ptr::addr_of_mut!((*block).next).write(std::ptr::null_mut());

                if (*list).last.is_null() {
                    (*list).first = block;
                } else {
                    (*(*list).last).next = block;
                }
                (*list).last = block;
                (*list).tail = 0;
            }

            (*list).count += 1;
            let slot = (*list).tail;
            (*list).tail += 1;

            let record = std::ptr::addr_of_mut!((*(*list).last).records[slot]);
            record.write(Record {
                kind: RecordKind::End as u8,
                _pad: [0; 3],
                length: 0,
                target: 0,
                data: [0; SMALL_DATA_MAX],
            });

            let record = &mut *record;
            if size <= SMALL_DATA_MAX {
                data = record.data.as_mut_ptr();
            }

            Ok((record, data))
        }
    }

    /// Pushes "at host address `ptr`, write these `length` bytes",
    /// capturing the bytes currently at `ptr`.
    pub fn add_modify(&mut self, ptr: *mut c_void, length: usize) -> Result<()> {
        let (record, data) = self.push_allocate(length)?;

        record.kind = RecordKind::Modify as u8;
        record.length = length as u32;
        record.target = ptr as u64;
        if length > SMALL_DATA_MAX {
            record.data[..8].copy_from_slice(&(data as usize).to_ne_bytes());
        }
        unsafe { std::ptr::copy_nonoverlapping(ptr as *const u8, data, length) };

        Ok(())
    }

    /// Pushes an opaque payload of `length` bytes, copied from `src`
    /// when non-null, and returns the payload storage so the caller
    /// can fill or amend it in place.
    pub fn add_data(&mut self, src: *const c_void, length: usize) -> Result<*mut u8> {
        let (record, data) = self.push_allocate(length)?;

        record.kind = RecordKind::Any as u8;
        record.length = length as u32;
        if length > SMALL_DATA_MAX {
            record.data[..8].copy_from_slice(&(data as usize).to_ne_bytes());
        }
        if !src.is_null() {
            unsafe { std::ptr::copy_nonoverlapping(src as *const u8, data, length) };
        }

        Ok(data)
    }

    /// Pushes "invoke this registered operation with these argument
    /// bytes at apply time".
    pub fn add_operation(&mut self, op: OpToken, arg: *const c_void, length: usize) -> Result<()> {
        let (record, data) = self.push_allocate(length)?;

        record.kind = RecordKind::Operation as u8;
        record.length = length as u32;
        record.target = op.id() as u64;
        if length > SMALL_DATA_MAX {
            record.data[..8].copy_from_slice(&(data as usize).to_ne_bytes());
        }
        if !arg.is_null() {
            unsafe { std::ptr::copy_nonoverlapping(arg as *const u8, data, length) };
        }

        Ok(())
    }

    fn front(&self) -> Option<&Record> {
        let list = self.list();
        if list.count == 0 {
            return None;
        }

        Some(unsafe { &(*list.first).records[list.head] })
    }

    /// Dequeues the head record; a drained head block is unlinked and
    /// returned to the allocator.
    fn pop(&mut self) {
        let list = self.list.as_ptr();

        unsafe {
            if (*list).count == 0 {
                return;
            }

            (*list).count -= 1;
            (*list).head += 1;
            if (*list).head == RECORDS_PER_BLOCK || (*list).count == 0 {
                let block = (*list).first;
                (*list).first = (*block).next;
                if (*list).first.is_null() {
                    (*list).last = std::ptr::null_mut();
                }
                if let Some(alloc) = self.alloc.as_ref() {
                    alloc.free(NonNull::new(block as *mut c_void).expect("blocks are non-null"));
                }
                if (*list).count == 0 {
                    (*list).tail = 0;
                }
                (*list).head = 0;
            }
        }
    }

    /// Returns the head record, or `None` when the log is drained or
    /// the head is a sentinel.
    pub fn first(&self) -> Option<&Record> {
        let record = self.front()?;

        match record.kind() {
            RecordKind::Any | RecordKind::Modify | RecordKind::Operation => Some(record),
            _ => None,
        }
    }

    /// Skips the head record and returns the next one.
    pub fn next(&mut self) -> Option<&Record> {
        self.skip_one(false);
        self.first()
    }

    /// Applies the head record: `Modify` writes its payload to the
    /// target address, `Operation` invokes the registered operation.
    /// An `Any` record is yielded to the caller without popping when
    /// `yield_any` is set, and silently skipped otherwise.  `Unknown`
    /// is reported without popping.
    pub fn apply_one(&mut self, yield_any: bool) -> RecordKind {
        let record = match self.front() {
            Some(record) => record,
            None => return RecordKind::End,
        };
        let kind = record.kind();

        match kind {
            RecordKind::Modify => unsafe {
                std::ptr::copy_nonoverlapping(
                    record.payload_ptr() as *const u8,
                    record.target as *mut u8,
                    record.payload_len(),
                );
            },
            RecordKind::Operation => match OpToken::from_id(record.target) {
                Some(op) => {
                    // The operation's return value is discarded.
                    op.invoke(record.payload_ptr() as *mut c_void, record.payload_len());
                }
                None => {
                    warn!("update record names unknown operation {}", record.target);
                    return RecordKind::Unknown;
                }
            },
            RecordKind::Any => {
                if yield_any {
                    return RecordKind::Any;
                }
                // Otherwise, skip this data.
            }
            RecordKind::End => {}
            RecordKind::Unknown => return RecordKind::Unknown,
        }

        self.pop();
        kind
    }

    /// Applies records until the log is drained, an `Unknown` record
    /// is hit, or an `Any` record is yielded.
    pub fn apply(&mut self, yield_any: bool) -> RecordKind {
        while !self.is_empty() {
            let kind = self.apply_one(yield_any);

            if kind == RecordKind::End
                || kind == RecordKind::Unknown
                || (kind == RecordKind::Any && yield_any)
            {
                return kind;
            }
        }

        RecordKind::End
    }

    /// Like `apply_one`, without the side effects of `Modify` and
    /// `Operation`.
    pub fn skip_one(&mut self, yield_any: bool) -> RecordKind {
        let record = match self.front() {
            Some(record) => record,
            None => return RecordKind::End,
        };
        let kind = record.kind();

        if kind == RecordKind::Any && yield_any {
            return RecordKind::Any;
        }

        self.pop();
        kind
    }

    /// Like `apply`, without side effects.
    pub fn skip(&mut self, yield_any: bool) -> RecordKind {
        while !self.is_empty() {
            let kind = self.skip_one(yield_any);

            if kind == RecordKind::End
                || kind == RecordKind::Unknown
                || (kind == RecordKind::Any && yield_any)
            {
                return kind;
            }
        }

        RecordKind::End
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::AreaConfig;
    use crate::operation::register_operation;
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;

    fn scratch_area() -> Area {
        Area::new(AreaConfig::new(256 * 1024)).expect("area should build")
    }

    #[test]
    fn push_and_walk() {
        let area = scratch_area();
        let mut update = UpdateBuffer::create_in(&area).expect("update should build");

        assert!(update.is_empty());

        let payload = [1u8, 2, 3, 4];
        update
            .add_data(payload.as_ptr() as *const c_void, payload.len())
            .expect("push should succeed");

        let big = [7u8; 100];
        update
            .add_data(big.as_ptr() as *const c_void, big.len())
            .expect("push should succeed");

        assert_eq!(update.len(), 2);

        let first = update.first().expect("record should exist");
        assert_eq!(first.kind(), RecordKind::Any);
        assert_eq!(first.payload(), &payload[..]);

        let second = update.next().expect("record should exist");
        assert_eq!(second.payload(), &big[..]);

        assert!(update.next().is_none());
        assert!(update.is_empty());
    }

    // Round-trip: push Modify(ptr, bytes) then apply means memory at
    // ptr equals bytes.
    #[test]
    fn modify_round_trip() {
        let area = scratch_area();
        let mut update = UpdateBuffer::create_in(&area).expect("update should build");

        let mut small: u32 = 200;
        let mut large = [0u8; 64];

        // Capture the would-be values, then change them back before
        // applying.
        small += 1;
        update
            .add_modify(&mut small as *mut u32 as *mut c_void, 4)
            .expect("push should succeed");
        small -= 1;

        for (i, byte) in large.iter_mut().enumerate() {
            *byte = i as u8;
        }
        update
            .add_modify(large.as_mut_ptr() as *mut c_void, large.len())
            .expect("push should succeed");
        large = [0u8; 64];

        assert_eq!(update.apply(false), RecordKind::End);
        assert_eq!(small, 201);
        for (i, byte) in large.iter().enumerate() {
            assert_eq!(*byte, i as u8);
        }
        assert!(update.is_empty());
    }

    static OPERATION_SUM: AtomicU64 = AtomicU64::new(0);

    fn sum_bytes(arg: *mut c_void, len: usize) -> u64 {
        let bytes = unsafe { std::slice::from_raw_parts(arg as *const u8, len) };
        let sum: u64 = bytes.iter().map(|&b| b as u64).sum();

        OPERATION_SUM.fetch_add(sum, Ordering::SeqCst);
        sum
    }

    #[test]
    fn operation_apply_and_skip() {
        let token = register_operation(sum_bytes);
        let area = scratch_area();
        let mut update = UpdateBuffer::create_in(&area).expect("update should build");

        let arg = [10u8, 20, 30];
        update
            .add_operation(token, arg.as_ptr() as *const c_void, arg.len())
            .expect("push should succeed");
        update
            .add_operation(token, arg.as_ptr() as *const c_void, arg.len())
            .expect("push should succeed");

        let before = OPERATION_SUM.load(Ordering::SeqCst);
        assert_eq!(update.apply_one(false), RecordKind::Operation);
        assert_eq!(OPERATION_SUM.load(Ordering::SeqCst), before + 60);

        // Skipping must not invoke.
        assert_eq!(update.skip_one(false), RecordKind::Operation);
        assert_eq!(OPERATION_SUM.load(Ordering::SeqCst), before + 60);
        assert!(update.is_empty());
    }

    #[test]
    fn any_yields_or_skips() {
        let area = scratch_area();
        let mut update = UpdateBuffer::create_in(&area).expect("update should build");

        let mut value: u64 = 1;
        update
            .add_data(&value as *const u64 as *const c_void, 8)
            .expect("push should succeed");
        value += 1;
        update
            .add_modify(&mut value as *mut u64 as *mut c_void, 8)
            .expect("push should succeed");
        value -= 1;

        // Yielded: the Any record stays at the head.
        assert_eq!(update.apply(true), RecordKind::Any);
        assert_eq!(update.len(), 2);
        let head = update.first().expect("record should exist");
        assert_eq!(head.payload(), &1u64.to_ne_bytes()[..]);

        // Not yielded: Any is skipped, the Modify applies.
        assert_eq!(update.apply(false), RecordKind::End);
        assert_eq!(value, 2);
        assert!(update.is_empty());
    }

    // Push enough records to span several blocks, then drain and
    // check order; cursors must reset once empty.
    #[test]
    fn block_boundaries() {
        let area = scratch_area();
        let mut update = UpdateBuffer::create_in(&area).expect("update should build");

        let mut targets: Vec<Box<u64>> = Vec::new();
        for i in 0..40u64 {
            let mut slot = Box::new(i + 1);
            update
                .add_modify(&mut *slot as *mut u64 as *mut c_void, 8)
                .expect("push should succeed");
            *slot = 0;
            targets.push(slot);
        }

        assert_eq!(update.len(), 40);
        assert_eq!(update.apply(false), RecordKind::End);

        for (i, slot) in targets.iter().enumerate() {
            assert_eq!(**slot, i as u64 + 1);
        }
        assert!(update.is_empty());

        // The drained buffer accepts new records.
        let mut value: u16 = 9;
        update
            .add_modify(&mut value as *mut u16 as *mut c_void, 2)
            .expect("push should succeed");
        value = 0;
        assert_eq!(update.apply(false), RecordKind::End);
        assert_eq!(value, 9);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let area = scratch_area();
        let mut update = UpdateBuffer::create_in(&area).expect("update should build");

        let huge = vec![0u8; ORBIT_BUFFER_MAX + 1];
        assert!(matches!(
            update.add_data(huge.as_ptr() as *const c_void, huge.len()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn exhausted_scratch_is_reported() {
        let area = Area::new(AreaConfig::new(4096)).expect("area should build");

        let mut update = UpdateBuffer::create_in(&area).expect("update should build");

        // Each out-of-line payload consumes ~1KiB; the one-page
        // region runs dry quickly.
        let payload = [0u8; 1024];
        let mut status = Ok(());
        for _ in 0..8 {
            status = update
                .add_data(payload.as_ptr() as *const c_void, payload.len())
                .map(|_| ());
            if status.is_err() {
                break;
            }
        }
        assert!(matches!(status, Err(Error::OutOfSpace)));
    }

    #[test]
    fn describe_round_trips() {
        let area = scratch_area();
        let mut update = UpdateBuffer::create_in(&area).expect("update should build");

        let mut value: u32 = 6;
        update
            .add_modify(&mut value as *mut u32 as *mut c_void, 4)
            .expect("push should succeed");
        value = 5;

        let desc = update.describe();
        assert_eq!(desc.data_start as usize, area.base());
        assert_eq!(desc.data_length as usize % map::page_size(), 0);

        // Same process, same addresses: the rebuilt view walks the
        // same records.
        let mut rebuilt = unsafe { UpdateBuffer::from_desc(&desc) };
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt.apply(false), RecordKind::End);
        assert_eq!(value, 6);
    }
}
