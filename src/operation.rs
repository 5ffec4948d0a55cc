//! Pre-registered operations that update records may invoke at apply
//! time.  A record carries the registered id rather than a raw
//! function pointer; because registration happens before an orbit is
//! forked, the table is identical on both sides and the id resolves
//! to the same function in the host.
use std::ffi::c_void;
use std::num::NonZeroU32;

/// The signature of a deferred operation: a pointer to the record's
/// payload bytes and their length.  The return value is discarded at
/// apply time.
pub type OperationFn = fn(arg: *mut c_void, len: usize) -> u64;

/// Opaque handle to a registered operation.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct OpToken {
    id: NonZeroU32,
}

lazy_static::lazy_static! {
    static ref OPERATIONS: std::sync::Mutex<Vec<OperationFn>> = Default::default();
}

/// Registers `func` globally and returns its token.  Must be called
/// before spawning any orbit that will push records naming it.
pub fn register_operation(func: OperationFn) -> OpToken {
    let mut operations = OPERATIONS.lock().unwrap();

    let next_id = operations.len() + 1;
    assert!(next_id <= u32::MAX as usize, "too many registered operations");

    operations.push(func);
    OpToken {
        id: NonZeroU32::new(next_id as u32).expect("next_id is positive"),
    }
}

impl OpToken {
    /// Returns the token's underlying id, as stored in records.
    #[inline]
    pub(crate) fn id(self) -> u32 {
        self.id.get()
    }

    /// Recovers a token from a record's stored id, if it names a
    /// registered operation.
    pub(crate) fn from_id(id: u64) -> Option<OpToken> {
        if id > u32::MAX as u64 {
            return None;
        }
        let id = NonZeroU32::new(id as u32)?;

        let operations = OPERATIONS.lock().unwrap();
        if id.get() as usize <= operations.len() {
            Some(OpToken { id })
        } else {
            None
        }
    }

    /// Invokes the registered operation.
    pub(crate) fn invoke(self, arg: *mut c_void, len: usize) -> u64 {
        let func = {
            let operations = OPERATIONS.lock().unwrap();
            operations[self.id.get() as usize - 1]
        };

        func(arg, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    static HITS: AtomicUsize = AtomicUsize::new(0);

    fn bump(_arg: *mut c_void, len: usize) -> u64 {
        HITS.fetch_add(len, Ordering::SeqCst);
        0
    }

    #[test]
    fn register_and_invoke() {
        let token = register_operation(bump);

        assert_eq!(OpToken::from_id(token.id() as u64), Some(token));
        assert_eq!(OpToken::from_id(0), None);
        assert_eq!(OpToken::from_id(u64::MAX), None);

        let before = HITS.load(Ordering::SeqCst);
        token.invoke(std::ptr::null_mut(), 7);
        assert_eq!(HITS.load(Ordering::SeqCst), before + 7);
    }
}
