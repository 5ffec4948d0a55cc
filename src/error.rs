//! The runtime-wide error taxonomy.  Errors from enqueue are returned
//! synchronously; errors after enqueue (snapshot failure, orbit death)
//! surface through the task's future.

/// Runtime error kinds.
///
/// Checker-level crashes never propagate as typed errors: they
/// manifest as `Gone` once the orbit's lifecycle reaches `Dead`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller-supplied argument was rejected before any work happened.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An area allocator cannot satisfy the request.  Areas are sized
    /// by the host; wrapping layers may detect this before calling.
    #[error("allocator out of space")]
    OutOfSpace,

    /// The target orbit has died or been destroyed.
    #[error("orbit is gone")]
    Gone,

    /// Dispatch is already consuming the target task.
    #[error("task is already being dispatched")]
    Busy,

    /// Unknown task id or orbit id.
    #[error("unknown orbit or task")]
    NotFound,

    /// The task already produced its result.
    #[error("task already completed")]
    AlreadyDone,

    /// The area has no attached allocator.
    #[error("area has no allocator")]
    NoAllocator,

    /// Mapping or transport failure, with the OS errno.
    #[error("snapshot engine failure: errno {0}")]
    Io(i32),
}

impl Error {
    /// Builds an `Io` error from the calling thread's errno.
    pub(crate) fn last_os() -> Error {
        Error::Io(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
