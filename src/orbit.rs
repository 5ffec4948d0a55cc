//! Orbit lifecycle and the host-side call path.  An orbit is a
//! forked sibling process running the dispatch loop; the host talks
//! to it over a socketpair.  A pump thread feeds it one task at a
//! time in FIFO order, and a reader thread routes results to the
//! tasks' futures and notices the orbit's death.
use log::info;
use log::warn;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::ffi::c_void;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;

use crate::area::Area;
use crate::area::AreaConfig;
use crate::arena;
use crate::dispatch;
use crate::error::Error;
use crate::error::Result;
use crate::future::Future;
use crate::future::FutureSlot;
use crate::future::Pulled;
use crate::snapshot;
use crate::task::apply_queue_flags;
use crate::task::PendingTask;
use crate::task::QueueDecision;
use crate::task::TaskFlags;
use crate::update::UpdateBuffer;
use crate::wire;

/// Maximum size of a call's argument blob.
pub const ARG_SIZE_MAX: usize = 1024;

/// Maximum orbit name length, in bytes.
pub const NAME_LEN: usize = 16;

const DEFAULT_NAME: &str = "anonymous";

#[cfg(not(feature = "test_only_small_constants"))]
const DEFAULT_SCRATCH_SIZE: usize = 4 << 20;

#[cfg(feature = "test_only_small_constants")]
const DEFAULT_SCRATCH_SIZE: usize = 256 << 10;

/// The entry function an orbit runs per task.  `store` is whatever
/// the orbit's init function returned; `argbuf` points to the orbit's
/// copy of the argument blob and is valid for the call only.
pub type EntryFn = fn(store: *mut c_void, argbuf: *mut c_void) -> TaskOutput;

/// Optional per-orbit initializer, run once in the orbit before the
/// first dispatch; the returned pointer is threaded through every
/// entry invocation.
pub type InitFn = fn() -> *mut c_void;

/// What an entry invocation produced: the scalar retval and, for
/// async callers, an optional update log.
pub struct TaskOutput {
    pub retval: u64,
    pub update: Option<UpdateBuffer>,
}

impl TaskOutput {
    pub fn new(retval: u64) -> Self {
        Self {
            retval,
            update: None,
        }
    }

    pub fn with_update(retval: u64, update: UpdateBuffer) -> Self {
        Self {
            retval,
            update: Some(update),
        }
    }
}

impl From<u64> for TaskOutput {
    fn from(retval: u64) -> Self {
        TaskOutput::new(retval)
    }
}

/// Orbit lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifeState {
    New,
    Attached,
    Started,
    /// Shutting down: the queue is drained and the pump is sending
    /// the shutdown message.
    Stopped,
    /// The host dropped control without killing the orbit; it exits
    /// on its own once it notices.
    Detached,
    Dead,
}

/// When created, an orbit is configured with an entry function and
/// optionally a name, an initializer, and a scratch area size.
pub struct OrbitConfig {
    pub name: Option<String>,
    pub entry: EntryFn,
    pub init: Option<InitFn>,
    pub scratch_size: usize,
}

impl OrbitConfig {
    pub fn new(name: &str, entry: EntryFn) -> Self {
        Self {
            name: Some(name.to_string()),
            entry,
            init: None,
            scratch_size: DEFAULT_SCRATCH_SIZE,
        }
    }
}

struct OrbitShared {
    state: LifeState,
    queue: VecDeque<PendingTask>,
    /// The task currently on the wire or running, if any.
    in_flight: Option<u64>,
    next_taskid: u64,
}

pub(crate) struct OrbitInner {
    mpid: u32,
    lobid: u64,
    gobid: u64,
    name: String,
    child_pid: libc::pid_t,
    scratch: Area,
    shared: Mutex<OrbitShared>,
    cond: Condvar,
    futures: Mutex<HashMap<u64, Arc<FutureSlot>>>,
    /// Host end of the socketpair; only the pump writes to it.
    stream: UnixStream,
    /// The reader thread's clone of the host end; recorded so later
    /// forks can close it.
    reader_fd: RawFd,
}

/// Host-side handle to an orbit.  Clones refer to the same orbit.
#[derive(Clone)]
pub struct Orbit {
    inner: Arc<OrbitInner>,
}

lazy_static::lazy_static! {
    // TODO(lock): this lock is never taken on a fast path.
    static ref ORBITS: Mutex<HashMap<u64, Arc<OrbitInner>>> = Default::default();

    /// Serializes socketpair creation and fork so no half-created
    /// channel leaks into a concurrently forked orbit.
    static ref CREATION_LOCK: Mutex<()> = Default::default();
}

static NEXT_LOBID: AtomicU64 = AtomicU64::new(0);

/// True inside an orbit's dispatch loop, false in the host.
pub fn is_orbit_context() -> bool {
    dispatch::is_orbit_context()
}

fn io_errno(err: std::io::Error) -> Error {
    Error::Io(err.raw_os_error().unwrap_or(0))
}

fn truncate_name(name: &str) -> String {
    if name.len() <= NAME_LEN {
        return name.to_string();
    }

    let mut end = NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Reaps `pid`, tolerating a host-installed child reaper having
/// gotten there first.
fn reap_child(pid: libc::pid_t) {
    loop {
        let mut status = 0;
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };

        if ret >= 0 {
            return;
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno != libc::EINTR {
            return;
        }
    }
}

impl Orbit {
    /// Spawns an orbit for `config`: creates its scratch area and
    /// control channel, forks the dispatch context, and starts the
    /// host-side pump and reader threads.
    pub fn new(config: OrbitConfig) -> Result<Orbit> {
        let name = truncate_name(config.name.as_deref().unwrap_or(DEFAULT_NAME));

        let _creation = CREATION_LOCK.lock().unwrap();
        arena::ensure_reserved();

        let scratch = Area::new(AreaConfig::new(config.scratch_size))?;
        let (host_end, child_end) = UnixStream::pair().map_err(io_errno)?;
        let reader_end = host_end.try_clone().map_err(io_errno)?;

        // Runtime fds the child must not inherit: every live orbit's
        // host-side fds, and this orbit's own host ends.  Leaving one
        // open would defeat EOF-based death detection.
        let close_fds: Vec<RawFd> = {
            let orbits = ORBITS.lock().unwrap();
            let mut fds: Vec<RawFd> = Vec::with_capacity(2 * orbits.len() + 2);

            for inner in orbits.values() {
                fds.push(inner.stream.as_raw_fd());
                fds.push(inner.reader_fd);
            }
            fds.push(host_end.as_raw_fd());
            fds.push(reader_end.as_raw_fd());
            fds
        };

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(Error::last_os());
        }
        if pid == 0 {
            // Orbit context from here on; never returns.
            dispatch::orbit_main(dispatch::ChildSetup {
                stream: child_end,
                close_fds,
                name,
                entry: config.entry,
                init: config.init,
                scratch,
            });
        }

        drop(child_end);

        let mpid = unsafe { libc::getpid() } as u32;
        let lobid = NEXT_LOBID.fetch_add(1, Ordering::SeqCst) + 1;
        let gobid = (mpid as u64) << 32 | lobid;

        let inner = Arc::new(OrbitInner {
            mpid,
            lobid,
            gobid,
            name,
            child_pid: pid,
            scratch,
            shared: Mutex::new(OrbitShared {
                state: LifeState::New,
                queue: VecDeque::new(),
                in_flight: None,
                next_taskid: 0,
            }),
            cond: Condvar::new(),
            futures: Mutex::new(HashMap::new()),
            stream: host_end,
            reader_fd: reader_end.as_raw_fd(),
        });

        ORBITS.lock().unwrap().insert(gobid, inner.clone());
        inner.shared.lock().unwrap().state = LifeState::Attached;

        {
            let pump = inner.clone();
            std::thread::Builder::new()
                .name(format!("orbit-pump-{}", lobid))
                .spawn(move || pump_loop(pump))
                .map_err(io_errno)?;
        }
        {
            let reader = inner.clone();
            std::thread::Builder::new()
                .name(format!("orbit-reader-{}", lobid))
                .spawn(move || reader_loop(reader, reader_end))
                .map_err(io_errno)?;
        }

        inner.shared.lock().unwrap().state = LifeState::Started;
        info!("created orbit <mpid {}, lobid {}, gobid {}>", mpid, lobid, gobid);

        Ok(Orbit { inner })
    }

    #[inline]
    pub fn gobid(&self) -> u64 {
        self.inner.gobid
    }

    #[inline]
    pub fn lobid(&self) -> u64 {
        self.inner.lobid
    }

    /// The creating host's pid.
    #[inline]
    pub fn mpid(&self) -> u32 {
        self.inner.mpid
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> LifeState {
        self.inner.shared.lock().unwrap().state
    }

    /// The orbit is known and has not died.
    pub fn exists(&self) -> bool {
        self.state() != LifeState::Dead
    }

    /// The orbit has died or been destroyed.
    pub fn gone(&self) -> bool {
        self.state() == LifeState::Dead
    }

    /// Queues an asynchronous call.  The named areas' extents are
    /// frozen here, before this returns; the argument blob is copied
    /// by value.
    pub fn call_async(
        &self,
        flags: TaskFlags,
        areas: &[&Area],
        entry: Option<EntryFn>,
        arg: &[u8],
    ) -> Result<Future> {
        flags.validate()?;
        if arg.len() > ARG_SIZE_MAX {
            return Err(Error::InvalidArgument("argument blob too large"));
        }

        let mut shared = self.inner.shared.lock().unwrap();
        match shared.state {
            LifeState::Started => {}
            _ => return Err(Error::Gone),
        }

        let cancelled = match apply_queue_flags(&mut shared.queue, flags, arg) {
            QueueDecision::Coalesce(taskid) => {
                return Ok(Future::new(self.clone(), taskid));
            }
            QueueDecision::Proceed { cancelled } => cancelled,
        };

        // The copy below is the snapshot: it happens within
        // call_async, so the task observes the areas as of now.
        let captured = snapshot::capture(areas)?;

        shared.next_taskid += 1;
        let taskid = shared.next_taskid;

        // The slot must exist before the pump can send the task, or
        // a fast result would have nowhere to land.
        {
            let mut futures = self.inner.futures.lock().unwrap();
            for stale in cancelled {
                futures.remove(&stale);
            }
            if !flags.contains(TaskFlags::NORETVAL) {
                futures.insert(taskid, Arc::new(FutureSlot::new()));
            }
        }

        shared.queue.push_back(PendingTask {
            taskid,
            flags,
            entry,
            arg: arg.to_vec(),
            areas: captured,
        });

        drop(shared);
        self.inner.cond.notify_all();

        Ok(Future::new(self.clone(), taskid))
    }

    /// Synchronous call: enqueue and block until the retval.  The
    /// checker shall not push updates during a synchronous call; one
    /// that arrives anyway is logged and skipped.
    pub fn call(&self, areas: &[&Area], entry: Option<EntryFn>, arg: &[u8]) -> Result<u64> {
        let future = self.call_async(TaskFlags::empty(), areas, entry, arg)?;

        loop {
            match future.pull()? {
                Pulled::Done(retval) => return Ok(retval),
                Pulled::Update(mut update) => {
                    warn!(
                        "orbit {}: update log pushed during a synchronous call; skipping",
                        self.inner.gobid
                    );
                    update.skip(false);
                }
            }
        }
    }

    /// Cancels every queued, cancellable task whose argument blob is
    /// byte-equal to `arg`.  Returns how many were cancelled.
    pub fn cancel_by_arg(&self, arg: &[u8]) -> Result<usize> {
        let cancelled: Vec<u64> = {
            let mut shared = self.inner.shared.lock().unwrap();

            let mut keep = VecDeque::with_capacity(shared.queue.len());
            let mut cancelled = Vec::new();
            for task in shared.queue.drain(..) {
                if task.arg == arg && task.flags.contains(TaskFlags::CANCELLABLE) {
                    cancelled.push(task.taskid);
                } else {
                    keep.push_back(task);
                }
            }
            shared.queue = keep;
            cancelled
        };

        let mut futures = self.inner.futures.lock().unwrap();
        for taskid in &cancelled {
            futures.remove(taskid);
        }

        Ok(cancelled.len())
    }

    /// Destroys the orbit: queued tasks are cancelled, a graceful
    /// shutdown is attempted, then the context is killed and reaped.
    /// Pending futures flush with `Err(Gone)`.
    pub fn destroy(&self) -> Result<()> {
        {
            let mut shared = self.inner.shared.lock().unwrap();
            match shared.state {
                LifeState::Dead => return Ok(()),
                LifeState::Detached => return Err(Error::Gone),
                _ => {}
            }
            shared.state = LifeState::Stopped;
            shared.queue.clear();
        }
        self.inner.cond.notify_all();

        // Give an idle orbit a moment to exit on the shutdown
        // message before killing it.
        let mut exited = false;
        for _ in 0..50 {
            let mut status = 0;
            let ret = unsafe { libc::waitpid(self.inner.child_pid, &mut status, libc::WNOHANG) };
            if ret != 0 {
                // Reaped, or a host child-reaper got there first.
                exited = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        if !exited {
            unsafe { libc::kill(self.inner.child_pid, libc::SIGKILL) };
            reap_child(self.inner.child_pid);
        }

        self.inner.on_dead();
        ORBITS.lock().unwrap().remove(&self.inner.gobid);
        Ok(())
    }

    /// Drops host control without killing the orbit.  The orbit
    /// exits once it sees the closed channel; its tasks' futures
    /// flush with `Err(Gone)`.
    pub fn detach(&self) -> Result<()> {
        {
            let mut shared = self.inner.shared.lock().unwrap();
            match shared.state {
                LifeState::Dead | LifeState::Detached => return Err(Error::Gone),
                _ => {}
            }
            shared.state = LifeState::Detached;
            shared.queue.clear();
        }
        self.inner.cond.notify_all();

        let _ = self.inner.stream.shutdown(std::net::Shutdown::Both);
        ORBITS.lock().unwrap().remove(&self.inner.gobid);
        Ok(())
    }

    pub(crate) fn pull_task(&self, taskid: u64) -> Result<Pulled> {
        let slot = self
            .inner
            .futures
            .lock()
            .unwrap()
            .get(&taskid)
            .cloned()
            .ok_or(Error::NotFound)?;

        let (pulled, finished) = slot.pull()?;
        if finished {
            self.inner.futures.lock().unwrap().remove(&taskid);
        }

        Ok(pulled)
    }

    pub(crate) fn cancel_task(&self, taskid: u64) -> Result<()> {
        {
            let mut shared = self.inner.shared.lock().unwrap();

            if let Some(pos) = shared.queue.iter().position(|task| task.taskid == taskid) {
                if !shared.queue[pos].flags.contains(TaskFlags::CANCELLABLE) {
                    return Err(Error::InvalidArgument("task is not cancellable"));
                }
                shared.queue.remove(pos);
            } else if shared.in_flight == Some(taskid) {
                return Err(Error::Busy);
            } else {
                // Not queued, not running: either its result exists,
                // or this orbit never knew it / already reaped it.
                return if self.inner.futures.lock().unwrap().contains_key(&taskid) {
                    Err(Error::AlreadyDone)
                } else {
                    Err(Error::NotFound)
                };
            }
        }

        self.inner.futures.lock().unwrap().remove(&taskid);
        Ok(())
    }

}

impl OrbitInner {
    /// Marks the orbit dead and flushes every outstanding future.
    /// Idempotent; called from the reader, the pump, and destroy.
    fn on_dead(&self) {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.state == LifeState::Dead {
                return;
            }
            shared.state = LifeState::Dead;
            shared.queue.clear();
            shared.in_flight = None;
        }
        self.cond.notify_all();

        let futures = self.futures.lock().unwrap();
        for slot in futures.values() {
            slot.fail();
        }
    }
}

/// Feeds the orbit one task at a time: the next task goes on the wire
/// only after the previous one's retval came back, so the cancel
/// window stays open until dispatch actually begins.
fn pump_loop(inner: Arc<OrbitInner>) {
    loop {
        let task = {
            let mut shared = inner.shared.lock().unwrap();
            loop {
                match shared.state {
                    LifeState::Stopped => {
                        drop(shared);
                        let _ = wire::write_shutdown(&inner.stream);
                        return;
                    }
                    LifeState::Dead | LifeState::Detached => return,
                    _ => {}
                }

                if shared.in_flight.is_none() {
                    if let Some(task) = shared.queue.pop_front() {
                        shared.in_flight = Some(task.taskid);
                        break task;
                    }
                }

                shared = inner.cond.wait(shared).unwrap();
            }
        };

        if wire::write_task(&inner.stream, &task).is_err() {
            // The orbit died under us.
            inner.on_dead();
            return;
        }
    }
}

/// Routes results to futures and detects the orbit's death via EOF.
fn reader_loop(inner: Arc<OrbitInner>, stream: UnixStream) {
    let scratch_range = (inner.scratch.base(), inner.scratch.len());

    loop {
        match wire::read_result(&stream, scratch_range) {
            Ok(msg) => {
                {
                    let mut shared = inner.shared.lock().unwrap();
                    if shared.in_flight == Some(msg.taskid) {
                        shared.in_flight = None;
                    }
                }
                inner.cond.notify_all();

                let slot = inner.futures.lock().unwrap().get(&msg.taskid).cloned();
                if let Some(slot) = slot {
                    if let Some(desc) = msg.update {
                        // The bytes already landed in the scratch
                        // range the description names.
                        slot.push_update(unsafe { UpdateBuffer::from_desc(&desc) });
                    }
                    slot.push_done(msg.retval);
                }
            }
            Err(_) => {
                let detached = {
                    let shared = inner.shared.lock().unwrap();
                    shared.state == LifeState::Detached
                };

                reap_child(inner.child_pid);
                if !detached {
                    info!("orbit {} is gone", inner.gobid);
                }
                inner.on_dead();
                return;
            }
        }
    }
}

/// Destroys the orbit with this gobid.
pub fn destroy(gobid: u64) -> Result<()> {
    let inner = ORBITS
        .lock()
        .unwrap()
        .get(&gobid)
        .cloned()
        .ok_or(Error::NotFound)?;

    Orbit { inner }.destroy()
}

/// Destroys every live orbit.
pub fn destroy_all() -> Result<()> {
    let orbits: Vec<Arc<OrbitInner>> = ORBITS.lock().unwrap().values().cloned().collect();

    for inner in orbits {
        let _ = Orbit { inner }.destroy();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_truncation() {
        assert_eq!(truncate_name("checker"), "checker");
        assert_eq!(truncate_name("a-very-long-orbit-name"), "a-very-long-orbi");
        assert_eq!(truncate_name(""), "");
    }

    #[test]
    fn gobid_embeds_identity() {
        let mpid = 1234u32;
        let lobid = 7u64;
        let gobid = (mpid as u64) << 32 | lobid;

        assert_eq!(gobid >> 32, mpid as u64);
        assert_eq!(gobid & 0xffff_ffff, lobid);
    }
}
