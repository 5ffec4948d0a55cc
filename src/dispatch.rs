//! The orbit-side dispatch loop.  After the fork, the orbit closes
//! the host's fds, names itself, runs the per-orbit initializer, and
//! then consumes tasks one at a time: install the snapshots, run the
//! entry, publish the result.  A crash anywhere in the entry kills
//! the orbit context, which the host observes as `Gone`.
use log::error;
use std::ffi::c_void;
use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::area::Area;
use crate::map;
use crate::orbit::EntryFn;
use crate::orbit::InitFn;
use crate::orbit::TaskOutput;
use crate::snapshot::InstalledAreas;
use crate::wire;
use crate::wire::Request;

static ORBIT_CONTEXT: AtomicBool = AtomicBool::new(false);

lazy_static::lazy_static! {
    /// The calling orbit's scratch area, set before the loop starts.
    static ref SCRATCH: Mutex<Option<Area>> = Default::default();
}

/// True inside the dispatch loop, false in the host.
pub(crate) fn is_orbit_context() -> bool {
    ORBIT_CONTEXT.load(Ordering::Relaxed)
}

/// The scratch area backing update buffers, if this is an orbit.
pub(crate) fn scratch_area() -> Option<Area> {
    SCRATCH.lock().unwrap().clone()
}

/// Everything the forked context needs; assembled by the parent
/// before the fork.
pub(crate) struct ChildSetup {
    pub stream: UnixStream,
    /// Host-side runtime fds inherited across the fork.
    pub close_fds: Vec<RawFd>,
    pub name: String,
    pub entry: EntryFn,
    pub init: Option<InitFn>,
    pub scratch: Area,
}

fn set_process_name(name: &str) {
    if let Ok(cname) = CString::new(name) {
        unsafe { libc::prctl(libc::PR_SET_NAME, cname.as_ptr() as libc::c_ulong) };
    }
}

/// Publishes a task's outcome.  A sent update's region is then folded
/// into the scratch extent, so the next update starts past it.
fn publish(stream: &UnixStream, taskid: u64, output: TaskOutput) -> io::Result<()> {
    match output.update {
        Some(update) => {
            let desc = update.describe();
            wire::write_result(stream, taskid, output.retval, Some(&desc))?;

            if let Some(scratch) = scratch_area() {
                let (start, len) = update.used_region();
                scratch
                    .extent()
                    .set_len(map::round_up_page(start + len - scratch.base()));
            }
            Ok(())
        }
        None => wire::write_result(stream, taskid, output.retval, None),
    }
}

/// The dispatch loop proper.  Never returns; exits the process on
/// shutdown or channel EOF.
pub(crate) fn orbit_main(setup: ChildSetup) -> ! {
    ORBIT_CONTEXT.store(true, Ordering::Relaxed);

    for fd in &setup.close_fds {
        unsafe { libc::close(*fd) };
    }

    set_process_name(&setup.name);
    *SCRATCH.lock().unwrap() = Some(setup.scratch);

    let store = match setup.init {
        Some(init) => init(),
        None => std::ptr::null_mut(),
    };

    let mut installed = InstalledAreas::new();

    loop {
        let mut task = match wire::read_request(&setup.stream, &mut |header| {
            installed.prepare(header)
        }) {
            Ok(Request::Task(task)) => task,
            Ok(Request::Shutdown) | Err(_) => break,
        };

        log::debug!("dispatching task {} flags {:#x}", task.taskid, task.flags);

        let entry: EntryFn = if task.entry == 0 {
            setup.entry
        } else {
            // The address came from the host; the fork shares the
            // text mapping, so it denotes the same function here.
            unsafe { std::mem::transmute::<usize, EntryFn>(task.entry as usize) }
        };

        let argbuf = task.arg.as_mut_ptr() as *mut c_void;
        let output = match std::panic::catch_unwind(AssertUnwindSafe(|| entry(store, argbuf))) {
            Ok(output) => output,
            Err(_) => {
                error!("orbit entry panicked; aborting the orbit context");
                std::process::abort();
            }
        };

        if publish(&setup.stream, task.taskid, output).is_err() {
            break;
        }
    }

    unsafe { libc::_exit(0) }
}
