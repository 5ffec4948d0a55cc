//! Host-side handle to an async task's result stream.  The reader
//! thread feeds a per-task slot; `pull` drains it: at most one update
//! log, then the final retval, then end-of-stream.
use std::collections::VecDeque;
use std::sync::Condvar;
use std::sync::Mutex;

use crate::error::Error;
use crate::error::Result;
use crate::orbit::Orbit;
use crate::update::UpdateBuffer;

/// One step of a result stream.
pub enum Pulled {
    /// An update log is available; consume it and pull again.
    Update(UpdateBuffer),
    /// End of stream: the task's final retval.  The task is reaped.
    Done(u64),
}

enum SlotItem {
    Update(UpdateBuffer),
    Done(u64),
}

struct SlotState {
    items: VecDeque<SlotItem>,
    /// The orbit died; anything not already queued is lost.
    failed: bool,
}

pub(crate) struct FutureSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl FutureSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                items: VecDeque::new(),
                failed: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn push_update(&self, update: UpdateBuffer) {
        let mut state = self.state.lock().unwrap();

        state.items.push_back(SlotItem::Update(update));
        self.cond.notify_all();
    }

    pub fn push_done(&self, retval: u64) {
        let mut state = self.state.lock().unwrap();

        state.items.push_back(SlotItem::Done(retval));
        self.cond.notify_all();
    }

    /// Marks the stream broken.  Results that fully arrived before
    /// the failure are still delivered.
    pub fn fail(&self) {
        let mut state = self.state.lock().unwrap();

        state.failed = true;
        self.cond.notify_all();
    }

    /// Blocks for the next item.  The second value reports whether
    /// the stream ended and the task can be reaped.
    pub fn pull(&self) -> Result<(Pulled, bool)> {
        let mut state = self.state.lock().unwrap();

        loop {
            if let Some(item) = state.items.pop_front() {
                return Ok(match item {
                    SlotItem::Update(update) => (Pulled::Update(update), false),
                    SlotItem::Done(retval) => (Pulled::Done(retval), true),
                });
            }

            if state.failed {
                return Err(Error::Gone);
            }

            state = self.cond.wait(state).unwrap();
        }
    }
}

/// Handle to a queued or running task: the owning orbit and the task
/// id.
pub struct Future {
    orbit: Orbit,
    taskid: u64,
}

impl Future {
    pub(crate) fn new(orbit: Orbit, taskid: u64) -> Self {
        Self { orbit, taskid }
    }

    pub fn taskid(&self) -> u64 {
        self.taskid
    }

    pub fn orbit(&self) -> &Orbit {
        &self.orbit
    }

    /// Blocks for the task's next result: zero or one `Update`, then
    /// `Done`.  After `Done`, further pulls return `Err(NotFound)`.
    pub fn pull(&self) -> Result<Pulled> {
        self.orbit.pull_task(self.taskid)
    }

    /// Cancels the task if it is still queued and cancellable.
    /// Returns `Err(Busy)` once dispatch started, `Err(AlreadyDone)`
    /// once the result exists, and `Err(NotFound)` for a task this
    /// orbit no longer knows.
    pub fn cancel(&self) -> Result<()> {
        self.orbit.cancel_task(self.taskid)
    }
}
