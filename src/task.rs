//! Queued invocations and the enqueue-time flag rules.  Tasks wait in
//! a per-orbit FIFO; the skip family coalesces duplicate work at
//! enqueue, the cancel family displaces stale queued work.
use std::collections::VecDeque;

use crate::error::Error;
use crate::error::Result;
use crate::orbit::EntryFn;
use crate::snapshot::CapturedArea;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// No result will be delivered; the future need not be
        /// consumed.
        const NORETVAL = 1 << 0;
        /// The task may be cancelled while still queued.
        const CANCELLABLE = 1 << 1;
        /// Drop the new task if an unstarted one with a byte-equal
        /// argument is queued, returning the queued task's id.
        const SKIP_SAME_ARG = 1 << 2;
        /// Drop the new task if any unstarted task is queued.
        const SKIP_ANY = 1 << 3;
        /// Cancel queued tasks with a byte-equal argument before
        /// inserting.
        const CANCEL_SAME_ARG = 1 << 4;
        /// Cancel every queued task before inserting.
        const CANCEL_ANY = 1 << 5;
    }
}

impl TaskFlags {
    /// The skip and cancel families are mutually exclusive.
    pub(crate) fn validate(self) -> Result<()> {
        let skips = self.intersects(TaskFlags::SKIP_SAME_ARG | TaskFlags::SKIP_ANY);
        let cancels = self.intersects(TaskFlags::CANCEL_SAME_ARG | TaskFlags::CANCEL_ANY);

        if skips && cancels {
            return Err(Error::InvalidArgument(
                "skip and cancel flags are mutually exclusive",
            ));
        }

        Ok(())
    }
}

/// A queued invocation, complete with its frozen snapshots.
pub(crate) struct PendingTask {
    pub taskid: u64,
    pub flags: TaskFlags,
    pub entry: Option<EntryFn>,
    /// The argument blob, copied by value at enqueue.
    pub arg: Vec<u8>,
    pub areas: Vec<CapturedArea>,
}

/// What the enqueue-time flags decided.
pub(crate) enum QueueDecision {
    /// Insert the new task; the listed queued tasks were cancelled to
    /// make way.
    Proceed { cancelled: Vec<u64> },
    /// Drop the new task and hand back the id of the queued one that
    /// covers it.
    Coalesce(u64),
}

/// Applies the skip/cancel flag families against the queued tasks.
pub(crate) fn apply_queue_flags(
    queue: &mut VecDeque<PendingTask>,
    flags: TaskFlags,
    arg: &[u8],
) -> QueueDecision {
    if flags.contains(TaskFlags::SKIP_ANY) {
        if let Some(task) = queue.back() {
            return QueueDecision::Coalesce(task.taskid);
        }
    } else if flags.contains(TaskFlags::SKIP_SAME_ARG) {
        if let Some(task) = queue.iter().rev().find(|task| task.arg == arg) {
            return QueueDecision::Coalesce(task.taskid);
        }
    }

    let mut cancelled = Vec::new();
    if flags.contains(TaskFlags::CANCEL_ANY) {
        cancelled.extend(queue.drain(..).map(|task| task.taskid));
    } else if flags.contains(TaskFlags::CANCEL_SAME_ARG) {
        let mut keep = VecDeque::with_capacity(queue.len());
        for task in queue.drain(..) {
            if task.arg == arg {
                cancelled.push(task.taskid);
            } else {
                keep.push_back(task);
            }
        }
        *queue = keep;
    }

    QueueDecision::Proceed { cancelled }
}
