//! Message framing between the host and an orbit over a socketpair.
//! Task messages carry the argument blob and each snapshotted area's
//! extent bytes; result messages carry the retval and, when present,
//! the update log's region so the receiver can lay it down at the
//! same addresses.  Writes use `MSG_NOSIGNAL` so a dead peer surfaces
//! as an error instead of `SIGPIPE`.
use std::ffi::c_void;
use std::io;
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;

use crate::snapshot::CapturedArea;
use crate::task::PendingTask;
use crate::update::UpdateDesc;

const MSG_TASK: u8 = 1;
const MSG_SHUTDOWN: u8 = 2;
const MSG_RESULT: u8 = 3;

/// Per-area preamble of a task message; the extent bytes follow.
pub(crate) struct AreaHeader {
    pub base: u64,
    pub length: u64,
    pub mode: u8,
    pub data_start: u64,
    pub extent_length: u64,
}

/// A decoded task message, minus the area bytes (those are read
/// straight into the paired addresses).
pub(crate) struct TaskMsg {
    pub taskid: u64,
    pub flags: u32,
    /// Address of the override entry function, or 0 for the orbit's
    /// default.  Valid on both sides of the fork.
    pub entry: u64,
    pub arg: Vec<u8>,
}

pub(crate) enum Request {
    Task(TaskMsg),
    Shutdown,
}

/// A decoded result message.  Update bytes, if any, have already been
/// written to the addresses the description names.
pub(crate) struct ResultMsg {
    pub taskid: u64,
    pub retval: u64,
    pub update: Option<UpdateDesc>,
}

fn send_all(stream: &UnixStream, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let ret = unsafe {
            libc::send(
                stream.as_raw_fd(),
                buf.as_ptr() as *const c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }

        buf = &buf[ret as usize..];
    }

    Ok(())
}

fn recv_exact(stream: &UnixStream, buf: &mut [u8]) -> io::Result<()> {
    (&*stream).read_exact(buf)
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn u8(&mut self) -> u8 {
        let (head, rest) = self.buf.split_at(1);
        self.buf = rest;
        head[0]
    }

    fn u32(&mut self) -> u32 {
        let (head, rest) = self.buf.split_at(4);
        self.buf = rest;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(head);
        u32::from_le_bytes(raw)
    }

    fn u64(&mut self) -> u64 {
        let (head, rest) = self.buf.split_at(8);
        self.buf = rest;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(head);
        u64::from_le_bytes(raw)
    }
}

const TASK_HEADER_LEN: usize = 8 + 4 + 8 + 4 + 4;
const AREA_HEADER_LEN: usize = 8 + 8 + 1 + 8 + 8;
const RESULT_HEADER_LEN: usize = 8 + 8 + 1;
const UPDATE_DESC_LEN: usize = 8 + 8 + 8;

/// Sends a task and its captured area extents.
pub(crate) fn write_task(stream: &UnixStream, task: &PendingTask) -> io::Result<()> {
    let mut header = Vec::with_capacity(1 + TASK_HEADER_LEN + task.arg.len());

    header.push(MSG_TASK);
    put_u64(&mut header, task.taskid);
    put_u32(&mut header, task.flags.bits());
    put_u64(&mut header, task.entry.map(|f| f as usize as u64).unwrap_or(0));
    put_u32(&mut header, task.arg.len() as u32);
    put_u32(&mut header, task.areas.len() as u32);
    header.extend_from_slice(&task.arg);
    send_all(stream, &header)?;

    for area in &task.areas {
        let mut preamble = Vec::with_capacity(AREA_HEADER_LEN);

        put_u64(&mut preamble, area.base);
        put_u64(&mut preamble, area.length);
        preamble.push(area.mode);
        put_u64(&mut preamble, area.data_start);
        put_u64(&mut preamble, area.bytes.len() as u64);
        send_all(stream, &preamble)?;
        send_all(stream, &area.bytes)?;
    }

    Ok(())
}

/// Tells the dispatch loop to exit.
pub(crate) fn write_shutdown(stream: &UnixStream) -> io::Result<()> {
    send_all(stream, &[MSG_SHUTDOWN])
}

/// Reads the next host request.  For each snapshotted area, `prepare`
/// is handed the area header and returns the destination address for
/// the extent bytes, which are read directly into place.
pub(crate) fn read_request(
    stream: &UnixStream,
    prepare: &mut dyn FnMut(&AreaHeader) -> io::Result<*mut u8>,
) -> io::Result<Request> {
    let mut kind = [0u8; 1];
    recv_exact(stream, &mut kind)?;

    match kind[0] {
        MSG_SHUTDOWN => return Ok(Request::Shutdown),
        MSG_TASK => {}
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected message kind {}", other),
            ))
        }
    }

    let mut raw = [0u8; TASK_HEADER_LEN];
    recv_exact(stream, &mut raw)?;
    let mut cursor = Cursor::new(&raw);

    let taskid = cursor.u64();
    let flags = cursor.u32();
    let entry = cursor.u64();
    let arg_len = cursor.u32() as usize;
    let narea = cursor.u32() as usize;

    let mut arg = vec![0u8; arg_len];
    recv_exact(stream, &mut arg)?;

    for _ in 0..narea {
        let mut raw = [0u8; AREA_HEADER_LEN];
        recv_exact(stream, &mut raw)?;
        let mut cursor = Cursor::new(&raw);

        let header = AreaHeader {
            base: cursor.u64(),
            length: cursor.u64(),
            mode: cursor.u8(),
            data_start: cursor.u64(),
            extent_length: cursor.u64(),
        };

        let dest = prepare(&header)?;
        let extent =
            unsafe { std::slice::from_raw_parts_mut(dest, header.extent_length as usize) };
        recv_exact(stream, extent)?;
    }

    Ok(Request::Task(TaskMsg {
        taskid,
        flags,
        entry,
        arg,
    }))
}

/// Sends a task's result: the retval and, when present, the update
/// description followed by the raw bytes of its region.
pub(crate) fn write_result(
    stream: &UnixStream,
    taskid: u64,
    retval: u64,
    update: Option<&UpdateDesc>,
) -> io::Result<()> {
    let mut header = Vec::with_capacity(1 + RESULT_HEADER_LEN + UPDATE_DESC_LEN);

    header.push(MSG_RESULT);
    put_u64(&mut header, taskid);
    put_u64(&mut header, retval);
    header.push(update.is_some() as u8);

    if let Some(desc) = update {
        put_u64(&mut header, desc.data_start);
        put_u64(&mut header, desc.data_length);
        put_u64(&mut header, desc.list);
    }
    send_all(stream, &header)?;

    if let Some(desc) = update {
        let bytes = unsafe {
            std::slice::from_raw_parts(desc.data_start as *const u8, desc.data_length as usize)
        };
        send_all(stream, bytes)?;
    }

    Ok(())
}

/// Reads the next result message.  Update bytes are written straight
/// into the region the description names; the description must fall
/// inside `scratch` (the orbit's scratch area), which the host
/// committed when the orbit was created.
pub(crate) fn read_result(stream: &UnixStream, scratch: (usize, usize)) -> io::Result<ResultMsg> {
    let mut raw = [0u8; 1 + RESULT_HEADER_LEN];
    recv_exact(stream, &mut raw)?;
    let mut cursor = Cursor::new(&raw);

    let kind = cursor.u8();
    if kind != MSG_RESULT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected message kind {}", kind),
        ));
    }

    let taskid = cursor.u64();
    let retval = cursor.u64();
    let has_update = cursor.u8() != 0;

    let update = if has_update {
        let mut raw = [0u8; UPDATE_DESC_LEN];
        recv_exact(stream, &mut raw)?;
        let mut cursor = Cursor::new(&raw);

        let desc = UpdateDesc {
            data_start: cursor.u64(),
            data_length: cursor.u64(),
            list: cursor.u64(),
        };

        let (base, length) = scratch;
        let start = desc.data_start as usize;
        let len = desc.data_length as usize;
        if start < base || len > length || start + len > base + length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "update region outside the orbit's scratch area",
            ));
        }

        let region = unsafe { std::slice::from_raw_parts_mut(start as *mut u8, len) };
        recv_exact(stream, region)?;

        Some(desc)
    } else {
        None
    };

    Ok(ResultMsg {
        taskid,
        retval,
        update,
    })
}
