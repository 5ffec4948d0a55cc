//! Asynchronous calls and the update log: modify records applied to
//! host memory, opaque data records yielded to the caller, and
//! deferred operations invoked at apply time.
use std::ffi::c_void;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use orbit::register_operation;
use orbit::AllocatorMethod;
use orbit::Area;
use orbit::AreaConfig;
use orbit::Error;
use orbit::OpToken;
use orbit::Orbit;
use orbit::OrbitConfig;
use orbit::Pulled;
use orbit::RecordKind;
use orbit::TaskFlags;
use orbit::TaskOutput;
use orbit::UpdateBuffer;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn as_bytes<T>(value: &T) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    }
}

// Push a Modify that will set the host object to its successor, and
// return 0.
fn modify_entry(_store: *mut c_void, argbuf: *mut c_void) -> TaskOutput {
    let obj = unsafe { *(argbuf as *const *mut u64) };

    let mut update = match UpdateBuffer::create() {
        Ok(update) => update,
        Err(_) => return TaskOutput::new(u64::MAX),
    };

    unsafe { *obj += 1 };
    if update.add_modify(obj as *mut c_void, 8).is_err() {
        return TaskOutput::new(u64::MAX);
    }

    TaskOutput::with_update(0, update)
}

#[test]
fn modify_record_applies_on_pull() {
    init_logging();

    let ob = Orbit::new(OrbitConfig::new("async_modify", modify_entry)).expect("orbit should spawn");

    let area = Area::new(AreaConfig::with_method(
        4096,
        AllocatorMethod::Linear { use_meta: false },
    ))
    .expect("area should build");

    let obj = area.alloc(8).expect("alloc should succeed").as_ptr() as *mut u64;
    unsafe { obj.write(200) };

    let future = ob
        .call_async(TaskFlags::empty(), &[&area], None, as_bytes(&obj))
        .expect("call_async should succeed");

    // Nothing applied until the host pulls and applies.
    let mut update = match future.pull().expect("pull should succeed") {
        Pulled::Update(update) => update,
        Pulled::Done(_) => panic!("expected an update first"),
    };
    assert_eq!(unsafe { obj.read() }, 200);

    assert_eq!(update.apply(false), RecordKind::End);
    assert_eq!(unsafe { obj.read() }, 201);

    match future.pull().expect("pull should succeed") {
        Pulled::Done(retval) => assert_eq!(retval, 0),
        Pulled::Update(_) => panic!("expected the retval"),
    }

    // End of stream: the task is reaped.
    assert!(matches!(future.pull(), Err(Error::NotFound)));

    ob.destroy().expect("destroy should succeed");
}

#[repr(C)]
struct SumArgs {
    size: usize,
    data: [u32; 128],
}

// Sum the argument data and publish the result as an Any record.
fn sum_entry(_store: *mut c_void, argbuf: *mut c_void) -> TaskOutput {
    let args = unsafe { &*(argbuf as *const SumArgs) };

    let mut sum = 0u64;
    for i in 0..args.size {
        sum += args.data[i] as u64;
    }

    let mut update = match UpdateBuffer::create() {
        Ok(update) => update,
        Err(_) => return TaskOutput::new(u64::MAX),
    };
    if update
        .add_data(&sum as *const u64 as *const c_void, 8)
        .is_err()
    {
        return TaskOutput::new(u64::MAX);
    }

    TaskOutput::with_update(0, update)
}

#[test]
fn any_record_is_yielded() {
    init_logging();

    let ob = Orbit::new(OrbitConfig::new("async_any", sum_entry)).expect("orbit should spawn");

    let mut args = SumArgs {
        size: 100,
        data: [0; 128],
    };
    let mut expected = 0u64;
    for i in 0..args.size {
        let value = (i * (i + 1) * 7) as u32;
        args.data[i] = value;
        expected += value as u64;
    }

    let future = ob
        .call_async(TaskFlags::empty(), &[], None, as_bytes(&args))
        .expect("call_async should succeed");

    let mut update = match future.pull().expect("pull should succeed") {
        Pulled::Update(update) => update,
        Pulled::Done(_) => panic!("expected an update first"),
    };

    assert_eq!(update.apply(true), RecordKind::Any);
    let record = update.first().expect("record should exist");
    assert_eq!(record.kind(), RecordKind::Any);
    assert_eq!(record.payload_len(), 8);

    let mut raw = [0u8; 8];
    raw.copy_from_slice(record.payload());
    assert_eq!(u64::from_ne_bytes(raw), expected);

    assert_eq!(update.skip(false), RecordKind::End);
    assert!(update.is_empty());

    match future.pull().expect("pull should succeed") {
        Pulled::Done(retval) => assert_eq!(retval, 0),
        Pulled::Update(_) => panic!("expected the retval"),
    }

    ob.destroy().expect("destroy should succeed");
}

static OPERATION_VALUE: AtomicU64 = AtomicU64::new(0);

fn record_value(arg: *mut c_void, len: usize) -> u64 {
    assert_eq!(len, 8);
    let value = unsafe { (arg as *const u64).read_unaligned() };

    OPERATION_VALUE.store(value, Ordering::SeqCst);
    value
}

// The token travels in the argument blob; the operation itself is
// resolved host-side at apply time.
fn operation_entry(_store: *mut c_void, argbuf: *mut c_void) -> TaskOutput {
    let token = unsafe { *(argbuf as *const OpToken) };

    let mut update = match UpdateBuffer::create() {
        Ok(update) => update,
        Err(_) => return TaskOutput::new(u64::MAX),
    };

    let value: u64 = 777;
    if update
        .add_operation(token, &value as *const u64 as *const c_void, 8)
        .is_err()
    {
        return TaskOutput::new(u64::MAX);
    }

    TaskOutput::with_update(1, update)
}

#[test]
fn operation_record_invokes_on_apply() {
    init_logging();

    // Register before the fork so the orbit shares the table.
    let token = register_operation(record_value);

    let ob =
        Orbit::new(OrbitConfig::new("async_op", operation_entry)).expect("orbit should spawn");

    let future = ob
        .call_async(TaskFlags::empty(), &[], None, as_bytes(&token))
        .expect("call_async should succeed");

    let mut update = match future.pull().expect("pull should succeed") {
        Pulled::Update(update) => update,
        Pulled::Done(_) => panic!("expected an update first"),
    };

    assert_eq!(update.apply(false), RecordKind::End);
    assert_eq!(OPERATION_VALUE.load(Ordering::SeqCst), 777);

    match future.pull().expect("pull should succeed") {
        Pulled::Done(retval) => assert_eq!(retval, 1),
        Pulled::Update(_) => panic!("expected the retval"),
    }

    ob.destroy().expect("destroy should succeed");
}

// Several async tasks in a row: update logs arrive in enqueue order
// and each lands in its own scratch region.
#[test]
fn updates_arrive_in_fifo_order() {
    init_logging();

    let ob = Orbit::new(OrbitConfig::new("async_fifo", modify_entry)).expect("orbit should spawn");

    let area = Area::new(AreaConfig::with_method(
        4096,
        AllocatorMethod::Linear { use_meta: false },
    ))
    .expect("area should build");

    let mut objs = Vec::new();
    let mut futures = Vec::new();
    for i in 0..4u64 {
        let obj = area.alloc(8).expect("alloc should succeed").as_ptr() as *mut u64;
        unsafe { obj.write(100 * i) };
        objs.push(obj);

        futures.push(
            ob.call_async(TaskFlags::empty(), &[&area], None, as_bytes(&obj))
                .expect("call_async should succeed"),
        );
    }

    for (i, future) in futures.iter().enumerate() {
        let mut update = match future.pull().expect("pull should succeed") {
            Pulled::Update(update) => update,
            Pulled::Done(_) => panic!("expected an update first"),
        };
        assert_eq!(update.apply(false), RecordKind::End);
        assert_eq!(unsafe { objs[i].read() }, 100 * i as u64 + 1);

        match future.pull().expect("pull should succeed") {
            Pulled::Done(retval) => assert_eq!(retval, 0),
            Pulled::Update(_) => panic!("expected the retval"),
        }
    }

    ob.destroy().expect("destroy should succeed");
}
