//! Snapshot isolation on the synchronous call path: the checker's
//! writes stay in the orbit, and each call observes the area as of
//! its own enqueue.
use std::ffi::c_void;

use orbit::AllocatorMethod;
use orbit::Area;
use orbit::AreaConfig;
use orbit::Orbit;
use orbit::OrbitConfig;
use orbit::SnapshotMode;
use orbit::TaskOutput;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn as_bytes<T>(value: &T) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    }
}

// Increment the object in the orbit's snapshot and return the new
// value.
fn increment_entry(_store: *mut c_void, argbuf: *mut c_void) -> TaskOutput {
    let obj = unsafe { *(argbuf as *const *mut u64) };

    unsafe {
        *obj += 1;
        TaskOutput::new(*obj)
    }
}

#[test]
fn checker_writes_stay_in_orbit() {
    init_logging();

    let ob =
        Orbit::new(OrbitConfig::new("sync_modify", increment_entry)).expect("orbit should spawn");

    let area = Area::new(AreaConfig::with_method(
        4096,
        AllocatorMethod::Linear { use_meta: false },
    ))
    .expect("area should build");

    let obj = area.alloc(8).expect("alloc should succeed").as_ptr() as *mut u64;
    unsafe { obj.write(200) };

    let ret = ob
        .call(&[&area], None, as_bytes(&obj))
        .expect("call should succeed");

    assert_eq!(ret, 201);
    // The orbit's increment is invisible to the host.
    assert_eq!(unsafe { obj.read() }, 200);

    ob.destroy().expect("destroy should succeed");
}

// Each call snapshots anew: host writes between calls are observed,
// host writes after an enqueue are not.
#[test]
fn snapshot_refreshes_between_calls() {
    init_logging();

    let ob =
        Orbit::new(OrbitConfig::new("refresh", increment_entry)).expect("orbit should spawn");

    let area = Area::new(AreaConfig::with_method(
        4096,
        AllocatorMethod::Linear { use_meta: false },
    ))
    .expect("area should build");

    let obj = area.alloc(8).expect("alloc should succeed").as_ptr() as *mut u64;

    unsafe { obj.write(10) };
    let ret = ob
        .call(&[&area], None, as_bytes(&obj))
        .expect("call should succeed");
    assert_eq!(ret, 11);

    unsafe { obj.write(500) };
    let ret = ob
        .call(&[&area], None, as_bytes(&obj))
        .expect("call should succeed");
    assert_eq!(ret, 501);

    ob.destroy().expect("destroy should succeed");
}

// Move mode: the orbit observes the data, the host loses it.
#[test]
fn move_mode_consumes_host_pages() {
    init_logging();

    let ob = Orbit::new(OrbitConfig::new("move_mode", increment_entry)).expect("orbit should spawn");

    let config = AreaConfig {
        size: 4096,
        mode: SnapshotMode::Move,
        method: Some(AllocatorMethod::Linear { use_meta: false }),
        mapper_name: None,
    };
    let area = Area::new(config).expect("area should build");

    let obj = area.alloc(8).expect("alloc should succeed").as_ptr() as *mut u64;
    unsafe { obj.write(70) };

    let ret = ob
        .call(&[&area], None, as_bytes(&obj))
        .expect("call should succeed");
    assert_eq!(ret, 71);

    // Anonymous backing reads back as zeros once moved out.
    assert_eq!(unsafe { obj.read() }, 0);

    ob.destroy().expect("destroy should succeed");
}

// Copy mode behaves like CoW from the host's point of view.
#[test]
fn copy_mode_preserves_host_pages() {
    init_logging();

    let ob = Orbit::new(OrbitConfig::new("copy_mode", increment_entry)).expect("orbit should spawn");

    let config = AreaConfig {
        size: 4096,
        mode: SnapshotMode::Copy,
        method: Some(AllocatorMethod::Linear { use_meta: false }),
        mapper_name: None,
    };
    let area = Area::new(config).expect("area should build");

    let obj = area.alloc(8).expect("alloc should succeed").as_ptr() as *mut u64;
    unsafe { obj.write(41) };

    let ret = ob
        .call(&[&area], None, as_bytes(&obj))
        .expect("call should succeed");
    assert_eq!(ret, 42);
    assert_eq!(unsafe { obj.read() }, 41);

    ob.destroy().expect("destroy should succeed");
}
