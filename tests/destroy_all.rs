//! `destroy_all` reclaims every live orbit.  Kept in its own binary:
//! it would tear down orbits belonging to concurrently running tests.
use std::ffi::c_void;

use orbit::destroy_all;
use orbit::Orbit;
use orbit::OrbitConfig;
use orbit::TaskOutput;

fn trivial_entry(_store: *mut c_void, _argbuf: *mut c_void) -> TaskOutput {
    TaskOutput::new(1)
}

#[test]
fn destroy_all_reclaims_every_orbit() {
    let _ = env_logger::builder().is_test(true).try_init();

    let orbits: Vec<Orbit> = (0..10)
        .map(|i| {
            Orbit::new(OrbitConfig::new(&format!("fleet-{}", i), trivial_entry))
                .expect("orbit should spawn")
        })
        .collect();

    for ob in &orbits {
        assert!(ob.exists());
        assert_eq!(ob.call(&[], None, &[]).expect("call should succeed"), 1);
    }

    destroy_all().expect("destroy_all should succeed");

    for ob in &orbits {
        assert!(ob.gone());
    }
}
