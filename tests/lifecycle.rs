//! End-to-end tests against the public API and lifecycle, matching the
//! concrete scenarios and quantified properties this crate's design is
//! grounded on. Every test is `#[serial]` because `init`/`shutdown` and the
//! `allow_gpu_memory_use` flag are process-global state.

use std::sync::Arc;

use accel_alloc::driver::mock::MockDriver;
use accel_alloc::driver::DeviceDriver;
use accel_alloc::{free, lifecycle, malloc, memory_used, Place};
use serial_test::serial;

fn init_host_only() {
    let driver: Arc<dyn DeviceDriver> = Arc::new(MockDriver::new(Vec::new()));
    lifecycle::init_with_driver(driver);
}

fn init_with_one_device(capacity: usize) {
    let driver: Arc<dyn DeviceDriver> = Arc::new(MockDriver::new(vec![capacity]));
    lifecycle::init_with_driver(driver);
}

#[test]
#[serial]
fn scenario_1_single_alloc_free() {
    init_host_only();
    let p = malloc(Place::HostCpu, 100).expect("allocation failed");
    assert!(!p.is_null());
    free(Place::HostCpu, p);
    assert_eq!(memory_used(Place::HostCpu), 0);
    lifecycle::shutdown();
}

#[test]
#[serial]
fn p5_malloc_free_pair_is_memory_neutral() {
    init_host_only();
    let before = memory_used(Place::HostCpu);
    let p = malloc(Place::HostCpu, 4096).unwrap();
    free(Place::HostCpu, p);
    assert_eq!(memory_used(Place::HostCpu), before);
    lifecycle::shutdown();
}

#[test]
#[serial]
fn p6_reinit_after_shutdown_matches_fresh_state() {
    init_host_only();
    let p = malloc(Place::HostCpu, 512).unwrap();
    free(Place::HostCpu, p);
    let used_after_first_session = memory_used(Place::HostCpu);
    lifecycle::shutdown();

    init_host_only();
    assert_eq!(memory_used(Place::HostCpu), used_after_first_session);
    lifecycle::shutdown();
}

#[test]
#[serial]
fn p7_round_trip_zero_after_every_pair() {
    init_host_only();
    assert_eq!(memory_used(Place::HostCpu), 0);
    for size in [32, 1024, 8192] {
        let p = malloc(Place::HostCpu, size).unwrap();
        assert_ne!(memory_used(Place::HostCpu), 0);
        free(Place::HostCpu, p);
        assert_eq!(memory_used(Place::HostCpu), 0);
    }
    lifecycle::shutdown();
}

#[test]
#[serial]
fn device_place_round_trips_through_facade() {
    init_with_one_device(64 * 1024 * 1024);
    let p = malloc(Place::Device(0), 256).expect("device allocation failed");
    assert!(!p.is_null());
    free(Place::Device(0), p);
    assert_eq!(memory_used(Place::Device(0)), 0);
    lifecycle::shutdown();
}

// The following three tests exercise fatal paths. `error::fatal` panics
// rather than aborting the process (see `error.rs`), so each test catches
// the unwind and restores lifecycle state itself rather than relying on
// `#[should_panic]`, which would leave `INITIALIZED` dirty for whatever
// test runs next in this binary.

#[test]
#[serial]
fn out_of_range_device_is_fatal() {
    init_host_only();
    let result = std::panic::catch_unwind(|| malloc(Place::Device(0), 16));
    assert!(result.is_err());
    lifecycle::shutdown();
}

#[test]
#[serial]
fn double_init_is_fatal() {
    init_host_only();
    let result = std::panic::catch_unwind(init_host_only);
    assert!(result.is_err());
    lifecycle::shutdown();
}

#[test]
#[serial]
fn shutdown_without_init_is_fatal() {
    let result = std::panic::catch_unwind(lifecycle::shutdown);
    assert!(result.is_err());
}
