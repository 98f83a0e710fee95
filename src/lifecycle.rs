//! Process-global startup and teardown.
//!
//! Mirrors `original_source/majel/malloc/malloc.cc`'s `init()`/`shutdown()`:
//! base/driver state comes up before the shared façade, and tears down in
//! the same order in reverse (the façade has nothing of its own to release
//! beyond the buddies it owns, which `facade::shutdown` drops).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::EnvConfigSource;
use crate::driver::DeviceDriver;
use crate::error::{self, Error};
use crate::facade;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Brings up the allocator for this process. Fatal if called twice without
/// an intervening [`shutdown`].
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        error::fatal(Error::invariant("init called while already initialized"));
    }
    log::debug!("accel_alloc: initializing");
    let driver = default_driver();
    facade::init(&EnvConfigSource, driver);
}

/// Initializes against an explicitly supplied driver, bypassing the
/// feature-gated default selection in [`default_driver`]. Used by
/// integration tests that need a [`MockDriver`] with specific device
/// capacities even when the `cuda` feature is enabled.
pub fn init_with_driver(driver: Arc<dyn DeviceDriver>) {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        error::fatal(Error::invariant("init called while already initialized"));
    }
    log::debug!("accel_alloc: initializing with injected driver");
    facade::init(&EnvConfigSource, driver);
}

/// Tears down the allocator. Fatal if [`init`] was never called.
pub fn shutdown() {
    if !INITIALIZED.swap(false, Ordering::SeqCst) {
        error::fatal(Error::invariant("shutdown called before init"));
    }
    log::debug!("accel_alloc: shutting down");
    facade::shutdown();
}

#[cfg(feature = "cuda")]
fn default_driver() -> Arc<dyn DeviceDriver> {
    Arc::new(crate::driver::cuda::CudaDriver::new())
}

#[cfg(not(feature = "cuda"))]
fn default_driver() -> Arc<dyn DeviceDriver> {
    Arc::new(crate::driver::mock::MockDriver::new(Vec::new()))
}
