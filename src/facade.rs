//! The shared, process-global façade dispatching by [`Place`].
//!
//! Replaces the original's `boost::static_visitor`-based
//! `SharedAllocator` with a tagged enum (`Place`) and an exhaustive `match`.

use std::sync::{Arc, Mutex, OnceLock};

use crate::base::cpu::CpuAllocator;
use crate::base::gpu::GpuAllocator;
use crate::buddy::BuddyAllocator;
use crate::config::{resolve_gpu_system_chunk_size, ConfigSource, Parameters};
use crate::driver::DeviceDriver;
use crate::error::{self, Error};
use crate::place::Place;

struct FacadeState {
    cpu: BuddyAllocator<CpuAllocator>,
    devices: Vec<BuddyAllocator<GpuAllocator>>,
}

static FACADE: OnceLock<Mutex<Option<FacadeState>>> = OnceLock::new();

fn facade() -> &'static Mutex<Option<FacadeState>> {
    FACADE.get_or_init(|| Mutex::new(None))
}

/// Constructs the per-place buddy allocators from resolved parameters.
/// Called once by `lifecycle::init`; fatal if already initialized.
pub fn init(source: &dyn ConfigSource, driver: Arc<dyn DeviceDriver>) {
    let mut guard = facade().lock().unwrap_or_else(|e| e.into_inner());
    if guard.is_some() {
        error::fatal(Error::invariant("facade already initialized"));
    }

    let device_count = driver.device_count();
    let mut devices = Vec::with_capacity(device_count as usize);
    for device in 0..device_count {
        driver.set_device(device);
        let params = Parameters::resolve(source, &*driver);
        let base = GpuAllocator::new(
            driver.clone(),
            device,
            params.gpu_maximum_allocation_size,
            params.system_maximum_allocation_size,
        );
        let probe_driver = driver.clone();
        let probe_fraction = params.gpu_fraction;
        let probe_arena_chunk_size = params.arena_chunk_size;
        let capacity_probe: Box<dyn Fn() -> usize + Send + Sync> = Box::new(move || {
            let (available, total) = probe_driver.get_memory_usage();
            resolve_gpu_system_chunk_size(available, total, probe_arena_chunk_size, probe_fraction)
        });
        devices.push(BuddyAllocator::new(
            base,
            driver.clone(),
            params.arena_chunk_size,
            params.gpu_system_chunk_size,
            params.should_initialize_allocations,
            Some(capacity_probe),
        ));
    }

    let cpu_params = Parameters::resolve(source, &*driver);
    let cpu_base = CpuAllocator::new(driver.clone(), cpu_params.use_pinned_host_allocator);
    let cpu = BuddyAllocator::new(
        cpu_base,
        driver,
        cpu_params.arena_chunk_size,
        cpu_params.cpu_system_chunk_size,
        cpu_params.should_initialize_allocations,
        None,
    );

    *guard = Some(FacadeState { cpu, devices });
}

/// Tears down every per-place buddy allocator. Fatal if not initialized.
pub fn shutdown() {
    let mut guard = facade().lock().unwrap_or_else(|e| e.into_inner());
    if guard.take().is_none() {
        error::fatal(Error::invariant("shutdown called before init"));
    }
}

pub fn malloc(place: Place, size: usize) -> Option<usize> {
    with_state(|state| match place {
        Place::HostCpu => state.cpu.malloc(size),
        Place::Device(id) => match state.devices.get(id as usize) {
            Some(buddy) => buddy.malloc(size),
            None => error::fatal(Error::NoAllocatorForDevice(id)),
        },
    })
}

pub fn free(place: Place, address: usize) {
    with_state(|state| {
        match place {
            Place::HostCpu => state.cpu.free(address),
            Place::Device(id) => match state.devices.get(id as usize) {
                Some(buddy) => buddy.free(address),
                None => error::fatal(Error::NoAllocatorForDevice(id)),
            },
        }
        Some(())
    });
}

/// Only the buddy's `total_used` — huge-chunk bytes are never tracked here
/// (see DESIGN.md's note on this).
pub fn memory_used(place: Place) -> usize {
    with_state(|state| {
        Some(match place {
            Place::HostCpu => state.cpu.memory_used(),
            Place::Device(id) => match state.devices.get(id as usize) {
                Some(buddy) => buddy.memory_used(),
                None => error::fatal(Error::NoAllocatorForDevice(id)),
            },
        })
    })
    .unwrap_or(0)
}

fn with_state<T>(f: impl FnOnce(&FacadeState) -> Option<T>) -> Option<T> {
    let guard = facade().lock().unwrap_or_else(|e| e.into_inner());
    match guard.as_ref() {
        Some(state) => f(state),
        None => error::fatal(Error::invariant("facade used before init")),
    }
}
