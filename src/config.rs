//! Configuration façade and resolved tunables.
//!
//! Replaces the original `support::get_knob_value` knob system with a small
//! trait any key-value source can implement. The names chosen for
//! [`EnvConfigSource`]'s environment variables are this crate's own
//! convention — spec left them unspecified on purpose.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::driver::DeviceDriver;
use crate::util::total_physical_memory;

/// Process-global switch gating the device buddy's native allocation source.
///
/// Reads and writes are independently [`Ordering::Relaxed`] — callers are
/// expected to set this before concurrent allocation traffic begins, not to
/// toggle it as a synchronization primitive.
static ALLOW_GPU_MEMORY_USE: AtomicBool = AtomicBool::new(true);

/// Sets whether the device buddy's native allocation source is permitted to
/// allocate at all.
pub fn set_allow_gpu_memory_use(allow: bool) {
    ALLOW_GPU_MEMORY_USE.store(allow, Ordering::Relaxed);
}

/// Whether the device buddy's native allocation source is currently permitted.
pub fn is_gpu_memory_use_allowed() -> bool {
    ALLOW_GPU_MEMORY_USE.load(Ordering::Relaxed)
}

/// A source of named configuration values, with caller-supplied defaults.
pub trait ConfigSource {
    fn get_usize(&self, name: &str, default: usize) -> usize;
    fn get_f64(&self, name: &str, default: f64) -> f64;
    fn get_bool(&self, name: &str, default: bool) -> bool;
}

/// Reads `ACCEL_ALLOC_<NAME>` environment variables, falling back to the
/// caller's default on absence or parse failure.
pub struct EnvConfigSource;

impl EnvConfigSource {
    fn var_name(name: &str) -> String {
        format!("ACCEL_ALLOC_{}", name.to_uppercase().replace(' ', "_"))
    }

    fn read(name: &str) -> Option<String> {
        std::env::var(Self::var_name(name)).ok()
    }
}

impl ConfigSource for EnvConfigSource {
    fn get_usize(&self, name: &str, default: usize) -> usize {
        Self::read(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn get_f64(&self, name: &str, default: f64) -> f64 {
        Self::read(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn get_bool(&self, name: &str, default: bool) -> bool {
        Self::read(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }
}

/// An in-memory override map, for tests that need deterministic
/// [`Parameters`] without mutating process environment.
#[derive(Default)]
pub struct MapConfigSource {
    usize_values: HashMap<String, usize>,
    f64_values: HashMap<String, f64>,
    bool_values: HashMap<String, bool>,
}

impl MapConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_usize(mut self, name: &str, value: usize) -> Self {
        self.usize_values.insert(name.to_string(), value);
        self
    }

    pub fn with_f64(mut self, name: &str, value: f64) -> Self {
        self.f64_values.insert(name.to_string(), value);
        self
    }

    pub fn with_bool(mut self, name: &str, value: bool) -> Self {
        self.bool_values.insert(name.to_string(), value);
        self
    }
}

impl ConfigSource for MapConfigSource {
    fn get_usize(&self, name: &str, default: usize) -> usize {
        self.usize_values.get(name).copied().unwrap_or(default)
    }

    fn get_f64(&self, name: &str, default: f64) -> f64 {
        self.f64_values.get(name).copied().unwrap_or(default)
    }

    fn get_bool(&self, name: &str, default: bool) -> bool {
        self.bool_values.get(name).copied().unwrap_or(default)
    }
}

/// Resolved tunables, computed once at init time from a [`ConfigSource`] and
/// a [`DeviceDriver`]'s reported device capacity.
#[derive(Clone, Debug)]
pub struct Parameters {
    pub arena_chunk_size: usize,
    pub cpu_system_chunk_size: usize,
    pub gpu_fraction: f64,
    pub gpu_system_chunk_size: usize,
    pub gpu_maximum_allocation_size: usize,
    pub system_maximum_allocation_size: usize,
    pub should_initialize_allocations: bool,
    pub use_pinned_host_allocator: bool,
}

/// Mirrors `parameters.cc`'s two-step clamp: reserve `arena_chunk_size` out
/// of whatever is currently available, then reserve the `(1 - gpu_fraction)`
/// buffer out of total, and take whichever leaves less headroom. Shared by
/// [`Parameters::resolve`] and `facade`'s live capacity probe so a refill can
/// recompute this from a fresh `(available, total)` reading, not just at
/// init time.
pub fn resolve_gpu_system_chunk_size(available: usize, total: usize, arena_chunk_size: usize, gpu_fraction: f64) -> usize {
    let buffer = ((1.0 - gpu_fraction) * total as f64) as usize;
    let available_after_arena = available.max(arena_chunk_size) - arena_chunk_size;
    available_after_arena.max(buffer) - buffer
}

impl Parameters {
    /// Resolves every tunable in the configuration table against `source`,
    /// using `driver`'s current-device memory usage for the device-capacity
    /// derived defaults.
    pub fn resolve(source: &dyn ConfigSource, driver: &dyn DeviceDriver) -> Self {
        let arena_chunk_size = source.get_usize("arena_chunk_size", 256);
        let cpu_system_chunk_size =
            source.get_usize("cpu_system_chunk_size", total_physical_memory() / 32);
        let gpu_fraction = source.get_f64("gpu_fraction", 0.95);

        let (available, total) = if driver.device_count() > 0 {
            driver.get_memory_usage()
        } else {
            (0, 0)
        };
        let gpu_maximum_allocation_size =
            source.get_usize("gpu_maximum_allocation_size", (total as f64 * gpu_fraction) as usize);

        let usable = resolve_gpu_system_chunk_size(available, total, arena_chunk_size, gpu_fraction);
        let gpu_system_chunk_size = source.get_usize("gpu_system_chunk_size", usable);
        let system_maximum_allocation_size = source.get_usize(
            "system_maximum_allocation_size",
            2 * gpu_maximum_allocation_size,
        );
        let should_initialize_allocations =
            source.get_bool("should_initialize_allocations", false);
        let use_pinned_host_allocator = source.get_bool("use_pinned_host_allocator", false);

        Parameters {
            arena_chunk_size,
            cpu_system_chunk_size,
            gpu_fraction,
            gpu_system_chunk_size,
            gpu_maximum_allocation_size,
            system_maximum_allocation_size,
            should_initialize_allocations,
            use_pinned_host_allocator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use serial_test::serial;

    #[test]
    fn map_source_falls_back_to_defaults() {
        let source = MapConfigSource::new().with_usize("arena_chunk_size", 512);
        assert_eq!(source.get_usize("arena_chunk_size", 256), 512);
        assert_eq!(source.get_usize("unset", 256), 256);
        assert_eq!(source.get_f64("unset_f64", 0.5), 0.5);
        assert_eq!(source.get_bool("unset_bool", true), true);
    }

    #[test]
    fn resolve_derives_from_device_capacity() {
        let driver = MockDriver::single(1_000_000);
        let source = MapConfigSource::new();
        let params = Parameters::resolve(&source, &driver);
        assert_eq!(params.gpu_maximum_allocation_size, 950_000);
        assert_eq!(params.gpu_system_chunk_size, 949_744);
        assert_eq!(
            params.system_maximum_allocation_size,
            2 * params.gpu_maximum_allocation_size
        );
    }

    #[test]
    #[serial]
    fn allow_gpu_memory_use_defaults_true() {
        set_allow_gpu_memory_use(true);
        assert!(is_gpu_memory_use_allowed());
        set_allow_gpu_memory_use(false);
        assert!(!is_gpu_memory_use_allowed());
        set_allow_gpu_memory_use(true);
    }
}
