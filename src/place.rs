//! The memory domain an allocation lives in.

use std::fmt;

/// Where a buffer lives: the host CPU, or a specific device accelerator.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Place {
    /// Host (CPU) memory.
    HostCpu,
    /// Device memory for the accelerator at this index.
    Device(u32),
}

impl Place {
    /// The device index, if this is a device place.
    pub fn device_id(&self) -> Option<u32> {
        match self {
            Place::HostCpu => None,
            Place::Device(id) => Some(*id),
        }
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Place::HostCpu => write!(f, "host"),
            Place::Device(id) => write!(f, "device[{id}]"),
        }
    }
}
