//! GPU driver surface: topology enumeration, per-device sampling and
//! device reset.
//!
//! Everything above this module speaks in terms of [`TopologySnapshot`]
//! and [`DeviceSample`]; whether those come from the NVIDIA library or
//! from a textual topology matrix is decided once at startup.

pub mod dummy;
pub mod nvidia;

use thiserror::Error;

pub use dummy::DummyDriver;
pub use nvidia::NvidiaDriver;

use crate::topology::DeviceMeta;
use crate::topology::TopologyLevel;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("nvml: {0}")]
    Nvml(#[from] nvml_wrapper::error::NvmlError),
    #[error("invalid topology input: {0}")]
    Parse(String),
    #[error("no such device index {0}")]
    UnknownDevice(usize),
}

/// Static facts about one physical GPU.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub minor_id: u32,
    pub uuid: String,
    pub bus_id: String,
    pub total_memory: u64,
}

/// Everything the tree needs to build itself.
#[derive(Debug, Clone)]
pub struct TopologySnapshot {
    pub devices: Vec<DeviceInfo>,
    /// symmetric pairwise topology levels, diagonal is `Internal`
    pub levels: Vec<Vec<TopologyLevel>>,
    pub driver_version: (i32, i32),
}

/// Observed usage on one device.
#[derive(Debug, Clone, Default)]
pub struct DeviceSample {
    pub pids: Vec<u32>,
    pub used_memory: u64,
    /// hundredths of a core busy
    pub utilization: u32,
}

/// The device backend. An exhaustive enum rather than a registry: there
/// are exactly two ways this agent talks to GPUs.
#[derive(Debug)]
pub enum Driver {
    Nvidia(NvidiaDriver),
    Dummy(DummyDriver),
}

impl Driver {
    pub fn snapshot(&self) -> Result<TopologySnapshot, DriverError> {
        match self {
            Driver::Nvidia(drv) => drv.snapshot(),
            Driver::Dummy(drv) => Ok(drv.snapshot()),
        }
    }

    pub fn sample(&self, index: usize) -> Result<DeviceSample, DriverError> {
        match self {
            Driver::Nvidia(drv) => drv.sample(index),
            Driver::Dummy(drv) => drv.sample(index),
        }
    }

    /// Clear user-visible device settings after the last slice on a card
    /// is released. The dummy backend has nothing to reset.
    pub fn reset(&self, meta: &DeviceMeta) -> Result<(), DriverError> {
        match self {
            Driver::Nvidia(drv) => drv.reset(meta),
            Driver::Dummy(_) => Ok(()),
        }
    }

    pub fn version(&self) -> (i32, i32) {
        match self {
            Driver::Nvidia(drv) => drv.version(),
            Driver::Dummy(drv) => drv.version(),
        }
    }
}
