//! NVIDIA backend over the management library.

use nvml_wrapper::enum_wrappers::device::ComputeMode;
use nvml_wrapper::enum_wrappers::device::EccCounter;
use nvml_wrapper::enum_wrappers::device::TopologyLevel as NvmlTopologyLevel;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use tracing::debug;
use tracing::info;

use crate::driver::DeviceInfo;
use crate::driver::DeviceSample;
use crate::driver::DriverError;
use crate::driver::TopologySnapshot;
use crate::topology::DeviceMeta;
use crate::topology::TopologyLevel;

pub struct NvidiaDriver {
    nvml: Nvml,
    device_count: u32,
    driver_version: (i32, i32),
}

impl std::fmt::Debug for NvidiaDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvidiaDriver")
            .field("device_count", &self.device_count)
            .field("driver_version", &self.driver_version)
            .finish()
    }
}

impl NvidiaDriver {
    pub fn init() -> Result<Self, DriverError> {
        let nvml = Nvml::init()?;
        let device_count = nvml.device_count()?;
        let driver_version = parse_driver_version(&nvml.sys_driver_version()?);
        info!(
            devices = device_count,
            major = driver_version.0,
            minor = driver_version.1,
            "nvidia driver initialized"
        );
        Ok(Self {
            nvml,
            device_count,
            driver_version,
        })
    }

    pub fn snapshot(&self) -> Result<TopologySnapshot, DriverError> {
        let count = self.device_count as usize;
        let mut devices = Vec::with_capacity(count);
        for i in 0..count {
            let dev = self.nvml.device_by_index(i as u32)?;
            devices.push(DeviceInfo {
                minor_id: dev.minor_number()?,
                uuid: dev.uuid()?,
                bus_id: dev.pci_info()?.bus_id,
                total_memory: dev.memory_info()?.total,
            });
        }

        let mut levels = vec![vec![TopologyLevel::Internal; count]; count];
        for a in 0..count {
            let dev_a = self.nvml.device_by_index(a as u32)?;
            for b in (a + 1)..count {
                let dev_b = self.nvml.device_by_index(b as u32)?;
                let mut level = map_level(dev_a.topology_common_ancestor(dev_b)?);
                // boards with several dies report Internal, treat them as
                // sitting behind one switch
                if level == TopologyLevel::Internal && dev_a.is_multi_gpu_board()? {
                    level = TopologyLevel::Single;
                }
                levels[a][b] = level;
                levels[b][a] = level;
            }
        }

        Ok(TopologySnapshot {
            devices,
            levels,
            driver_version: self.driver_version,
        })
    }

    pub fn sample(&self, index: usize) -> Result<DeviceSample, DriverError> {
        if index >= self.device_count as usize {
            return Err(DriverError::UnknownDevice(index));
        }
        let dev = self.nvml.device_by_index(index as u32)?;

        let mut sample = DeviceSample {
            utilization: dev.utilization_rates()?.gpu,
            ..DeviceSample::default()
        };
        for proc_info in dev.running_compute_processes()? {
            sample.pids.push(proc_info.pid);
            if let UsedGpuMemory::Used(bytes) = proc_info.used_gpu_memory {
                sample.used_memory += bytes;
            }
        }
        Ok(sample)
    }

    /// Put a fully freed card back into its default state: default compute
    /// mode, ECC counters cleared when ECC is on.
    pub fn reset(&self, meta: &DeviceMeta) -> Result<(), DriverError> {
        // synthetic leaves (text topology) carry no bus id and have
        // nothing to reset
        if meta.bus_id.is_empty() {
            return Ok(());
        }

        let mut dev = self.nvml.device_by_index(meta.id as u32)?;
        dev.set_compute_mode(ComputeMode::Default)?;

        match dev.is_ecc_enabled() {
            Ok(ecc) if ecc.currently_enabled => {
                dev.clear_ecc_error_counts(EccCounter::Volatile)?;
                dev.clear_ecc_error_counts(EccCounter::Aggregate)?;
            }
            Ok(_) => {}
            // cards without ECC report NotSupported, nothing to clear
            Err(NvmlError::NotSupported) => {
                debug!(bus_id = %meta.bus_id, "ecc not supported, skipping counter clear");
            }
            Err(err) => return Err(err.into()),
        }

        Ok(())
    }

    pub fn version(&self) -> (i32, i32) {
        self.driver_version
    }
}

fn map_level(level: NvmlTopologyLevel) -> TopologyLevel {
    match level {
        NvmlTopologyLevel::Internal => TopologyLevel::Internal,
        NvmlTopologyLevel::Single => TopologyLevel::Single,
        NvmlTopologyLevel::Multiple => TopologyLevel::Multiple,
        NvmlTopologyLevel::HostBridge => TopologyLevel::HostBridge,
        NvmlTopologyLevel::Node => TopologyLevel::Cpu,
        NvmlTopologyLevel::System => TopologyLevel::System,
    }
}

/// Driver versions look like "535.161.08"; the controller file carries the
/// first two components.
fn parse_driver_version(version: &str) -> (i32, i32) {
    let mut parts = version.split('.');
    let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor)
}
