//! On-disk controller files read by the in-container shim.
//!
//! `vcuda.config` is a fixed-layout packed record; the offsets below are
//! the binding contract with the shim and must not drift. `pids.config`
//! is a bare sequence of little-endian 32-bit pids.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

pub const PIDS_CONFIG_NAME: &str = "pids.config";
pub const CONTROLLER_CONFIG_NAME: &str = "vcuda.config";
pub const DEFAULT_FILE_MODE: u32 = 0o777;

// field offsets in vcuda.config
const POD_UID_OFFSET: usize = 0;
const POD_UID_SIZE: usize = 48;
const LIMIT_OFFSET: usize = 48;
const CONTAINER_NAME_OFFSET: usize = 4096;
const CONTAINER_NAME_SIZE: usize = 4096;
const BUS_ID_OFFSET: usize = 8192;
const BUS_ID_SIZE: usize = 16;
const GPU_MEMORY_OFFSET: usize = 8208;
const UTILIZATION_OFFSET: usize = 8216;
const HARD_LIMIT_OFFSET: usize = 8220;
const DRIVER_MAJOR_OFFSET: usize = 8224;
const DRIVER_MINOR_OFFSET: usize = 8228;
const ENABLE_OFFSET: usize = 8232;
/// record end padded to an 8-byte boundary
pub const CONFIG_SIZE: usize = 8240;

/// Contents of one container's `vcuda.config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcudaConfig {
    pub pod_uid: String,
    pub container_name: String,
    pub bus_id: String,
    /// bytes the container may use
    pub gpu_memory: u64,
    /// hundredths of a core the container asked for
    pub utilization: i32,
    /// upper bound the shim enforces when `hard_limit` is off
    pub limit: i32,
    pub hard_limit: bool,
    pub driver_version: (i32, i32),
    /// whole-card containers run unthrottled
    pub enable: bool,
}

fn put_str(buf: &mut [u8], offset: usize, size: usize, value: &str) {
    // NUL-terminated, truncated to leave room for the terminator
    let bytes = value.as_bytes();
    let len = bytes.len().min(size - 1);
    buf[offset..offset + len].copy_from_slice(&bytes[..len]);
}

fn put_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

impl VcudaConfig {
    pub fn encode(&self) -> [u8; CONFIG_SIZE] {
        let mut buf = [0u8; CONFIG_SIZE];
        put_str(&mut buf, POD_UID_OFFSET, POD_UID_SIZE, &self.pod_uid);
        put_i32(&mut buf, LIMIT_OFFSET, self.limit);
        put_str(
            &mut buf,
            CONTAINER_NAME_OFFSET,
            CONTAINER_NAME_SIZE,
            &self.container_name,
        );
        put_str(&mut buf, BUS_ID_OFFSET, BUS_ID_SIZE, &self.bus_id);
        put_u64(&mut buf, GPU_MEMORY_OFFSET, self.gpu_memory);
        put_i32(&mut buf, UTILIZATION_OFFSET, self.utilization);
        put_i32(&mut buf, HARD_LIMIT_OFFSET, i32::from(self.hard_limit));
        put_i32(&mut buf, DRIVER_MAJOR_OFFSET, self.driver_version.0);
        put_i32(&mut buf, DRIVER_MINOR_OFFSET, self.driver_version.1);
        put_i32(&mut buf, ENABLE_OFFSET, i32::from(self.enable));
        buf
    }

    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .mode(DEFAULT_FILE_MODE)
            .open(path)?;
        file.write_all(&self.encode())?;
        Ok(())
    }
}

/// Write the pid list, holding an exclusive flock for the duration so the
/// shim never reads a half-written file.
pub fn write_pids(path: &Path, pids: &[i32]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .mode(DEFAULT_FILE_MODE)
        .open(path)?;

    let fd = file.as_raw_fd();
    while unsafe { libc::flock(fd, libc::LOCK_EX) } != 0 {
        std::thread::sleep(Duration::from_millis(100));
    }

    let mut buf = Vec::with_capacity(pids.len() * 4);
    for pid in pids {
        buf.extend_from_slice(&pid.to_le_bytes());
    }
    let result = file.write_all(&buf);

    unsafe { libc::flock(fd, libc::LOCK_UN) };
    result
}
