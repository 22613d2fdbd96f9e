//! Text-matrix backend, used when the NVIDIA library is unavailable and
//! by every test that needs a topology.

use crate::driver::DeviceInfo;
use crate::driver::DeviceSample;
use crate::driver::DriverError;
use crate::driver::TopologySnapshot;
use crate::topology::TopologyLevel;

/// Backend parsed from an `nvidia-smi topo -m`-style matrix:
///
/// ```text
///       GPU0 GPU1 GPU2 GPU3
/// GPU0   X   PIX  PHB  PHB
/// GPU1  PIX   X   PHB  PHB
/// ...
/// ```
#[derive(Debug, Clone)]
pub struct DummyDriver {
    devices: Vec<DeviceInfo>,
    levels: Vec<Vec<TopologyLevel>>,
}

impl DummyDriver {
    pub fn from_matrix(input: &str, memory_per_device: u64) -> Result<Self, DriverError> {
        let mut lines = input.lines().filter(|l| !l.trim().is_empty());

        let header = lines
            .next()
            .ok_or_else(|| DriverError::Parse("empty topology input".into()))?;
        let count = header.split_whitespace().count();
        if count == 0 {
            return Err(DriverError::Parse("no devices in header row".into()));
        }

        let mut levels = vec![vec![TopologyLevel::Internal; count]; count];
        let mut rows = 0usize;
        for (row, line) in lines.enumerate() {
            let cells: Vec<&str> = line.split_whitespace().collect();
            if cells.len() != count + 1 {
                return Err(DriverError::Parse(format!(
                    "row {row} has {} cells, want {}",
                    cells.len().saturating_sub(1),
                    count
                )));
            }
            if row >= count {
                return Err(DriverError::Parse(format!(
                    "more rows than the {count} devices in the header"
                )));
            }
            for (col, cell) in cells[1..].iter().enumerate() {
                if col == row {
                    continue;
                }
                levels[row][col] = TopologyLevel::parse(cell);
            }
            rows += 1;
        }
        if rows != count {
            return Err(DriverError::Parse(format!(
                "matrix has {rows} rows for {count} devices"
            )));
        }

        // reject asymmetric input early, the tree assumes a symmetric matrix
        for a in 0..count {
            for b in (a + 1)..count {
                if levels[a][b] != levels[b][a] {
                    return Err(DriverError::Parse(format!(
                        "asymmetric level for pair ({a}, {b})"
                    )));
                }
            }
        }

        let devices = (0..count)
            .map(|i| DeviceInfo {
                minor_id: i as u32,
                uuid: format!("GPU-dummy-{i:04}"),
                bus_id: format!("00000000:{i:02X}:00.0"),
                total_memory: memory_per_device,
            })
            .collect();

        Ok(Self { devices, levels })
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            devices: self.devices.clone(),
            levels: self.levels.clone(),
            driver_version: (0, 0),
        }
    }

    pub fn sample(&self, index: usize) -> Result<DeviceSample, DriverError> {
        if index >= self.devices.len() {
            return Err(DriverError::UnknownDevice(index));
        }
        Ok(DeviceSample::default())
    }

    pub fn version(&self) -> (i32, i32) {
        (0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_square_matrix() {
        let input = "\
      GPU0 GPU1
GPU0   X   PIX
GPU1  PIX   X
";
        let driver = DummyDriver::from_matrix(input, 1 << 30).unwrap();
        let snap = driver.snapshot();
        assert_eq!(snap.devices.len(), 2);
        assert_eq!(snap.levels[0][1], TopologyLevel::Single);
        assert_eq!(snap.levels[1][0], TopologyLevel::Single);
        assert_eq!(snap.devices[1].minor_id, 1);
    }

    #[test]
    fn rejects_ragged_and_asymmetric_input() {
        assert!(DummyDriver::from_matrix("", 0).is_err());
        let ragged = "  GPU0 GPU1\nGPU0  X\n";
        assert!(DummyDriver::from_matrix(ragged, 0).is_err());
        let asymmetric = "\
      GPU0 GPU1
GPU0   X   PIX
GPU1  PHB   X
";
        assert!(DummyDriver::from_matrix(asymmetric, 0).is_err());
    }

    #[test]
    fn sample_is_empty_and_bounded() {
        let driver = DummyDriver::from_matrix("  GPU0\nGPU0  X\n", 0).unwrap();
        assert!(driver.sample(0).unwrap().pids.is_empty());
        assert!(driver.sample(1).is_err());
    }
}
