//! Common test utilities for ema integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use ema::{Device, DeviceKind, EmaError, EnergySensor, Plugin};
use tempfile::TempDir;

/// A powercap tree in a temporary directory.
pub struct FakePowercap {
    dir: TempDir,
}

impl FakePowercap {
    pub fn new() -> Self {
        FakePowercap {
            dir: tempfile::tempdir().expect("Failed to create temp dir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Add a top level zone `intel-rapl:<idx>`.
    pub fn zone(&self, idx: u32, name: &str, energy: u64) -> PathBuf {
        let dir = self.root().join(format!("intel-rapl:{}", idx));
        write_zone(&dir, name, energy, Some(150_000_000));
        dir
    }

    /// Add subzone `intel-rapl:<idx>:<sub>` below an existing zone.
    pub fn subzone(&self, idx: u32, sub: u32, name: &str, energy: u64) -> PathBuf {
        let dir = self
            .root()
            .join(format!("intel-rapl:{}", idx))
            .join(format!("intel-rapl:{}:{}", idx, sub));
        write_zone(&dir, name, energy, None);
        dir
    }

    pub fn set_energy(zone: &Path, energy: u64) {
        fs::write(zone.join("energy_uj"), format!("{}\n", energy))
            .expect("Failed to update energy_uj");
    }

    /// One package with core and dram subzones plus an unattributed psys zone.
    pub fn single_package() -> Self {
        let powercap = FakePowercap::new();
        powercap.zone(0, "package-0", 1_000);
        powercap.subzone(0, 0, "core", 500);
        powercap.subzone(0, 1, "dram", 70);
        powercap.zone(1, "psys", 10);
        powercap
    }
}

fn write_zone(dir: &Path, name: &str, energy: u64, max_power_uw: Option<u64>) {
    fs::create_dir_all(dir).expect("Failed to create zone dir");
    fs::write(dir.join("name"), format!("{}\n", name)).expect("Failed to write name");
    fs::write(dir.join("energy_uj"), format!("{}\n", energy)).expect("Failed to write energy");
    fs::write(dir.join("max_energy_range_uj"), "262143328850\n")
        .expect("Failed to write max_energy_range_uj");
    if let Some(power) = max_power_uw {
        fs::write(dir.join("constraint_0_max_power_uw"), format!("{}\n", power))
            .expect("Failed to write constraint");
    }
}

/// Sensor whose counter is set by the test. Reads fail while `broken` is set.
pub struct ManualSensor {
    name: String,
    value: Arc<AtomicU64>,
    max: u64,
    broken: Arc<AtomicBool>,
}

impl EnergySensor for ManualSensor {
    fn read_energy_uj(&self) -> Result<u64> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(EmaError::SensorRead {
                device: self.name.clone(),
                reason: "read failed".to_string(),
            }
            .into());
        }
        Ok(self.value.load(Ordering::SeqCst))
    }

    fn energy_max_uj(&self) -> u64 {
        self.max
    }
}

/// Plugin exposing manually driven devices.
pub struct ManualPlugin {
    name: String,
    devices: Vec<(String, Arc<AtomicU64>, u64, Arc<AtomicBool>)>,
}

impl ManualPlugin {
    pub fn new(name: &str) -> Self {
        ManualPlugin {
            name: name.to_string(),
            devices: Vec::new(),
        }
    }

    /// Add a device and return the handle that drives its counter.
    pub fn device(&mut self, name: &str, start: u64, max: u64) -> Arc<AtomicU64> {
        self.breakable_device(name, start, max).0
    }

    /// Add a device whose reads fail while the returned flag is set.
    pub fn breakable_device(
        &mut self,
        name: &str,
        start: u64,
        max: u64,
    ) -> (Arc<AtomicU64>, Arc<AtomicBool>) {
        let value = Arc::new(AtomicU64::new(start));
        let broken = Arc::new(AtomicBool::new(false));
        self.devices
            .push((name.to_string(), value.clone(), max, broken.clone()));
        (value, broken)
    }
}

impl Plugin for ManualPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self) -> Result<Vec<Device>> {
        self.devices
            .iter()
            .map(|(name, value, max, broken)| {
                let sensor = ManualSensor {
                    name: name.clone(),
                    value: value.clone(),
                    max: *max,
                    broken: broken.clone(),
                };
                Device::new(&self.name, name, name, DeviceKind::Misc, Box::new(sensor))
            })
            .collect()
    }
}

/// Configuration writing into `dir` with the built-in plugins disabled.
pub fn quiet_config(dir: &Path) -> ema::Config {
    ema::Config {
        output_dir: dir.to_path_buf(),
        rapl: false,
        nvml: false,
        ..ema::Config::default()
    }
}

pub fn report_path(dir: &Path) -> PathBuf {
    dir.join(format!("output.EMA.{}", std::process::id()))
}
