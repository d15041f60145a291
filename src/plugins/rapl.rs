//! Intel RAPL energy counters through the Linux powercap interface.
//!
//! Layout of the powercap tree this plugin walks:
//!
//! ```text
//! /sys/class/powercap/intel-rapl/
//!     intel-rapl:0/                 package zone
//!         name                      "package-0"
//!         energy_uj
//!         max_energy_range_uj
//!         constraint_0_max_power_uw
//!         intel-rapl:0:0/           subzone ("core", "uncore", "dram")
//!     intel-rapl:1/                 "psys", not tied to a package
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::device::{Device, DeviceKind, EnergySensor};
use crate::error::EmaError;
use crate::plugin::Plugin;
use crate::utils::{read_trimmed, read_u64};

pub const PLUGIN_NAME: &str = "RAPL";
pub const DEFAULT_POWERCAP_ROOT: &str = "/sys/class/powercap/intel-rapl";

const ZONE_PREFIX: &str = "intel-rapl";
const MAX_POWER_CONSTRAINTS: usize = 3;
/// Used when a zone exposes no power constraint to derive the wrap time from.
const DEFAULT_UPDATE_INTERVAL_MS: u64 = 1000;

static PACKAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|-)package-(\d+)(?:-|$)").unwrap());

/// Extract the package id from a zone name such as `package-0`.
pub fn parse_package_id(name: &str) -> Option<u32> {
    PACKAGE_RE
        .captures(name)
        .and_then(|cap| cap[1].parse().ok())
}

/// Wrap time in milliseconds of a counter with range `max_range_uj` drawing
/// `max_power_uw`.
pub fn update_interval_ms(max_range_uj: u64, max_power_uw: u64) -> u64 {
    if max_power_uw == 0 {
        return DEFAULT_UPDATE_INTERVAL_MS;
    }
    let interval = (max_range_uj as u128 * 1000) / max_power_uw as u128;
    interval.min(u64::MAX as u128) as u64
}

struct RaplSensor {
    energy_path: PathBuf,
    max_range_uj: u64,
    update_interval_ms: u64,
}

impl EnergySensor for RaplSensor {
    fn read_energy_uj(&self) -> Result<u64> {
        read_u64(&self.energy_path)
    }

    fn energy_max_uj(&self) -> u64 {
        self.max_range_uj
    }

    fn update_interval_ms(&self) -> u64 {
        self.update_interval_ms
    }
}

#[derive(Debug)]
struct ZoneInfo {
    uid: String,
    name: String,
    package: Option<u32>,
    energy_path: PathBuf,
    max_range_uj: u64,
    update_interval_ms: u64,
}

impl ZoneInfo {
    fn into_device(self, package: u32) -> Result<Device> {
        let name = format!("CPU-{}.{}", package, self.name);
        let sensor = RaplSensor {
            energy_path: self.energy_path,
            max_range_uj: self.max_range_uj,
            update_interval_ms: self.update_interval_ms,
        };
        Device::new(PLUGIN_NAME, name, self.uid, DeviceKind::Cpu, Box::new(sensor))
    }
}

fn count_dirs_with_prefix(path: &Path, prefix: &str) -> usize {
    match fs::read_dir(path) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(prefix))
            .count(),
        Err(err) => {
            tracing::debug!("Failed to open {}: {}", path.display(), err);
            0
        }
    }
}

fn check_readable(path: &Path) -> Result<()> {
    match fs::File::open(path) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            bail!("RAPL is not supported, missing {}", path.display())
        }
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            bail!("No read permissions for {}", path.display())
        }
        Err(err) => Err(err).with_context(|| format!("Failed to open {}", path.display())),
    }
}

fn read_zone_name(zone: &Path) -> Result<String> {
    let path = zone.join("name");
    check_readable(&path)?;
    read_trimmed(&path)
}

/// Largest `constraint_<n>_max_power_uw` of a zone, 0 if there is none.
fn read_max_power_uw(zone: &Path) -> Result<u64> {
    // Constraints are long_term, short_term and peak but the numbering
    // differs between machines, so take the largest one present.
    let mut max_power = 0;
    for i in 0..MAX_POWER_CONSTRAINTS {
        let path = zone.join(format!("constraint_{}_max_power_uw", i));
        if !path.exists() {
            continue;
        }
        max_power = max_power.max(read_u64(&path)?);
    }
    Ok(max_power)
}

/// Gather everything needed to read the zone at `zone`, or its subzone `sub`.
fn probe_zone(zone: &Path, sub: Option<&Path>) -> Result<ZoneInfo> {
    let dir = sub.unwrap_or(zone);
    let energy_path = dir.join("energy_uj");
    check_readable(&energy_path)?;

    let zone_name = read_zone_name(zone)?;
    let package = parse_package_id(&zone_name);
    let name = match sub {
        Some(sub) => read_zone_name(sub)?,
        None => zone_name,
    };

    let own_range = dir.join("max_energy_range_uj");
    let max_range_uj = if own_range.exists() {
        read_u64(&own_range)?
    } else {
        read_u64(&zone.join("max_energy_range_uj"))?
    };
    if max_range_uj == 0 {
        bail!("Zero max_energy_range_uj in {}", dir.display());
    }

    let max_power_uw = read_max_power_uw(zone)?;
    let uid = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    Ok(ZoneInfo {
        uid,
        name,
        package,
        energy_path,
        max_range_uj,
        update_interval_ms: update_interval_ms(max_range_uj, max_power_uw),
    })
}

pub struct RaplPlugin {
    root: PathBuf,
}

impl Default for RaplPlugin {
    fn default() -> Self {
        Self::new(DEFAULT_POWERCAP_ROOT)
    }
}

impl RaplPlugin {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        RaplPlugin { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn zone_path(&self, zone_idx: usize) -> PathBuf {
        self.root.join(format!("{}:{}", ZONE_PREFIX, zone_idx))
    }

    fn subzone_path(&self, zone_idx: usize, subzone_idx: usize) -> PathBuf {
        self.zone_path(zone_idx)
            .join(format!("{}:{}:{}", ZONE_PREFIX, zone_idx, subzone_idx))
    }

    fn add_device(devices: &mut Vec<Device>, info: ZoneInfo, package: u32) {
        let uid = info.uid.clone();
        match info.into_device(package) {
            Ok(device) => devices.push(device),
            Err(err) => tracing::warn!("Skipping RAPL zone {}: {:#}", uid, err),
        }
    }
}

impl Plugin for RaplPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn init(&mut self) -> Result<Vec<Device>> {
        let num_zones = count_dirs_with_prefix(&self.root, ZONE_PREFIX);
        if num_zones == 0 {
            tracing::info!("No RAPL devices detected");
            return Ok(Vec::new());
        }

        let mut devices = Vec::new();
        for i in 0..num_zones {
            let zone = self.zone_path(i);
            let info = match probe_zone(&zone, None) {
                Ok(info) => info,
                Err(err) => {
                    tracing::warn!("Skipping RAPL zone {}: {:#}", zone.display(), err);
                    continue;
                }
            };

            // Zones like psys are not attributed to a CPU package.
            let Some(package) = info.package else {
                tracing::debug!("Skipping RAPL zone {} ({})", info.uid, info.name);
                continue;
            };
            Self::add_device(&mut devices, info, package);

            for j in 0..count_dirs_with_prefix(&zone, ZONE_PREFIX) {
                let subzone = self.subzone_path(i, j);
                match probe_zone(&zone, Some(&subzone)) {
                    Ok(info) => Self::add_device(&mut devices, info, package),
                    Err(err) => {
                        tracing::warn!("Skipping RAPL zone {}: {:#}", subzone.display(), err)
                    }
                }
            }
        }

        if devices.is_empty() {
            return Err(EmaError::NoDeviceAccess {
                plugin: PLUGIN_NAME.to_string(),
            }
            .into());
        }
        Ok(devices)
    }
}
