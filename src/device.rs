//! Devices are single energy counters exposed by a plugin.
//!
//! Hardware counters wrap around once they reach their maximum range. Every
//! [`Device`] keeps the last observed raw value and the number of wraps seen
//! so far, so that [`Device::energy_uj`] is monotonic as long as the counter
//! is sampled at least once per wrap period (see [`crate::overflow`]).

use std::fmt;
use std::sync::Mutex;

use anyhow::Result;
use serde::Serialize;

/// Source of raw energy readings for one device.
pub trait EnergySensor: Send + Sync {
    /// Current raw counter value in micro joules.
    fn read_energy_uj(&self) -> Result<u64>;

    /// Value at which the raw counter wraps back to zero.
    fn energy_max_uj(&self) -> u64 {
        u64::MAX
    }

    /// Shortest time in milliseconds in which the counter can wrap.
    ///
    /// Zero means the counter never needs background tracking.
    fn update_interval_ms(&self) -> u64 {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Misc,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
            DeviceKind::Misc => "misc",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OverflowState {
    pub wraps: u64,
    pub last: u64,
}

impl OverflowState {
    /// Record a raw reading, counting a wrap if it went backwards.
    pub fn observe(&mut self, current: u64) -> bool {
        let wrapped = current < self.last;
        if wrapped {
            self.wraps += 1;
        }
        self.last = current;
        wrapped
    }

    pub fn corrected(&self, max: u64) -> u64 {
        self.wraps.saturating_mul(max).saturating_add(self.last)
    }
}

pub struct Device {
    plugin: String,
    name: String,
    uid: String,
    kind: DeviceKind,
    sensor: Box<dyn EnergySensor>,
    overflow: Mutex<OverflowState>,
}

impl Device {
    /// Create a device and take the first reading as the overflow baseline.
    pub fn new(
        plugin: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
        kind: DeviceKind,
        sensor: Box<dyn EnergySensor>,
    ) -> Result<Self> {
        let last = sensor.read_energy_uj()?;
        Ok(Device {
            plugin: plugin.into(),
            name: name.into(),
            uid: uid.into(),
            kind,
            sensor,
            overflow: Mutex::new(OverflowState { wraps: 0, last }),
        })
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn update_interval_ms(&self) -> u64 {
        self.sensor.update_interval_ms()
    }

    pub fn energy_max_uj(&self) -> u64 {
        self.sensor.energy_max_uj()
    }

    /// Raw sensor value without wrap correction.
    pub fn raw_energy_uj(&self) -> Result<u64> {
        self.sensor.read_energy_uj()
    }

    /// Wrap corrected energy in micro joules.
    pub fn energy_uj(&self) -> Result<u64> {
        let mut state = self.lock_overflow();
        let current = self.sensor.read_energy_uj()?;
        if state.observe(current) {
            tracing::debug!("Counter of {} wrapped ({} wraps)", self.name, state.wraps);
        }
        Ok(state.corrected(self.sensor.energy_max_uj()))
    }

    /// Sample the sensor for overflow tracking only.
    pub(crate) fn track(&self) -> Result<bool> {
        let mut state = self.lock_overflow();
        let current = self.sensor.read_energy_uj()?;
        Ok(state.observe(current))
    }

    pub fn overflow_state(&self) -> OverflowState {
        *self.lock_overflow()
    }

    fn lock_overflow(&self) -> std::sync::MutexGuard<'_, OverflowState> {
        // Plain data, always consistent even after a panic.
        self.overflow
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("plugin", &self.plugin)
            .field("name", &self.name)
            .field("uid", &self.uid)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::EmaError;

    /// Sensor backed by a shared value tests can move around.
    pub struct ManualSensor {
        pub value: Arc<AtomicU64>,
        pub max: u64,
        pub interval_ms: u64,
    }

    impl EnergySensor for ManualSensor {
        fn read_energy_uj(&self) -> Result<u64> {
            Ok(self.value.load(Ordering::SeqCst))
        }

        fn energy_max_uj(&self) -> u64 {
            self.max
        }

        fn update_interval_ms(&self) -> u64 {
            self.interval_ms
        }
    }

    pub fn manual_device(
        plugin: &str,
        name: &str,
        start: u64,
        max: u64,
        interval_ms: u64,
    ) -> (Device, Arc<AtomicU64>) {
        let value = Arc::new(AtomicU64::new(start));
        let sensor = ManualSensor {
            value: value.clone(),
            max,
            interval_ms,
        };
        let device = Device::new(plugin, name, name, DeviceKind::Misc, Box::new(sensor)).unwrap();
        (device, value)
    }

    /// Sensor that fails every read while `broken` is set.
    pub struct FlakySensor {
        pub inner: ManualSensor,
        pub name: String,
        pub broken: Arc<AtomicBool>,
    }

    impl EnergySensor for FlakySensor {
        fn read_energy_uj(&self) -> Result<u64> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(EmaError::SensorRead {
                    device: self.name.clone(),
                    reason: "device unplugged".to_string(),
                }
                .into());
            }
            self.inner.read_energy_uj()
        }

        fn energy_max_uj(&self) -> u64 {
            self.inner.energy_max_uj()
        }

        fn update_interval_ms(&self) -> u64 {
            self.inner.update_interval_ms()
        }
    }

    /// Like [`manual_device`], plus a switch that makes reads fail.
    pub fn flaky_device(
        plugin: &str,
        name: &str,
        start: u64,
    ) -> (Device, Arc<AtomicU64>, Arc<AtomicBool>) {
        let value = Arc::new(AtomicU64::new(start));
        let broken = Arc::new(AtomicBool::new(false));
        let sensor = FlakySensor {
            inner: ManualSensor {
                value: value.clone(),
                max: u64::MAX,
                interval_ms: 0,
            },
            name: name.to_string(),
            broken: broken.clone(),
        };
        let device = Device::new(plugin, name, name, DeviceKind::Misc, Box::new(sensor)).unwrap();
        (device, value, broken)
    }
}
