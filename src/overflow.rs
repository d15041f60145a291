//! Background overflow tracking.
//!
//! RAPL style counters wrap after a few minutes at full load. Regions may be
//! open much longer than that, so a tracker thread samples every device that
//! reports a non-zero update interval often enough to observe each wrap.

use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::device::Device;

/// Smallest sampling period, regardless of what devices report.
const MIN_SAMPLE_PERIOD_MS: u64 = 1;

pub struct OverflowTracker {
    stop_tx: Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
    period: Duration,
}

/// Sampling period for a device set, `None` if nothing needs tracking.
///
/// Devices are sampled twice per shortest wrap interval so a wrap can't slip
/// between two samples.
pub fn sample_period(devices: &[Arc<Device>]) -> Option<Duration> {
    devices
        .iter()
        .map(|device| device.update_interval_ms())
        .filter(|&interval| interval > 0)
        .min()
        .map(|interval| Duration::from_millis((interval / 2).max(MIN_SAMPLE_PERIOD_MS)))
}

/// Run one tracking pass over all devices that need it.
///
/// Returns the number of wraps observed.
pub fn sample_devices(devices: &[Arc<Device>]) -> usize {
    let mut wraps = 0;
    for device in devices.iter().filter(|d| d.update_interval_ms() > 0) {
        match device.track() {
            Ok(true) => {
                tracing::debug!("Overflow detected on {}", device.name());
                wraps += 1;
            }
            Ok(false) => {}
            Err(err) => tracing::warn!("Overflow tracking of {} failed: {:#}", device.name(), err),
        }
    }
    wraps
}

impl OverflowTracker {
    /// Spawn the tracker thread if any device needs tracking.
    pub fn start(devices: Vec<Arc<Device>>) -> Result<Option<Self>> {
        let Some(period) = sample_period(&devices) else {
            tracing::debug!("No device needs overflow tracking");
            return Ok(None);
        };

        let (stop_tx, stop_rx) = channel::<()>();
        let handle = thread::Builder::new()
            .name("ema_overflow".to_string())
            .spawn(move || loop {
                sample_devices(&devices);
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .context("Failed to start overflow tracking")?;

        tracing::info!("Overflow tracking every {:?}", period);
        Ok(Some(OverflowTracker {
            stop_tx,
            handle: Some(handle),
            period,
        }))
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stop the tracker thread and wait for it to exit.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let _ = self.stop_tx.send(());
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("Overflow tracking thread panicked"))
    }
}

impl Drop for OverflowTracker {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::warn!("{:#}", err);
        }
    }
}
