//! Measurement regions.
//!
//! A [`Region`] is a named code segment whose energy and wall time are
//! accumulated per device over every `begin`/`end` pair. Regions are meant to
//! be driven by the thread that defined them; measurements of one region must
//! not be nested.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;

use crate::device::Device;
use crate::error::EmaError;
use crate::utils::now_us;

/// Where a region was defined in the user's code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CodeLocation {
    pub file: String,
    pub line: u32,
    pub function: String,
}

impl CodeLocation {
    pub fn new(file: impl Into<String>, line: u32, function: impl Into<String>) -> Self {
        CodeLocation {
            file: file.into(),
            line,
            function: function.into(),
        }
    }
}

/// Define a region at the call site.
///
/// ```no_run
/// # fn main() -> anyhow::Result<()> {
/// let ema = ema::Ema::init(ema::Config::default())?;
/// let region = ema::region!(ema, "solver")?;
/// region.begin()?;
/// // ... work ...
/// region.end()?;
/// ema.finalize()?;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! region {
    ($ema:expr, $idf:expr) => {
        $ema.region_define(
            $idf,
            None,
            $crate::CodeLocation::new(file!(), line!(), module_path!()),
        )
    };
    ($ema:expr, $idf:expr, $filter:expr) => {
        $ema.region_define(
            $idf,
            Some($filter),
            $crate::CodeLocation::new(file!(), line!(), module_path!()),
        )
    };
}

#[derive(Debug, Clone)]
pub struct Measurement {
    pub device: Arc<Device>,
    pub energy_start: u64,
    pub energy_result: u64,
    pub time_start: u64,
    pub time_result: u64,
}

impl Measurement {
    fn new(device: Arc<Device>) -> Self {
        Measurement {
            device,
            energy_start: 0,
            energy_result: 0,
            time_start: 0,
            time_result: 0,
        }
    }
}

#[derive(Debug)]
pub struct RegionData {
    pub idf: String,
    pub location: CodeLocation,
    pub visits: u64,
    pub measurements: Vec<Measurement>,
    active: bool,
}

impl RegionData {
    /// Store key, unique per thread.
    pub fn key(&self) -> String {
        region_key(&self.idf, &self.location)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

pub fn region_key(idf: &str, location: &CodeLocation) -> String {
    format!(
        "{}:{}({}:{})",
        location.file, location.line, location.function, idf
    )
}

/// Handle to a region. Cloning the handle does not copy the region.
#[derive(Clone)]
pub struct Region {
    inner: Arc<Mutex<RegionData>>,
    session: u64,
}

/// Time and energy of every device, in measurement order.
fn read_devices(measurements: &[Measurement]) -> Result<Vec<(u64, u64)>> {
    measurements
        .iter()
        .map(|m| Ok((now_us(), m.device.energy_uj()?)))
        .collect()
}

impl Region {
    pub(crate) fn new(idf: &str, location: CodeLocation, devices: Vec<Arc<Device>>) -> Self {
        let data = RegionData {
            idf: idf.to_string(),
            location,
            visits: 0,
            measurements: devices.into_iter().map(Measurement::new).collect(),
            active: false,
        };
        Region {
            inner: Arc::new(Mutex::new(data)),
            session: 0,
        }
    }

    /// Start a measurement.
    ///
    /// Calling `begin` again before [`end`](Region::end) restarts the
    /// current measurement. Nothing changes if a device can't be read.
    pub fn begin(&self) -> Result<()> {
        let mut data = self.lock();
        let starts = read_devices(&data.measurements)?;
        for (m, (time, energy)) in data.measurements.iter_mut().zip(starts) {
            m.time_start = time;
            m.energy_start = energy;
        }
        data.visits += 1;
        data.active = true;
        Ok(())
    }

    /// Stop the running measurement and accumulate its results.
    ///
    /// If a device can't be read the measurement stays open and `end` may be
    /// retried.
    pub fn end(&self) -> Result<()> {
        let mut data = self.lock();
        if !data.active {
            return Err(EmaError::RegionNotStarted {
                idf: data.idf.clone(),
            }
            .into());
        }
        let ends = read_devices(&data.measurements)?;
        for (m, (time, energy)) in data.measurements.iter_mut().zip(ends) {
            m.time_result += time.saturating_sub(m.time_start);
            m.energy_result += energy.saturating_sub(m.energy_start);
        }
        data.active = false;
        Ok(())
    }

    /// Id of the session that created the region, 0 if none.
    pub fn session_id(&self) -> u64 {
        self.session
    }

    pub(crate) fn in_session(mut self, session: u64) -> Self {
        self.session = session;
        self
    }

    pub fn idf(&self) -> String {
        self.lock().idf.clone()
    }

    pub fn visits(&self) -> u64 {
        self.lock().visits
    }

    /// Snapshot of the accumulated measurements.
    pub fn measurements(&self) -> Vec<Measurement> {
        self.lock().measurements.clone()
    }

    /// Run `f` with the region data locked.
    pub fn with_data<T>(&self, f: impl FnOnce(&RegionData) -> T) -> T {
        f(&self.lock())
    }

    pub fn ptr_eq(&self, other: &Region) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> MutexGuard<'_, RegionData> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with_data(|data| {
            f.debug_struct("Region")
                .field("idf", &data.idf)
                .field("location", &data.location)
                .field("visits", &data.visits)
                .field("devices", &data.measurements.len())
                .finish()
        })
    }
}
