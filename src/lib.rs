//! EMA - region-based energy measurement.
//!
//! Plugins discover hardware energy counters ("devices"), a background thread
//! compensates for counter wrap-around, and named code regions accumulate
//! energy and wall time per device and per thread. A report is written when
//! the session is finalized.
//!
//! # Modules
//!
//! - [`session`] - the [`Ema`] session owning plugins, devices and regions
//! - [`region`] - measurement regions and the [`region!`] macro
//! - [`plugins`] - built-in RAPL and NVML plugins
//! - [`global`] - process-wide session for binding-style callers
//! - [`ffi`] - the `EMA_*` C ABI
//!
//! # Example
//!
//! ```no_run
//! use ema::{Config, Ema, Filter};
//!
//! # fn main() -> anyhow::Result<()> {
//! let ema = Ema::init(Config::from_env()?)?;
//! let no_gpu = Filter::exclude_plugin("NVML");
//! let region = ema::region!(ema, "compute", &no_gpu)?;
//!
//! region.begin()?;
//! // ... work ...
//! region.end()?;
//!
//! ema.finalize()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod ffi;
pub mod filter;
pub mod global;
pub mod logging;
pub mod output;
pub mod overflow;
pub mod plugin;
pub mod plugins;
pub mod region;
pub mod region_store;
pub mod session;
pub mod utils;

// Re-export for convenience
pub use config::Config;
pub use device::{Device, DeviceKind, EnergySensor};
pub use error::EmaError;
pub use filter::Filter;
pub use output::OutputFormat;
pub use plugin::{Plugin, PluginRegistry};
pub use region::{CodeLocation, Region};
pub use session::{Ema, EmaBuilder};
