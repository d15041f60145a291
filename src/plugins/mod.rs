//! Built-in plugins.

#[cfg(feature = "nvml")]
pub mod nvml;
pub mod rapl;

#[cfg(feature = "nvml")]
pub use nvml::NvmlPlugin;
pub use rapl::RaplPlugin;
