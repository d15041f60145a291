//! Session configuration.

use std::path::PathBuf;

use anyhow::Result;

use crate::output::OutputFormat;
use crate::plugins::rapl::DEFAULT_POWERCAP_ROOT;

pub const ENV_OUTPUT_DIR: &str = "EMA_OUTPUT_DIR";
pub const ENV_OUTPUT_FORMAT: &str = "EMA_OUTPUT_FORMAT";
pub const ENV_PLUGIN_RAPL: &str = "EMA_PLUGIN_RAPL";
pub const ENV_PLUGIN_NVML: &str = "EMA_PLUGIN_NVML";
pub const ENV_POWERCAP_ROOT: &str = "EMA_POWERCAP_ROOT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory receiving `output.EMA.<pid>`
    pub output_dir: PathBuf,
    pub output_format: OutputFormat,
    /// Write the report when the session is finalized
    pub write_results: bool,
    /// Register the built-in RAPL plugin
    pub rapl: bool,
    /// Register the built-in NVML plugin (needs the `nvml` feature)
    pub nvml: bool,
    /// Root of the powercap RAPL tree
    pub powercap_root: PathBuf,
    /// NVML shared library to load
    pub nvml_library: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            output_dir: PathBuf::from("."),
            output_format: OutputFormat::Csv,
            write_results: true,
            rapl: true,
            nvml: cfg!(feature = "nvml"),
            powercap_root: PathBuf::from(DEFAULT_POWERCAP_ROOT),
            nvml_library: String::from("libnvidia-ml.so.1"),
        }
    }
}

/// `ON` or `1` enables a switch, anything else disables it.
fn parse_switch(value: &str) -> bool {
    let value = value.trim();
    value.eq_ignore_ascii_case("on") || value == "1"
}

impl Config {
    /// Defaults overridden by the `EMA_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        if let Some(dir) = lookup(ENV_OUTPUT_DIR) {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(format) = lookup(ENV_OUTPUT_FORMAT) {
            config.output_format = format.parse()?;
        }
        if let Some(value) = lookup(ENV_PLUGIN_RAPL) {
            config.rapl = parse_switch(&value);
        }
        if let Some(value) = lookup(ENV_PLUGIN_NVML) {
            config.nvml = parse_switch(&value);
        }
        if let Some(root) = lookup(ENV_POWERCAP_ROOT) {
            config.powercap_root = PathBuf::from(root);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_empty_env_is_default() {
        assert_eq!(Config::from_lookup(lookup(&[])).unwrap(), Config::default());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("EMA_OUTPUT_DIR", "/tmp/ema"),
            ("EMA_OUTPUT_FORMAT", "json"),
            ("EMA_PLUGIN_RAPL", "off"),
            ("EMA_PLUGIN_NVML", "ON"),
            ("EMA_POWERCAP_ROOT", "/fake/powercap"),
        ]))
        .unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/tmp/ema"));
        assert_eq!(config.output_format, OutputFormat::Json);
        assert!(!config.rapl);
        assert!(config.nvml);
        assert_eq!(config.powercap_root, PathBuf::from("/fake/powercap"));
    }

    #[test]
    fn test_switch_values() {
        assert!(parse_switch("ON"));
        assert!(parse_switch("on"));
        assert!(parse_switch("1"));
        assert!(!parse_switch("OFF"));
        assert!(!parse_switch("yes"));
        assert!(!parse_switch(""));
    }

    #[test]
    fn test_bad_format() {
        assert!(Config::from_lookup(lookup(&[("EMA_OUTPUT_FORMAT", "xml")])).is_err());
    }
}
