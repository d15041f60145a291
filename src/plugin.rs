//! Plugin trait and the registry of plugins and their devices.
//!
//! A plugin is a backend that knows how to discover energy counters of one
//! kind (RAPL through powercap, NVIDIA GPUs through NVML, or anything a user
//! registers). The registry owns the plugins and the flat list of devices
//! they exposed during initialization.

use std::sync::Arc;

use anyhow::Result;

use crate::device::Device;

/// Trait implemented by every energy measurement backend.
///
/// # Example
///
/// ```
/// use anyhow::Result;
/// use ema::{Device, DeviceKind, EnergySensor, Plugin};
///
/// struct Constant;
///
/// impl EnergySensor for Constant {
///     fn read_energy_uj(&self) -> Result<u64> {
///         Ok(42)
///     }
/// }
///
/// struct ConstantPlugin;
///
/// impl Plugin for ConstantPlugin {
///     fn name(&self) -> &str {
///         "CONST"
///     }
///
///     fn init(&mut self) -> Result<Vec<Device>> {
///         Ok(vec![Device::new("CONST", "const0", "const0", DeviceKind::Misc, Box::new(Constant))?])
///     }
/// }
/// ```
pub trait Plugin: Send + Sync {
    /// Name used for filtering and reporting, e.g. `RAPL`.
    fn name(&self) -> &str;

    /// Discover the devices this plugin provides.
    fn init(&mut self) -> Result<Vec<Device>>;

    /// Release backend resources. Devices are no longer read afterwards.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

struct PluginEntry {
    plugin: Box<dyn Plugin>,
    devices: Vec<Arc<Device>>,
    initialized: bool,
}

#[derive(Default)]
pub struct PluginRegistry {
    entries: Vec<PluginEntry>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Box<dyn Plugin>) {
        tracing::info!("Registered plugin {}", plugin.name());
        self.entries.push(PluginEntry {
            plugin,
            devices: Vec::new(),
            initialized: false,
        });
    }

    /// Initialize every registered plugin.
    ///
    /// A plugin that fails to initialize is skipped and contributes no
    /// devices; the other plugins are still initialized.
    pub fn init_all(&mut self) {
        for entry in self.entries.iter_mut().filter(|e| !e.initialized) {
            match entry.plugin.init() {
                Ok(devices) => {
                    tracing::info!(
                        "Plugin {} provides {} device(s)",
                        entry.plugin.name(),
                        devices.len()
                    );
                    entry.devices = devices.into_iter().map(Arc::new).collect();
                    entry.initialized = true;
                }
                Err(err) => {
                    tracing::warn!("Skipping plugin {}: {:#}", entry.plugin.name(), err);
                }
            }
        }
    }

    /// Names of all registered plugins, in registration order.
    pub fn plugins(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.plugin.name()).collect()
    }

    /// All devices of all initialized plugins.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.entries
            .iter()
            .flat_map(|e| e.devices.iter().cloned())
            .collect()
    }

    /// Devices of the plugin called `name`, empty if there is no such plugin.
    pub fn plugin_devices(&self, name: &str) -> Vec<Arc<Device>> {
        self.entries
            .iter()
            .filter(|e| e.plugin.name() == name)
            .flat_map(|e| e.devices.iter().cloned())
            .collect()
    }

    /// Finalize all initialized plugins, returning the first error.
    pub fn finalize_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for entry in self.entries.iter_mut().filter(|e| e.initialized) {
            entry.devices.clear();
            entry.initialized = false;
            if let Err(err) = entry.plugin.finalize() {
                tracing::warn!("Failed to finalize plugin {}: {:#}", entry.plugin.name(), err);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;

    use super::*;
    use crate::device::testing::manual_device;

    struct FakePlugin {
        name: &'static str,
        devices: usize,
        fail: bool,
        finalized: Arc<AtomicUsize>,
    }

    impl Plugin for FakePlugin {
        fn name(&self) -> &str {
            self.name
        }

        fn init(&mut self) -> Result<Vec<Device>> {
            if self.fail {
                bail!("no hardware");
            }
            Ok((0..self.devices)
                .map(|i| manual_device(self.name, &format!("{}-{}", self.name, i), 0, 100, 0).0)
                .collect())
        }

        fn finalize(&mut self) -> Result<()> {
            self.finalized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fake(name: &'static str, devices: usize, fail: bool) -> (Box<FakePlugin>, Arc<AtomicUsize>) {
        let finalized = Arc::new(AtomicUsize::new(0));
        (
            Box::new(FakePlugin {
                name,
                devices,
                fail,
                finalized: finalized.clone(),
            }),
            finalized,
        )
    }

    #[test]
    fn test_failed_plugin_is_skipped() {
        let mut registry = PluginRegistry::new();
        let (good, good_final) = fake("GOOD", 2, false);
        let (bad, bad_final) = fake("BAD", 3, true);
        registry.register(bad);
        registry.register(good);
        registry.init_all();

        assert_eq!(registry.plugins(), vec!["BAD", "GOOD"]);
        assert_eq!(registry.devices().len(), 2);
        assert!(registry.plugin_devices("BAD").is_empty());
        assert_eq!(registry.plugin_devices("GOOD").len(), 2);

        registry.finalize_all().unwrap();
        assert_eq!(good_final.load(Ordering::SeqCst), 1);
        assert_eq!(bad_final.load(Ordering::SeqCst), 0);
        assert!(registry.devices().is_empty());
    }

    #[test]
    fn test_devices_keep_registration_order() {
        let mut registry = PluginRegistry::new();
        registry.register(fake("A", 1, false).0);
        registry.register(fake("B", 2, false).0);
        registry.init_all();
        let names: Vec<String> = registry
            .devices()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(names, vec!["A-0", "B-0", "B-1"]);
    }

    #[test]
    fn test_finalize_twice_is_noop() {
        let mut registry = PluginRegistry::new();
        let (plugin, finalized) = fake("A", 1, false);
        registry.register(plugin);
        registry.init_all();
        registry.finalize_all().unwrap();
        registry.finalize_all().unwrap();
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }
}
