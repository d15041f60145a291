//! The measurement session.
//!
//! An [`Ema`] owns the plugin registry, the overflow tracker and the region
//! stores. It is created once, shared by reference with every thread that
//! defines regions, and finalized at the end of the program.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::device::Device;
use crate::filter::Filter;
use crate::output;
use crate::overflow::OverflowTracker;
use crate::plugin::{Plugin, PluginRegistry};
use crate::plugins::RaplPlugin;
use crate::region::{CodeLocation, Region};
use crate::region_store::RegionStores;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub struct EmaBuilder {
    config: Config,
    builtin_plugins: bool,
    plugins: Vec<Box<dyn Plugin>>,
}

impl EmaBuilder {
    /// Register an additional plugin. User plugins are initialized after the
    /// built-in ones.
    pub fn plugin<P: Plugin + 'static>(mut self, plugin: P) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    /// Skip RAPL and NVML regardless of the configuration.
    pub fn without_builtin_plugins(mut self) -> Self {
        self.builtin_plugins = false;
        self
    }

    pub fn init(self) -> Result<Ema> {
        let mut registry = PluginRegistry::new();
        if self.builtin_plugins {
            register_builtin_plugins(&self.config, &mut registry);
        }
        for plugin in self.plugins {
            registry.register(plugin);
        }
        registry.init_all();

        let tracker = OverflowTracker::start(registry.devices())?;

        Ok(Ema {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            config: self.config,
            registry,
            tracker,
            stores: RegionStores::new(),
            finalized: false,
        })
    }
}

fn register_builtin_plugins(config: &Config, registry: &mut PluginRegistry) {
    if config.nvml {
        #[cfg(feature = "nvml")]
        registry.register(Box::new(crate::plugins::NvmlPlugin::new(
            config.nvml_library.clone(),
        )));
        #[cfg(not(feature = "nvml"))]
        tracing::warn!("NVML requested but ema was built without the nvml feature");
    }
    if config.rapl {
        registry.register(Box::new(RaplPlugin::new(config.powercap_root.clone())));
    }
}

pub struct Ema {
    id: u64,
    config: Config,
    registry: PluginRegistry,
    tracker: Option<OverflowTracker>,
    stores: RegionStores,
    finalized: bool,
}

impl Ema {
    /// Start a session with the built-in plugins enabled in `config`.
    pub fn init(config: Config) -> Result<Ema> {
        Self::builder(config).init()
    }

    pub fn builder(config: Config) -> EmaBuilder {
        EmaBuilder {
            config,
            builtin_plugins: true,
            plugins: Vec::new(),
        }
    }

    /// Process-unique id, carried by every region the session creates.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn plugins(&self) -> Vec<&str> {
        self.registry.plugins()
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.registry.devices()
    }

    pub fn plugin_devices(&self, plugin: &str) -> Vec<Arc<Device>> {
        self.registry.plugin_devices(plugin)
    }

    /// Create a region that is not registered for reporting.
    pub fn region_create(
        &self,
        idf: &str,
        filter: Option<&Filter>,
        location: CodeLocation,
    ) -> Region {
        let devices = self.registry.devices();
        let devices = match filter {
            Some(filter) => filter.apply(&devices),
            None => devices,
        };
        Region::new(idf, location, devices).in_session(self.id)
    }

    /// Create a region and register it in the calling thread's store.
    ///
    /// Defining a region with the same identifier at the same location again
    /// from the same thread returns the region defined first.
    pub fn region_define(
        &self,
        idf: &str,
        filter: Option<&Filter>,
        location: CodeLocation,
    ) -> Result<Region> {
        self.stores
            .define(self.region_create(idf, filter, location))
    }

    pub fn region_stores(&self) -> &RegionStores {
        &self.stores
    }

    /// Write the report of all defined regions to `writer`.
    pub fn print_all<W: Write>(&self, writer: W) -> Result<()> {
        let rows = output::collect_rows(&self.stores);
        output::write_rows(&rows, self.config.output_format, writer)
    }

    /// Write the report to `output.EMA.<pid>` in the output directory.
    pub fn write_results(&self) -> Result<PathBuf> {
        output::write_results(
            &self.stores,
            self.config.output_format,
            &self.config.output_dir,
        )
    }

    /// Write results if enabled, stop overflow tracking and finalize the
    /// plugins. Teardown continues past a failed report; the first error is
    /// returned.
    pub fn finalize(mut self) -> Result<()> {
        let report = if self.config.write_results {
            self.write_results().map(|_| ())
        } else {
            Ok(())
        };
        let teardown = self.shutdown();
        self.stores.clear();
        report.and(teardown)
    }

    fn shutdown(&mut self) -> Result<()> {
        self.finalized = true;
        let tracker = match self.tracker.take() {
            Some(tracker) => tracker.stop(),
            None => Ok(()),
        };
        let plugins = self.registry.finalize_all();
        tracker.and(plugins)
    }
}

impl Drop for Ema {
    fn drop(&mut self) {
        if !self.finalized {
            if let Err(err) = self.shutdown() {
                tracing::warn!("Failed to shut down EMA session: {:#}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::device::testing::manual_device;
    use crate::device::DeviceKind;

    struct Manual {
        name: &'static str,
        devices: Vec<Device>,
    }

    impl Plugin for Manual {
        fn name(&self) -> &str {
            self.name
        }

        fn init(&mut self) -> Result<Vec<Device>> {
            Ok(std::mem::take(&mut self.devices))
        }
    }

    fn config(dir: &std::path::Path) -> Config {
        Config {
            output_dir: dir.to_path_buf(),
            ..Config::default()
        }
    }

    #[test]
    fn test_builder_with_user_plugins() {
        let dir = tempfile::tempdir().unwrap();
        let (cpu, cpu_value) = manual_device("CPU", "cpu0", 0, u64::MAX, 0);
        let (gpu, _) = manual_device("GPU", "gpu0", 0, u64::MAX, 0);
        let ema = Ema::builder(config(dir.path()))
            .without_builtin_plugins()
            .plugin(Manual {
                name: "CPU",
                devices: vec![cpu],
            })
            .plugin(Manual {
                name: "GPU",
                devices: vec![gpu],
            })
            .init()
            .unwrap();

        assert_eq!(ema.plugins(), vec!["CPU", "GPU"]);
        assert_eq!(ema.devices().len(), 2);
        assert_eq!(ema.plugin_devices("GPU")[0].name(), "gpu0");
        assert_eq!(ema.devices()[0].kind(), DeviceKind::Misc);

        let filter = Filter::exclude_plugin("GPU");
        let region = ema
            .region_define("r", Some(&filter), CodeLocation::new("a.rs", 1, "f"))
            .unwrap();
        region.begin().unwrap();
        cpu_value.store(25, Ordering::SeqCst);
        region.end().unwrap();

        let mut buf = Vec::new();
        ema.print_all(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("0,r,a.rs,1,f,1,cpu0,misc,25,"));

        ema.finalize().unwrap();
        let report = dir.path().join(format!("output.EMA.{}", std::process::id()));
        assert!(report.exists());
    }

    #[test]
    fn test_region_create_is_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        let ema = Ema::builder(config(dir.path()))
            .without_builtin_plugins()
            .init()
            .unwrap();
        let region = ema.region_create("loose", None, CodeLocation::default());
        region.begin().unwrap();
        region.end().unwrap();
        assert_eq!(ema.region_stores().thread_count(), 0);
        assert_eq!(region.session_id(), ema.id());
    }

    #[test]
    fn test_sessions_get_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let first = Ema::builder(config(dir.path()))
            .without_builtin_plugins()
            .init()
            .unwrap();
        let second = Ema::builder(config(dir.path()))
            .without_builtin_plugins()
            .init()
            .unwrap();
        assert_ne!(first.id(), second.id());
        assert_ne!(first.id(), 0);
    }

    #[test]
    fn test_finalize_without_report() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.write_results = false;
        let ema = Ema::builder(config)
            .without_builtin_plugins()
            .init()
            .unwrap();
        ema.finalize().unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_powercap_tree_yields_no_devices() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            output_dir: dir.path().to_path_buf(),
            write_results: false,
            nvml: false,
            powercap_root: dir.path().join("no-such-powercap"),
            ..Config::default()
        };
        let ema = Ema::init(config).unwrap();
        assert_eq!(ema.plugins(), vec!["RAPL"]);
        assert!(ema.devices().is_empty());
        ema.finalize().unwrap();
    }
}
