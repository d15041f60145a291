//! Device filters applied when a region picks the devices it measures.

use std::fmt;
use std::sync::Arc;

use crate::device::Device;

type Predicate = dyn Fn(&Device) -> bool + Send + Sync;

/// Selects the devices a region measures. Devices for which the predicate
/// returns `false` are dropped.
#[derive(Clone)]
pub struct Filter {
    description: String,
    keep: Arc<Predicate>,
}

impl Filter {
    pub fn new<F>(description: impl Into<String>, keep: F) -> Self
    where
        F: Fn(&Device) -> bool + Send + Sync + 'static,
    {
        Filter {
            description: description.into(),
            keep: Arc::new(keep),
        }
    }

    /// Drop every device of the plugin called `plugin_name`.
    pub fn exclude_plugin(plugin_name: impl Into<String>) -> Self {
        let plugin_name = plugin_name.into();
        let description = format!("exclude plugin {}", plugin_name);
        Filter::new(description, move |device| device.plugin() != plugin_name)
    }

    pub fn keeps(&self, device: &Device) -> bool {
        (self.keep)(device)
    }

    pub fn apply(&self, devices: &[Arc<Device>]) -> Vec<Arc<Device>> {
        devices
            .iter()
            .filter(|device| self.keeps(device))
            .cloned()
            .collect()
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Filter").field(&self.description).finish()
    }
}
