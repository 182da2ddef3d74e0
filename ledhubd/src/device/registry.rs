use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use serde_json::Value;
use super::LedDevice;

/// Builds a device from its JSON configuration.
pub type DeviceConstructor =
    Arc<dyn Fn(&Value) -> anyhow::Result<Box<dyn LedDevice>> + Send + Sync>;

/// A registered device type.
#[derive(Clone)]
pub struct DeviceDescriptor {
    pub type_name: String,
    pub construct: DeviceConstructor,
    /// Service type the device needs discovered before it can be built.
    pub discovery: Option<String>,
}

impl fmt::Debug for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceDescriptor")
            .field("type_name", &self.type_name)
            .field("discovery", &self.discovery)
            .finish_non_exhaustive()
    }
}

/// Mapping from lowercase device type name to its descriptor.
///
/// Constructors are cloned out and invoked after the lock is released, so a
/// constructor may itself register further types.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, DeviceDescriptor>>,
}

static GLOBAL: OnceLock<Arc<DeviceRegistry>> = OnceLock::new();

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<DeviceRegistry> {
        GLOBAL.get_or_init(|| Arc::new(DeviceRegistry::new())).clone()
    }

    /// Insert or replace the constructor for `type_name`. Last writer wins.
    pub fn register<F>(&self, type_name: &str, discovery: Option<&str>, construct: F)
    where
        F: Fn(&Value) -> anyhow::Result<Box<dyn LedDevice>> + Send + Sync + 'static,
    {
        let name = type_name.to_lowercase();
        let descriptor = DeviceDescriptor {
            type_name: name.clone(),
            construct: Arc::new(construct),
            discovery: discovery.map(str::to_string),
        };

        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        if devices.insert(name.clone(), descriptor).is_some() {
            tracing::debug!("Replaced constructor for device type {}", name);
        }
    }

    pub fn lookup(&self, type_name: &str) -> Option<DeviceDescriptor> {
        let devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        devices.get(&type_name.to_lowercase()).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, DeviceDescriptor> {
        let devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        devices
            .iter()
            .map(|(name, descriptor)| (name.clone(), descriptor.clone()))
            .collect()
    }

    /// Distinct discovery service types declared by registered devices.
    pub fn discovery_service_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .snapshot()
            .into_values()
            .filter_map(|descriptor| descriptor.discovery)
            .collect();
        types.sort();
        types.dedup();
        types
    }
}
