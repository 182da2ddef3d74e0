pub mod file;
pub mod udpraw;

use serde_json::Value;
use shared::protocol::UDPRAW_SERVICE_TYPE;
use super::registry::DeviceRegistry;
use super::LedDevice;

/// A device type compiled into the daemon.
pub struct BuiltinDevice {
    pub type_name: &'static str,
    pub discovery: Option<&'static str>,
    pub construct: fn(&Value) -> anyhow::Result<Box<dyn LedDevice>>,
}

pub const BUILTIN_DEVICES: &[BuiltinDevice] = &[
    BuiltinDevice {
        type_name: "file",
        discovery: None,
        construct: file::FileDevice::construct,
    },
    BuiltinDevice {
        type_name: "udpraw",
        discovery: Some(UDPRAW_SERVICE_TYPE),
        construct: udpraw::UdpRawDevice::construct,
    },
];

/// Register every built-in device type. Run once at startup, before the
/// first device is created.
pub fn register_builtin_devices(registry: &DeviceRegistry) {
    for builtin in BUILTIN_DEVICES {
        registry.register(builtin.type_name, builtin.discovery, builtin.construct);
    }
    tracing::debug!("Registered {} built-in device types", BUILTIN_DEVICES.len());
}
