pub mod drivers;
pub mod manager;
pub mod registry;
pub mod schemas;
pub mod worker;

use serde::Deserialize;
use serde_json::Value;
use shared::types::ColorRgb;
use tokio::sync::mpsc;
use crate::error::DeviceError;

/// An LED output device. Every method runs on the device's own worker
/// thread, never concurrently with another method of the same device.
pub trait LedDevice: Send {
    /// Called once on the worker thread before any other command.
    fn start(&mut self, events: DeviceEvents);

    /// Turn the LEDs off and halt any internal activity. The caller waits
    /// for this to return before the worker is torn down.
    fn stop(&mut self);

    fn enable(&mut self);
    fn disable(&mut self);
    fn switch_on(&mut self);
    fn switch_off(&mut self);

    /// Write one frame. Devices that cannot keep up drop or coalesce frames
    /// themselves.
    fn update_leds(&mut self, frame: &[ColorRgb]);

    fn latch_time(&self) -> i32 {
        0
    }

    fn active_device_type(&self) -> String;

    fn color_order(&self) -> String {
        "rgb".to_string()
    }

    fn led_count(&self) -> u32;

    /// Actual enable state, or `None` if the device has no way to tell.
    fn component_state(&self) -> Option<bool> {
        None
    }
}

/// Notifications a device sends back to its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceNotification {
    EnableStateChanged(bool),
}

/// Sending half of a device's notification channel.
#[derive(Debug, Clone)]
pub struct DeviceEvents {
    tx: mpsc::UnboundedSender<DeviceNotification>,
}

impl DeviceEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DeviceNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report a spontaneous enable state change (fault entered or cleared).
    pub fn enable_state_changed(&self, enabled: bool) {
        if self.tx.send(DeviceNotification::EnableStateChanged(enabled)).is_err() {
            tracing::debug!("Dropping enable state change, manager detached");
        }
    }
}

/// Settings every built-in device understands.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonConfig {
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default = "default_led_count")]
    pub hardware_led_count: u32,
    #[serde(default = "default_color_order")]
    pub color_order: String,
    #[serde(default)]
    pub latch_time: i32,
}

fn default_led_count() -> u32 {
    1
}

fn default_color_order() -> String {
    "rgb".to_string()
}

impl CommonConfig {
    pub fn from_config(config: &Value) -> Result<Self, DeviceError> {
        let mut common: CommonConfig = serde_json::from_value(config.clone()).map_err(|e| {
            DeviceError::InvalidConfig {
                device_type: device_type_of(config).unwrap_or_default(),
                reason: e.to_string(),
            }
        })?;
        common.device_type = common.device_type.to_lowercase();
        Ok(common)
    }
}

/// Lowercased `type` field of a device configuration.
pub fn device_type_of(config: &Value) -> Result<String, DeviceError> {
    config
        .get("type")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_lowercase)
        .ok_or(DeviceError::MissingType)
}
