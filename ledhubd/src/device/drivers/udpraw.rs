//! Sends each frame as plain RGB byte triplets in a single UDP datagram.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;
use shared::types::ColorRgb;
use crate::device::{CommonConfig, DeviceEvents, LedDevice};

const DEFAULT_PORT: u16 = 5568;

#[derive(Debug, Deserialize)]
struct UdpRawConfig {
    #[serde(default)]
    host: Option<String>,
    #[serde(default = "default_port")]
    port: u16,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

pub struct UdpRawDevice {
    common: CommonConfig,
    host: Option<String>,
    port: u16,
    socket: Option<UdpSocket>,
    target: Option<SocketAddr>,
    events: Option<DeviceEvents>,
    enabled: bool,
    on: bool,
}

impl UdpRawDevice {
    pub fn construct(config: &Value) -> anyhow::Result<Box<dyn LedDevice>> {
        let common = CommonConfig::from_config(config)?;
        let settings: UdpRawConfig = serde_json::from_value(config.clone())
            .context("Invalid udpraw device settings")?;

        Ok(Box::new(Self {
            common,
            host: settings.host.filter(|host| !host.is_empty()),
            port: settings.port,
            socket: None,
            target: None,
            events: None,
            enabled: false,
            on: false,
        }))
    }

    fn connect(&mut self) -> anyhow::Result<()> {
        let host = self
            .host
            .as_deref()
            .context("No host configured and none discovered")?;
        let target = (host, self.port)
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve {}", host))?
            .next()
            .with_context(|| format!("No address for {}", host))?;
        let bind = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind).context("Failed to bind UDP socket")?;

        tracing::info!("udpraw device sending to {}", target);
        self.socket = Some(socket);
        self.target = Some(target);
        Ok(())
    }

    fn fault(&mut self) {
        self.socket = None;
        self.enabled = false;
        self.on = false;
        if let Some(events) = &self.events {
            events.enable_state_changed(false);
        }
    }

    fn send(&mut self, frame: &[ColorRgb]) {
        let (Some(socket), Some(target)) = (&self.socket, self.target) else {
            return;
        };
        let payload: Vec<u8> = frame
            .iter()
            .flat_map(|c| [c.red, c.green, c.blue])
            .collect();

        if let Err(e) = socket.send_to(&payload, target) {
            tracing::error!("Failed to send frame to {}: {}", target, e);
            self.fault();
        }
    }
}

impl LedDevice for UdpRawDevice {
    fn start(&mut self, events: DeviceEvents) {
        self.events = Some(events);
        if let Err(e) = self.connect() {
            // stays disabled until a host is known
            tracing::warn!("udpraw device not ready: {:#}", e);
        }
    }

    fn stop(&mut self) {
        self.switch_off();
        self.enabled = false;
        self.socket = None;
    }

    fn enable(&mut self) {
        if self.enabled {
            return;
        }
        if self.socket.is_none() {
            if let Err(e) = self.connect() {
                tracing::warn!("udpraw device cannot be enabled: {:#}", e);
                return;
            }
        }
        self.enabled = true;
        self.on = true;
    }

    fn disable(&mut self) {
        self.switch_off();
        self.enabled = false;
    }

    fn switch_on(&mut self) {
        if self.enabled {
            self.on = true;
        }
    }

    fn switch_off(&mut self) {
        if self.on {
            let black = vec![ColorRgb::BLACK; self.common.hardware_led_count as usize];
            self.send(&black);
            self.on = false;
        }
    }

    fn update_leds(&mut self, frame: &[ColorRgb]) {
        if self.enabled && self.on {
            self.send(frame);
        }
    }

    fn latch_time(&self) -> i32 {
        self.common.latch_time
    }

    fn active_device_type(&self) -> String {
        self.common.device_type.clone()
    }

    fn color_order(&self) -> String {
        self.common.color_order.clone()
    }

    fn led_count(&self) -> u32 {
        self.common.hardware_led_count
    }

    fn component_state(&self) -> Option<bool> {
        Some(self.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use serde_json::json;

    #[test]
    fn test_sends_raw_rgb_bytes() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let port = receiver.local_addr().unwrap().port();

        let mut device = UdpRawDevice::construct(&json!({
            "type": "udpraw",
            "host": "127.0.0.1",
            "port": port,
            "hardwareLedCount": 2,
        }))
        .unwrap();
        let (events, _rx) = DeviceEvents::channel();
        device.start(events);
        device.enable();
        device.update_leds(&[ColorRgb::new(1, 2, 3), ColorRgb::new(4, 5, 6)]);

        let mut buf = [0u8; 64];
        let len = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[1, 2, 3, 4, 5, 6]);

        device.stop();
        let len = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[0; 6]);
    }

    #[test]
    fn test_refuses_to_enable_without_host() {
        let mut device = UdpRawDevice::construct(&json!({"type": "udpraw"})).unwrap();
        let (events, _rx) = DeviceEvents::channel();
        device.start(events);
        device.enable();

        assert_eq!(device.component_state(), Some(false));
    }

    #[test]
    fn test_default_port() {
        let settings: UdpRawConfig = serde_json::from_value(json!({"type": "udpraw"})).unwrap();
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.host, None);
    }
}
