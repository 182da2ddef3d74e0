//! Debug device that writes every frame as a line of text.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use anyhow::Context;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use shared::types::ColorRgb;
use crate::device::{CommonConfig, DeviceEvents, LedDevice};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileConfig {
    #[serde(default = "default_output")]
    output: PathBuf,
    #[serde(default)]
    print_time_stamp: bool,
}

fn default_output() -> PathBuf {
    PathBuf::from("/dev/null")
}

pub struct FileDevice {
    common: CommonConfig,
    output: PathBuf,
    print_time_stamp: bool,
    writer: Option<BufWriter<File>>,
    events: Option<DeviceEvents>,
    enabled: bool,
    on: bool,
}

impl FileDevice {
    pub fn construct(config: &Value) -> anyhow::Result<Box<dyn LedDevice>> {
        let common = CommonConfig::from_config(config)?;
        let settings: FileConfig = serde_json::from_value(config.clone())
            .context("Invalid file device settings")?;

        Ok(Box::new(Self {
            common,
            output: settings.output,
            print_time_stamp: settings.print_time_stamp,
            writer: None,
            events: None,
            enabled: false,
            on: false,
        }))
    }

    fn open(&mut self) -> bool {
        if self.writer.is_some() {
            return true;
        }
        match File::create(&self.output) {
            Ok(file) => {
                tracing::debug!("Writing LED frames to {}", self.output.display());
                self.writer = Some(BufWriter::new(file));
                true
            }
            Err(e) => {
                tracing::error!("Failed to open {}: {}", self.output.display(), e);
                false
            }
        }
    }

    fn fault(&mut self) {
        self.writer = None;
        self.enabled = false;
        self.on = false;
        if let Some(events) = &self.events {
            events.enable_state_changed(false);
        }
    }

    fn write_frame(&mut self, frame: &[ColorRgb]) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };

        let colors: Vec<String> = frame
            .iter()
            .map(|c| format!("{{{},{},{}}}", c.red, c.green, c.blue))
            .collect();
        let line = if self.print_time_stamp {
            format!("{} [{}]", Utc::now().to_rfc3339(), colors.join(", "))
        } else {
            format!("[{}]", colors.join(", "))
        };

        let result = writeln!(writer, "{}", line).and_then(|_| writer.flush());
        if let Err(e) = result {
            tracing::error!("Failed to write to {}: {}", self.output.display(), e);
            self.fault();
        }
    }
}

impl LedDevice for FileDevice {
    fn start(&mut self, events: DeviceEvents) {
        self.events = Some(events);
        if !self.open() {
            self.fault();
        }
    }

    fn stop(&mut self) {
        self.switch_off();
        self.enabled = false;
        self.writer = None;
    }

    fn enable(&mut self) {
        if self.enabled {
            return;
        }
        if self.open() {
            self.enabled = true;
            self.on = true;
        } else {
            tracing::warn!("File device cannot be enabled without an output file");
        }
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
            self.write_frame(&black);
            self.on = false;
        }
    }

    fn update_leds(&mut self, frame: &[ColorRgb]) {
        if self.enabled && self.on {
            self.write_frame(frame);
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
