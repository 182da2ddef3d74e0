use std::path::Path;
use serde::Deserialize;
use serde_json::{json, Value};
use shared::types::ColorRgb;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Configuration of the LED device, handed to its constructor as JSON
    #[serde(default = "default_device")]
    pub device: Value,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Restrict mDNS to one interface
    #[serde(default)]
    pub interface: Option<String>,
    /// Announce the API over mDNS
    #[serde(default = "default_true")]
    pub advertise: bool,
    #[serde(default)]
    pub instance_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_refresh_hz")]
    pub refresh_hz: u32,
    #[serde(default)]
    pub color: [u8; 3],
    #[serde(default = "default_true")]
    pub enable_on_start: bool,
}

fn default_device() -> Value {
    json!({ "type": "file", "output": "/dev/null" })
}

fn default_true() -> bool {
    true
}

fn default_listen() -> String {
    "[::]:8090".to_string()
}

fn default_refresh_hz() -> u32 {
    25
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interface: None,
            advertise: true,
            instance_name: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            refresh_hz: default_refresh_hz(),
            color: [0, 0, 0],
            enable_on_start: true,
        }
    }
}

impl OutputConfig {
    pub fn color(&self) -> ColorRgb {
        let [red, green, blue] = self.color;
        ColorRgb::new(red, green, blue)
    }
}

impl ApiConfig {
    /// Port part of the listen address, used in the mDNS announcement
    pub fn port(&self) -> u16 {
        self.listen
            .rsplit(':')
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(8090)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        if !config.device.is_object() {
            anyhow::bail!("[device] must be a table");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.device["type"], "file");
        assert!(config.discovery.enabled);
        assert_eq!(config.api.listen, "[::]:8090");
        assert_eq!(config.api.port(), 8090);
        assert_eq!(config.output.refresh_hz, 25);
        assert_eq!(config.output.color(), ColorRgb::BLACK);
    }

    #[test]
    fn test_device_table_becomes_json() {
        let config = Config::parse(
            r#"
            [device]
            type = "udpraw"
            host = "10.0.0.9"
            port = 5568
            hardwareLedCount = 60

            [discovery]
            interface = "eth0"
            advertise = false

            [api]
            listen = "127.0.0.1:9000"

            [output]
            color = [255, 128, 0]
            "#,
        )
        .unwrap();

        assert_eq!(
            config.device,
            json!({"type": "udpraw", "host": "10.0.0.9", "port": 5568, "hardwareLedCount": 60})
        );
        assert_eq!(config.discovery.interface.as_deref(), Some("eth0"));
        assert!(!config.discovery.advertise);
        assert_eq!(config.api.port(), 9000);
        assert_eq!(config.output.color(), ColorRgb::new(255, 128, 0));
    }

    #[test]
    fn test_load_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "device = 5").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("must be a table"));
        assert!(err.to_string().contains(&file.path().display().to_string()));

        assert!(Config::load("/nonexistent/ledhubd.toml").is_err());
    }
}
