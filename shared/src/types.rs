use std::collections::HashMap;
use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// A service found by one of the discovery backends.
/// Consumers only ever see cloned snapshots of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredService {
    /// Fully qualified service type, e.g. "_hue._tcp.local."
    pub service_type: String,

    /// Instance name without the type suffix, e.g. "kitchen"
    pub instance_name: String,

    /// Hostname, e.g. "hue-bridge.local."
    pub hostname: String,

    /// Address once the instance has been resolved
    pub resolved_address: Option<IpAddr>,

    /// Service port once known
    pub port: Option<u16>,

    /// TXT record key-value pairs
    pub txt: HashMap<String, String>,

    /// First time this service was seen
    pub first_seen: DateTime<Utc>,

    /// Last time any event touched this service
    pub last_seen: DateTime<Utc>,
}

/// One LED color value of an output frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorRgb {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl ColorRgb {
    pub const BLACK: ColorRgb = ColorRgb { red: 0, green: 0, blue: 0 };

    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }
}
