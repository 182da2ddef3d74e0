pub mod gateway;
pub mod hash;
pub mod mdns;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::net::IpAddr;
use std::pin::Pin;
use futures::Stream;
use crate::error::DiscoveryError;

/// Identifies one advertised service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    /// Normalised service type, e.g. "_hue._tcp.local."
    pub service_type: String,
    pub instance_name: String,
}

/// What a backend knows about an instance when it reports it.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub key: ServiceKey,
    pub hostname: String,
    pub address: Option<IpAddr>,
    pub port: Option<u16>,
    pub txt: HashMap<String, String>,
}

/// Events a backend delivers to its gateway.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Added(ServiceRecord),
    Updated(ServiceRecord),
    Resolved {
        key: ServiceKey,
        address: IpAddr,
        port: Option<u16>,
    },
    Removed(ServiceKey),
    HostnameChanged(String),
}

pub type EventStream = Pin<Box<dyn Stream<Item = BackendEvent> + Send>>;

/// A service this process publishes about itself.
#[derive(Debug, Clone)]
pub struct LocalService {
    pub service_type: String,
    pub instance_name: String,
    pub port: u16,
    pub txt: HashMap<String, String>,
}

/// A service discovery mechanism (mDNS, Bonjour, ...). Owned and driven by
/// exactly one gateway task.
pub trait DiscoveryBackend: Send + 'static {
    fn name(&self) -> &'static str;

    /// Bring the backend up. The returned stream carries host-level events
    /// such as hostname changes.
    fn start(&mut self) -> Result<EventStream, DiscoveryError>;

    /// Subscribe to one service type.
    fn browse(&mut self, service_type: &str) -> Result<EventStream, DiscoveryError>;

    /// Ask for the address of an instance. The answer arrives as an event.
    fn resolve(&mut self, key: &ServiceKey) -> Result<(), DiscoveryError>;

    fn advertise(&mut self, service: &LocalService) -> Result<(), DiscoveryError> {
        let _ = service;
        Err(DiscoveryError::AdvertiseUnsupported(self.name()))
    }

    fn shutdown(&mut self) -> Result<(), DiscoveryError>;
}
