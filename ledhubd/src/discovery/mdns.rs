use std::collections::HashMap;
use std::net::IpAddr;
use futures::{future, stream, StreamExt};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use shared::protocol::{instance_from_fullname, normalize_service_type};
use crate::error::DiscoveryError;
use super::{BackendEvent, DiscoveryBackend, EventStream, LocalService, ServiceKey, ServiceRecord};

const BACKEND_NAME: &str = "mdns";

/// Discovery backend on top of the `mdns-sd` daemon.
pub struct MdnsBackend {
    interface: Option<String>,
    daemon: Option<ServiceDaemon>,
    registered: Vec<String>,
}

impl MdnsBackend {
    /// `interface` pins the daemon to one network interface.
    pub fn new(interface: Option<String>) -> Self {
        Self {
            interface,
            daemon: None,
            registered: Vec::new(),
        }
    }

    fn daemon(&self) -> Result<&ServiceDaemon, DiscoveryError> {
        self.daemon
            .as_ref()
            .ok_or(DiscoveryError::BackendUnavailable(BACKEND_NAME))
    }
}

fn start_error(reason: impl ToString) -> DiscoveryError {
    DiscoveryError::BackendStart {
        backend: BACKEND_NAME,
        reason: reason.to_string(),
    }
}

impl DiscoveryBackend for MdnsBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn start(&mut self) -> Result<EventStream, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(start_error)?;

        if let Some(interface) = &self.interface {
            daemon
                .disable_interface(mdns_sd::IfKind::All)
                .map_err(start_error)?;
            daemon
                .enable_interface(interface.as_str())
                .map_err(|e| start_error(format!("interface {}: {}", interface, e)))?;
        }
        self.daemon = Some(daemon);

        // mdns-sd never renames the host, so the only hostname event is the initial one
        let hostname = match hostname::get() {
            Ok(name) => Some(BackendEvent::HostnameChanged(name.to_string_lossy().to_string())),
            Err(e) => {
                tracing::warn!("Failed to get system hostname: {}", e);
                None
            }
        };
        Ok(stream::iter(hostname).boxed())
    }

    fn browse(&mut self, service_type: &str) -> Result<EventStream, DiscoveryError> {
        let receiver = self
            .daemon()?
            .browse(service_type)
            .map_err(|e| DiscoveryError::Browse {
                service_type: service_type.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!("Browsing mDNS for {}", service_type);
        Ok(receiver
            .into_stream()
            .filter_map(|event| future::ready(convert_event(event)))
            .boxed())
    }

    fn resolve(&mut self, key: &ServiceKey) -> Result<(), DiscoveryError> {
        self.daemon()?;
        // the daemon resolves every instance it finds on its own
        tracing::trace!("Waiting for mDNS to resolve {}", key.instance_name);
        Ok(())
    }

    fn advertise(&mut self, service: &LocalService) -> Result<(), DiscoveryError> {
        let advertise_error = |reason: String| DiscoveryError::Advertise {
            name: service.instance_name.clone(),
            reason,
        };

        let hostname = hostname::get()
            .map_err(|e| advertise_error(format!("failed to get system hostname: {}", e)))?
            .to_string_lossy()
            .to_string();

        let service_info = ServiceInfo::new(
            &service.service_type,
            &service.instance_name,
            &format!("{}.local.", hostname),
            "",
            service.port,
            service.txt.clone(),
        )
        .map_err(|e| advertise_error(e.to_string()))?
        .enable_addr_auto();

        let fullname = service_info.get_fullname().to_string();
        self.daemon()?
            .register(service_info)
            .map_err(|e| advertise_error(e.to_string()))?;

        tracing::info!(
            "Registered {} as {} on port {}",
            service.service_type,
            service.instance_name,
            service.port
        );
        self.registered.push(fullname);
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), DiscoveryError> {
        let Some(daemon) = self.daemon.take() else {
            return Ok(());
        };

        for fullname in self.registered.drain(..) {
            match daemon.unregister(&fullname) {
                Ok(_) => tracing::info!("Unregistered {}", fullname),
                Err(e) => tracing::error!("Failed to unregister {}: {}", fullname, e),
            }
        }

        daemon.shutdown().map_err(|e| DiscoveryError::BackendStart {
            backend: BACKEND_NAME,
            reason: format!("shutdown failed: {}", e),
        })?;
        Ok(())
    }
}

fn convert_event(event: ServiceEvent) -> Option<BackendEvent> {
    match event {
        ServiceEvent::ServiceFound(service_type, fullname) => {
            tracing::debug!("Found service: {}", fullname);
            Some(BackendEvent::Added(ServiceRecord {
                key: service_key(&service_type, &fullname),
                hostname: String::new(),
                address: None,
                port: None,
                txt: HashMap::new(),
            }))
        }
        ServiceEvent::ServiceResolved(info) => {
            tracing::debug!("Resolved service: {}", info.get_fullname());
            Some(BackendEvent::Updated(convert_service_info(&info)))
        }
        ServiceEvent::ServiceRemoved(service_type, fullname) => {
            tracing::debug!("Service removed: {}", fullname);
            Some(BackendEvent::Removed(service_key(&service_type, &fullname)))
        }
        _ => None,
    }
}

fn service_key(service_type: &str, fullname: &str) -> ServiceKey {
    ServiceKey {
        service_type: normalize_service_type(service_type),
        instance_name: instance_from_fullname(fullname, service_type).to_string(),
    }
}

/// Convert an mdns-sd ServiceInfo into a backend record.
fn convert_service_info(info: &ServiceInfo) -> ServiceRecord {
    // LED controllers are usually IPv4-only, prefer that when both are announced
    let address = info
        .get_addresses()
        .iter()
        .copied()
        .min_by_key(|addr: &IpAddr| (addr.is_ipv6(), *addr));

    let txt: HashMap<String, String> = info
        .get_properties()
        .iter()
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect();

    ServiceRecord {
        key: service_key(info.get_type(), info.get_fullname()),
        hostname: info.get_hostname().to_string(),
        address,
        port: Some(info.get_port()),
        txt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_found_becomes_unresolved_record() {
        let event = ServiceEvent::ServiceFound(
            "_hue._tcp.local.".to_string(),
            "kitchen._hue._tcp.local.".to_string(),
        );
        match convert_event(event) {
            Some(BackendEvent::Added(record)) => {
                assert_eq!(record.key.service_type, "_hue._tcp.local.");
                assert_eq!(record.key.instance_name, "kitchen");
                assert!(record.address.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_resolved_service_carries_address_and_txt() {
        let info = ServiceInfo::new(
            "_udpraw._udp.local.",
            "strip",
            "strip.local.",
            "192.168.1.20",
            5568,
            HashMap::from([("leds".to_string(), "60".to_string())]),
        )
        .unwrap();

        match convert_event(ServiceEvent::ServiceResolved(info)) {
            Some(BackendEvent::Updated(record)) => {
                assert_eq!(record.key.instance_name, "strip");
                assert_eq!(record.hostname, "strip.local.");
                assert_eq!(record.address, Some("192.168.1.20".parse().unwrap()));
                assert_eq!(record.port, Some(5568));
                assert_eq!(record.txt.get("leds").map(String::as_str), Some("60"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_search_events_are_ignored() {
        let event = ServiceEvent::SearchStarted("_hue._tcp.local.".to_string());
        assert!(convert_event(event).is_none());
    }
}
