use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use serde::Serialize;
use serde_json::Value;
use shared::types::{ColorRgb, DiscoveredService};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::controller::{Component, Controller};
use crate::discovery::gateway::DiscoveryHandle;
use crate::error::DeviceError;
use super::registry::{DeviceDescriptor, DeviceRegistry};
use super::worker::{DeviceCommand, DeviceWorker};
use super::{device_type_of, DeviceEvents, DeviceNotification};

/// Lifecycle of the single device slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Empty,
    Starting,
    Running,
    Stopping,
}

/// State shared between the manager and the notification forwarder of the
/// active device.
struct ManagerShared {
    controller: Arc<dyn Controller>,
    enabled: AtomicBool,
}

impl ManagerShared {
    fn publish(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        self.controller.set_component_state(Component::LedDevice, enabled);
    }

    fn handle_internal_enable_state(&self, enabled: bool) {
        tracing::info!("LED device reports it is {}", if enabled { "enabled" } else { "disabled" });
        self.publish(enabled);
        if enabled {
            // do not leave the device showing a stale frame
            self.controller.request_update();
        }
    }
}

struct ActiveDevice {
    device_type: String,
    /// Configuration as requested, before discovery filled anything in
    requested: Value,
    config: Value,
    /// Built before its service was resolved; rebuilt once it is
    awaiting_discovery: bool,
    worker: DeviceWorker,
    forwarder: JoinHandle<()>,
}

/// Owns at most one LED device and the thread it runs on.
///
/// Callers serialise `create_device`/`stop_device_thread` themselves; both
/// take `&mut self`.
pub struct LedDeviceManager {
    registry: Arc<DeviceRegistry>,
    gateways: Vec<DiscoveryHandle>,
    shared: Arc<ManagerShared>,
    active: Option<ActiveDevice>,
    state: SlotState,
    controller_requested: bool,
}

impl LedDeviceManager {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        gateways: Vec<DiscoveryHandle>,
        controller: Arc<dyn Controller>,
    ) -> Self {
        let shared = Arc::new(ManagerShared {
            controller,
            enabled: AtomicBool::new(false),
        });
        shared.publish(false);

        Self {
            registry,
            gateways,
            shared,
            active: None,
            state: SlotState::Empty,
            controller_requested: false,
        }
    }

    /// Subscribe every gateway to the service types registered devices need.
    pub async fn start_discovery(&self) {
        for service_type in self.registry.discovery_service_types() {
            for gateway in &self.gateways {
                match gateway.browse_for_service_type(&service_type).await {
                    Ok(outcome) => tracing::debug!(
                        "Browsing {} on {}: {:?}",
                        service_type,
                        gateway.backend_name(),
                        outcome
                    ),
                    Err(e) => tracing::error!(
                        "Failed to browse {} on {}: {}",
                        service_type,
                        gateway.backend_name(),
                        e
                    ),
                }
            }
        }
    }

    /// Replace the active device with one built from `config`.
    ///
    /// On error no device is left active.
    pub async fn create_device(&mut self, config: &Value) -> Result<(), DeviceError> {
        if self.active.is_some() {
            self.stop_device_thread().await;
        }

        let device_type = device_type_of(config)?;
        let descriptor = self
            .registry
            .lookup(&device_type)
            .ok_or_else(|| DeviceError::UnknownDeviceType(device_type.clone()))?;

        self.state = SlotState::Starting;
        let requested = config.clone();
        let (config, awaiting_discovery) = self.apply_discovery(&descriptor, config);

        let device = match (descriptor.construct)(&config) {
            Ok(device) => device,
            Err(e) => {
                self.state = SlotState::Empty;
                return Err(DeviceError::InvalidConfig {
                    device_type,
                    reason: format!("{:#}", e),
                });
            }
        };

        let (events, notifications) = DeviceEvents::channel();
        let worker = match DeviceWorker::spawn(device, events, &device_type) {
            Ok(worker) => worker,
            Err(e) => {
                self.state = SlotState::Empty;
                return Err(e);
            }
        };
        let forwarder = tokio::spawn(forward_notifications(notifications, self.shared.clone()));

        self.active = Some(ActiveDevice {
            device_type: device_type.clone(),
            requested,
            config,
            awaiting_discovery,
            worker,
            forwarder,
        });

        let started = match &self.active {
            Some(active) => active.worker.start().await,
            None => Ok(()),
        };
        if let Err(e) = started {
            self.stop_device_thread().await;
            return Err(e);
        }

        self.state = SlotState::Running;
        tracing::info!("Started LED device {}", device_type);
        Ok(())
    }

    /// Fill in `host`/`port` from discovery for devices that declare a
    /// service type and were configured without an address. The flag is set
    /// when no resolved service was found yet.
    fn apply_discovery(&self, descriptor: &DeviceDescriptor, config: &Value) -> (Value, bool) {
        let mut config = config.clone();
        let Some(service_type) = &descriptor.discovery else {
            return (config, false);
        };
        if config.get("host").and_then(Value::as_str).is_some_and(|host| !host.is_empty()) {
            return (config, false);
        }

        let filter = config.get("name").and_then(Value::as_str);
        let resolved = self
            .services_discovered(service_type, filter)
            .into_iter()
            .find(|service| service.resolved_address.is_some());

        let awaiting = match (resolved, config.as_object_mut()) {
            (Some(service), Some(object)) => {
                if let Some(address) = service.resolved_address {
                    tracing::info!(
                        "Using discovered {} instance {} at {}",
                        service_type,
                        service.instance_name,
                        address
                    );
                    object.insert("host".to_string(), Value::from(address.to_string()));
                }
                if let Some(port) = service.port {
                    object.entry("port").or_insert(Value::from(port));
                }
                false
            }
            _ => {
                tracing::warn!(
                    "No resolved {} service yet for device {}",
                    service_type,
                    descriptor.type_name
                );
                true
            }
        };
        (config, awaiting)
    }

    /// Rebuild a device that was created before its service was resolved,
    /// if discovery now knows an address for it. Returns whether it was
    /// rebuilt.
    async fn retry_deferred_discovery(&mut self) -> bool {
        let Some(active) = self.active.as_ref().filter(|active| active.awaiting_discovery) else {
            return false;
        };
        let Some(descriptor) = self.registry.lookup(&active.device_type) else {
            return false;
        };
        if self.apply_discovery(&descriptor, &active.requested).1 {
            return false;
        }

        let requested = active.requested.clone();
        tracing::info!("Service for LED device {} resolved, rebuilding it", descriptor.type_name);
        if let Err(e) = self.create_device(&requested).await {
            tracing::error!("Failed to rebuild LED device {}: {}", descriptor.type_name, e);
        }
        true
    }

    /// Discovered services changed. A device still waiting for its service
    /// is rebuilt and, if the controller wants it on, enabled.
    pub async fn services_changed(&mut self) {
        if self.retry_deferred_discovery().await && self.controller_requested {
            self.handle_component_state(Component::LedDevice, true).await;
        }
    }

    /// Whether the active device was built without its discovered address.
    pub fn awaiting_discovery(&self) -> bool {
        self.active.as_ref().is_some_and(|active| active.awaiting_discovery)
    }

    /// Tear down the active device: stop it, close its command channel,
    /// join its thread, disconnect its notifications, then drop it.
    pub async fn stop_device_thread(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        self.state = SlotState::Stopping;
        tracing::info!("Stopping LED device {}", active.device_type);

        if !active.worker.stop().await {
            tracing::warn!("Device {} exited before acknowledging stop", active.device_type);
        }

        active.worker.detach();

        let device = active.worker.join().await;

        active.forwarder.abort();
        let _ = active.forwarder.await;

        match device {
            Ok(device) => drop(device),
            Err(e) => tracing::error!("Lost LED device during teardown: {}", e),
        }

        // the device is gone; what the controller asked for is kept
        self.shared.publish(false);
        self.state = SlotState::Empty;
    }

    /// Tear down whatever is running. Call before dropping the manager.
    pub async fn shutdown(&mut self) {
        self.stop_device_thread().await;
    }

    fn post(&self, cmd: DeviceCommand) {
        match &self.active {
            Some(active) => active.worker.post(cmd),
            None => tracing::trace!("No LED device active, dropping command"),
        }
    }

    /// Queue a frame. Never waits for the device.
    pub fn update_leds(&self, frame: Vec<ColorRgb>) {
        self.post(DeviceCommand::UpdateLeds(frame));
    }

    pub fn switch_on(&self) {
        self.post(DeviceCommand::SwitchOn);
    }

    pub fn switch_off(&self) {
        self.post(DeviceCommand::SwitchOff);
    }

    /// Apply a controller request and publish what the device actually did.
    pub async fn handle_component_state(&mut self, component: Component, requested: bool) {
        if component != Component::LedDevice {
            return;
        }
        self.controller_requested = requested;
        if requested {
            self.retry_deferred_discovery().await;
        }

        let actual = match &self.active {
            Some(active) => {
                active.worker.post(if requested { DeviceCommand::Enable } else { DeviceCommand::Disable });
                match active.worker.component_state().await {
                    Some(Some(state)) => state,
                    // device cannot report its state, take the command as done
                    Some(None) => requested,
                    None => false,
                }
            }
            None => false,
        };

        if actual != requested {
            tracing::warn!(
                "LED device {} stayed {} after request",
                self.active_type_name(),
                if actual { "enabled" } else { "disabled" }
            );
        }
        self.shared.publish(actual);
    }

    /// The device changed state on its own, e.g. a fault or a recovery.
    pub fn handle_internal_enable_state(&self, enabled: bool) {
        self.shared.handle_internal_enable_state(enabled);
    }

    pub fn enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    pub fn controller_requested(&self) -> bool {
        self.controller_requested
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Configuration the active device was built from, after discovery.
    pub fn active_config(&self) -> Option<&Value> {
        self.active.as_ref().map(|active| &active.config)
    }

    fn active_type_name(&self) -> &str {
        self.active.as_ref().map(|active| active.worker.device_type()).unwrap_or("<none>")
    }

    /// Zero when no device is active.
    pub async fn latch_time(&self) -> i32 {
        match &self.active {
            Some(active) => active.worker.latch_time().await.unwrap_or_default(),
            None => 0,
        }
    }

    /// Empty when no device is active.
    pub async fn active_device_type(&self) -> String {
        match &self.active {
            Some(active) => active.worker.active_device_type().await.unwrap_or_default(),
            None => String::new(),
        }
    }

    /// Empty when no device is active.
    pub async fn color_order(&self) -> String {
        match &self.active {
            Some(active) => active.worker.color_order().await.unwrap_or_default(),
            None => String::new(),
        }
    }

    /// Zero when no device is active.
    pub async fn led_count(&self) -> u32 {
        match &self.active {
            Some(active) => active.worker.led_count().await.unwrap_or_default(),
            None => 0,
        }
    }

    /// Services of `service_type` known to any gateway.
    pub fn services_discovered(&self, service_type: &str, filter: Option<&str>) -> Vec<DiscoveredService> {
        let mut services = Vec::new();
        for gateway in &self.gateways {
            match gateway.services_discovered(service_type, filter) {
                Ok(found) => services.extend(found),
                Err(e) => tracing::warn!("{}: {}", gateway.backend_name(), e),
            }
        }
        services
    }
}

impl Drop for LedDeviceManager {
    fn drop(&mut self) {
        if let Some(mut active) = self.active.take() {
            tracing::warn!(
                "LED device manager dropped with {} still active, detaching it",
                active.device_type
            );
            active.worker.post(DeviceCommand::SwitchOff);
            active.worker.detach();
            active.forwarder.abort();
        }
    }
}

/// Keep a deferred device in step with discovery: re-checks it every time
/// the gateway's services change.
pub async fn follow_discovery(
    manager: Arc<Mutex<LedDeviceManager>>,
    mut changes: watch::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        manager.lock().await.services_changed().await;

        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

async fn forward_notifications(
    mut rx: mpsc::UnboundedReceiver<DeviceNotification>,
    shared: Arc<ManagerShared>,
) {
    while let Some(notification) = rx.recv().await {
        match notification {
            DeviceNotification::EnableStateChanged(enabled) => {
                shared.handle_internal_enable_state(enabled)
            }
        }
    }
}
