use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use serde::Serialize;
use tokio::sync::Notify;

/// Components whose enable state the controller tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    LedDevice,
    Smoothing,
    Grabber,
    Forwarder,
}

/// The owning system the device manager reports to.
pub trait Controller: Send + Sync {
    /// Publish the actual state of a component.
    fn set_component_state(&self, component: Component, enabled: bool);

    /// Ask for the current output to be pushed again.
    fn request_update(&self);
}

/// Controller used by the daemon: a state table plus a wakeup for the
/// output loop.
#[derive(Default)]
pub struct HubController {
    components: Mutex<HashMap<Component, bool>>,
    update: Notify,
}

impl HubController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn component_state(&self, component: Component) -> bool {
        let components = self.components.lock().unwrap_or_else(PoisonError::into_inner);
        components.get(&component).copied().unwrap_or(false)
    }

    /// Resolves once an update was requested after (or shortly before) the call.
    pub async fn update_requested(&self) {
        self.update.notified().await;
    }
}

impl Controller for HubController {
    fn set_component_state(&self, component: Component, enabled: bool) {
        let mut components = self.components.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = components.insert(component, enabled);
        if previous != Some(enabled) {
            tracing::info!("Component {:?} is now {}", component, if enabled { "enabled" } else { "disabled" });
        }
    }

    fn request_update(&self) {
        self.update.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_component_state_defaults_to_disabled() {
        let controller = HubController::new();
        assert!(!controller.component_state(Component::LedDevice));

        controller.set_component_state(Component::LedDevice, true);
        assert!(controller.component_state(Component::LedDevice));
        assert!(!controller.component_state(Component::Smoothing));
    }

    #[tokio::test]
    async fn test_update_request_wakes_waiter() {
        let controller = HubController::new();
        // notify_one stores a permit when nobody is waiting yet
        controller.request_update();
        tokio::time::timeout(Duration::from_secs(1), controller.update_requested())
            .await
            .expect("update request should wake the waiter");
    }
}
