//! In-memory discovery backend for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::error::DiscoveryError;
use super::gateway::{DiscoveryGateway, DiscoveryHandle};
use super::{BackendEvent, DiscoveryBackend, EventStream, ServiceKey, ServiceRecord};

#[derive(Default)]
pub struct FakeState {
    pub browsed: Vec<String>,
    pub resolves: Vec<ServiceKey>,
    pub senders: HashMap<String, flume::Sender<BackendEvent>>,
    pub shut_down: bool,
}

pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
    fail_start: bool,
}

impl DiscoveryBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn start(&mut self) -> Result<EventStream, DiscoveryError> {
        if self.fail_start {
            return Err(DiscoveryError::BackendStart {
                backend: "fake",
                reason: "address in use".to_string(),
            });
        }
        Ok(stream::iter(vec![BackendEvent::HostnameChanged("hub".to_string())]).boxed())
    }

    fn browse(&mut self, service_type: &str) -> Result<EventStream, DiscoveryError> {
        // widen the window in which a second browse could race this one
        std::thread::sleep(Duration::from_millis(20));
        let (tx, rx) = flume::unbounded();
        let mut state = self.state.lock().unwrap();
        state.browsed.push(service_type.to_string());
        state.senders.insert(service_type.to_string(), tx);
        Ok(rx.into_stream().boxed())
    }

    fn resolve(&mut self, key: &ServiceKey) -> Result<(), DiscoveryError> {
        self.state.lock().unwrap().resolves.push(key.clone());
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), DiscoveryError> {
        self.state.lock().unwrap().shut_down = true;
        Ok(())
    }
}

pub fn spawn_fake(fail_start: bool) -> (DiscoveryHandle, JoinHandle<()>, Arc<Mutex<FakeState>>) {
    let state = Arc::new(Mutex::new(FakeState::default()));
    let backend = FakeBackend {
        state: state.clone(),
        fail_start,
    };
    let (handle, task) = DiscoveryGateway::spawn(Box::new(backend), CancellationToken::new());
    (handle, task, state)
}

/// A service record as a backend reports it; `address` and `port` left out
/// means the instance is still unresolved.
pub fn record(service_type: &str, instance: &str, address: Option<&str>, port: Option<u16>) -> ServiceRecord {
    ServiceRecord {
        key: ServiceKey {
            service_type: service_type.to_string(),
            instance_name: instance.to_string(),
        },
        hostname: format!("{}.local.", instance),
        address: address.map(|a| a.parse().unwrap()),
        port,
        txt: HashMap::new(),
    }
}

/// Deliver `event` on the stream of an already browsed service type.
pub fn emit_to(state: &Arc<Mutex<FakeState>>, service_type: &str, event: BackendEvent) {
    let state = state.lock().unwrap();
    state.senders[service_type].send(event).unwrap();
}

pub async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
