use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};
use chrono::Utc;
use futures::stream::{SelectAll, StreamExt};
use regex::Regex;
use serde::Serialize;
use shared::protocol::{normalize_service_type, MATCH_ALL_FILTER};
use shared::types::DiscoveredService;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::error::DiscoveryError;
use super::{hash, BackendEvent, DiscoveryBackend, EventStream, LocalService, ServiceKey, ServiceRecord};

type ServiceTable = HashMap<ServiceKey, DiscoveredService>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowseOutcome {
    Subscribed,
    AlreadySubscribed,
}

/// Commands sent to the gateway task
enum GatewayCommand {
    Browse(String, oneshot::Sender<Result<BrowseOutcome, DiscoveryError>>),
    Advertise(LocalService, oneshot::Sender<Result<(), DiscoveryError>>),
}

/// Handle to a running gateway. Cheap to clone; reads go straight to the
/// shared service table, everything else is serialised through the task.
#[derive(Clone)]
pub struct DiscoveryHandle {
    backend: &'static str,
    tx: mpsc::Sender<GatewayCommand>,
    services: Arc<RwLock<ServiceTable>>,
    hash_rx: watch::Receiver<String>,
    cancel: CancellationToken,
}

impl DiscoveryHandle {
    pub fn backend_name(&self) -> &'static str {
        self.backend
    }

    /// Subscribe to `service_type` unless already subscribed. Returns once
    /// the backend has accepted the subscription.
    pub async fn browse_for_service_type(&self, service_type: &str) -> Result<BrowseOutcome, DiscoveryError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(GatewayCommand::Browse(service_type.to_string(), reply))
            .await
            .map_err(|_| DiscoveryError::GatewayClosed)?;
        rx.await.map_err(|_| DiscoveryError::GatewayClosed)?
    }

    /// Publish a service of our own through the backend.
    pub async fn advertise(&self, service: LocalService) -> Result<(), DiscoveryError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(GatewayCommand::Advertise(service, reply))
            .await
            .map_err(|_| DiscoveryError::GatewayClosed)?;
        rx.await.map_err(|_| DiscoveryError::GatewayClosed)?
    }

    /// Known services of `service_type` whose instance name matches the
    /// `filter` regex (all of them by default), sorted by instance name.
    pub fn services_discovered(
        &self,
        service_type: &str,
        filter: Option<&str>,
    ) -> Result<Vec<DiscoveredService>, DiscoveryError> {
        let filter = filter.unwrap_or(MATCH_ALL_FILTER);
        let regex = Regex::new(filter).map_err(|source| DiscoveryError::InvalidFilter {
            filter: filter.to_string(),
            source,
        })?;
        let service_type = normalize_service_type(service_type);

        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<DiscoveredService> = services
            .values()
            .filter(|s| s.service_type == service_type && regex.is_match(&s.instance_name))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.instance_name.cmp(&b.instance_name));
        Ok(found)
    }

    /// Every known service, sorted by type and instance name.
    pub fn all_services(&self) -> Vec<DiscoveredService> {
        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<DiscoveredService> = services.values().cloned().collect();
        all.sort_by(|a, b| {
            (&a.service_type, &a.instance_name).cmp(&(&b.service_type, &b.instance_name))
        });
        all
    }

    pub fn services_hash(&self) -> String {
        self.hash_rx.borrow().clone()
    }

    pub fn hash_receiver(&self) -> watch::Receiver<String> {
        self.hash_rx.clone()
    }

    /// Stop the gateway task; the backend is shut down on its way out.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Task state of one gateway: the backend, its subscriptions and the event
/// streams they produce.
pub struct DiscoveryGateway {
    backend_name: &'static str,
    backend: Option<Box<dyn DiscoveryBackend>>,
    subscriptions: HashSet<String>,
    resolving: HashSet<ServiceKey>,
    services: Arc<RwLock<ServiceTable>>,
    hash_tx: watch::Sender<String>,
    events: SelectAll<EventStream>,
}

impl DiscoveryGateway {
    /// Start `backend` and spawn the gateway task. Must be called from
    /// within a tokio runtime.
    ///
    /// A backend that fails to start leaves the gateway running but inert.
    pub fn spawn(
        mut backend: Box<dyn DiscoveryBackend>,
        cancel: CancellationToken,
    ) -> (DiscoveryHandle, JoinHandle<()>) {
        let backend_name = backend.name();
        let mut events = SelectAll::new();

        let backend = match backend.start() {
            Ok(stream) => {
                events.push(stream);
                tracing::info!("Discovery backend {} started", backend_name);
                Some(backend)
            }
            Err(e) => {
                tracing::error!("{}; {} discovery stays inactive", e, backend_name);
                None
            }
        };

        let services = Arc::new(RwLock::new(ServiceTable::new()));
        let (hash_tx, hash_rx) = watch::channel(hash::compute_hash(&[]));
        let (tx, rx) = mpsc::channel(64);
        let cancel = cancel.child_token();

        let gateway = Self {
            backend_name,
            backend,
            subscriptions: HashSet::new(),
            resolving: HashSet::new(),
            services: services.clone(),
            hash_tx,
            events,
        };
        let task = tokio::spawn(gateway.run(rx, cancel.clone()));

        let handle = DiscoveryHandle {
            backend: backend_name,
            tx,
            services,
            hash_rx,
            cancel,
        };
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<GatewayCommand>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                }

                Some(event) = self.events.next() => {
                    self.handle_event(event);
                }

                _ = cancel.cancelled() => {
                    tracing::info!("{} discovery shutting down", self.backend_name);
                    break;
                }
            }
        }

        if let Some(mut backend) = self.backend.take() {
            if let Err(e) = backend.shutdown() {
                tracing::error!("Failed to shut down {} discovery: {}", self.backend_name, e);
            }
        }
    }

    fn handle_command(&mut self, cmd: GatewayCommand) {
        match cmd {
            GatewayCommand::Browse(service_type, reply) => {
                let result = self.browse(&service_type);
                if let Err(e) = &result {
                    tracing::error!("{}", e);
                }
                let _ = reply.send(result);
            }
            GatewayCommand::Advertise(service, reply) => {
                let result = match self.backend.as_mut() {
                    Some(backend) => backend.advertise(&service),
                    None => Err(DiscoveryError::BackendUnavailable(self.backend_name)),
                };
                let _ = reply.send(result);
            }
        }
    }

    fn browse(&mut self, service_type: &str) -> Result<BrowseOutcome, DiscoveryError> {
        let service_type = normalize_service_type(service_type);
        if self.subscriptions.contains(&service_type) {
            return Ok(BrowseOutcome::AlreadySubscribed);
        }

        let backend = self
            .backend
            .as_mut()
            .ok_or(DiscoveryError::BackendUnavailable(self.backend_name))?;
        let stream = backend.browse(&service_type)?;

        self.events.push(stream);
        self.subscriptions.insert(service_type);
        Ok(BrowseOutcome::Subscribed)
    }

    fn handle_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Added(record) | BackendEvent::Updated(record) => self.upsert(record),
            BackendEvent::Resolved { key, address, port } => self.resolved(key, address, port),
            BackendEvent::Removed(key) => {
                self.resolving.remove(&key);
                let removed = self.table().remove(&key).is_some();
                if removed {
                    tracing::debug!("Removed {} ({})", key.instance_name, key.service_type);
                    self.publish_hash();
                }
            }
            BackendEvent::HostnameChanged(hostname) => {
                tracing::info!("{} hostname is now {}", self.backend_name, hostname);
            }
        }
    }

    fn table(&self) -> std::sync::RwLockWriteGuard<'_, ServiceTable> {
        self.services.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn upsert(&mut self, record: ServiceRecord) {
        let now = Utc::now();
        let key = record.key;

        let unresolved = {
            let mut services = self.table();
            let entry = services.entry(key.clone()).or_insert_with(|| DiscoveredService {
                service_type: key.service_type.clone(),
                instance_name: key.instance_name.clone(),
                hostname: String::new(),
                resolved_address: None,
                port: None,
                txt: HashMap::new(),
                first_seen: now,
                last_seen: now,
            });
            if !record.hostname.is_empty() {
                entry.hostname = record.hostname;
            }
            if record.address.is_some() {
                entry.resolved_address = record.address;
            }
            if record.port.is_some() {
                entry.port = record.port;
            }
            if !record.txt.is_empty() {
                entry.txt = record.txt;
            }
            entry.last_seen = now;
            entry.resolved_address.is_none()
        };

        if unresolved {
            self.request_resolve(key);
        } else {
            self.resolving.remove(&key);
        }
        self.publish_hash();
    }

    fn request_resolve(&mut self, key: ServiceKey) {
        let Some(backend) = self.backend.as_mut() else {
            return;
        };
        if self.resolving.contains(&key) {
            return;
        }
        match backend.resolve(&key) {
            Ok(()) => {
                self.resolving.insert(key);
            }
            Err(e) => tracing::warn!("Failed to resolve {}: {}", key.instance_name, e),
        }
    }

    fn resolved(&mut self, key: ServiceKey, address: IpAddr, port: Option<u16>) {
        self.resolving.remove(&key);
        let updated = {
            let mut services = self.table();
            match services.get_mut(&key) {
                Some(entry) => {
                    entry.resolved_address = Some(address);
                    if port.is_some() {
                        entry.port = port;
                    }
                    entry.last_seen = Utc::now();
                    true
                }
                None => false,
            }
        };

        if updated {
            tracing::debug!("Resolved {} to {}", key.instance_name, address);
            self.publish_hash();
        } else {
            tracing::debug!("Ignoring resolution of unknown service {}", key.instance_name);
        }
    }

    fn publish_hash(&self) {
        let services: Vec<DiscoveredService> = {
            let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
            services.values().cloned().collect()
        };
        let new_hash = hash::compute_hash(&services);
        self.hash_tx.send_if_modified(|current| {
            if *current == new_hash {
                false
            } else {
                *current = new_hash;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use crate::discovery::testing::{self, emit_to, spawn_fake, wait_until, FakeState};

    fn key(instance: &str) -> ServiceKey {
        ServiceKey {
            service_type: "_hue._tcp.local.".to_string(),
            instance_name: instance.to_string(),
        }
    }

    fn record(instance: &str, address: Option<&str>) -> ServiceRecord {
        testing::record("_hue._tcp.local.", instance, address, address.map(|_| 80))
    }

    fn emit(state: &Arc<Mutex<FakeState>>, event: BackendEvent) {
        emit_to(state, "_hue._tcp.local.", event);
    }

    #[tokio::test]
    async fn test_browse_is_deduplicated() {
        let (handle, _task, state) = spawn_fake(false);

        assert_eq!(handle.browse_for_service_type("_hue._tcp").await.unwrap(), BrowseOutcome::Subscribed);
        assert_eq!(
            handle.browse_for_service_type("_hue._tcp").await.unwrap(),
            BrowseOutcome::AlreadySubscribed
        );
        assert_eq!(
            handle.browse_for_service_type("_hue._tcp.local.").await.unwrap(),
            BrowseOutcome::AlreadySubscribed
        );
        assert_eq!(state.lock().unwrap().browsed, vec!["_hue._tcp.local.".to_string()]);

        emit(&state, BackendEvent::Added(record("kitchen", None)));
        emit(&state, BackendEvent::Added(record("kitchen", None)));
        emit(&state, BackendEvent::Updated(record("kitchen", Some("10.0.0.5"))));
        wait_until(|| {
            handle.services_discovered("_hue._tcp", None).unwrap().iter().any(|s| s.port == Some(80))
        })
        .await;
        assert_eq!(handle.services_discovered("_hue._tcp", None).unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_browse_yields_one_subscription() {
        let (handle, _task, state) = spawn_fake(false);

        let first = tokio::spawn({
            let handle = handle.clone();
            async move { handle.browse_for_service_type("_x._tcp").await }
        });
        let second = tokio::spawn({
            let handle = handle.clone();
            async move { handle.browse_for_service_type("_x._tcp").await }
        });

        let mut outcomes = vec![first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];
        outcomes.sort_by_key(|o| *o == BrowseOutcome::AlreadySubscribed);
        assert_eq!(outcomes, vec![BrowseOutcome::Subscribed, BrowseOutcome::AlreadySubscribed]);
        assert_eq!(state.lock().unwrap().browsed, vec!["_x._tcp.local.".to_string()]);
    }

    #[tokio::test]
    async fn test_service_lifecycle() {
        let (handle, _task, state) = spawn_fake(false);
        handle.browse_for_service_type("_hue._tcp").await.unwrap();

        emit(&state, BackendEvent::Added(record("kitchen", None)));
        emit(&state, BackendEvent::Updated(record("kitchen", None)));
        wait_until(|| handle.services_discovered("_hue._tcp", None).unwrap().len() == 1).await;
        wait_until(|| !state.lock().unwrap().resolves.is_empty()).await;

        let entry = &handle.services_discovered("_hue._tcp", None).unwrap()[0];
        assert_eq!(entry.instance_name, "kitchen");
        assert_eq!(entry.hostname, "kitchen.local.");
        assert_eq!(entry.resolved_address, None);

        emit(
            &state,
            BackendEvent::Resolved {
                key: key("kitchen"),
                address: "10.0.0.7".parse().unwrap(),
                port: Some(443),
            },
        );
        wait_until(|| {
            handle.services_discovered("_hue._tcp", None).unwrap()[0].resolved_address.is_some()
        })
        .await;
        let entry = &handle.services_discovered("_hue._tcp", None).unwrap()[0];
        assert_eq!(entry.resolved_address, Some("10.0.0.7".parse().unwrap()));
        assert_eq!(entry.port, Some(443));
        // one resolve request despite two unresolved notifications
        assert_eq!(state.lock().unwrap().resolves, vec![key("kitchen")]);

        emit(&state, BackendEvent::Removed(key("kitchen")));
        wait_until(|| handle.services_discovered("_hue._tcp", None).unwrap().is_empty()).await;
    }

    #[tokio::test]
    async fn test_filter_matches_instance_names() {
        let (handle, _task, state) = spawn_fake(false);
        handle.browse_for_service_type("_hue._tcp").await.unwrap();
        emit(&state, BackendEvent::Updated(record("kitchen", Some("10.0.0.1"))));
        emit(&state, BackendEvent::Updated(record("hall", Some("10.0.0.2"))));
        wait_until(|| handle.services_discovered("_hue._tcp", None).unwrap().len() == 2).await;

        let all: Vec<String> = handle
            .services_discovered("_hue._tcp", None)
            .unwrap()
            .into_iter()
            .map(|s| s.instance_name)
            .collect();
        assert_eq!(all, vec!["hall", "kitchen"]);

        let kitchen = handle.services_discovered("_hue._tcp", Some("^kit")).unwrap();
        assert_eq!(kitchen.len(), 1);
        assert_eq!(kitchen[0].instance_name, "kitchen");

        assert!(handle.services_discovered("_other._tcp", None).unwrap().is_empty());
        assert!(matches!(
            handle.services_discovered("_hue._tcp", Some("(")),
            Err(DiscoveryError::InvalidFilter { .. })
        ));
        assert_eq!(handle.all_services().len(), 2);
    }

    #[tokio::test]
    async fn test_hash_follows_mutations() {
        let (handle, _task, state) = spawn_fake(false);
        let empty = handle.services_hash();
        handle.browse_for_service_type("_hue._tcp").await.unwrap();

        emit(&state, BackendEvent::Updated(record("kitchen", Some("10.0.0.1"))));
        wait_until(|| handle.services_hash() != empty).await;

        emit(&state, BackendEvent::Removed(key("kitchen")));
        wait_until(|| handle.services_hash() == empty).await;
    }

    #[tokio::test]
    async fn test_failed_backend_is_inert() {
        let (handle, _task, state) = spawn_fake(true);

        let err = handle.browse_for_service_type("_hue._tcp").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::BackendUnavailable("fake")));
        assert!(state.lock().unwrap().browsed.is_empty());
        assert!(handle.services_discovered("_hue._tcp", None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_advertise_unsupported_by_backend() {
        let (handle, _task, _state) = spawn_fake(false);
        let service = LocalService {
            service_type: "_ledhub._tcp.local.".to_string(),
            instance_name: "hub".to_string(),
            port: 8090,
            txt: HashMap::new(),
        };

        let err = handle.advertise(service).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::AdvertiseUnsupported("fake")));
    }

    #[tokio::test]
    async fn test_shutdown_stops_backend() {
        let (handle, task, state) = spawn_fake(false);
        handle.shutdown();
        task.await.unwrap();

        assert!(state.lock().unwrap().shut_down);
        assert!(matches!(
            handle.browse_for_service_type("_hue._tcp").await,
            Err(DiscoveryError::GatewayClosed)
        ));
    }
}
