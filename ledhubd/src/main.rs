use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use shared::protocol::{HUB_SERVICE_TYPE, TXT_DEVICE, TXT_VERSION};
use ledhubd::api;
use ledhubd::config::Config;
use ledhubd::controller::{Component, HubController};
use ledhubd::device::drivers::register_builtin_devices;
use ledhubd::device::manager::{follow_discovery, LedDeviceManager};
use ledhubd::device::registry::DeviceRegistry;
use ledhubd::discovery::gateway::DiscoveryGateway;
use ledhubd::discovery::mdns::MdnsBackend;
use ledhubd::discovery::LocalService;
use ledhubd::output::{self, OutputState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ledhubd=info"))
        )
        .init();

    tracing::info!("Starting ledhubd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/ledhub/ledhubd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Device types must be known before the first device is built
    let registry = DeviceRegistry::global();
    register_builtin_devices(&registry);

    let cancel = CancellationToken::new();

    // Start mDNS discovery; a backend that cannot bind stays inert
    let discovery = if config.discovery.enabled {
        let backend = MdnsBackend::new(config.discovery.interface.clone());
        Some(DiscoveryGateway::spawn(Box::new(backend), cancel.clone()))
    } else {
        tracing::info!("Service discovery disabled");
        None
    };
    let gateway = discovery.as_ref().map(|(handle, _)| handle.clone());

    let controller = Arc::new(HubController::new());
    let mut manager = LedDeviceManager::new(
        registry.clone(),
        gateway.iter().cloned().collect(),
        controller.clone(),
    );
    manager.start_discovery().await;

    // A bad device config is reported but does not stop the API from coming up
    match manager.create_device(&config.device).await {
        Ok(()) => {
            manager
                .handle_component_state(Component::LedDevice, config.output.enable_on_start)
                .await;
        }
        Err(e) => tracing::error!("Failed to create LED device: {}", e),
    }
    let manager = Arc::new(Mutex::new(manager));

    // Advertise the API
    if let (Some(gateway), true) = (&gateway, config.discovery.advertise) {
        let instance_name = match &config.discovery.instance_name {
            Some(name) => name.clone(),
            None => format!(
                "ledhub-{}",
                hostname::get()
                    .map(|h| h.to_string_lossy().to_string())
                    .unwrap_or_else(|_| "unknown".to_string())
            ),
        };
        let device_type = manager.lock().await.active_device_type().await;
        let service = LocalService {
            service_type: HUB_SERVICE_TYPE.to_string(),
            instance_name,
            port: config.api.port(),
            txt: HashMap::from([
                (TXT_VERSION.to_string(), env!("CARGO_PKG_VERSION").to_string()),
                (TXT_DEVICE.to_string(), device_type),
            ]),
        };
        if let Err(e) = gateway.advertise(service).await {
            tracing::error!("Failed to advertise API: {}", e);
        }
    }

    // Rebuild a device that came up before its service was resolved
    let follower_handle = gateway.as_ref().map(|gateway| {
        tokio::spawn(follow_discovery(
            manager.clone(),
            gateway.hash_receiver(),
            cancel.clone(),
        ))
    });

    // Spawn output loop
    let output = Arc::new(OutputState::new(config.output.color()));
    let output_handle = tokio::spawn(output::run(
        manager.clone(),
        controller.clone(),
        output.clone(),
        config.output.refresh_hz,
        cancel.clone(),
    ));

    // Build API router
    let app_state = api::routes::AppState {
        manager: manager.clone(),
        discovery: gateway.clone(),
        output,
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation
    cancel.cancel();

    // Wait for output and API to finish before touching the device
    let _ = tokio::join!(output_handle, server_handle);
    if let Some(follower_handle) = follower_handle {
        let _ = follower_handle.await;
    }

    // LEDs off and device thread joined
    manager.lock().await.shutdown().await;

    // Stop discovery; the gateway unregisters our advertisement on the way out
    if let Some((handle, gateway_handle)) = discovery {
        handle.shutdown();
        if let Err(e) = gateway_handle.await {
            tracing::error!("Discovery task failed: {}", e);
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
