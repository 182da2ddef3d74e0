use std::sync::Arc;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use crate::controller::Component;
use crate::device::manager::{LedDeviceManager, SlotState};
use crate::device::schemas;
use crate::discovery::gateway::DiscoveryHandle;
use crate::error::DiscoveryError;
use crate::output::OutputState;
use shared::types::{ColorRgb, DiscoveredService};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Mutex<LedDeviceManager>>,
    pub discovery: Option<DiscoveryHandle>,
    pub output: Arc<OutputState>,
}

#[derive(Serialize)]
pub struct DeviceStatus {
    pub state: SlotState,
    pub device_type: String,
    pub enabled: bool,
    pub requested: bool,
    pub led_count: u32,
    pub latch_time: i32,
    pub color_order: String,
}

#[derive(Deserialize)]
pub struct ComponentRequest {
    pub enabled: bool,
}

#[derive(Deserialize)]
pub struct ServiceQuery {
    #[serde(rename = "type")]
    pub service_type: Option<String>,
    pub filter: Option<String>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (status, Json(ErrorResponse { error: error.to_string() }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/device", get(get_device).put(put_device))
        .route("/v1/device/state", put(put_device_state))
        .route("/v1/device/schemas", get(get_schemas))
        .route("/v1/services", get(get_services))
        .route("/v1/services/hash", get(get_hash))
        .route("/v1/output/color", put(put_color))
        .with_state(state)
}

async fn device_status(manager: &LedDeviceManager) -> DeviceStatus {
    DeviceStatus {
        state: manager.state(),
        device_type: manager.active_device_type().await,
        enabled: manager.enabled(),
        requested: manager.controller_requested(),
        led_count: manager.led_count().await,
        latch_time: manager.latch_time().await,
        color_order: manager.color_order().await,
    }
}

async fn get_device(State(state): State<AppState>) -> Json<DeviceStatus> {
    let manager = state.manager.lock().await;
    Json(device_status(&manager).await)
}

async fn put_device(
    State(state): State<AppState>,
    Json(config): Json<Value>,
) -> Result<Json<DeviceStatus>, ApiError> {
    let mut manager = state.manager.lock().await;

    if let Err(e) = manager.create_device(&config).await {
        tracing::error!("Failed to create LED device: {}", e);
        let status = if e.is_configuration() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        return Err(api_error(status, e));
    }

    // the new device starts disabled; carry over what the controller asked for
    let requested = manager.controller_requested();
    manager.handle_component_state(Component::LedDevice, requested).await;

    Ok(Json(device_status(&manager).await))
}

async fn put_device_state(
    State(state): State<AppState>,
    Json(request): Json<ComponentRequest>,
) -> Json<DeviceStatus> {
    let mut manager = state.manager.lock().await;
    manager.handle_component_state(Component::LedDevice, request.enabled).await;
    Json(device_status(&manager).await)
}

async fn get_schemas() -> Result<Json<Map<String, Value>>, ApiError> {
    schemas::led_device_schemas().map(Json).map_err(|e| {
        tracing::error!("Failed to load device schemas: {:#}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
    })
}

async fn get_services(
    State(state): State<AppState>,
    Query(params): Query<ServiceQuery>,
) -> Result<Json<Vec<DiscoveredService>>, ApiError> {
    // snapshots come straight from the gateway, never through the manager lock
    let services = match params.service_type {
        Some(service_type) => state
            .discovery
            .as_ref()
            .map(|gateway| gateway.services_discovered(&service_type, params.filter.as_deref()))
            .unwrap_or_else(|| Ok(Vec::new())),
        None => Ok(state
            .discovery
            .as_ref()
            .map(DiscoveryHandle::all_services)
            .unwrap_or_default()),
    };

    services.map(Json).map_err(|e| match e {
        DiscoveryError::InvalidFilter { .. } => api_error(StatusCode::BAD_REQUEST, e),
        e => {
            tracing::error!("Failed to query services: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    })
}

async fn get_hash(State(state): State<AppState>) -> String {
    state
        .discovery
        .as_ref()
        .map(DiscoveryHandle::services_hash)
        .unwrap_or_default()
}

async fn put_color(State(state): State<AppState>, Json(color): Json<ColorRgb>) -> StatusCode {
    state.output.set_color(color);
    StatusCode::NO_CONTENT
}
