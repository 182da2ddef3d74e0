use thiserror::Error;

/// Errors raised by the device registry and lifecycle manager.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device configuration carries no `type` field.
    #[error("device configuration has no 'type' field")]
    MissingType,

    /// No constructor is registered under the requested type name.
    #[error("unknown device type '{0}'")]
    UnknownDeviceType(String),

    /// The constructor rejected the configuration.
    #[error("invalid configuration for device type '{device_type}': {reason}")]
    InvalidConfig { device_type: String, reason: String },

    /// The worker thread for the device could not be created.
    #[error("failed to spawn execution context for device '{device_type}': {source}")]
    Spawn {
        device_type: String,
        #[source]
        source: std::io::Error,
    },

    /// The worker thread stopped answering before the operation completed.
    #[error("execution context of device '{0}' terminated unexpectedly")]
    WorkerGone(String),
}

impl DeviceError {
    /// Configuration errors are the caller's fault and are reported back
    /// verbatim; everything else is an environment problem.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DeviceError::MissingType
                | DeviceError::UnknownDeviceType(_)
                | DeviceError::InvalidConfig { .. }
        )
    }
}

/// Errors raised by discovery gateways and their backends.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery backend '{backend}' failed to start: {reason}")]
    BackendStart { backend: &'static str, reason: String },

    #[error("discovery backend '{0}' is unavailable")]
    BackendUnavailable(&'static str),

    #[error("failed to browse for '{service_type}': {reason}")]
    Browse { service_type: String, reason: String },

    #[error("failed to advertise '{name}': {reason}")]
    Advertise { name: String, reason: String },

    #[error("discovery backend '{0}' does not support advertising")]
    AdvertiseUnsupported(&'static str),

    #[error("invalid service filter '{filter}': {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: regex::Error,
    },

    #[error("discovery gateway has shut down")]
    GatewayClosed,
}
