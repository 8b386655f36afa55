//! Error types shared by the sensor subsystem.

use thiserror::Error;

/// Failures reported by the BLE platform seam.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,
    #[error("no open GATT link")]
    NotConnected,
    #[error("{operation} rejected by platform (code {code})")]
    Rejected { operation: &'static str, code: i32 },
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("characteristic {0} not found on the device")]
    UnknownCharacteristic(uuid::Uuid),
    #[error("{operation} failed: {reason}")]
    Backend {
        operation: &'static str,
        reason: String,
    },
}

/// Operation-level failures of a sensor manager.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Bluetooth is disabled")]
    BluetoothDisabled,
    #[error("device {0} was not seen during the last scan")]
    UnknownDevice(String),
    #[error("sensor service is not running")]
    ServiceStopped,
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] anyhow::Error),
}

/// Failures of the record storage collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The eligibility gate refused (e.g. the participant signed out).
    #[error("current user may not store sensor data")]
    NotEligible,
    #[error("record I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
