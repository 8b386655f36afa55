use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Advertised name of earpieces running the old firmware.
pub const OLD_FIRMWARE_NAME: &str = "earconnect";
/// Advertised name of earpieces running the new firmware.
pub const NEW_FIRMWARE_NAME: &str = "one";

/// Sensor firmware generation, derived from the advertised device name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FirmwareGeneration {
    #[default]
    Old,
    New,
}

impl FirmwareGeneration {
    pub fn from_device_name(name: Option<&str>) -> Self {
        match name {
            Some(NEW_FIRMWARE_NAME) => Self::New,
            _ => Self::Old,
        }
    }

    pub fn is_new(self) -> bool {
        self == Self::New
    }
}

/// Identity of a (scanned or paired) ear sensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorIdentity {
    pub address: String,
    pub name: Option<String>,
}

impl SensorIdentity {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
        }
    }

    pub fn firmware_generation(&self) -> FirmwareGeneration {
        FirmwareGeneration::from_device_name(self.name.as_deref())
    }

    /// PIN the user has to enter while bonding, if the firmware asks for one.
    pub fn pairing_pin(&self) -> Option<&'static str> {
        match self.firmware_generation() {
            FirmwareGeneration::New => Some("111111"),
            FirmwareGeneration::Old => None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("--")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// One decoded heart rate measurement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartMeasurement {
    pub bpm: u16,
    /// RR intervals in seconds, in the order they were encoded.
    pub rr_intervals: Vec<f32>,
}

/// Progress of a sensor synchronization, as shown to the user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    active: bool,
    progress: Option<u8>,
    last_sync_time: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn progress(&self) -> Option<u8> {
        self.progress
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.last_sync_time
    }

    /// Toggling the active flag always forgets the progress.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
        self.progress = None;
    }

    pub fn set_progress(&mut self, progress: Option<u8>) {
        self.progress = progress;
        if matches!(progress, Some(p) if p > 0 && p < 100) {
            self.active = true;
        }
    }

    pub fn set_last_sync_time(&mut self, time: Option<DateTime<Utc>>) {
        self.last_sync_time = time;
    }

    pub fn started(&mut self) {
        self.set_active(true);
        self.progress = Some(0);
    }

    pub fn finished(&mut self, at: DateTime<Utc>) {
        self.set_active(false);
        self.last_sync_time = Some(at);
    }

    pub fn failed(&mut self) {
        self.set_active(false);
    }
}

/// Most recent readings, for the connected-status indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LiveReadings {
    pub heart_rate: Option<u16>,
    pub temperature: Option<f32>,
    /// Positioning quality on the 0..=100 scale.
    pub quality: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    DeviceFound(SensorIdentity),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PairingEvent {
    Succeeded,
    Failed(String),
    Cancelled,
}

/// One-shot signals raised by the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorSignal {
    WearingCompleted,
}

/// Heart rate record, one entry per stored dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRateRecord {
    pub values: Vec<u16>,
    pub rr_history: Vec<Vec<f32>>,
    pub timestamps: Vec<i64>,
    pub ear_position_quality: Vec<u8>,
    pub new_firmware: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureRecord {
    pub values: Vec<f32>,
    pub timestamps: Vec<i64>,
    pub ear_position_quality: Vec<u8>,
    pub new_firmware: bool,
}

/// The two record shapes handed to the storage collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SensorRecord {
    #[serde(rename = "HeartMeasurementEar")]
    HeartRate(HeartRateRecord),
    #[serde(rename = "Temperature")]
    Temperature(TemperatureRecord),
}
