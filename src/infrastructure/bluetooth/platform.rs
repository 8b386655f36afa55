//! BLE Platform Seam
//!
//! The operating system's Bluetooth stack, reduced to the commands the
//! connection state machine issues and the events it reacts to. Commands
//! return immediately; their outcome arrives later as a [`PlatformEvent`]
//! on the link's event channel.

use crate::domain::error::PlatformError;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Off,
    TurningOn,
    On,
    TurningOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Characteristic property bits relevant for subscriptions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub notify: bool,
    pub indicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    /// Whether a client characteristic configuration descriptor is present.
    pub has_config_descriptor: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// Everything the platform reports back, serialized per link.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    AdapterStateChanged(AdapterState),
    BondStateChanged {
        address: String,
        previous: BondState,
        current: BondState,
    },
    ScanResult {
        address: String,
        name: Option<String>,
    },
    ScanFailed {
        code: i32,
    },
    ConnectionStateChanged {
        address: String,
        state: GattConnectionState,
    },
    ServicesDiscovered(Vec<GattService>),
    DescriptorWritten {
        characteristic: Uuid,
        success: bool,
    },
    CharacteristicChanged {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    CharacteristicRead {
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

/// Commands issued to the platform Bluetooth stack.
pub trait BlePlatform: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Addresses of all devices bonded at the platform level.
    fn bonded_devices(&self) -> Vec<String>;

    fn bond_state(&self, address: &str) -> BondState;

    /// Start a scan reporting only devices advertising one of `names`.
    fn start_scan(&self, names: &[&str]) -> Result<(), PlatformError>;

    /// Flush pending results and stop the scan.
    fn stop_scan(&self);

    fn create_bond(&self, address: &str) -> Result<(), PlatformError>;

    /// Remove the platform bond. Never panics; callers may ignore the result.
    fn remove_bond(&self, address: &str) -> Result<(), PlatformError>;

    /// Open a GATT link that reconnects automatically whenever the device
    /// comes into range.
    fn connect_gatt(&self, address: &str) -> Result<(), PlatformError>;

    /// Disconnect and release the GATT link, if any.
    fn close_gatt(&self);

    fn discover_services(&self) -> Result<(), PlatformError>;

    fn set_characteristic_notification(
        &self,
        characteristic: &Uuid,
        enabled: bool,
    ) -> Result<(), PlatformError>;

    /// Write a descriptor. Only one write may be outstanding per link.
    fn write_descriptor(
        &self,
        characteristic: &Uuid,
        descriptor: &Uuid,
        value: &[u8],
    ) -> Result<(), PlatformError>;

    fn read_characteristic(&self, characteristic: &Uuid) -> Result<(), PlatformError>;
}
