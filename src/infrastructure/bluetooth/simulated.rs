//! In-process BLE platform.
//!
//! Records every command it receives and lets the caller inject platform
//! events. With auto-respond enabled it behaves like a cooperative earpiece:
//! bonding, connecting, discovery and descriptor writes all succeed.

use crate::domain::error::PlatformError;
use crate::domain::models::FirmwareGeneration;
use crate::infrastructure::bluetooth::platform::{
    AdapterState, BlePlatform, BondState, CharacteristicProperties, GattCharacteristic,
    GattConnectionState, GattService, PlatformEvent,
};
use crate::infrastructure::bluetooth::protocol::{
    BATTERY_LEVEL, BODY_SENSOR_LOCATION, HEART_RATE_MEASUREMENT, RAW_DATA, SIGNAL_QUALITY,
    TEMPERATURE_MEASUREMENT,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
const HEALTH_THERMOMETER_SERVICE: Uuid = Uuid::from_u128(0x00001809_0000_1000_8000_00805f9b34fb);
const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
const VENDOR_SERVICE: Uuid = Uuid::from_u128(0x0000a000_1212_efde_1523_785feabcd123);

#[derive(Debug, Clone, PartialEq)]
pub enum PlatformCommand {
    StartScan(Vec<String>),
    StopScan,
    CreateBond(String),
    RemoveBond(String),
    ConnectGatt(String),
    CloseGatt,
    DiscoverServices,
    SetNotification(Uuid, bool),
    WriteDescriptor {
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    ReadCharacteristic(Uuid),
}

#[derive(Debug)]
struct SimState {
    enabled: bool,
    auto_respond: bool,
    bonded: HashSet<String>,
    connected: Option<String>,
    battery_level: u8,
    rejected_writes: HashSet<Uuid>,
    commands: Vec<PlatformCommand>,
}

pub struct SimulatedPlatform {
    state: Mutex<SimState>,
    events: mpsc::UnboundedSender<PlatformEvent>,
}

impl SimulatedPlatform {
    /// A powered-on adapter with nothing bonded.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PlatformEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let platform = Arc::new(Self {
            state: Mutex::new(SimState {
                enabled: true,
                auto_respond: false,
                bonded: HashSet::new(),
                connected: None,
                battery_level: 87,
                rejected_writes: HashSet::new(),
                commands: Vec::new(),
            }),
            events,
        });
        (platform, rx)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_auto_respond(&self, enabled: bool) {
        self.lock().auto_respond = enabled;
    }

    pub fn emit(&self, event: PlatformEvent) {
        let _ = self.events.send(event);
    }

    /// Toggle the radio and report the change like the platform would.
    pub fn set_enabled(&self, enabled: bool) {
        {
            let mut state = self.lock();
            state.enabled = enabled;
            if !enabled {
                state.connected = None;
            }
        }
        self.emit(PlatformEvent::AdapterStateChanged(if enabled {
            AdapterState::On
        } else {
            AdapterState::Off
        }));
    }

    /// Mark a device as bonded without emitting an event.
    pub fn add_bond(&self, address: &str) {
        self.lock().bonded.insert(address.to_string());
    }

    pub fn set_battery_level(&self, level: u8) {
        self.lock().battery_level = level;
    }

    pub fn reject_descriptor_writes_for(&self, characteristic: Uuid) {
        self.lock().rejected_writes.insert(characteristic);
    }

    pub fn advertise(&self, address: &str, name: Option<&str>) {
        self.emit(PlatformEvent::ScanResult {
            address: address.to_string(),
            name: name.map(str::to_string),
        });
    }

    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        self.emit(PlatformEvent::CharacteristicChanged {
            characteristic,
            value,
        });
    }

    pub fn commands(&self) -> Vec<PlatformCommand> {
        self.lock().commands.clone()
    }

    pub fn take_commands(&self) -> Vec<PlatformCommand> {
        std::mem::take(&mut self.lock().commands)
    }

    pub fn connected_address(&self) -> Option<String> {
        self.lock().connected.clone()
    }

    fn record(&self, command: PlatformCommand) -> bool {
        let mut state = self.lock();
        state.commands.push(command);
        state.auto_respond
    }
}

impl BlePlatform for SimulatedPlatform {
    fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    fn bonded_devices(&self) -> Vec<String> {
        self.lock().bonded.iter().cloned().collect()
    }

    fn bond_state(&self, address: &str) -> BondState {
        if self.lock().bonded.contains(address) {
            BondState::Bonded
        } else {
            BondState::None
        }
    }

    fn start_scan(&self, names: &[&str]) -> Result<(), PlatformError> {
        if !self.is_enabled() {
            return Err(PlatformError::AdapterUnavailable);
        }
        self.record(PlatformCommand::StartScan(
            names.iter().map(|n| n.to_string()).collect(),
        ));
        Ok(())
    }

    fn stop_scan(&self) {
        self.record(PlatformCommand::StopScan);
    }

    fn create_bond(&self, address: &str) -> Result<(), PlatformError> {
        if !self.is_enabled() {
            return Err(PlatformError::AdapterUnavailable);
        }
        if self.record(PlatformCommand::CreateBond(address.to_string())) {
            self.lock().bonded.insert(address.to_string());
            for (previous, current) in [
                (BondState::None, BondState::Bonding),
                (BondState::Bonding, BondState::Bonded),
            ] {
                self.emit(PlatformEvent::BondStateChanged {
                    address: address.to_string(),
                    previous,
                    current,
                });
            }
        }
        Ok(())
    }

    fn remove_bond(&self, address: &str) -> Result<(), PlatformError> {
        self.record(PlatformCommand::RemoveBond(address.to_string()));
        if self.lock().bonded.remove(address) {
            Ok(())
        } else {
            Err(PlatformError::Rejected {
                operation: "remove_bond",
                code: -1,
            })
        }
    }

    fn connect_gatt(&self, address: &str) -> Result<(), PlatformError> {
        if !self.is_enabled() {
            return Err(PlatformError::AdapterUnavailable);
        }
        if self.record(PlatformCommand::ConnectGatt(address.to_string())) {
            self.lock().connected = Some(address.to_string());
            for state in [GattConnectionState::Connecting, GattConnectionState::Connected] {
                self.emit(PlatformEvent::ConnectionStateChanged {
                    address: address.to_string(),
                    state,
                });
            }
        }
        Ok(())
    }

    fn close_gatt(&self) {
        self.record(PlatformCommand::CloseGatt);
        self.lock().connected = None;
    }

    fn discover_services(&self) -> Result<(), PlatformError> {
        if self.record(PlatformCommand::DiscoverServices) {
            self.emit(PlatformEvent::ServicesDiscovered(earpiece_services()));
        }
        Ok(())
    }

    fn set_characteristic_notification(
        &self,
        characteristic: &Uuid,
        enabled: bool,
    ) -> Result<(), PlatformError> {
        self.record(PlatformCommand::SetNotification(*characteristic, enabled));
        Ok(())
    }

    fn write_descriptor(
        &self,
        characteristic: &Uuid,
        descriptor: &Uuid,
        value: &[u8],
    ) -> Result<(), PlatformError> {
        if self.lock().rejected_writes.contains(characteristic) {
            return Err(PlatformError::Rejected {
                operation: "write_descriptor",
                code: 133,
            });
        }
        if self.record(PlatformCommand::WriteDescriptor {
            characteristic: *characteristic,
            descriptor: *descriptor,
            value: value.to_vec(),
        }) {
            self.emit(PlatformEvent::DescriptorWritten {
                characteristic: *characteristic,
                success: true,
            });
        }
        Ok(())
    }

    fn read_characteristic(&self, characteristic: &Uuid) -> Result<(), PlatformError> {
        if self.lock().connected.is_none() {
            return Err(PlatformError::NotConnected);
        }
        if self.record(PlatformCommand::ReadCharacteristic(*characteristic))
            && *characteristic == BATTERY_LEVEL
        {
            let level = self.lock().battery_level;
            self.emit(PlatformEvent::CharacteristicRead {
                characteristic: *characteristic,
                value: vec![level],
            });
        }
        Ok(())
    }
}

fn notifying(uuid: Uuid) -> GattCharacteristic {
    GattCharacteristic {
        uuid,
        properties: CharacteristicProperties {
            read: false,
            notify: true,
            indicate: false,
        },
        has_config_descriptor: true,
    }
}

/// The GATT table an earpiece exposes.
pub fn earpiece_services() -> Vec<GattService> {
    vec![
        GattService {
            uuid: HEART_RATE_SERVICE,
            characteristics: vec![
                notifying(HEART_RATE_MEASUREMENT),
                GattCharacteristic {
                    uuid: BODY_SENSOR_LOCATION,
                    properties: CharacteristicProperties {
                        read: true,
                        ..Default::default()
                    },
                    has_config_descriptor: false,
                },
            ],
        },
        GattService {
            uuid: HEALTH_THERMOMETER_SERVICE,
            characteristics: vec![GattCharacteristic {
                uuid: TEMPERATURE_MEASUREMENT,
                properties: CharacteristicProperties {
                    read: false,
                    notify: false,
                    indicate: true,
                },
                has_config_descriptor: true,
            }],
        },
        GattService {
            uuid: BATTERY_SERVICE,
            characteristics: vec![GattCharacteristic {
                uuid: BATTERY_LEVEL,
                properties: CharacteristicProperties {
                    read: true,
                    notify: true,
                    indicate: false,
                },
                has_config_descriptor: true,
            }],
        },
        GattService {
            uuid: VENDOR_SERVICE,
            characteristics: vec![notifying(RAW_DATA), notifying(SIGNAL_QUALITY)],
        },
    ]
}

/// Heart Rate Measurement payload with 8-bit bpm and one RR interval.
pub fn encode_heart_rate(bpm: u8, rr_seconds: f32) -> Vec<u8> {
    let rr = ((rr_seconds * 1024.0).round() as u16).to_le_bytes();
    vec![0x10, bpm, rr[0], rr[1]]
}

/// Temperature Measurement payload holding `celsius` with two decimals.
pub fn encode_temperature(celsius: f32) -> Vec<u8> {
    let mantissa = (celsius * 100.0).round() as i32;
    let m = mantissa.to_le_bytes();
    vec![0x04, m[0], m[1], m[2], (-2i8) as u8, 0x03]
}

/// Signal quality payload in the layout of the given firmware.
pub fn encode_quality(raw: u8, firmware: FirmwareGeneration) -> Vec<u8> {
    match firmware {
        FirmwareGeneration::Old => vec![raw],
        FirmwareGeneration::New => vec![0x06, 0, 0, 0, 0, 0, 0, 0, raw],
    }
}

/// Stream plausible readings every `interval` while the link is up.
pub fn spawn_earpiece_feed(
    platform: Arc<SimulatedPlatform>,
    interval: Duration,
    firmware: FirmwareGeneration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut step: u32 = 0;
        loop {
            ticker.tick().await;
            if platform.connected_address().is_none() {
                continue;
            }
            step = step.wrapping_add(1);
            let wobble = (step % 10) as f32;
            let bpm = 62 + (step % 15) as u8;
            let quality = match firmware {
                FirmwareGeneration::New => 20 + (step % 15) as u8,
                FirmwareGeneration::Old => 35 + (step % 25) as u8,
            };
            platform.notify(TEMPERATURE_MEASUREMENT, encode_temperature(36.4 + wobble * 0.05));
            platform.notify(HEART_RATE_MEASUREMENT, encode_heart_rate(bpm, 60.0 / bpm as f32));
            platform.notify(SIGNAL_QUALITY, encode_quality(quality, firmware));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{self, SensorReading};

    #[test]
    fn test_encoded_payloads_decode() {
        let heart = protocol::decode_heart_rate(&encode_heart_rate(64, 0.5)).unwrap();
        assert_eq!(heart.bpm, 64);
        assert_eq!(heart.rr_intervals, vec![0.5]);

        let celsius = protocol::decode_temperature(&encode_temperature(36.75)).unwrap();
        assert!((celsius - 36.75).abs() < 0.001);

        assert_eq!(
            protocol::decode(
                &SIGNAL_QUALITY,
                &encode_quality(25, FirmwareGeneration::New),
                FirmwareGeneration::New
            ),
            Some(SensorReading::Quality(25))
        );
    }

    #[tokio::test]
    async fn test_auto_respond_bonds_and_connects() {
        let (platform, mut events) = SimulatedPlatform::new();
        platform.set_auto_respond(true);

        platform.create_bond("AA").unwrap();
        platform.connect_gatt("AA").unwrap();

        assert_eq!(platform.bond_state("AA"), BondState::Bonded);
        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert_eq!(received.len(), 4);
        assert_eq!(
            received[3],
            PlatformEvent::ConnectionStateChanged {
                address: "AA".into(),
                state: GattConnectionState::Connected,
            }
        );
        assert_eq!(platform.connected_address().as_deref(), Some("AA"));
    }

    #[test]
    fn test_remove_unknown_bond_is_rejected() {
        let (platform, _events) = SimulatedPlatform::new();
        assert!(platform.remove_bond("ZZ").is_err());
    }
}
