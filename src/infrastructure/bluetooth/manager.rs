//! Connection state machine for the Cosinuss earpiece.
//!
//! The manager owns the paired identity, the pending pairing target and the
//! GATT subscription queue. It is driven from a single event loop, so all
//! platform events for the link are handled strictly in order.
//!
//! ```text
//!   Unpaired ──scan──▶ Scanning ──pair──▶ PairingInProgress
//!      ▲                                   │ bonded + GATT connected
//!      │ unpair / bond removed             ▼
//!      └──────────────────────────── Connected ◀──radio on──┐
//!                                          │ link lost       │
//!                                          ▼                 │
//!                                     Disconnected ──────────┘
//! ```

use crate::domain::aggregator::Aggregator;
use crate::domain::clock::Clock;
use crate::domain::error::{PlatformError, SensorError};
use crate::domain::models::{
    ConnectionState, FirmwareGeneration, PairingEvent, ScanEvent, SensorIdentity, SensorSignal,
};
use crate::domain::quality;
use crate::domain::settings::{ScanSettings, StudyConfig};
use crate::domain::status::StatusPublisher;
use crate::infrastructure::bluetooth::connection::{self, DescriptorWriteQueue};
use crate::infrastructure::bluetooth::platform::{
    AdapterState, BlePlatform, BondState, GattConnectionState, PlatformEvent,
};
use crate::infrastructure::bluetooth::protocol::{self, SensorReading, BATTERY_LEVEL};
use crate::infrastructure::bluetooth::scanner::{BleScanner, WatchdogTick};
use crate::infrastructure::persistence::{self, KeyValueStore, PairingStore};
use crate::DIAGNOSTICS_TARGET;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

struct PendingPairing {
    identity: SensorIdentity,
    listener: mpsc::UnboundedSender<PairingEvent>,
}

/// Collaborators injected into the manager.
pub struct ManagerContext {
    pub platform: Arc<dyn BlePlatform>,
    pub preferences: Arc<dyn KeyValueStore>,
    pub status: StatusPublisher,
    pub aggregator: Arc<Aggregator>,
    pub study: Arc<dyn StudyConfig>,
    pub clock: Arc<dyn Clock>,
    pub scan: ScanSettings,
}

pub struct CosinussManager {
    platform: Arc<dyn BlePlatform>,
    preferences: Arc<dyn KeyValueStore>,
    pairing_store: PairingStore,
    status: StatusPublisher,
    aggregator: Arc<Aggregator>,
    study: Arc<dyn StudyConfig>,
    clock: Arc<dyn Clock>,
    scanner: BleScanner,
    subscriptions: DescriptorWriteQueue,
    current: Option<SensorIdentity>,
    pending: Option<PendingPairing>,
    /// Set while the wearing-completed signal is armed.
    connected_at_ms: Option<i64>,
}

impl CosinussManager {
    pub fn new(context: ManagerContext, ticks: mpsc::UnboundedSender<WatchdogTick>) -> Self {
        let scanner = BleScanner::new(
            context.platform.clone(),
            Duration::from_millis(context.scan.restart_delay_ms),
            ticks,
        );
        Self {
            pairing_store: PairingStore::new(context.preferences.clone()),
            platform: context.platform,
            preferences: context.preferences,
            status: context.status,
            aggregator: context.aggregator,
            study: context.study,
            clock: context.clock,
            scanner,
            subscriptions: DescriptorWriteQueue::new(),
            current: None,
            pending: None,
            connected_at_ms: None,
        }
    }

    /// Restore the paired device and the last sync time, reconnecting when
    /// the device is still bonded.
    pub fn init(&mut self) {
        if let Some(time) = persistence::load_last_sync_time(self.preferences.as_ref()) {
            self.status.set_last_sync_time(time);
        }

        let enabled = self.platform.is_enabled();
        self.status.set_bluetooth_enabled(enabled);

        let Some(stored) = self.pairing_store.load() else {
            return;
        };

        if !enabled {
            info!(address = %stored.address, "Bluetooth is off, keeping paired earpiece");
            self.set_current(Some(stored));
            return;
        }

        if !self.platform.bonded_devices().contains(&stored.address) {
            info!(
                target: DIAGNOSTICS_TARGET,
                address = %stored.address,
                "Earpiece bond was removed externally, forgetting it"
            );
            if let Err(e) = self.forget_paired() {
                warn!("{}", e);
            }
            return;
        }

        info!(address = %stored.address, "Restoring paired earpiece");
        let address = stored.address.clone();
        self.set_current(Some(stored));
        if let Err(e) = self.platform.connect_gatt(&address) {
            warn!(%address, "Reconnect request failed: {}", e);
        }
    }

    pub fn current_device(&self) -> Option<&SensorIdentity> {
        self.current.as_ref()
    }

    pub fn is_pairing(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    pub fn start_scan(&mut self, listener: mpsc::UnboundedSender<ScanEvent>) -> Result<(), SensorError> {
        self.scanner.start(listener)
    }

    pub fn stop_scan(&mut self) {
        self.scanner.stop();
    }

    pub fn on_watchdog_tick(&mut self, tick: WatchdogTick) {
        self.scanner.on_watchdog_tick(tick);
    }

    /// Pair with a device reported by the last scan. Any previously paired
    /// device is unpaired first.
    pub fn pair(
        &mut self,
        address: &str,
        listener: mpsc::UnboundedSender<PairingEvent>,
    ) -> Result<(), SensorError> {
        let identity = self
            .scanner
            .scanned_device(address)
            .cloned()
            .ok_or_else(|| SensorError::UnknownDevice(address.to_string()))?;
        if !self.platform.is_enabled() {
            return Err(SensorError::BluetoothDisabled);
        }

        self.scanner.stop();
        if self.current.is_some() || self.pending.is_some() {
            self.unpair();
        }

        info!(
            address = %identity.address,
            name = identity.display_name(),
            "Pairing with earpiece"
        );
        let bonded = self.platform.bond_state(address) == BondState::Bonded;
        self.pending = Some(PendingPairing { identity, listener });

        let requested = if bonded {
            self.platform.connect_gatt(address)
        } else {
            self.platform.create_bond(address)
        };
        if let Err(e) = requested {
            self.pending = None;
            return Err(e.into());
        }
        Ok(())
    }

    pub fn cancel_pairing(&mut self) {
        if let Some(pending) = self.pending.take() {
            info!(address = %pending.identity.address, "Pairing cancelled");
            let _ = pending.listener.send(PairingEvent::Cancelled);
        }
    }

    /// Forget the paired device: close the link, drop the platform bond and
    /// the persisted identity, and cancel a pending pairing.
    pub fn unpair(&mut self) {
        self.cancel_pairing();
        self.close_link();

        let Some(current) = self.current.take() else {
            return;
        };
        if let Err(e) = self.platform.remove_bond(&current.address) {
            debug!(address = %current.address, "Bond removal failed: {}", e);
        }
        if let Err(e) = self.forget_paired() {
            warn!("{}", e);
        }
        self.status.set_current_device(None);
        info!(target: DIAGNOSTICS_TARGET, address = %current.address, "Earpiece unpaired");
    }

    /// Streaming devices have nothing to pull; data arrives continuously.
    pub fn start_synchronization(&self) {
        debug!("Earpiece streams continuously, nothing to synchronize");
    }

    pub fn acquire_battery_level(&self) -> Result<(), SensorError> {
        if self.current.is_none() || self.status.reader().connection_state() != ConnectionState::Connected {
            return Err(PlatformError::NotConnected.into());
        }
        self.platform.read_characteristic(&BATTERY_LEVEL)?;
        Ok(())
    }

    pub fn handle_event(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::AdapterStateChanged(state) => self.on_adapter_state(state),
            PlatformEvent::BondStateChanged {
                address,
                previous,
                current,
            } => self.on_bond_state(&address, previous, current),
            PlatformEvent::ScanResult { address, name } => {
                self.scanner.on_scan_result(&address, name.as_deref())
            }
            PlatformEvent::ScanFailed { code } => self.scanner.on_scan_failed(code),
            PlatformEvent::ConnectionStateChanged { address, state } => {
                self.on_connection_state(&address, state)
            }
            PlatformEvent::ServicesDiscovered(services) => {
                connection::subscribe_all(&services, &mut self.subscriptions, self.platform.as_ref());
            }
            PlatformEvent::DescriptorWritten {
                characteristic,
                success,
            } => self
                .subscriptions
                .on_write_complete(&characteristic, success, self.platform.as_ref()),
            PlatformEvent::CharacteristicChanged {
                characteristic,
                value,
            }
            | PlatformEvent::CharacteristicRead {
                characteristic,
                value,
            } => self.on_characteristic_value(&characteristic, &value),
        }
    }

    fn on_adapter_state(&mut self, state: AdapterState) {
        match state {
            AdapterState::On => {
                info!("Bluetooth turned on");
                self.status.set_bluetooth_enabled(true);
                let Some(current) = &self.current else {
                    return;
                };
                if self.platform.bonded_devices().contains(&current.address) {
                    if let Err(e) = self.platform.connect_gatt(&current.address) {
                        warn!(address = %current.address, "Reconnect request failed: {}", e);
                    }
                }
            }
            AdapterState::TurningOff | AdapterState::Off => {
                info!("Bluetooth turned off");
                self.status.set_bluetooth_enabled(false);
                self.close_link();
                self.scanner.fail(SensorError::BluetoothDisabled.to_string());
            }
            AdapterState::TurningOn => {}
        }
    }

    fn on_bond_state(&mut self, address: &str, previous: BondState, current: BondState) {
        debug!(address, ?previous, ?current, "Bond state changed");

        if self.pending.as_ref().is_some_and(|p| p.identity.address == address) {
            match current {
                BondState::Bonded => {
                    if let Err(e) = self.platform.connect_gatt(address) {
                        self.fail_pairing(format!("Could not connect: {}", e));
                    }
                }
                BondState::None if previous == BondState::Bonding => {
                    self.fail_pairing("Bonding was interrupted".to_string());
                }
                _ => {}
            }
            return;
        }

        let is_current = self.current.as_ref().is_some_and(|c| c.address == address);
        if is_current && current == BondState::None {
            info!(address, "Earpiece bond removed, unpairing");
            self.unpair();
        }
    }

    fn on_connection_state(&mut self, address: &str, state: GattConnectionState) {
        if state == GattConnectionState::Connected {
            self.complete_pairing(address);
        }

        let is_current = self.current.as_ref().is_some_and(|c| c.address == address);
        if !is_current {
            debug!(address, ?state, "Ignoring connection change of unknown device");
            return;
        }

        match state {
            GattConnectionState::Connecting => {
                self.status.set_connection_state(ConnectionState::Connecting);
            }
            GattConnectionState::Connected => {
                info!(address, "Earpiece connected");
                self.status.set_connection_state(ConnectionState::Connected);
                self.connected_at_ms = Some(self.clock.now_ms());
                if let Err(e) = self.platform.discover_services() {
                    error!(address, "Service discovery failed: {}", e);
                }
            }
            GattConnectionState::Disconnected => {
                info!(address, "Earpiece disconnected");
                self.subscriptions.clear();
                self.connected_at_ms = None;
                self.status.set_connection_state(ConnectionState::Disconnected);
            }
        }
    }

    /// First GATT connection after bonding makes the pending target the
    /// paired device.
    fn complete_pairing(&mut self, address: &str) {
        if !self.pending.as_ref().is_some_and(|p| p.identity.address == address) {
            return;
        }
        let Some(pending) = self.pending.take() else {
            return;
        };

        if let Err(e) = self.pairing_store.save(&pending.identity) {
            error!("Failed to persist paired earpiece: {}", e);
        }
        info!(
            target: DIAGNOSTICS_TARGET,
            address = %pending.identity.address,
            name = pending.identity.display_name(),
            "Earpiece paired"
        );
        self.set_current(Some(pending.identity));
        let _ = pending.listener.send(PairingEvent::Succeeded);
    }

    fn fail_pairing(&mut self, reason: String) {
        if let Some(pending) = self.pending.take() {
            warn!(address = %pending.identity.address, "Pairing failed: {}", reason);
            let _ = pending.listener.send(PairingEvent::Failed(reason));
        }
    }

    fn forget_paired(&self) -> Result<(), SensorError> {
        self.pairing_store.clear()?;
        Ok(())
    }

    fn set_current(&mut self, identity: Option<SensorIdentity>) {
        self.status.set_current_device(identity.clone());
        self.current = identity;
    }

    fn close_link(&mut self) {
        self.platform.close_gatt();
        self.subscriptions.clear();
        self.connected_at_ms = None;
        if self.status.reader().connection_state() != ConnectionState::Disconnected {
            self.status.set_connection_state(ConnectionState::Disconnected);
        }
    }

    fn firmware(&self) -> FirmwareGeneration {
        self.current
            .as_ref()
            .map(SensorIdentity::firmware_generation)
            .unwrap_or_default()
    }

    fn on_characteristic_value(&mut self, characteristic: &Uuid, value: &[u8]) {
        let firmware = self.firmware();
        match protocol::decode(characteristic, value, firmware) {
            Some(SensorReading::HeartRate(measurement)) => {
                self.status.set_heart_rate(measurement.bpm);
                self.aggregator.add_heart_measurement(measurement, firmware);
            }
            Some(SensorReading::Temperature(celsius)) => {
                self.status.set_body_temperature(celsius);
                self.aggregator.add_temperature(celsius, firmware);
            }
            Some(SensorReading::Quality(raw)) => {
                self.status
                    .set_positioning_quality(quality::normalize(raw, firmware));
                self.aggregator.add_quality(raw, firmware);
            }
            Some(SensorReading::Battery(level)) => {
                debug!(level, "Battery level");
                self.status.set_battery_level(level);
            }
            None => {
                trace!(%characteristic, "Nothing decoded");
                return;
            }
        }
        self.check_wearing_completed();
    }

    fn check_wearing_completed(&mut self) {
        let Some(connected_at) = self.connected_at_ms else {
            return;
        };
        let duration = self.study.wearing_duration_ms();
        if duration <= 0 {
            return;
        }
        if self.clock.now_ms() - connected_at > duration {
            info!("Earpiece worn long enough today");
            self.connected_at_ms = None;
            self.status.signal(SensorSignal::WearingCompleted);
        }
    }
}
