//! System BLE platform.
//!
//! Drives the operating system's Bluetooth stack through `btleplug`. Every
//! command is handed to a task on the runtime and its outcome is reported as
//! a [`PlatformEvent`], the same way the stack's callbacks would.
//!
//! Bonding is left to the operating system, which pairs on the first
//! encrypted access. Bonds created here are remembered for the lifetime of
//! the process; [`SystemPlatform::remember_bond`] restores them on startup.

use crate::domain::error::PlatformError;
use crate::infrastructure::bluetooth::platform::{
    BlePlatform, BondState, CharacteristicProperties, GattCharacteristic, GattConnectionState,
    GattService, PlatformEvent,
};
use crate::infrastructure::bluetooth::protocol::CLIENT_CHARACTERISTIC_CONFIG;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, Service, ValueNotification,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::stream::{Stream, StreamExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// How often an absent earpiece is looked for again.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);

/// btleplug reports no scan failure codes; this is the platform's
/// "internal error" code.
const SCAN_FAILED_INTERNAL_ERROR: i32 = 3;

const DISABLE_VALUE: [u8; 2] = [0x00, 0x00];

/// An open GATT link the caller wants kept alive.
struct Link {
    address: String,
    peripheral: Option<Peripheral>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            peripheral: None,
            tasks: Vec::new(),
        }
    }

    fn detach(&mut self) {
        self.peripheral = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.detach();
    }
}

#[derive(Default)]
struct LinkState {
    scan_names: Option<Vec<String>>,
    bonded: HashSet<String>,
    link: Option<Link>,
}

struct Shared {
    adapter: Adapter,
    runtime: Handle,
    events: mpsc::UnboundedSender<PlatformEvent>,
    state: Mutex<LinkState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: PlatformEvent) {
        let _ = self.events.send(event);
    }

    fn wants_link(&self, address: &str) -> bool {
        self.lock()
            .link
            .as_ref()
            .is_some_and(|l| l.address == address)
    }

    fn connected_peripheral(&self) -> Result<Peripheral, PlatformError> {
        self.lock()
            .link
            .as_ref()
            .and_then(|l| l.peripheral.clone())
            .ok_or(PlatformError::NotConnected)
    }

    /// Hand a connected peripheral and its notification pump to the link.
    /// `false` if the link was closed in the meantime.
    fn attach(&self, address: &str, peripheral: Peripheral, pump: JoinHandle<()>) -> bool {
        let mut state = self.lock();
        match state.link.as_mut() {
            Some(link) if link.address == address => {
                link.tasks.retain(|t| !t.is_finished());
                link.tasks.push(pump);
                link.peripheral = Some(peripheral);
                true
            }
            _ => {
                pump.abort();
                false
            }
        }
    }

    fn spawn_establish(self: &Arc<Self>, address: String) {
        let task = self.runtime.spawn(establish(self.clone(), address.clone()));
        let mut state = self.lock();
        match state.link.as_mut() {
            Some(link) if link.address == address => link.tasks.push(task),
            _ => task.abort(),
        }
    }

    fn spawn_scan(&self) {
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.start_scan(ScanFilter::default()).await {
                error!("BLE scan could not be started: {}", e);
                let _ = events.send(PlatformEvent::ScanFailed {
                    code: SCAN_FAILED_INTERNAL_ERROR,
                });
            }
        });
    }

    async fn find_peripheral(&self, address: &str) -> Option<Peripheral> {
        let peripherals = match self.adapter.peripherals().await {
            Ok(peripherals) => peripherals,
            Err(e) => {
                debug!("Listing peripherals failed: {}", e);
                return None;
            }
        };
        peripherals
            .into_iter()
            .find(|p| address_matches(&p.address().to_string(), address))
    }

    async fn report_scan_result(&self, id: &PeripheralId) {
        let Some(names) = self.lock().scan_names.clone() else {
            return;
        };
        let Ok(peripheral) = self.adapter.peripheral(id).await else {
            return;
        };
        let name = match peripheral.properties().await {
            Ok(Some(properties)) => properties.local_name,
            _ => None,
        };
        let Some(name) = name.filter(|n| names.iter().any(|f| f == n)) else {
            return;
        };
        self.emit(PlatformEvent::ScanResult {
            address: peripheral.address().to_string(),
            name: Some(name),
        });
    }

    async fn on_disconnected(self: &Arc<Self>, id: &PeripheralId) {
        let Ok(peripheral) = self.adapter.peripheral(id).await else {
            return;
        };
        let disconnected = peripheral.address().to_string();
        let address = {
            let mut state = self.lock();
            match state.link.as_mut() {
                Some(link) if address_matches(&link.address, &disconnected) => {
                    link.detach();
                    link.address.clone()
                }
                _ => return,
            }
        };

        info!(%address, "GATT link lost, waiting for the earpiece to return");
        self.emit(PlatformEvent::ConnectionStateChanged {
            address: address.clone(),
            state: GattConnectionState::Disconnected,
        });
        self.spawn_establish(address);
    }
}

/// Find the earpiece, connect and start forwarding its notifications.
/// Retries until the link is closed.
async fn establish(shared: Arc<Shared>, address: String) {
    let peripheral = loop {
        if !shared.wants_link(&address) {
            return;
        }
        if let Some(peripheral) = shared.find_peripheral(&address).await {
            break peripheral;
        }
        trace!(%address, "Earpiece not in range");
        if let Err(e) = shared.adapter.start_scan(ScanFilter::default()).await {
            debug!("Background scan failed: {}", e);
        }
        tokio::time::sleep(RECONNECT_INTERVAL).await;
    };

    shared.emit(PlatformEvent::ConnectionStateChanged {
        address: address.clone(),
        state: GattConnectionState::Connecting,
    });
    while let Err(e) = peripheral.connect().await {
        debug!(%address, "Connect attempt failed: {}", e);
        tokio::time::sleep(RECONNECT_INTERVAL).await;
        if !shared.wants_link(&address) {
            return;
        }
    }

    let scanning = shared.lock().scan_names.is_some();
    if !scanning {
        if let Err(e) = shared.adapter.stop_scan().await {
            debug!("Stopping background scan failed: {}", e);
        }
    }

    let notifications = match peripheral.notifications().await {
        Ok(notifications) => notifications,
        Err(e) => {
            error!(%address, "Cannot receive notifications: {}", e);
            return;
        }
    };
    let pump = tokio::spawn(forward_notifications(shared.clone(), notifications));
    if shared.attach(&address, peripheral, pump) {
        shared.emit(PlatformEvent::ConnectionStateChanged {
            address,
            state: GattConnectionState::Connected,
        });
    }
}

async fn forward_notifications<S>(shared: Arc<Shared>, mut notifications: S)
where
    S: Stream<Item = ValueNotification> + Unpin,
{
    while let Some(notification) = notifications.next().await {
        shared.emit(PlatformEvent::CharacteristicChanged {
            characteristic: notification.uuid,
            value: notification.value,
        });
    }
}

async fn pump_central_events(shared: Arc<Shared>) {
    let mut events = match shared.adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            error!("Cannot listen to Bluetooth events: {}", e);
            return;
        }
    };
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                shared.report_scan_result(&id).await
            }
            CentralEvent::DeviceDisconnected(id) => shared.on_disconnected(&id).await,
            _ => {}
        }
    }
    debug!("Bluetooth event stream ended");
}

fn address_matches(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn backend_error(operation: &'static str) -> impl FnOnce(btleplug::Error) -> PlatformError {
    move |e| PlatformError::Backend {
        operation,
        reason: e.to_string(),
    }
}

fn gatt_characteristic(characteristic: &Characteristic) -> GattCharacteristic {
    let properties = CharacteristicProperties {
        read: characteristic.properties.contains(CharPropFlags::READ),
        notify: characteristic.properties.contains(CharPropFlags::NOTIFY),
        indicate: characteristic.properties.contains(CharPropFlags::INDICATE),
    };
    GattCharacteristic {
        uuid: characteristic.uuid,
        // Not every stack lists descriptors; btleplug writes the
        // configuration descriptor itself when subscribing.
        has_config_descriptor: properties.notify
            || properties.indicate
            || characteristic
                .descriptors
                .iter()
                .any(|d| d.uuid == CLIENT_CHARACTERISTIC_CONFIG),
        properties,
    }
}

fn gatt_service(service: &Service) -> GattService {
    GattService {
        uuid: service.uuid,
        characteristics: service.characteristics.iter().map(gatt_characteristic).collect(),
    }
}

fn find_characteristic(peripheral: &Peripheral, uuid: &Uuid) -> Result<Characteristic, PlatformError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == *uuid)
        .ok_or(PlatformError::UnknownCharacteristic(*uuid))
}

pub struct SystemPlatform {
    shared: Arc<Shared>,
    central_events: JoinHandle<()>,
    _manager: Manager,
}

impl SystemPlatform {
    /// Open the first Bluetooth adapter of the system.
    pub async fn open() -> Result<(Arc<Self>, mpsc::UnboundedReceiver<PlatformEvent>), PlatformError> {
        let manager = Manager::new()
            .await
            .map_err(backend_error("opening the Bluetooth manager"))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(backend_error("listing Bluetooth adapters"))?
            .into_iter()
            .next()
            .ok_or(PlatformError::AdapterUnavailable)?;
        match adapter.adapter_info().await {
            Ok(name) => info!("Using Bluetooth adapter {}", name),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            adapter,
            runtime: Handle::current(),
            events,
            state: Mutex::new(LinkState::default()),
        });
        let central_events = tokio::spawn(pump_central_events(shared.clone()));
        let platform = Arc::new(Self {
            shared,
            central_events,
            _manager: manager,
        });
        Ok((platform, rx))
    }

    /// Treat `address` as bonded, e.g. a device paired in an earlier run.
    pub fn remember_bond(&self, address: &str) {
        self.shared.lock().bonded.insert(address.to_string());
    }
}

impl Drop for SystemPlatform {
    fn drop(&mut self) {
        self.central_events.abort();
        self.shared.lock().link = None;
    }
}

impl BlePlatform for SystemPlatform {
    /// An adapter was found when the platform was opened. Later radio state
    /// changes are not observed.
    fn is_enabled(&self) -> bool {
        true
    }

    fn bonded_devices(&self) -> Vec<String> {
        self.shared.lock().bonded.iter().cloned().collect()
    }

    fn bond_state(&self, address: &str) -> BondState {
        if self.shared.lock().bonded.contains(address) {
            BondState::Bonded
        } else {
            BondState::None
        }
    }

    fn start_scan(&self, names: &[&str]) -> Result<(), PlatformError> {
        self.shared.lock().scan_names = Some(names.iter().map(|n| n.to_string()).collect());
        self.shared.spawn_scan();
        Ok(())
    }

    fn stop_scan(&self) {
        self.shared.lock().scan_names = None;
        let adapter = self.shared.adapter.clone();
        self.shared.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                debug!("Stopping scan failed: {}", e);
            }
        });
    }

    fn create_bond(&self, address: &str) -> Result<(), PlatformError> {
        debug!(address, "Bonding is handled by the operating system on connect");
        self.shared.lock().bonded.insert(address.to_string());
        for (previous, current) in [
            (BondState::None, BondState::Bonding),
            (BondState::Bonding, BondState::Bonded),
        ] {
            self.shared.emit(PlatformEvent::BondStateChanged {
                address: address.to_string(),
                previous,
                current,
            });
        }
        Ok(())
    }

    fn remove_bond(&self, address: &str) -> Result<(), PlatformError> {
        self.shared.lock().bonded.remove(address);
        Err(PlatformError::Unsupported("bond removal"))
    }

    fn connect_gatt(&self, address: &str) -> Result<(), PlatformError> {
        self.shared.lock().link = Some(Link::new(address));
        self.shared.spawn_establish(address.to_string());
        Ok(())
    }

    fn close_gatt(&self) {
        let Some(mut link) = self.shared.lock().link.take() else {
            return;
        };
        if let Some(peripheral) = link.peripheral.take() {
            self.shared.runtime.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!("Disconnect failed: {}", e);
                }
            });
        }
    }

    fn discover_services(&self) -> Result<(), PlatformError> {
        let peripheral = self.shared.connected_peripheral()?;
        let shared = self.shared.clone();
        self.shared.runtime.spawn(async move {
            let services = match peripheral.discover_services().await {
                Ok(()) => peripheral.services().iter().map(gatt_service).collect(),
                Err(e) => {
                    error!("Service discovery failed: {}", e);
                    Vec::new()
                }
            };
            shared.emit(PlatformEvent::ServicesDiscovered(services));
        });
        Ok(())
    }

    /// btleplug routes notifications of subscribed characteristics to the
    /// peripheral's stream, so there is nothing to enable locally.
    fn set_characteristic_notification(
        &self,
        characteristic: &Uuid,
        enabled: bool,
    ) -> Result<(), PlatformError> {
        trace!(%characteristic, enabled, "Local notification routing");
        Ok(())
    }

    fn write_descriptor(
        &self,
        characteristic: &Uuid,
        descriptor: &Uuid,
        value: &[u8],
    ) -> Result<(), PlatformError> {
        if *descriptor != CLIENT_CHARACTERISTIC_CONFIG {
            return Err(PlatformError::Unsupported("writing arbitrary descriptors"));
        }
        let peripheral = self.shared.connected_peripheral()?;
        let target = find_characteristic(&peripheral, characteristic)?;
        let enable = value != DISABLE_VALUE.as_slice();
        let shared = self.shared.clone();
        self.shared.runtime.spawn(async move {
            let result = if enable {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };
            if let Err(e) = &result {
                warn!(characteristic = %target.uuid, "Updating subscription failed: {}", e);
            }
            shared.emit(PlatformEvent::DescriptorWritten {
                characteristic: target.uuid,
                success: result.is_ok(),
            });
        });
        Ok(())
    }

    fn read_characteristic(&self, characteristic: &Uuid) -> Result<(), PlatformError> {
        let peripheral = self.shared.connected_peripheral()?;
        let target = find_characteristic(&peripheral, characteristic)?;
        let shared = self.shared.clone();
        self.shared.runtime.spawn(async move {
            match peripheral.read(&target).await {
                Ok(value) => shared.emit(PlatformEvent::CharacteristicRead {
                    characteristic: target.uuid,
                    value,
                }),
                Err(e) => warn!(characteristic = %target.uuid, "Read failed: {}", e),
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::connection::subscription_for;
    use crate::infrastructure::bluetooth::protocol::{
        BATTERY_LEVEL, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE, HEART_RATE_MEASUREMENT,
        TEMPERATURE_MEASUREMENT,
    };
    use btleplug::api::Descriptor;
    use std::collections::BTreeSet;

    const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

    fn characteristic(uuid: Uuid, properties: CharPropFlags, with_cccd: bool) -> Characteristic {
        let mut descriptors = BTreeSet::new();
        if with_cccd {
            descriptors.insert(Descriptor {
                uuid: CLIENT_CHARACTERISTIC_CONFIG,
                service_uuid: HEART_RATE_SERVICE,
                characteristic_uuid: uuid,
            });
        }
        Characteristic {
            uuid,
            service_uuid: HEART_RATE_SERVICE,
            properties,
            descriptors,
        }
    }

    #[test]
    fn test_notifying_characteristic_is_subscribable() {
        let converted = gatt_characteristic(&characteristic(
            HEART_RATE_MEASUREMENT,
            CharPropFlags::NOTIFY,
            true,
        ));

        assert!(converted.properties.notify);
        assert!(!converted.properties.read);
        assert!(converted.has_config_descriptor);
        assert_eq!(subscription_for(&converted), Some(ENABLE_NOTIFICATION_VALUE));
    }

    #[test]
    fn test_unlisted_descriptor_is_assumed_for_indications() {
        let converted = gatt_characteristic(&characteristic(
            TEMPERATURE_MEASUREMENT,
            CharPropFlags::INDICATE,
            false,
        ));

        assert!(converted.has_config_descriptor);
        assert_eq!(subscription_for(&converted), Some(ENABLE_INDICATION_VALUE));
    }

    #[test]
    fn test_read_only_characteristic_is_not_subscribed() {
        let converted =
            gatt_characteristic(&characteristic(BATTERY_LEVEL, CharPropFlags::READ, false));

        assert!(converted.properties.read);
        assert!(!converted.has_config_descriptor);
        assert_eq!(subscription_for(&converted), None);
    }

    #[test]
    fn test_service_conversion_keeps_every_characteristic() {
        let service = Service {
            uuid: HEART_RATE_SERVICE,
            primary: true,
            characteristics: [
                characteristic(HEART_RATE_MEASUREMENT, CharPropFlags::NOTIFY, true),
                characteristic(BATTERY_LEVEL, CharPropFlags::READ, false),
            ]
            .into_iter()
            .collect(),
        };

        let converted = gatt_service(&service);

        assert_eq!(converted.uuid, HEART_RATE_SERVICE);
        let mut uuids: Vec<Uuid> = converted.characteristics.iter().map(|c| c.uuid).collect();
        uuids.sort();
        let mut expected = vec![HEART_RATE_MEASUREMENT, BATTERY_LEVEL];
        expected.sort();
        assert_eq!(uuids, expected);
    }

    #[test]
    fn test_addresses_compare_case_insensitively() {
        assert!(address_matches("C0:5F:87:0A:0B:0C", "c0:5f:87:0a:0b:0c"));
        assert!(!address_matches("C0:5F:87:0A:0B:0C", "C0:5F:87:0A:0B:0D"));
    }

    #[test]
    fn test_backend_errors_name_the_operation() {
        let error = backend_error("listing Bluetooth adapters")(btleplug::Error::NotConnected);
        assert_eq!(
            error.to_string(),
            format!("listing Bluetooth adapters failed: {}", btleplug::Error::NotConnected)
        );
    }
}
