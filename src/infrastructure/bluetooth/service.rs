//! Sensor Service Module
//!
//! Runs the connection state machine on one task. Commands from the
//! application, platform events and watchdog ticks are multiplexed into a
//! single loop so the manager never needs a lock.

use crate::domain::aggregator::Aggregator;
use crate::domain::clock::Clock;
use crate::domain::error::SensorError;
use crate::domain::models::{PairingEvent, ScanEvent, SensorIdentity};
use crate::domain::sensor::SensorDevice;
use crate::domain::settings::{AggregationSettings, ScanSettings, StudyConfig};
use crate::domain::status::{StatusPublisher, StatusReader};
use crate::infrastructure::bluetooth::manager::{CosinussManager, ManagerContext};
use crate::infrastructure::bluetooth::platform::{BlePlatform, PlatformEvent};
use crate::infrastructure::persistence::KeyValueStore;
use crate::infrastructure::storage::{EligibilityGate, RecordStore, StorageWorker};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug)]
pub enum SensorCommand {
    StartScan(mpsc::UnboundedSender<ScanEvent>),
    StopScan,
    Pair {
        address: String,
        listener: mpsc::UnboundedSender<PairingEvent>,
    },
    CancelPairing,
    Unpair,
    StartSynchronization,
    AcquireBatteryLevel,
}

/// Everything the service needs from its surroundings.
pub struct SensorServiceConfig {
    pub platform: Arc<dyn BlePlatform>,
    pub platform_events: mpsc::UnboundedReceiver<PlatformEvent>,
    pub preferences: Arc<dyn KeyValueStore>,
    pub records: Arc<dyn RecordStore>,
    pub eligibility: Arc<dyn EligibilityGate>,
    pub study: Arc<dyn StudyConfig>,
    pub clock: Arc<dyn Clock>,
    pub aggregation: AggregationSettings,
    pub scan: ScanSettings,
}

pub struct SensorService;

impl SensorService {
    /// Spawn the service and its storage worker on the current runtime.
    pub fn spawn(config: SensorServiceConfig) -> (CosinussHandle, JoinHandle<()>) {
        let status = StatusPublisher::new();
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let aggregator = Aggregator::new(
            config.clock.clone(),
            config.aggregation.clone(),
            batch_tx,
            status.clone(),
        );

        StorageWorker::new(
            config.records,
            config.eligibility,
            config.preferences.clone(),
            status.clone(),
            config.clock.clone(),
            config.aggregation.min_plausible_bpm,
        )
        .spawn(batch_rx);

        let (tick_tx, mut ticks) = mpsc::unbounded_channel();
        let mut manager = CosinussManager::new(
            ManagerContext {
                platform: config.platform,
                preferences: config.preferences,
                status: status.clone(),
                aggregator,
                study: config.study,
                clock: config.clock,
                scan: config.scan,
            },
            tick_tx,
        );

        let (cmd_tx, mut commands) = mpsc::unbounded_channel();
        let mut events = config.platform_events;

        let task = tokio::spawn(async move {
            manager.init();
            info!("Sensor service started");

            loop {
                tokio::select! {
                    command = commands.recv() => match command {
                        Some(command) => handle_command(&mut manager, command),
                        None => break,
                    },
                    Some(event) = events.recv() => manager.handle_event(event),
                    Some(tick) = ticks.recv() => manager.on_watchdog_tick(tick),
                }
            }

            manager.stop_scan();
            info!("Sensor service stopped");
        });

        let handle = CosinussHandle {
            commands: cmd_tx,
            status: status.reader(),
        };
        (handle, task)
    }
}

fn handle_command(manager: &mut CosinussManager, command: SensorCommand) {
    debug!("Sensor command: {:?}", command);
    match command {
        SensorCommand::StartScan(listener) => {
            if let Err(e) = manager.start_scan(listener.clone()) {
                error!("Failed to start scan: {}", e);
                let _ = listener.send(ScanEvent::Failed(e.to_string()));
            }
        }
        SensorCommand::StopScan => manager.stop_scan(),
        SensorCommand::Pair { address, listener } => {
            if let Err(e) = manager.pair(&address, listener.clone()) {
                error!(%address, "Pairing failed: {}", e);
                let _ = listener.send(PairingEvent::Failed(e.to_string()));
            }
        }
        SensorCommand::CancelPairing => manager.cancel_pairing(),
        SensorCommand::Unpair => manager.unpair(),
        SensorCommand::StartSynchronization => manager.start_synchronization(),
        SensorCommand::AcquireBatteryLevel => {
            if let Err(e) = manager.acquire_battery_level() {
                debug!("Battery level not available: {}", e);
            }
        }
    }
}

/// Cloneable front end of a running [`SensorService`]. The service stops
/// once every handle is dropped.
#[derive(Clone)]
pub struct CosinussHandle {
    commands: mpsc::UnboundedSender<SensorCommand>,
    status: StatusReader,
}

impl CosinussHandle {
    fn send(&self, command: SensorCommand) {
        if self.commands.send(command).is_err() {
            error!("{}", SensorError::ServiceStopped);
        }
    }
}

impl SensorDevice for CosinussHandle {
    fn start_scan(&self) -> mpsc::UnboundedReceiver<ScanEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.send(SensorCommand::StartScan(tx));
        rx
    }

    fn stop_scan(&self) {
        self.send(SensorCommand::StopScan);
    }

    fn pair(&self, address: &str) -> mpsc::UnboundedReceiver<PairingEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.send(SensorCommand::Pair {
            address: address.to_string(),
            listener: tx,
        });
        rx
    }

    fn cancel_pairing(&self) {
        self.send(SensorCommand::CancelPairing);
    }

    fn unpair(&self) {
        self.send(SensorCommand::Unpair);
    }

    fn start_synchronization(&self) {
        self.send(SensorCommand::StartSynchronization);
    }

    fn acquire_battery_level(&self) {
        self.send(SensorCommand::AcquireBatteryLevel);
    }

    fn current_device(&self) -> Option<SensorIdentity> {
        self.status.current_device()
    }

    fn status(&self) -> StatusReader {
        self.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::SystemClock;
    use crate::domain::settings::{StaticStudyConfig, WearingConfig};
    use crate::infrastructure::bluetooth::simulated::SimulatedPlatform;
    use crate::infrastructure::persistence::MemoryStore;
    use crate::infrastructure::storage::{AlwaysEligible, MemoryRecordStore};

    fn spawn(platform: Arc<SimulatedPlatform>, events: mpsc::UnboundedReceiver<PlatformEvent>) -> (CosinussHandle, JoinHandle<()>) {
        SensorService::spawn(SensorServiceConfig {
            platform,
            platform_events: events,
            preferences: Arc::new(MemoryStore::new()),
            records: Arc::new(MemoryRecordStore::default()),
            eligibility: Arc::new(AlwaysEligible),
            study: Arc::new(StaticStudyConfig::new(WearingConfig::default())),
            clock: Arc::new(SystemClock),
            aggregation: AggregationSettings::default(),
            scan: ScanSettings::default(),
        })
    }

    #[tokio::test]
    async fn test_scan_with_radio_off_reports_failure() {
        let (platform, events) = SimulatedPlatform::new();
        platform.set_enabled(false);
        let (handle, _task) = spawn(platform, events);

        let mut scan = handle.start_scan();
        assert_eq!(
            scan.recv().await,
            Some(ScanEvent::Failed("Bluetooth is disabled".into()))
        );
    }

    #[tokio::test]
    async fn test_pair_unknown_device_reports_failure() {
        let (platform, events) = SimulatedPlatform::new();
        let (handle, _task) = spawn(platform, events);

        let mut pairing = handle.pair("00:11");
        assert!(matches!(pairing.recv().await, Some(PairingEvent::Failed(_))));
        assert_eq!(handle.current_device(), None);
    }

    #[tokio::test]
    async fn test_service_stops_when_handles_drop() {
        let (platform, events) = SimulatedPlatform::new();
        let (handle, task) = spawn(platform, events);

        drop(handle);
        task.await.unwrap();
    }
}
