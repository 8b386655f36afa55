use anyhow::Context;
use inear_link::domain::clock::{Clock, SystemClock};
use inear_link::domain::models::{PairingEvent, ScanEvent};
use inear_link::domain::sensor::SensorDevice;
use inear_link::domain::settings::{BluetoothBackend, SettingsService, StaticStudyConfig};
use inear_link::infrastructure::bluetooth::platform::{BlePlatform, PlatformEvent};
use inear_link::infrastructure::bluetooth::simulated::{spawn_earpiece_feed, SimulatedPlatform};
use inear_link::infrastructure::bluetooth::system::SystemPlatform;
use inear_link::infrastructure::bluetooth::{SensorService, SensorServiceConfig};
use inear_link::infrastructure::persistence::{JsonFileStore, PairingStore};
use inear_link::infrastructure::storage::{AlwaysEligible, JsonLinesRecordStore};
use inear_link::presentation::notifications::{
    LoggingNotifier, NotificationController, WearingReminder,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const DEMO_ADDRESS: &str = "C0:5F:87:00:00:01";
const DEMO_NAME: &str = "one";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let _log_guard = inear_link::infrastructure::logging::init_logger(
        &settings_service.get().log_settings,
    )
    .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
    .ok();

    info!("Starting InEarLink");

    let settings = settings_service.get().clone();
    let data_dir = settings.data_dir()?;
    let preferences = Arc::new(
        JsonFileStore::open(data_dir.join("preferences.json"))
            .context("Failed to open preferences")?,
    );
    let records = Arc::new(
        JsonLinesRecordStore::new(data_dir.clone()).context("Failed to open record store")?,
    );
    info!("Storing records in {}", records.path().display());

    let paired = PairingStore::new(preferences.clone()).load();
    let (platform, platform_events, simulator): (
        Arc<dyn BlePlatform>,
        mpsc::UnboundedReceiver<PlatformEvent>,
        Option<Arc<SimulatedPlatform>>,
    ) = match settings.bluetooth.backend {
        BluetoothBackend::System => {
            let (platform, events) = SystemPlatform::open()
                .await
                .context("Failed to open the Bluetooth adapter")?;
            if let Some(paired) = &paired {
                platform.remember_bond(&paired.address);
            }
            (platform as Arc<dyn BlePlatform>, events, None)
        }
        BluetoothBackend::Simulated => {
            info!("Using the simulated earpiece");
            let (platform, events) = SimulatedPlatform::new();
            platform.set_auto_respond(true);
            // The simulated stack forgets its bonds between runs; restore ours.
            if let Some(paired) = &paired {
                platform.add_bond(&paired.address);
            }
            (platform.clone() as Arc<dyn BlePlatform>, events, Some(platform))
        }
    };

    let study = Arc::new(StaticStudyConfig::new(settings.wearing.clone()));
    let clock = Arc::new(SystemClock);
    let (sensor, service_task) = SensorService::spawn(SensorServiceConfig {
        platform,
        platform_events,
        preferences,
        records,
        eligibility: Arc::new(AlwaysEligible),
        study: study.clone(),
        clock: clock.clone(),
        aggregation: settings.aggregation.clone(),
        scan: settings.scan.clone(),
    });

    let notifier = Arc::new(LoggingNotifier);
    NotificationController::spawn(sensor.status(), notifier.clone());

    let reminder = WearingReminder::new(study.clone(), sensor.status(), notifier, clock.clone());
    tokio::spawn(async move {
        loop {
            let now = clock.now();
            let Some(delay) = study
                .next_reminder_check(now)
                .and_then(|at| (at - now).to_std().ok())
            else {
                warn!("No valid wearing reminder time configured");
                break;
            };
            tokio::time::sleep(delay).await;
            reminder.check();
        }
    });

    // Let the service restore a previously paired earpiece.
    tokio::time::sleep(Duration::from_millis(100)).await;
    if sensor.current_device().is_none() {
        pair_first_earpiece(&sensor, simulator.as_deref()).await?;
    } else {
        info!("Using paired earpiece");
    }

    let feed = simulator.map(|simulator| {
        let firmware = sensor
            .current_device()
            .map(|d| d.firmware_generation())
            .unwrap_or_default();
        spawn_earpiece_feed(simulator, Duration::from_secs(1), firmware)
    });
    sensor.acquire_battery_level();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(feed) = feed {
        feed.abort();
    }
    drop(sensor);
    if let Err(e) = service_task.await {
        error!("Sensor service ended abnormally: {}", e);
    }
    Ok(())
}

/// Scan and pair with the first earpiece found. The simulator is told to
/// advertise its earpiece when it drives the service.
async fn pair_first_earpiece(
    sensor: &impl SensorDevice,
    simulator: Option<&SimulatedPlatform>,
) -> anyhow::Result<()> {
    let mut scan = sensor.start_scan();
    if let Some(simulator) = simulator {
        simulator.advertise(DEMO_ADDRESS, Some(DEMO_NAME));
    } else {
        info!("Scanning, put the earpiece in pairing mode");
    }

    let device = loop {
        match scan.recv().await {
            Some(ScanEvent::DeviceFound(device)) => break device,
            Some(ScanEvent::Failed(reason)) => anyhow::bail!("Scan failed: {}", reason),
            None => anyhow::bail!("Sensor service stopped while scanning"),
        }
    };
    if let Some(pin) = device.pairing_pin() {
        info!("Enter PIN {} on the earpiece prompt", pin);
    }

    let mut pairing = sensor.pair(&device.address);
    match pairing.recv().await {
        Some(PairingEvent::Succeeded) => {
            info!("Paired with {} ({})", device.display_name(), device.address);
            Ok(())
        }
        Some(PairingEvent::Failed(reason)) => anyhow::bail!("Pairing failed: {}", reason),
        Some(PairingEvent::Cancelled) => {
            warn!("Pairing was cancelled");
            Ok(())
        }
        None => anyhow::bail!("Sensor service stopped while pairing"),
    }
}
