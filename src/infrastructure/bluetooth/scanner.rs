//! BLE Scanner Module
//!
//! Discovers earpieces by advertised name. Platform scans go stale on some
//! stacks, so a watchdog restarts the scan until the first device shows up.

use crate::domain::error::SensorError;
use crate::domain::models::{ScanEvent, SensorIdentity};
use crate::infrastructure::bluetooth::platform::BlePlatform;
use crate::infrastructure::bluetooth::protocol::DEVICE_NAME_FILTER;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Posted by the watchdog timer into the owning event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogTick {
    pub generation: u64,
}

/// Re-armable delayed tick. Only the tick of the latest arming counts.
pub struct ScanWatchdog {
    delay: Duration,
    generation: u64,
    task: Option<JoinHandle<()>>,
    ticks: mpsc::UnboundedSender<WatchdogTick>,
}

impl ScanWatchdog {
    pub fn new(delay: Duration, ticks: mpsc::UnboundedSender<WatchdogTick>) -> Self {
        Self {
            delay,
            generation: 0,
            task: None,
            ticks,
        }
    }

    pub fn arm(&mut self) {
        self.cancel();
        self.generation += 1;

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, scan watchdog not armed");
            return;
        };
        let tick = WatchdogTick {
            generation: self.generation,
        };
        let delay = self.delay;
        let ticks = self.ticks.clone();
        self.task = Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = ticks.send(tick);
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    pub fn is_current(&self, tick: &WatchdogTick) -> bool {
        self.task.is_some() && tick.generation == self.generation
    }
}

impl Drop for ScanWatchdog {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// BLE Scanner for discovering earpieces
pub struct BleScanner {
    platform: Arc<dyn BlePlatform>,
    watchdog: ScanWatchdog,
    listener: Option<mpsc::UnboundedSender<ScanEvent>>,
    scanned: HashMap<String, SensorIdentity>,
}

impl BleScanner {
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        restart_delay: Duration,
        ticks: mpsc::UnboundedSender<WatchdogTick>,
    ) -> Self {
        Self {
            platform,
            watchdog: ScanWatchdog::new(restart_delay, ticks),
            listener: None,
            scanned: HashMap::new(),
        }
    }

    /// Start scanning, reporting every newly seen earpiece to `listener`.
    /// A running scan is stopped first.
    pub fn start(&mut self, listener: mpsc::UnboundedSender<ScanEvent>) -> Result<(), SensorError> {
        self.stop();
        self.scanned.clear();

        if !self.platform.is_enabled() {
            return Err(SensorError::BluetoothDisabled);
        }

        info!("Starting BLE scan for {:?}", DEVICE_NAME_FILTER);
        self.platform.start_scan(&DEVICE_NAME_FILTER)?;
        self.listener = Some(listener);
        self.watchdog.arm();
        Ok(())
    }

    pub fn stop(&mut self) {
        self.watchdog.cancel();
        if self.listener.take().is_some() {
            info!("Stopping BLE scan...");
            self.platform.stop_scan();
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.listener.is_some()
    }

    /// A device seen during the current or the last scan.
    pub fn scanned_device(&self, address: &str) -> Option<&SensorIdentity> {
        self.scanned.get(address)
    }

    pub fn on_scan_result(&mut self, address: &str, name: Option<&str>) {
        let Some(listener) = &self.listener else {
            return;
        };
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return;
        };
        if self.scanned.contains_key(address) {
            return;
        }

        let identity = SensorIdentity::new(address, Some(name.to_string()));
        info!(address, name, "Found earpiece");
        self.scanned.insert(address.to_string(), identity.clone());
        self.watchdog.cancel();

        if listener.send(ScanEvent::DeviceFound(identity)).is_err() {
            debug!("Scan listener dropped");
            self.stop();
        }
    }

    pub fn on_scan_failed(&mut self, code: i32) {
        self.fail(format!("BLE scan failed. (Error Code: {})", code));
    }

    /// End the scan and report `reason` to its listener, if one is active.
    pub fn fail(&mut self, reason: String) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        warn!("{}", reason);
        self.watchdog.cancel();
        self.platform.stop_scan();
        let _ = listener.send(ScanEvent::Failed(reason));
    }

    pub fn on_watchdog_tick(&mut self, tick: WatchdogTick) {
        if !self.watchdog.is_current(&tick) || !self.is_scanning() {
            return;
        }

        info!("No earpiece found yet, restarting scan");
        self.platform.stop_scan();
        if let Err(e) = self.platform.start_scan(&DEVICE_NAME_FILTER) {
            self.fail(e.to_string());
            return;
        }
        self.watchdog.arm();
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        self.stop();
    }
}
