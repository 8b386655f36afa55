//! Observable sensor status.
//!
//! `StatusPublisher` is held only by the components that own a value (the
//! connection state machine, the aggregator and the storage worker). UI and
//! notification collaborators get a `StatusReader`, whose receivers are
//! released automatically when dropped.

use crate::domain::models::{
    ConnectionState, LiveReadings, SensorIdentity, SensorSignal, SyncState,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::warn;

struct Channels {
    connection: watch::Sender<ConnectionState>,
    sync: watch::Sender<SyncState>,
    battery: watch::Sender<Option<u8>>,
    readings: watch::Sender<LiveReadings>,
    completed: watch::Sender<Option<LiveReadings>>,
    current_device: watch::Sender<Option<SensorIdentity>>,
    bluetooth_enabled: watch::Sender<bool>,
    signals: broadcast::Sender<SensorSignal>,
}

#[derive(Clone)]
pub struct StatusPublisher {
    channels: Arc<Channels>,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(16);
        Self {
            channels: Arc::new(Channels {
                connection: watch::Sender::new(ConnectionState::Disconnected),
                sync: watch::Sender::new(SyncState::default()),
                battery: watch::Sender::new(None),
                readings: watch::Sender::new(LiveReadings::default()),
                completed: watch::Sender::new(None),
                current_device: watch::Sender::new(None),
                bluetooth_enabled: watch::Sender::new(false),
                signals,
            }),
        }
    }

    pub fn reader(&self) -> StatusReader {
        StatusReader {
            channels: self.channels.clone(),
        }
    }

    /// Publish a new connection state. Losing the connection fails any
    /// synchronization still in progress.
    pub fn set_connection_state(&self, state: ConnectionState) {
        self.channels.connection.send_replace(state);
        let sync_active = self.channels.sync.borrow().is_active();
        if state == ConnectionState::Disconnected && sync_active {
            self.sync_failed("lost connection to sensor");
        }
    }

    pub fn set_current_device(&self, device: Option<SensorIdentity>) {
        self.channels.current_device.send_replace(device);
    }

    pub fn set_bluetooth_enabled(&self, enabled: bool) {
        self.channels.bluetooth_enabled.send_if_modified(|current| {
            let changed = *current != enabled;
            *current = enabled;
            changed
        });
    }

    pub fn set_battery_level(&self, level: u8) {
        self.channels.battery.send_replace(Some(level));
    }

    pub fn set_heart_rate(&self, bpm: u16) {
        self.channels
            .readings
            .send_modify(|r| r.heart_rate = Some(bpm));
    }

    pub fn set_body_temperature(&self, celsius: f32) {
        self.channels
            .readings
            .send_modify(|r| r.temperature = Some(celsius));
    }

    pub fn set_positioning_quality(&self, quality: u8) {
        self.channels
            .readings
            .send_modify(|r| r.quality = Some(quality));
    }

    /// Readings of the most recently completed dataset.
    pub fn dataset_completed(&self, readings: LiveReadings) {
        self.channels.completed.send_replace(Some(readings));
    }

    pub fn set_last_sync_time(&self, time: DateTime<Utc>) {
        self.channels
            .sync
            .send_modify(|s| s.set_last_sync_time(Some(time)));
    }

    pub fn sync_started(&self) {
        self.channels.sync.send_modify(SyncState::started);
    }

    pub fn sync_finished(&self, at: DateTime<Utc>) {
        self.channels.sync.send_modify(|s| s.finished(at));
    }

    pub fn sync_failed(&self, reason: &str) {
        warn!("Sensor synchronization failed: {}", reason);
        self.channels.sync.send_modify(SyncState::failed);
    }

    pub fn signal(&self, signal: SensorSignal) {
        // No subscriber is fine, the signal is simply not shown.
        let _ = self.channels.signals.send(signal);
    }
}

/// Read-only view handed to UI and notification collaborators.
#[derive(Clone)]
pub struct StatusReader {
    channels: Arc<Channels>,
}

impl StatusReader {
    pub fn connection_state(&self) -> ConnectionState {
        *self.channels.connection.borrow()
    }

    pub fn sync_state(&self) -> SyncState {
        self.channels.sync.borrow().clone()
    }

    pub fn battery_level(&self) -> Option<u8> {
        *self.channels.battery.borrow()
    }

    pub fn live_readings(&self) -> LiveReadings {
        *self.channels.readings.borrow()
    }

    pub fn current_device(&self) -> Option<SensorIdentity> {
        self.channels.current_device.borrow().clone()
    }

    pub fn bluetooth_enabled(&self) -> bool {
        *self.channels.bluetooth_enabled.borrow()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.channels.connection.subscribe()
    }

    pub fn subscribe_sync(&self) -> watch::Receiver<SyncState> {
        self.channels.sync.subscribe()
    }

    pub fn subscribe_battery(&self) -> watch::Receiver<Option<u8>> {
        self.channels.battery.subscribe()
    }

    pub fn subscribe_readings(&self) -> watch::Receiver<LiveReadings> {
        self.channels.readings.subscribe()
    }

    pub fn subscribe_completed(&self) -> watch::Receiver<Option<LiveReadings>> {
        self.channels.completed.subscribe()
    }

    pub fn subscribe_current_device(&self) -> watch::Receiver<Option<SensorIdentity>> {
        self.channels.current_device.subscribe()
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<SensorSignal> {
        self.channels.signals.subscribe()
    }
}
