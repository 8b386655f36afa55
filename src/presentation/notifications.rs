//! Notification collaborator.
//!
//! Renders published sensor status as user notifications. The controller only
//! reads the status; it never drives the sensor.

use crate::domain::clock::Clock;
use crate::domain::models::{ConnectionState, LiveReadings, SensorSignal};
use crate::domain::quality::QualityLabel;
use crate::domain::reminder;
use crate::domain::settings::StudyConfig;
use crate::domain::status::StatusReader;
use chrono::{DateTime, Local, Utc};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Content of the ongoing "sensor connected" notification.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConnectedStatus {
    pub heart_rate: Option<u16>,
    pub temperature: Option<f32>,
    pub positioning: Option<QualityLabel>,
}

impl From<LiveReadings> for ConnectedStatus {
    fn from(readings: LiveReadings) -> Self {
        Self {
            heart_rate: readings.heart_rate,
            temperature: readings.temperature,
            positioning: readings.quality.map(QualityLabel::from_normalized),
        }
    }
}

pub trait SensorNotifier: Send + Sync {
    fn show_sync_progress(&self, progress: Option<u8>);
    fn hide_sync_progress(&self);
    fn show_connected(&self, status: ConnectedStatus);
    fn hide_connected(&self);
    /// `end` closes the wearing window when the study configures one.
    fn show_wearing_reminder(
        &self,
        begin: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        duration_minutes: i64,
    );
    fn hide_wearing_reminder(&self);
    fn show_wearing_completed(&self);
    fn hide_wearing_completed(&self);
}

/// Writes notifications to the log, for headless runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

impl SensorNotifier for LoggingNotifier {
    fn show_sync_progress(&self, progress: Option<u8>) {
        match progress {
            Some(p) => info!("[notification] Synchronizing sensor data ({}%)", p),
            None => info!("[notification] Synchronizing sensor data"),
        }
    }

    fn hide_sync_progress(&self) {
        debug!("[notification] Sync indicator hidden");
    }

    fn show_connected(&self, status: ConnectedStatus) {
        let mut lines = Vec::new();
        if let Some(bpm) = status.heart_rate {
            lines.push(format!("Heart rate: {} bpm", bpm));
        }
        if let Some(celsius) = status.temperature {
            lines.push(format!("Temperature: {:.1} °C", celsius));
        }
        if let Some(label) = status.positioning {
            lines.push(format!("Positioning: {:?}", label));
        }
        info!("[notification] Earpiece connected. {}", lines.join(", "));
    }

    fn hide_connected(&self) {
        debug!("[notification] Connected status hidden");
    }

    fn show_wearing_reminder(
        &self,
        begin: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        duration_minutes: i64,
    ) {
        let begin = begin.with_timezone(&Local).format("%H:%M");
        match end {
            Some(end) => info!(
                "[notification] Please wear your earpiece for {} minutes today between {} and {}",
                duration_minutes,
                begin,
                end.with_timezone(&Local).format("%H:%M")
            ),
            None => info!(
                "[notification] Please wear your earpiece today from {} for {} minutes",
                begin, duration_minutes
            ),
        }
    }

    fn hide_wearing_reminder(&self) {
        debug!("[notification] Wearing reminder hidden");
    }

    fn show_wearing_completed(&self) {
        info!("[notification] Earpiece worn long enough today, you may take it off");
    }

    fn hide_wearing_completed(&self) {
        debug!("[notification] Wearing completed reminder hidden");
    }
}

pub struct NotificationController;

impl NotificationController {
    /// Follow `status` until its publisher goes away.
    pub fn spawn(status: StatusReader, notifier: Arc<dyn SensorNotifier>) -> JoinHandle<()> {
        let mut connection = status.subscribe_connection();
        let mut sync = status.subscribe_sync();
        let mut completed = status.subscribe_completed();
        let mut signals = status.subscribe_signals();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = connection.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *connection.borrow_and_update();
                        match state {
                            ConnectionState::Connected => {
                                notifier.show_connected(ConnectedStatus::default());
                                notifier.hide_wearing_reminder();
                            }
                            ConnectionState::Disconnected => {
                                notifier.hide_connected();
                                notifier.hide_wearing_completed();
                            }
                            ConnectionState::Connecting => {}
                        }
                    }
                    changed = sync.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = sync.borrow_and_update().clone();
                        if state.is_active() {
                            notifier.show_sync_progress(state.progress());
                        } else {
                            notifier.hide_sync_progress();
                        }
                    }
                    changed = completed.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let readings = *completed.borrow_and_update();
                        if let Some(readings) = readings {
                            if *connection.borrow() == ConnectionState::Connected {
                                notifier.show_connected(readings.into());
                            }
                        }
                    }
                    signal = signals.recv() => match signal {
                        Ok(SensorSignal::WearingCompleted) => notifier.show_wearing_completed(),
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Notification controller stopped");
        })
    }
}

/// Periodic job deciding whether to nudge the participant.
pub struct WearingReminder {
    study: Arc<dyn StudyConfig>,
    status: StatusReader,
    notifier: Arc<dyn SensorNotifier>,
    clock: Arc<dyn Clock>,
}

impl WearingReminder {
    pub fn new(
        study: Arc<dyn StudyConfig>,
        status: StatusReader,
        notifier: Arc<dyn SensorNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            study,
            status,
            notifier,
            clock,
        }
    }

    /// Show the reminder if due. Returns whether it was shown.
    pub fn check(&self) -> bool {
        let now = self.clock.now();
        let last_sync = self.status.sync_state().last_sync_time();
        let Some(begin) = reminder::needs_wearing_reminder(self.study.as_ref(), last_sync, now)
        else {
            return false;
        };
        let end = self.study.wearing_time_end(now);
        let minutes = self.study.wearing_duration_ms() / 60_000;
        self.notifier.show_wearing_reminder(begin, end, minutes);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;
    use crate::domain::status::StatusPublisher;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Shown {
        SyncProgress(Option<u8>),
        SyncHidden,
        Connected(ConnectedStatus),
        ConnectedHidden,
        Reminder { window_minutes: Option<i64>, duration: i64 },
        ReminderHidden,
        Completed,
        CompletedHidden,
    }

    #[derive(Default)]
    struct RecordingNotifier {
        shown: Mutex<Vec<Shown>>,
    }

    impl RecordingNotifier {
        fn take(&self) -> Vec<Shown> {
            std::mem::take(&mut *self.shown.lock().unwrap())
        }

        fn push(&self, shown: Shown) {
            self.shown.lock().unwrap().push(shown);
        }
    }

    impl SensorNotifier for RecordingNotifier {
        fn show_sync_progress(&self, progress: Option<u8>) {
            self.push(Shown::SyncProgress(progress));
        }
        fn hide_sync_progress(&self) {
            self.push(Shown::SyncHidden);
        }
        fn show_connected(&self, status: ConnectedStatus) {
            self.push(Shown::Connected(status));
        }
        fn hide_connected(&self) {
            self.push(Shown::ConnectedHidden);
        }
        fn show_wearing_reminder(
            &self,
            begin: DateTime<Utc>,
            end: Option<DateTime<Utc>>,
            duration_minutes: i64,
        ) {
            self.push(Shown::Reminder {
                window_minutes: end.map(|end| (end - begin).num_minutes()),
                duration: duration_minutes,
            });
        }
        fn hide_wearing_reminder(&self) {
            self.push(Shown::ReminderHidden);
        }
        fn show_wearing_completed(&self) {
            self.push(Shown::Completed);
        }
        fn hide_wearing_completed(&self) {
            self.push(Shown::CompletedHidden);
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_connection_changes_toggle_notifications() {
        let publisher = StatusPublisher::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let _task = NotificationController::spawn(publisher.reader(), notifier.clone());

        publisher.set_connection_state(ConnectionState::Connected);
        settle().await;
        assert_eq!(
            notifier.take(),
            vec![
                Shown::Connected(ConnectedStatus::default()),
                Shown::ReminderHidden
            ]
        );

        publisher.dataset_completed(LiveReadings {
            heart_rate: Some(70),
            temperature: Some(36.6),
            quality: Some(60),
        });
        settle().await;
        assert_eq!(
            notifier.take(),
            vec![Shown::Connected(ConnectedStatus {
                heart_rate: Some(70),
                temperature: Some(36.6),
                positioning: Some(QualityLabel::Medium),
            })]
        );

        publisher.signal(SensorSignal::WearingCompleted);
        settle().await;
        publisher.set_connection_state(ConnectionState::Disconnected);
        settle().await;
        assert_eq!(
            notifier.take(),
            vec![
                Shown::Completed,
                Shown::ConnectedHidden,
                Shown::CompletedHidden
            ]
        );
    }

    #[tokio::test]
    async fn test_sync_progress_indicator() {
        let publisher = StatusPublisher::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let _task = NotificationController::spawn(publisher.reader(), notifier.clone());

        publisher.sync_started();
        settle().await;
        publisher.sync_finished(Utc::now());
        settle().await;

        assert_eq!(
            notifier.take(),
            vec![Shown::SyncProgress(Some(0)), Shown::SyncHidden]
        );
    }

    #[tokio::test]
    async fn test_controller_stops_with_publisher() {
        let publisher = StatusPublisher::new();
        let task = NotificationController::spawn(publisher.reader(), Arc::new(LoggingNotifier));
        drop(publisher);
        task.await.unwrap();
    }

    #[test]
    fn test_wearing_reminder_uses_last_sync_time() {
        use crate::domain::settings::{StaticStudyConfig, WearingConfig};

        let today = Local::now().date_naive();
        let config = WearingConfig {
            wearing_time_begin: "0000".into(),
            wearing_time_end: "0100".into(),
            study_begin_date: Some(today),
            study_end_date: Some(today),
            ..WearingConfig::default()
        };
        let publisher = StatusPublisher::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let clock = Arc::new(ManualClock::new(Utc::now().timestamp_millis()));
        let reminder = WearingReminder::new(
            Arc::new(StaticStudyConfig::new(config)),
            publisher.reader(),
            notifier.clone(),
            clock.clone(),
        );

        assert!(reminder.check());
        assert_eq!(
            notifier.take(),
            vec![Shown::Reminder {
                window_minutes: Some(60),
                duration: 45
            }]
        );

        publisher.set_last_sync_time(clock.now());
        assert!(!reminder.check());
        assert!(notifier.take().is_empty());
    }
}
