//! Dataset aggregation and batch caching.
//!
//! Heart rate, temperature and signal quality arrive on separate
//! characteristics. The aggregator joins them into one `Dataset` per moment,
//! caches completed datasets and hands the whole cache over as a `Batch`
//! once the window is old or large enough.

use crate::domain::clock::Clock;
use crate::domain::models::{FirmwareGeneration, HeartMeasurement, LiveReadings};
use crate::domain::quality;
use crate::domain::settings::AggregationSettings;
use crate::domain::status::StatusPublisher;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Slack added to the delayed window check so it lands after expiry.
const WINDOW_CHECK_SLACK_MS: u64 = 10;

/// Samples of one moment in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub temperature: Option<f32>,
    pub heart: Option<HeartMeasurement>,
    pub raw_quality: Option<u8>,
    /// When the first field was set.
    pub timestamp_ms: i64,
    pub firmware: FirmwareGeneration,
}

impl Dataset {
    pub fn is_complete(&self) -> bool {
        self.temperature.is_some() && self.heart.is_some() && self.raw_quality.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.heart.is_none() && self.raw_quality.is_none()
    }

    fn readings(&self) -> LiveReadings {
        LiveReadings {
            heart_rate: self.heart.as_ref().map(|h| h.bpm).filter(|&bpm| bpm != 0),
            temperature: self.temperature,
            quality: self
                .raw_quality
                .map(|raw| quality::normalize(raw, self.firmware)),
        }
    }
}

/// A detached cache, owned by whoever receives it.
pub type Batch = Vec<Dataset>;

#[derive(Debug, Default)]
struct State {
    working: Dataset,
    cache: Vec<Dataset>,
    window_start_ms: Option<i64>,
}

pub struct Aggregator {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    settings: AggregationSettings,
    batches: mpsc::UnboundedSender<Batch>,
    status: StatusPublisher,
}

impl Aggregator {
    pub fn new(
        clock: Arc<dyn Clock>,
        settings: AggregationSettings,
        batches: mpsc::UnboundedSender<Batch>,
        status: StatusPublisher,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            clock,
            settings,
            batches,
            status,
        })
    }

    pub fn add_temperature(self: &Arc<Self>, celsius: f32, firmware: FirmwareGeneration) {
        self.add_field(firmware, |d| d.temperature = Some(celsius));
    }

    pub fn add_heart_measurement(
        self: &Arc<Self>,
        measurement: HeartMeasurement,
        firmware: FirmwareGeneration,
    ) {
        self.add_field(firmware, |d| d.heart = Some(measurement));
    }

    pub fn add_quality(self: &Arc<Self>, raw: u8, firmware: FirmwareGeneration) {
        self.add_field(firmware, |d| d.raw_quality = Some(raw));
    }

    /// Flush the cache if its window has expired. Safe to call at any time.
    pub fn check_window(&self) {
        let now = self.clock.now_ms();
        let batch = {
            let mut state = self.lock();
            self.take_batch_if_due(&mut state, now)
        };
        if let Some(batch) = batch {
            self.dispatch(batch);
        }
    }

    pub fn cached_len(&self) -> usize {
        self.lock().cache.len()
    }

    pub fn window_start_ms(&self) -> Option<i64> {
        self.lock().window_start_ms
    }

    pub fn working_dataset(&self) -> Dataset {
        self.lock().working.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add_field(self: &Arc<Self>, firmware: FirmwareGeneration, apply: impl FnOnce(&mut Dataset)) {
        let now = self.clock.now_ms();
        let mut opened_window = false;
        let mut completed = None;
        let mut batch = None;

        {
            let mut state = self.lock();

            self.push_if_complete(&mut state, now, &mut opened_window, &mut completed, &mut batch);

            if !state.working.is_empty()
                && now - state.working.timestamp_ms > self.settings.dataset_window_ms
            {
                debug!(
                    "Discarding incomplete dataset started at {}",
                    state.working.timestamp_ms
                );
                state.working = Dataset::default();
            }

            if state.working.is_empty() {
                state.working.timestamp_ms = now;
            }
            apply(&mut state.working);
            if firmware.is_new() {
                state.working.firmware = FirmwareGeneration::New;
            }

            self.push_if_complete(&mut state, now, &mut opened_window, &mut completed, &mut batch);
        }

        if let Some(readings) = completed {
            self.status.dataset_completed(readings);
        }
        if opened_window {
            self.schedule_window_check();
        }
        if let Some(batch) = batch {
            self.dispatch(batch);
        }
    }

    fn push_if_complete(
        &self,
        state: &mut State,
        now: i64,
        opened_window: &mut bool,
        completed: &mut Option<LiveReadings>,
        batch: &mut Option<Batch>,
    ) {
        if !state.working.is_complete() {
            return;
        }

        let dataset = std::mem::take(&mut state.working);
        debug!(
            bpm = dataset.heart.as_ref().map(|h| h.bpm),
            temperature = dataset.temperature,
            quality = dataset.raw_quality,
            timestamp = dataset.timestamp_ms,
            "Dataset completed and cached"
        );
        *completed = Some(dataset.readings());
        state.cache.push(dataset);

        if state.window_start_ms.is_none() {
            state.window_start_ms = Some(now);
            *opened_window = true;
        }

        if let Some(taken) = self.take_batch_if_due(state, now) {
            *batch = Some(taken);
        }
    }

    fn take_batch_if_due(&self, state: &mut State, now: i64) -> Option<Batch> {
        let start = state.window_start_ms?;
        let expired = now - start > self.settings.cache_max_age_ms;
        let full = state.cache.len() > self.settings.cache_max_size;
        if !expired && !full {
            return None;
        }

        debug!(
            size = state.cache.len(),
            expired, full, "Cache limit reached, detaching batch"
        );
        state.window_start_ms = None;
        Some(std::mem::take(&mut state.cache))
    }

    /// Re-check the window once it can have expired. The check is idempotent,
    /// so it may fire after the window was already flushed.
    fn schedule_window_check(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let delay = Duration::from_millis(
            self.settings.cache_max_age_ms.max(0) as u64 + WINDOW_CHECK_SLACK_MS,
        );
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(aggregator) = weak.upgrade() {
                aggregator.check_window();
            }
        });
    }

    fn dispatch(&self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        if self.batches.send(batch).is_err() {
            warn!("Storage worker is gone, dropping batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;

    fn hrm(bpm: u16) -> HeartMeasurement {
        HeartMeasurement {
            bpm,
            rr_intervals: vec![0.8],
        }
    }

    fn setup() -> (
        Arc<Aggregator>,
        Arc<ManualClock>,
        mpsc::UnboundedReceiver<Batch>,
        StatusPublisher,
    ) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let (tx, rx) = mpsc::unbounded_channel();
        let status = StatusPublisher::new();
        let aggregator = Aggregator::new(
            clock.clone(),
            AggregationSettings::default(),
            tx,
            status.clone(),
        );
        (aggregator, clock, rx, status)
    }

    fn add_complete(aggregator: &Arc<Aggregator>, clock: &ManualClock, bpm: u16) {
        aggregator.add_temperature(36.6, FirmwareGeneration::Old);
        clock.advance(10);
        aggregator.add_heart_measurement(hrm(bpm), FirmwareGeneration::Old);
        clock.advance(10);
        aggregator.add_quality(60, FirmwareGeneration::Old);
        clock.advance(10);
    }

    #[test]
    fn test_three_fields_complete_one_dataset() {
        let (aggregator, clock, _rx, status) = setup();
        let mut completed = status.reader().subscribe_completed();

        aggregator.add_temperature(36.6, FirmwareGeneration::Old);
        clock.advance(200);
        aggregator.add_heart_measurement(hrm(70), FirmwareGeneration::Old);
        clock.advance(300);
        aggregator.add_quality(55, FirmwareGeneration::Old);

        assert_eq!(aggregator.cached_len(), 1);
        assert!(aggregator.working_dataset().is_empty());
        assert_eq!(aggregator.window_start_ms(), Some(1_000_500));

        let readings = (*completed.borrow_and_update()).unwrap();
        assert_eq!(readings.heart_rate, Some(70));
        assert_eq!(readings.quality, Some(100));
    }

    #[test]
    fn test_stale_partial_dataset_is_discarded() {
        let (aggregator, clock, _rx, _status) = setup();

        aggregator.add_temperature(36.6, FirmwareGeneration::Old);
        aggregator.add_heart_measurement(hrm(70), FirmwareGeneration::Old);
        clock.advance(1_001);
        aggregator.add_quality(55, FirmwareGeneration::Old);

        assert_eq!(aggregator.cached_len(), 0);
        let working = aggregator.working_dataset();
        assert_eq!(working.raw_quality, Some(55));
        assert_eq!(working.temperature, None);
        assert_eq!(working.heart, None);
        assert_eq!(working.timestamp_ms, 1_001_001);
    }

    #[test]
    fn test_window_exactly_at_limit_is_kept() {
        let (aggregator, clock, _rx, _status) = setup();

        aggregator.add_temperature(36.6, FirmwareGeneration::Old);
        clock.advance(1_000);
        aggregator.add_heart_measurement(hrm(70), FirmwareGeneration::Old);
        aggregator.add_quality(55, FirmwareGeneration::Old);

        assert_eq!(aggregator.cached_len(), 1);
    }

    #[test]
    fn test_flush_after_sixty_first_dataset() {
        let (aggregator, clock, mut rx, _status) = setup();

        for _ in 0..60 {
            add_complete(&aggregator, &clock, 70);
        }
        assert_eq!(aggregator.cached_len(), 60);
        assert!(rx.try_recv().is_err());

        add_complete(&aggregator, &clock, 70);
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 61);
        assert!(rx.try_recv().is_err());
        assert_eq!(aggregator.cached_len(), 0);
        assert_eq!(aggregator.window_start_ms(), None);

        add_complete(&aggregator, &clock, 70);
        assert_eq!(aggregator.cached_len(), 1);
        assert!(aggregator.window_start_ms().is_some());
    }

    #[test]
    fn test_flush_on_window_age() {
        let (aggregator, clock, mut rx, _status) = setup();

        add_complete(&aggregator, &clock, 70);
        clock.advance(60_001);
        aggregator.check_window();

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(aggregator.cached_len(), 0);
    }

    #[test]
    fn test_check_window_is_idempotent() {
        let (aggregator, clock, mut rx, _status) = setup();

        aggregator.check_window();
        add_complete(&aggregator, &clock, 70);
        aggregator.check_window();
        assert!(rx.try_recv().is_err());

        clock.advance(61_000);
        aggregator.check_window();
        aggregator.check_window();
        assert_eq!(rx.try_recv().unwrap().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_new_firmware_flag_sticks_to_dataset() {
        let (aggregator, clock, mut rx, _status) = setup();

        aggregator.add_temperature(36.6, FirmwareGeneration::New);
        aggregator.add_heart_measurement(hrm(70), FirmwareGeneration::New);
        aggregator.add_quality(40, FirmwareGeneration::New);
        clock.advance(61_000);
        aggregator.check_window();

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch[0].firmware, FirmwareGeneration::New);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_window_check_flushes() {
        let (aggregator, clock, mut rx, _status) = setup();

        add_complete(&aggregator, &clock, 70);
        clock.advance(60_011);
        tokio::time::sleep(Duration::from_millis(60_020)).await;

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
    }
}
