//! Batch storage.
//!
//! Detached batches from the aggregator are projected into the two record
//! shapes and appended to a [`RecordStore`]. A batch is stored at most once;
//! failures drop it.

use crate::domain::aggregator::Batch;
use crate::domain::clock::Clock;
use crate::domain::error::StoreError;
use crate::domain::models::{HeartRateRecord, SensorRecord, TemperatureRecord};
use crate::domain::status::StatusPublisher;
use crate::infrastructure::persistence::{self, KeyValueStore};
use crate::DIAGNOSTICS_TARGET;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const RECORDS_FILE_NAME: &str = "sensor_records.jsonl";

pub trait RecordStore: Send + Sync {
    /// Append all of `records` or none of them.
    fn append_all(&self, records: &[SensorRecord]) -> Result<(), StoreError>;
}

/// Whether the current user may store sensor data at all.
pub trait EligibilityGate: Send + Sync {
    fn is_eligible(&self) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysEligible;

impl EligibilityGate for AlwaysEligible {
    fn is_eligible(&self) -> bool {
        true
    }
}

/// Appends one JSON document per line.
pub struct JsonLinesRecordStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesRecordStore {
    pub fn new(data_dir: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&data_dir)?;
        Ok(Self {
            path: data_dir.join(RECORDS_FILE_NAME),
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl RecordStore for JsonLinesRecordStore {
    fn append_all(&self, records: &[SensorRecord]) -> Result<(), StoreError> {
        let mut lines = String::new();
        for record in records {
            lines.push_str(&serde_json::to_string(record)?);
            lines.push('\n');
        }

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(lines.as_bytes())?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<SensorRecord>>,
}

impl MemoryRecordStore {
    pub fn records(&self) -> Vec<SensorRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl RecordStore for MemoryRecordStore {
    fn append_all(&self, records: &[SensorRecord]) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(records);
        Ok(())
    }
}

/// Project a batch into its heart rate and temperature records, skipping
/// entries whose bpm is at or below `min_bpm`. `None` if nothing survives.
pub fn build_records(batch: &Batch, min_bpm: u16) -> Option<(HeartRateRecord, TemperatureRecord)> {
    let mut heart = HeartRateRecord {
        values: Vec::new(),
        rr_history: Vec::new(),
        timestamps: Vec::new(),
        ear_position_quality: Vec::new(),
        new_firmware: false,
    };
    let mut temperature = TemperatureRecord {
        values: Vec::new(),
        timestamps: Vec::new(),
        ear_position_quality: Vec::new(),
        new_firmware: false,
    };

    for dataset in batch {
        let (Some(measurement), Some(celsius), Some(quality)) =
            (&dataset.heart, dataset.temperature, dataset.raw_quality)
        else {
            continue;
        };
        if measurement.bpm <= min_bpm {
            continue;
        }

        heart.values.push(measurement.bpm);
        heart.rr_history.push(measurement.rr_intervals.clone());
        heart.timestamps.push(dataset.timestamp_ms);
        heart.ear_position_quality.push(quality);
        heart.new_firmware = dataset.firmware.is_new();

        temperature.values.push(celsius);
        temperature.timestamps.push(dataset.timestamp_ms);
        temperature.ear_position_quality.push(quality);
        temperature.new_firmware = dataset.firmware.is_new();
    }

    if heart.values.is_empty() {
        return None;
    }
    Some((heart, temperature))
}

/// Consumes detached batches and stores them.
pub struct StorageWorker {
    store: Arc<dyn RecordStore>,
    gate: Arc<dyn EligibilityGate>,
    preferences: Arc<dyn KeyValueStore>,
    status: StatusPublisher,
    clock: Arc<dyn Clock>,
    min_plausible_bpm: u16,
}

impl StorageWorker {
    pub fn new(
        store: Arc<dyn RecordStore>,
        gate: Arc<dyn EligibilityGate>,
        preferences: Arc<dyn KeyValueStore>,
        status: StatusPublisher,
        clock: Arc<dyn Clock>,
        min_plausible_bpm: u16,
    ) -> Self {
        Self {
            store,
            gate,
            preferences,
            status,
            clock,
            min_plausible_bpm,
        }
    }

    /// Store one batch. `Ok(false)` when nothing survived filtering.
    pub fn store_batch(&self, batch: &Batch) -> Result<bool, StoreError> {
        let Some((heart, temperature)) = build_records(batch, self.min_plausible_bpm) else {
            debug!(size = batch.len(), "No plausible entries in batch");
            return Ok(false);
        };
        if !self.gate.is_eligible() {
            return Err(StoreError::NotEligible);
        }

        let stored = heart.values.len();
        self.store.append_all(&[
            SensorRecord::HeartRate(heart),
            SensorRecord::Temperature(temperature),
        ])?;
        info!(entries = stored, "Stored sensor batch");
        Ok(true)
    }

    pub fn process(&self, batch: Batch) {
        match self.store_batch(&batch) {
            Ok(true) => {
                let now = self.clock.now();
                self.status.set_last_sync_time(now);
                if let Err(e) = persistence::save_last_sync_time(self.preferences.as_ref(), now) {
                    warn!("Failed to persist last sync time: {}", e);
                }
            }
            Ok(false) => {}
            Err(StoreError::NotEligible) => {
                warn!(size = batch.len(), "Not eligible to store sensor data, dropping batch");
            }
            Err(e) => {
                error!(
                    target: DIAGNOSTICS_TARGET,
                    size = batch.len(),
                    "Failed to store sensor batch: {}",
                    e
                );
            }
        }
    }

    pub fn spawn(self, mut batches: mpsc::UnboundedReceiver<Batch>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(batch) = batches.recv().await {
                self.process(batch);
            }
            debug!("Storage worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregator::Dataset;
    use crate::domain::clock::ManualClock;
    use crate::domain::models::{FirmwareGeneration, HeartMeasurement};
    use crate::infrastructure::persistence::{MemoryStore, LAST_SYNC_TIME_KEY};
    use pretty_assertions::assert_eq;

    fn dataset(bpm: u16, ts: i64, firmware: FirmwareGeneration) -> Dataset {
        Dataset {
            temperature: Some(36.5),
            heart: Some(HeartMeasurement {
                bpm,
                rr_intervals: vec![0.5, 0.75],
            }),
            raw_quality: Some(42),
            timestamp_ms: ts,
            firmware,
        }
    }

    struct Never;

    impl EligibilityGate for Never {
        fn is_eligible(&self) -> bool {
            false
        }
    }

    fn worker(
        gate: Arc<dyn EligibilityGate>,
    ) -> (StorageWorker, Arc<MemoryRecordStore>, Arc<MemoryStore>, StatusPublisher) {
        let store = Arc::new(MemoryRecordStore::default());
        let prefs = Arc::new(MemoryStore::new());
        let status = StatusPublisher::new();
        let worker = StorageWorker::new(
            store.clone(),
            gate,
            prefs.clone(),
            status.clone(),
            Arc::new(ManualClock::new(5_000)),
            20,
        );
        (worker, store, prefs, status)
    }

    #[test]
    fn test_build_records_skips_implausible_entries() {
        let batch = vec![
            dataset(70, 1, FirmwareGeneration::Old),
            dataset(20, 2, FirmwareGeneration::Old),
            dataset(80, 3, FirmwareGeneration::New),
        ];
        let (heart, temperature) = build_records(&batch, 20).unwrap();

        assert_eq!(heart.values, vec![70, 80]);
        assert_eq!(heart.timestamps, vec![1, 3]);
        assert_eq!(heart.rr_history, vec![vec![0.5, 0.75], vec![0.5, 0.75]]);
        assert_eq!(heart.ear_position_quality, vec![42, 42]);
        assert!(heart.new_firmware);
        assert_eq!(temperature.values, vec![36.5, 36.5]);
        assert_eq!(temperature.timestamps, vec![1, 3]);
    }

    #[test]
    fn test_all_implausible_batch_stores_nothing() {
        let (worker, store, prefs, status) = worker(Arc::new(AlwaysEligible));
        let batch = vec![
            dataset(0, 1, FirmwareGeneration::Old),
            dataset(20, 2, FirmwareGeneration::Old),
        ];

        worker.process(batch);

        assert!(store.records().is_empty());
        assert_eq!(prefs.get(LAST_SYNC_TIME_KEY), None);
        assert_eq!(status.reader().sync_state().last_sync_time(), None);
    }

    #[test]
    fn test_successful_store_updates_last_sync_time() {
        let (worker, store, prefs, status) = worker(Arc::new(AlwaysEligible));

        worker.process(vec![dataset(70, 1, FirmwareGeneration::Old)]);

        let records = store.records();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], SensorRecord::HeartRate(_)));
        assert!(matches!(records[1], SensorRecord::Temperature(_)));
        assert_eq!(prefs.get(LAST_SYNC_TIME_KEY).as_deref(), Some("5000"));
        assert_eq!(
            status
                .reader()
                .sync_state()
                .last_sync_time()
                .map(|t| t.timestamp_millis()),
            Some(5_000)
        );
    }

    #[test]
    fn test_ineligible_batch_is_dropped() {
        let (worker, store, prefs, _status) = worker(Arc::new(Never));

        assert!(matches!(
            worker.store_batch(&vec![dataset(70, 1, FirmwareGeneration::Old)]),
            Err(StoreError::NotEligible)
        ));
        worker.process(vec![dataset(70, 1, FirmwareGeneration::Old)]);

        assert!(store.records().is_empty());
        assert_eq!(prefs.get(LAST_SYNC_TIME_KEY), None);
    }

    /// Accepts the heart rate record, then fails on the temperature record.
    #[derive(Default)]
    struct FailsOnTemperature {
        records: Mutex<Vec<SensorRecord>>,
    }

    impl RecordStore for FailsOnTemperature {
        fn append_all(&self, records: &[SensorRecord]) -> Result<(), StoreError> {
            let mut accepted = Vec::new();
            for record in records {
                if matches!(record, SensorRecord::Temperature(_)) {
                    return Err(StoreError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "disk full",
                    )));
                }
                accepted.push(record.clone());
            }
            self.records.lock().unwrap().extend(accepted);
            Ok(())
        }
    }

    #[test]
    fn test_store_failure_drops_whole_batch() {
        let store = Arc::new(FailsOnTemperature::default());
        let prefs = Arc::new(MemoryStore::new());
        let status = StatusPublisher::new();
        let worker = StorageWorker::new(
            store.clone(),
            Arc::new(AlwaysEligible),
            prefs.clone(),
            status.clone(),
            Arc::new(ManualClock::new(5_000)),
            20,
        );
        let batch = vec![dataset(70, 1, FirmwareGeneration::Old)];

        assert!(matches!(worker.store_batch(&batch), Err(StoreError::Io(_))));
        worker.process(batch);

        assert!(store.records.lock().unwrap().is_empty());
        assert_eq!(prefs.get(LAST_SYNC_TIME_KEY), None);
        assert_eq!(status.reader().sync_state().last_sync_time(), None);
    }

    #[test]
    fn test_json_lines_store_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonLinesRecordStore::new(dir.path().join("data")).unwrap();
        let (heart, temperature) =
            build_records(&vec![dataset(65, 7, FirmwareGeneration::Old)], 20).unwrap();

        store
            .append_all(&[
                SensorRecord::HeartRate(heart),
                SensorRecord::Temperature(temperature),
            ])
            .unwrap();

        let contents = fs::read_to_string(store.path()).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "HeartMeasurementEar");
        assert_eq!(lines[0]["values"][0], 65);
        assert_eq!(lines[0]["new_firmware"], false);
        assert_eq!(lines[1]["type"], "Temperature");
        assert_eq!(lines[1]["timestamps"][0], 7);
    }

    #[tokio::test]
    async fn test_spawned_worker_drains_channel() {
        let (worker, store, _prefs, _status) = worker(Arc::new(AlwaysEligible));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = worker.spawn(rx);

        tx.send(vec![dataset(70, 1, FirmwareGeneration::Old)]).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(store.records().len(), 2);
    }
}
