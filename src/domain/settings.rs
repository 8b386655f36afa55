use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const APP_DIR: &str = "InEarLink";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "inear_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Study schedule for the ear sensor, as delivered by the study schema.
///
/// Times are "HHMM" strings in 24h format, the duration is an "HHMM" span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WearingConfig {
    #[serde(default = "default_sensors_used")]
    pub sensors_used: Vec<String>,
    #[serde(default = "default_wearing_begin")]
    pub wearing_time_begin: String,
    #[serde(default = "default_wearing_end")]
    pub wearing_time_end: String,
    #[serde(default = "default_wearing_duration")]
    pub wearing_time_duration: String,
    #[serde(default = "default_reminder_time")]
    pub wearing_reminder_time: String,
    /// Study period (inclusive dates). Missing bounds mean "not in study".
    #[serde(default)]
    pub study_begin_date: Option<chrono::NaiveDate>,
    #[serde(default)]
    pub study_end_date: Option<chrono::NaiveDate>,
}

impl Default for WearingConfig {
    fn default() -> Self {
        Self {
            sensors_used: default_sensors_used(),
            wearing_time_begin: default_wearing_begin(),
            wearing_time_end: default_wearing_end(),
            wearing_time_duration: default_wearing_duration(),
            wearing_reminder_time: default_reminder_time(),
            study_begin_date: None,
            study_end_date: None,
        }
    }
}

fn default_sensors_used() -> Vec<String> {
    vec!["Garmin".to_string(), "Cosinuss".to_string()]
}
fn default_wearing_begin() -> String {
    "1900".to_string()
}
fn default_wearing_end() -> String {
    "2200".to_string()
}
fn default_wearing_duration() -> String {
    "0045".to_string()
}
fn default_reminder_time() -> String {
    "1930".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationSettings {
    /// A dataset that is not complete within this window is discarded.
    #[serde(default = "default_dataset_window_ms")]
    pub dataset_window_ms: i64,
    #[serde(default = "default_cache_max_age_ms")]
    pub cache_max_age_ms: i64,
    #[serde(default = "default_cache_max_size")]
    pub cache_max_size: usize,
    /// Entries at or below this bpm are dropped when a batch is stored.
    #[serde(default = "default_min_plausible_bpm")]
    pub min_plausible_bpm: u16,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            dataset_window_ms: default_dataset_window_ms(),
            cache_max_age_ms: default_cache_max_age_ms(),
            cache_max_size: default_cache_max_size(),
            min_plausible_bpm: default_min_plausible_bpm(),
        }
    }
}

fn default_dataset_window_ms() -> i64 {
    1000
}
fn default_cache_max_age_ms() -> i64 {
    60_000
}
fn default_cache_max_size() -> usize {
    60
}
fn default_min_plausible_bpm() -> u16 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Restart an unproductive scan after this long.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

fn default_restart_delay_ms() -> u64 {
    10_000
}

/// Which Bluetooth stack drives the earpiece.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BluetoothBackend {
    /// The operating system's stack.
    #[default]
    System,
    /// An in-process earpiece, for demos without hardware.
    Simulated,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BluetoothSettings {
    #[serde(default)]
    pub backend: BluetoothBackend,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    #[serde(default)]
    pub wearing: WearingConfig,

    #[serde(default)]
    pub aggregation: AggregationSettings,

    #[serde(default)]
    pub scan: ScanSettings,

    #[serde(default)]
    pub bluetooth: BluetoothSettings,

    /// Where records and persisted keys live. Defaults to the platform data dir.
    #[serde(default)]
    pub data_dir: Option<String>,
}

impl Settings {
    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(PathBuf::from(dir));
        }
        let mut path = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        path.push(APP_DIR);
        Ok(path)
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit file; a missing or unreadable file yields defaults.
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push(APP_DIR);
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

/// Parse "HHMM" into a wall-clock time.
pub fn parse_military_time(value: &str) -> Option<NaiveTime> {
    if value.len() != 4 {
        return None;
    }
    NaiveTime::parse_from_str(value, "%H%M").ok()
}

/// Today's local occurrence of an "HHMM" time.
pub fn today_at(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let time = parse_military_time(value)?;
    let today = now.with_timezone(&Local).date_naive();
    Local
        .from_local_datetime(&today.and_time(time))
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

/// The next occurrence of an "HHMM" time, today if it is still ahead,
/// tomorrow otherwise.
pub fn next_occurrence(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let today = today_at(value, now)?;
    if today > now {
        Some(today)
    } else {
        Some(today + chrono::Duration::days(1))
    }
}

/// Minutes covered by an "HHMM" duration, 0 if it cannot be parsed.
pub fn military_duration_minutes(value: &str) -> u32 {
    parse_military_time(value)
        .map(|t| {
            use chrono::Timelike;
            t.hour() * 60 + t.minute()
        })
        .unwrap_or(0)
}

/// Study configuration as consumed by the sensor subsystem.
pub trait StudyConfig: Send + Sync {
    /// Whether the ear sensor is part of the current study.
    fn sensor_enabled(&self) -> bool;
    /// Today's start of the wearing period, if configured.
    fn wearing_time_begin(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>>;
    /// Today's end of the wearing period, if configured.
    fn wearing_time_end(&self, _now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        None
    }
    /// How long the sensor should be worn, 0 disables the completion signal.
    fn wearing_duration_ms(&self) -> i64;
    fn in_study_period(&self, now: DateTime<Utc>) -> bool;
}

/// `StudyConfig` backed by the persisted settings document.
#[derive(Debug, Clone, Default)]
pub struct StaticStudyConfig {
    config: WearingConfig,
}

impl StaticStudyConfig {
    pub fn new(config: WearingConfig) -> Self {
        Self { config }
    }

    /// When the daily wearing reminder check should run next.
    pub fn next_reminder_check(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        next_occurrence(&self.config.wearing_reminder_time, now)
    }
}

impl StudyConfig for StaticStudyConfig {
    fn sensor_enabled(&self) -> bool {
        self.config.sensors_used.iter().any(|s| s == "Cosinuss")
    }

    fn wearing_time_begin(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        today_at(&self.config.wearing_time_begin, now)
    }

    fn wearing_time_end(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        today_at(&self.config.wearing_time_end, now)
    }

    fn wearing_duration_ms(&self) -> i64 {
        military_duration_minutes(&self.config.wearing_time_duration) as i64 * 60 * 1000
    }

    fn in_study_period(&self, now: DateTime<Utc>) -> bool {
        let (Some(begin), Some(end)) = (self.config.study_begin_date, self.config.study_end_date)
        else {
            return false;
        };
        let today = now.with_timezone(&Local).date_naive();
        begin <= today && today <= end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let settings: Settings =
            serde_json::from_str(r#"{"aggregation": {"cache_max_size": 10}}"#).unwrap();
        assert_eq!(settings.aggregation.cache_max_size, 10);
        assert_eq!(settings.aggregation.cache_max_age_ms, 60_000);
        assert_eq!(settings.scan.restart_delay_ms, 10_000);
        assert_eq!(settings.wearing.wearing_time_duration, "0045");
        assert_eq!(settings.log_settings.level, "info");
        assert_eq!(settings.bluetooth.backend, BluetoothBackend::System);

        let simulated: Settings =
            serde_json::from_str(r#"{"bluetooth": {"backend": "simulated"}}"#).unwrap();
        assert_eq!(simulated.bluetooth.backend, BluetoothBackend::Simulated);
    }

    #[test]
    fn test_military_time_parsing() {
        assert_eq!(
            parse_military_time("1930"),
            NaiveTime::from_hms_opt(19, 30, 0)
        );
        assert_eq!(parse_military_time("2561"), None);
        assert_eq!(parse_military_time(""), None);
        assert_eq!(military_duration_minutes("0045"), 45);
        assert_eq!(military_duration_minutes("0120"), 80);
        assert_eq!(military_duration_minutes("bogus"), 0);
    }

    #[test]
    fn test_static_study_config() {
        let mut wearing = WearingConfig::default();
        let config = StaticStudyConfig::new(wearing.clone());
        assert!(config.sensor_enabled());
        assert_eq!(config.wearing_duration_ms(), 45 * 60 * 1000);
        assert!(!config.in_study_period(Utc::now()));

        wearing.sensors_used = vec!["Garmin".into()];
        let today = Local::now().date_naive();
        wearing.study_begin_date = Some(today);
        wearing.study_end_date = Some(today);
        let config = StaticStudyConfig::new(wearing);
        assert!(!config.sensor_enabled());
        assert!(config.in_study_period(Utc::now()));
    }

    #[test]
    fn test_wearing_window_and_reminder_schedule() {
        let config = StaticStudyConfig::new(WearingConfig::default());
        let now = Local
            .from_local_datetime(
                &Local::now()
                    .date_naive()
                    .and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap()),
            )
            .earliest()
            .unwrap()
            .with_timezone(&Utc);

        let begin = config.wearing_time_begin(now).unwrap();
        let end = config.wearing_time_end(now).unwrap();
        assert_eq!((end - begin).num_minutes(), 180);

        let reminder = config.next_reminder_check(now).unwrap();
        assert_eq!((reminder - begin).num_minutes(), 30);

        let evening = reminder + chrono::Duration::minutes(1);
        let tomorrow = config.next_reminder_check(evening).unwrap();
        assert_eq!((tomorrow - reminder).num_hours(), 24);
    }

    #[test]
    fn test_settings_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut service = SettingsService::from_path(path.clone());
        service.get_mut().scan.restart_delay_ms = 5_000;
        service.save().unwrap();

        let reloaded = SettingsService::from_path(path);
        assert_eq!(reloaded.get().scan.restart_delay_ms, 5_000);
    }
}
