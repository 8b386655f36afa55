//! Daily wearing reminder.

use crate::domain::settings::StudyConfig;
use chrono::{DateTime, Utc};

/// Today's wearing begin time if the participant should be reminded to put
/// the earpiece on: the sensor is part of the study, the study is running
/// and nothing was synchronized since today's wearing period began.
pub fn needs_wearing_reminder(
    study: &dyn StudyConfig,
    last_sync: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if !study.sensor_enabled() || !study.in_study_period(now) {
        return None;
    }
    let begin = study.wearing_time_begin(now)?;
    let last_sync_ms = last_sync.map(|t| t.timestamp_millis()).unwrap_or(0);
    (last_sync_ms < begin.timestamp_millis()).then_some(begin)
}
