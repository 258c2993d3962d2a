use std::fmt;
use std::io::{Read, Write};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::records::{
    BarometerRecord, BatteryState, IndoorClimateRecord, PullRecord, PullResponse, PushConditions,
    SensorSuiteRecord, SignalState,
};

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Serialization error")]
    Serde(#[from] serde_json::Error),
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("Unit error {code}: {message}")]
    Unit { code: i64, message: String },
    #[error("Response carried no conditions payload")]
    EmptyPayload,
    #[error("No report has been produced yet")]
    NoReport,
    #[error("Report lock poisoned")]
    Poisoned,
}

/// The consolidated weather report. Every measurement is optional,
/// distinguishing "not yet observed" from a real zero; pull and push
/// merges each overwrite their own field subset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub device_id: String,
    /// Time of the last content change.
    pub timestamp: Option<DateTime<Utc>>,

    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub dew_point: Option<f64>,
    pub wet_bulb: Option<f64>,
    pub heat_index: Option<f64>,
    pub wind_chill: Option<f64>,
    pub thw_index: Option<f64>,
    pub thsw_index: Option<f64>,

    pub wind_speed_last: Option<f64>,
    pub wind_dir_last: Option<f64>,
    pub wind_speed_avg_1_min: Option<f64>,
    pub wind_dir_avg_1_min: Option<f64>,
    pub wind_speed_avg_2_min: Option<f64>,
    pub wind_dir_avg_2_min: Option<f64>,
    pub wind_gust_2_min: Option<f64>,
    pub wind_gust_dir_2_min: Option<f64>,
    pub wind_speed_avg_10_min: Option<f64>,
    pub wind_dir_avg_10_min: Option<f64>,
    pub wind_gust_10_min: Option<f64>,
    pub wind_gust_dir_10_min: Option<f64>,

    pub rain_size: Option<f64>,
    pub rain_rate_last: Option<f64>,
    pub rain_rate_high: Option<f64>,
    pub rain_last_15_min: Option<f64>,
    pub rain_rate_high_15_min: Option<f64>,
    pub rain_last_60_min: Option<f64>,
    pub rain_last_24_hr: Option<f64>,
    pub rain_storm: Option<f64>,
    pub rain_storm_start_at: Option<DateTime<Utc>>,

    pub solar_rad: Option<f64>,
    pub uv_index: Option<f64>,

    pub signal: Option<SignalState>,
    pub battery: Option<BatteryState>,

    pub rainfall_daily: Option<f64>,
    pub rainfall_monthly: Option<f64>,
    pub rainfall_year: Option<f64>,
    pub rain_storm_last: Option<f64>,
    pub rain_storm_last_start_at: Option<DateTime<Utc>>,
    pub rain_storm_last_end_at: Option<DateTime<Utc>>,

    pub bar_sea_level: Option<f64>,
    pub bar_trend: Option<f64>,
    pub bar_absolute: Option<f64>,

    pub temp_indoor: Option<f64>,
    pub hum_indoor: Option<f64>,
    pub dew_point_indoor: Option<f64>,
    pub heat_index_indoor: Option<f64>,
}

impl Report {
    /// True once the receiver-health fields have been populated at least
    /// once; a report never notifies before that.
    fn health_seen(&self) -> bool {
        self.signal.is_some() && self.battery.is_some()
    }
}

/// Which channel produced a merge, for logging.
#[derive(Debug, Clone, Copy)]
enum UpdateSource {
    Pull,
    Push,
    Replace,
}

impl fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateSource::Pull => write!(f, "pull"),
            UpdateSource::Push => write!(f, "push"),
            UpdateSource::Replace => write!(f, "replace"),
        }
    }
}

#[derive(Default)]
struct StoreState {
    report: Report,
    last_checksum: String,
    last_bytes: Vec<u8>,
}

/// Thread-safe latest-report holder. Merges from both channels funnel
/// through one finalize step that deduplicates by content hash and emits
/// a coalescing change notification.
///
/// The store owns the report outright; callers never mutate fields
/// directly, they hand it decoded wire records.
pub struct ReportStore {
    state: Mutex<StoreState>,
    notify: mpsc::Sender<()>,
    verbose: bool,
}

impl ReportStore {
    /// Returns a new store plus the change-notification receiver. The
    /// queue has capacity 1: rapid changes coalesce into a single
    /// wake-up, and the consumer re-reads the current snapshot on wake.
    pub fn new(verbose: bool) -> (Self, mpsc::Receiver<()>) {
        let (notify, receiver) = mpsc::channel(1);
        let store = Self {
            state: Mutex::new(StoreState::default()),
            notify,
            verbose,
        };
        (store, receiver)
    }

    /// Merges a full condition set fetched over the pull channel. A
    /// response carrying a unit error aborts without mutating state.
    pub fn merge_from_pull(&self, response: &PullResponse) -> Result<(), ReportError> {
        if let Some(err) = &response.error {
            return Err(ReportError::Unit {
                code: err.code,
                message: err.message.clone(),
            });
        }
        let conditions = response.data.as_ref().ok_or(ReportError::EmptyPayload)?;

        let mut state = self.lock()?;
        state.report.device_id = conditions.device_id.clone();

        for record in &conditions.conditions {
            match record {
                PullRecord::SensorSuite(v) => Self::apply_sensor_suite(&mut state.report, v),
                PullRecord::Barometer(v) => Self::apply_barometer(&mut state.report, v),
                PullRecord::IndoorClimate(v) => Self::apply_indoor_climate(&mut state.report, v),
                PullRecord::Unknown => {
                    log::debug!(
                        "Skipping unrecognized record category from {:}",
                        conditions.device_id
                    );
                }
            }
        }

        let event_time = conditions.timestamp.unwrap_or_else(Utc::now);
        self.finalize(&mut state, event_time, UpdateSource::Pull)
    }

    /// Merges a broadcast received over the push channel. Only the
    /// wind/rain subset and the device identifier are overwritten;
    /// receiver health and indoor/barometric fields are untouched.
    pub fn merge_from_push(&self, conditions: &PushConditions) -> Result<(), ReportError> {
        let mut state = self.lock()?;
        state.report.device_id = conditions.device_id.clone();

        for record in &conditions.conditions {
            let report = &mut state.report;
            report.wind_speed_last = record.wind_speed_last;
            report.wind_dir_last = record.wind_dir_last;

            report.rain_size = record.rain_size;
            report.rain_rate_last = record.rain_rate_last;
            report.rain_last_15_min = record.rain_last_15_min;
            report.rain_last_60_min = record.rain_last_60_min;
            report.rain_last_24_hr = record.rain_last_24_hr;
            report.rain_storm = record.rain_storm;
            if let Some(at) = record.rain_storm_start_at {
                report.rain_storm_start_at = Some(at);
            }
            report.rainfall_daily = record.rainfall_daily;
            report.rainfall_monthly = record.rainfall_monthly;
            report.rainfall_year = record.rainfall_year;

            report.wind_gust_10_min = record.wind_gust_10_min;
            report.wind_gust_dir_10_min = record.wind_gust_dir_10_min;
        }

        let event_time = conditions.timestamp.unwrap_or_else(Utc::now);
        self.finalize(&mut state, event_time, UpdateSource::Push)
    }

    /// Replaces the report wholesale from a compressed serialized
    /// snapshot produced by [`ReportStore::encode`] in another process.
    /// Bookkeeping (lock, queue, hash) stays local, never inherited.
    pub fn replace_from_serialized(&self, payload: &[u8]) -> Result<(), ReportError> {
        let mut decoder = ZlibDecoder::new(payload);
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw)?;
        let incoming: Report = serde_json::from_slice(&raw)?;

        let mut state = self.lock()?;
        let event_time = incoming.timestamp.unwrap_or_else(Utc::now);
        state.report = incoming;
        self.finalize(&mut state, event_time, UpdateSource::Replace)
    }

    /// Deep copy of the current report. Fails until at least one
    /// notifiable report has been produced.
    pub fn snapshot(&self) -> Result<Report, ReportError> {
        let state = self.lock()?;
        if state.last_bytes.is_empty() {
            return Err(ReportError::NoReport);
        }
        Ok(state.report.clone())
    }

    /// Compressed canonical form of the last produced report, for
    /// shipping a snapshot across process boundaries.
    pub fn encode(&self) -> Result<Vec<u8>, ReportError> {
        let state = self.lock()?;
        if state.last_bytes.is_empty() {
            return Err(ReportError::NoReport);
        }
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&state.last_bytes)?;
        Ok(encoder.finish()?)
    }

    /// Common tail of every merge: hash the candidate report, gate on
    /// receiver health, dedup against the previous hash, then stamp the
    /// event time and notify. The notification push never blocks; a full
    /// queue means a wake-up is already pending.
    fn finalize(
        &self,
        state: &mut StoreState,
        event_time: DateTime<Utc>,
        source: UpdateSource,
    ) -> Result<(), ReportError> {
        let (checksum, _) = Self::checksum(&state.report)?;

        if !state.report.health_seen() {
            return Ok(());
        }

        if checksum == state.last_checksum {
            if self.verbose {
                log::debug!(
                    "No new conditions from {:} via {source}",
                    state.report.device_id
                );
            }
            return Ok(());
        }

        state.report.timestamp = Some(event_time);
        // Re-hash so the stored checksum covers the updated timestamp
        let (checksum, bytes) = Self::checksum(&state.report)?;
        state.last_checksum = checksum;
        state.last_bytes = bytes;

        match self.notify.try_send(()) {
            Ok(()) => {
                if self.verbose {
                    log::info!(
                        "New conditions from {:} via {source}",
                        state.report.device_id
                    );
                }
            }
            Err(_) => {
                if self.verbose {
                    log::info!(
                        "New conditions from {:} via {source}, notification already pending",
                        state.report.device_id
                    );
                }
            }
        }
        Ok(())
    }

    fn checksum(report: &Report) -> Result<(String, Vec<u8>), ReportError> {
        let bytes = serde_json::to_vec(report)?;
        let digest = Sha256::digest(&bytes);
        Ok((hex::encode(digest), bytes))
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, ReportError> {
        self.state.lock().map_err(|_| ReportError::Poisoned)
    }

    fn apply_sensor_suite(report: &mut Report, v: &SensorSuiteRecord) {
        report.temperature = v.temperature;
        report.humidity = v.humidity;
        report.dew_point = v.dew_point;
        report.wet_bulb = v.wet_bulb;
        report.heat_index = v.heat_index;
        report.wind_chill = v.wind_chill;
        report.thw_index = v.thw_index;
        report.thsw_index = v.thsw_index;

        report.wind_speed_last = v.wind_speed_last;
        report.wind_dir_last = v.wind_dir_last;
        report.wind_speed_avg_1_min = v.wind_speed_avg_1_min;
        report.wind_dir_avg_1_min = v.wind_dir_avg_1_min;
        report.wind_speed_avg_2_min = v.wind_speed_avg_2_min;
        report.wind_dir_avg_2_min = v.wind_dir_avg_2_min;
        report.wind_gust_2_min = v.wind_gust_2_min;
        report.wind_gust_dir_2_min = v.wind_gust_dir_2_min;
        report.wind_speed_avg_10_min = v.wind_speed_avg_10_min;
        report.wind_dir_avg_10_min = v.wind_dir_avg_10_min;
        report.wind_gust_10_min = v.wind_gust_10_min;
        report.wind_gust_dir_10_min = v.wind_gust_dir_10_min;

        report.rain_size = v.rain_size;
        report.rain_rate_last = v.rain_rate_last;
        report.rain_rate_high = v.rain_rate_high;
        report.rain_last_15_min = v.rain_last_15_min;
        report.rain_rate_high_15_min = v.rain_rate_high_15_min;
        report.rain_last_60_min = v.rain_last_60_min;
        report.rain_last_24_hr = v.rain_last_24_hr;
        report.rain_storm = v.rain_storm;
        if let Some(at) = v.rain_storm_start_at {
            report.rain_storm_start_at = Some(at);
        }

        report.solar_rad = v.solar_rad;
        report.uv_index = v.uv_index;

        if let Some(signal) = v.signal_code.and_then(SignalState::from_code) {
            report.signal = Some(signal);
        }
        if let Some(battery) = v.battery_code.and_then(BatteryState::from_code) {
            report.battery = Some(battery);
        }

        report.rainfall_daily = v.rainfall_daily;
        report.rainfall_monthly = v.rainfall_monthly;
        report.rainfall_year = v.rainfall_year;
        report.rain_storm_last = v.rain_storm_last;
        if let Some(at) = v.rain_storm_last_start_at {
            report.rain_storm_last_start_at = Some(at);
        }
        if let Some(at) = v.rain_storm_last_end_at {
            report.rain_storm_last_end_at = Some(at);
        }
    }

    fn apply_barometer(report: &mut Report, v: &BarometerRecord) {
        report.bar_sea_level = v.bar_sea_level;
        report.bar_trend = v.bar_trend;
        report.bar_absolute = v.bar_absolute;
    }

    fn apply_indoor_climate(report: &mut Report, v: &IndoorClimateRecord) {
        report.temp_indoor = v.temperature;
        report.hum_indoor = v.humidity;
        report.dew_point_indoor = v.dew_point;
        report.heat_index_indoor = v.heat_index;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{decode_pull, decode_push};
    use tokio::sync::mpsc::error::TryRecvError;

    fn pull_payload(temperature: f64) -> Vec<u8> {
        format!(
            r#"{{
                "data": {{
                    "did": "X",
                    "ts": 1724000000,
                    "conditions": [
                        {{"lsid": 1, "data_structure_type": 1, "temp": {temperature},
                          "rx_state": 0, "trans_battery_flag": 0}},
                        {{"lsid": 2, "data_structure_type": 3, "bar_sea_level": 29.92}}
                    ]
                }},
                "error": null
            }}"#
        )
        .into_bytes()
    }

    fn push_payload(wind_speed: f64) -> Vec<u8> {
        format!(
            r#"{{
                "did": "X",
                "ts": 1724000100,
                "conditions": [
                    {{"lsid": 1, "wind_speed_last": {wind_speed}}}
                ]
            }}"#
        )
        .into_bytes()
    }

    #[test]
    fn identical_pull_merges_notify_once() {
        let (store, mut notify) = ReportStore::new(false);
        let response = decode_pull(&pull_payload(72.0)).unwrap();

        store.merge_from_pull(&response).unwrap();
        assert!(notify.try_recv().is_ok());

        store.merge_from_pull(&response).unwrap();
        assert!(matches!(notify.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn push_before_health_fields_never_notifies() {
        let (store, mut notify) = ReportStore::new(false);
        let conditions = decode_push(&push_payload(4.2)).unwrap();

        store.merge_from_push(&conditions).unwrap();
        assert!(matches!(notify.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(store.snapshot(), Err(ReportError::NoReport)));
    }

    #[test]
    fn rapid_changes_coalesce_to_one_notification() {
        let (store, mut notify) = ReportStore::new(false);

        let first = decode_pull(&pull_payload(72.0)).unwrap();
        let second = decode_pull(&pull_payload(73.5)).unwrap();
        store.merge_from_pull(&first).unwrap();
        store.merge_from_pull(&second).unwrap();

        assert!(notify.try_recv().is_ok());
        assert!(matches!(notify.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn unit_error_aborts_merge() {
        let (store, mut notify) = ReportStore::new(false);
        let response =
            decode_pull(br#"{"data": null, "error": {"code": 503, "message": "busy"}}"#).unwrap();

        assert!(matches!(
            store.merge_from_pull(&response),
            Err(ReportError::Unit { code: 503, .. })
        ));
        assert!(matches!(notify.try_recv(), Err(TryRecvError::Empty)));
        assert!(store.snapshot().is_err());
    }

    #[test]
    fn unknown_record_category_is_skipped() {
        let (store, mut notify) = ReportStore::new(false);
        let response = decode_pull(
            br#"{
                "data": {
                    "did": "X",
                    "ts": 1724000000,
                    "conditions": [
                        {"lsid": 1, "data_structure_type": 1, "temp": 68.0,
                         "rx_state": 0, "trans_battery_flag": 0},
                        {"lsid": 9, "data_structure_type": 250, "temp": 999.0}
                    ]
                },
                "error": null
            }"#,
        )
        .unwrap();

        store.merge_from_pull(&response).unwrap();
        assert!(notify.try_recv().is_ok());
        assert_eq!(store.snapshot().unwrap().temperature, Some(68.0));
    }

    #[test]
    fn serialized_round_trip_reproduces_fields() {
        let (store, _notify) = ReportStore::new(false);
        store
            .merge_from_pull(&decode_pull(&pull_payload(72.0)).unwrap())
            .unwrap();
        let encoded = store.encode().unwrap();

        let (other, mut other_notify) = ReportStore::new(false);
        other.replace_from_serialized(&encoded).unwrap();

        assert_eq!(other.snapshot().unwrap(), store.snapshot().unwrap());
        // the hydrated store runs its own notification queue
        assert!(other_notify.try_recv().is_ok());
    }

    #[test]
    fn replace_rejects_garbage() {
        let (store, _notify) = ReportStore::new(false);
        assert!(store.replace_from_serialized(b"definitely not zlib").is_err());
    }

    #[test]
    fn pull_then_push_scenario() {
        let (store, mut notify) = ReportStore::new(false);

        // pull carrying device id, health, and temperature
        let pull = decode_pull(&pull_payload(72.0)).unwrap();
        store.merge_from_pull(&pull).unwrap();
        let report = store.snapshot().unwrap();
        assert_eq!(report.device_id, "X");
        assert_eq!(report.temperature, Some(72.0));
        assert_eq!(report.signal, Some(SignalState::Synced));
        assert_eq!(report.battery, Some(BatteryState::Nominal));
        assert!(notify.try_recv().is_ok());

        // identical pull: no second notification
        store.merge_from_pull(&pull).unwrap();
        assert!(matches!(notify.try_recv(), Err(TryRecvError::Empty)));

        // push changing wind speed only
        let push = decode_push(&push_payload(4.2)).unwrap();
        store.merge_from_push(&push).unwrap();
        let report = store.snapshot().unwrap();
        assert_eq!(report.wind_speed_last, Some(4.2));
        assert_eq!(report.temperature, Some(72.0));
        assert!(notify.try_recv().is_ok());
    }
}
