use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed payload")]
    Malformed(#[from] serde_json::Error),
}

/// Error body the unit attaches to pull-channel response envelopes.
#[derive(Debug, Clone, Deserialize)]
pub struct UnitError {
    pub code: i64,
    pub message: String,
}

/// Envelope of a pull-channel conditions response.
#[derive(Debug, Deserialize)]
pub struct PullResponse {
    pub data: Option<PullConditions>,
    pub error: Option<UnitError>,
}

/// Full condition set fetched over the pull channel.
#[derive(Debug, Deserialize)]
pub struct PullConditions {
    #[serde(rename = "did")]
    pub device_id: String,
    #[serde(rename = "ts", default, with = "chrono::serde::ts_seconds_option")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<PullRecord>,
}

// Record category discriminators used on the wire
const RECORD_SENSOR_SUITE: u64 = 1;
const RECORD_BAROMETER: u64 = 3;
const RECORD_INDOOR_CLIMATE: u64 = 4;

/// A single pull-channel record, keyed on the wire by its
/// `data_structure_type` discriminator. Categories this decoder does not
/// understand map to [`PullRecord::Unknown`] so one new record shape never
/// fails a whole batch; merges skip them.
#[derive(Debug, Clone)]
pub enum PullRecord {
    SensorSuite(SensorSuiteRecord),
    Barometer(BarometerRecord),
    IndoorClimate(IndoorClimateRecord),
    Unknown,
}

impl<'de> Deserialize<'de> for PullRecord {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        let kind = value
            .get("data_structure_type")
            .and_then(serde_json::Value::as_u64);

        let record = match kind {
            Some(RECORD_SENSOR_SUITE) => PullRecord::SensorSuite(
                serde_json::from_value(value).map_err(serde::de::Error::custom)?,
            ),
            Some(RECORD_BAROMETER) => PullRecord::Barometer(
                serde_json::from_value(value).map_err(serde::de::Error::custom)?,
            ),
            Some(RECORD_INDOOR_CLIMATE) => PullRecord::IndoorClimate(
                serde_json::from_value(value).map_err(serde::de::Error::custom)?,
            ),
            _ => PullRecord::Unknown,
        };
        Ok(record)
    }
}

/// Conditions reported by the outdoor sensor suite, including the
/// receiver-health fields that gate report notifications.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorSuiteRecord {
    #[serde(rename = "lsid")]
    pub sensor_id: Option<i64>,
    #[serde(rename = "txid")]
    pub transmitter_id: Option<i64>,

    #[serde(rename = "temp")]
    pub temperature: Option<f64>,
    #[serde(rename = "hum")]
    pub humidity: Option<f64>,
    pub dew_point: Option<f64>,
    pub wet_bulb: Option<f64>,
    pub heat_index: Option<f64>,
    pub wind_chill: Option<f64>,
    pub thw_index: Option<f64>,
    pub thsw_index: Option<f64>,

    pub wind_speed_last: Option<f64>,
    pub wind_dir_last: Option<f64>,
    #[serde(rename = "wind_speed_avg_last_1_min")]
    pub wind_speed_avg_1_min: Option<f64>,
    #[serde(rename = "wind_dir_scalar_avg_last_1_min")]
    pub wind_dir_avg_1_min: Option<f64>,
    #[serde(rename = "wind_speed_avg_last_2_min")]
    pub wind_speed_avg_2_min: Option<f64>,
    #[serde(rename = "wind_dir_scalar_avg_last_2_min")]
    pub wind_dir_avg_2_min: Option<f64>,
    #[serde(rename = "wind_speed_hi_last_2_min")]
    pub wind_gust_2_min: Option<f64>,
    #[serde(rename = "wind_dir_at_hi_speed_last_2_min")]
    pub wind_gust_dir_2_min: Option<f64>,
    #[serde(rename = "wind_speed_avg_last_10_min")]
    pub wind_speed_avg_10_min: Option<f64>,
    #[serde(rename = "wind_dir_scalar_avg_last_10_min")]
    pub wind_dir_avg_10_min: Option<f64>,
    #[serde(rename = "wind_speed_hi_last_10_min")]
    pub wind_gust_10_min: Option<f64>,
    #[serde(rename = "wind_dir_at_hi_speed_last_10_min")]
    pub wind_gust_dir_10_min: Option<f64>,

    pub rain_size: Option<f64>,
    pub rain_rate_last: Option<f64>,
    #[serde(rename = "rain_rate_hi")]
    pub rain_rate_high: Option<f64>,
    #[serde(rename = "rainfall_last_15_min")]
    pub rain_last_15_min: Option<f64>,
    #[serde(rename = "rain_rate_hi_last_15_min")]
    pub rain_rate_high_15_min: Option<f64>,
    #[serde(rename = "rainfall_last_60_min")]
    pub rain_last_60_min: Option<f64>,
    #[serde(rename = "rainfall_last_24_hr")]
    pub rain_last_24_hr: Option<f64>,
    pub rain_storm: Option<f64>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub rain_storm_start_at: Option<DateTime<Utc>>,

    pub solar_rad: Option<f64>,
    pub uv_index: Option<f64>,

    #[serde(rename = "rx_state")]
    pub signal_code: Option<u8>,
    #[serde(rename = "trans_battery_flag")]
    pub battery_code: Option<u8>,

    pub rainfall_daily: Option<f64>,
    pub rainfall_monthly: Option<f64>,
    pub rainfall_year: Option<f64>,
    pub rain_storm_last: Option<f64>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub rain_storm_last_start_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub rain_storm_last_end_at: Option<DateTime<Utc>>,
}

/// Barometric conditions from the indoor base station.
#[derive(Debug, Clone, Deserialize)]
pub struct BarometerRecord {
    #[serde(rename = "lsid")]
    pub sensor_id: Option<i64>,
    pub bar_sea_level: Option<f64>,
    pub bar_trend: Option<f64>,
    pub bar_absolute: Option<f64>,
}

/// Indoor temperature and humidity conditions.
#[derive(Debug, Clone, Deserialize)]
pub struct IndoorClimateRecord {
    #[serde(rename = "lsid")]
    pub sensor_id: Option<i64>,
    #[serde(rename = "temp_in")]
    pub temperature: Option<f64>,
    #[serde(rename = "hum_in")]
    pub humidity: Option<f64>,
    #[serde(rename = "dew_point_in")]
    pub dew_point: Option<f64>,
    #[serde(rename = "heat_index_in")]
    pub heat_index: Option<f64>,
}

/// Partial condition set delivered in a push-channel broadcast.
#[derive(Debug, Clone, Deserialize)]
pub struct PushConditions {
    #[serde(rename = "did")]
    pub device_id: String,
    #[serde(rename = "ts", default, with = "chrono::serde::ts_seconds_option")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<PushRecord>,
}

/// The narrow wind/rain subset carried by broadcasts.
#[derive(Debug, Clone, Deserialize)]
pub struct PushRecord {
    #[serde(rename = "lsid")]
    pub sensor_id: Option<i64>,
    #[serde(rename = "txid")]
    pub transmitter_id: Option<i64>,

    pub wind_speed_last: Option<f64>,
    pub wind_dir_last: Option<f64>,

    pub rain_size: Option<f64>,
    pub rain_rate_last: Option<f64>,
    #[serde(rename = "rain_15_min")]
    pub rain_last_15_min: Option<f64>,
    #[serde(rename = "rain_60_min")]
    pub rain_last_60_min: Option<f64>,
    #[serde(rename = "rain_24_hr")]
    pub rain_last_24_hr: Option<f64>,
    pub rain_storm: Option<f64>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub rain_storm_start_at: Option<DateTime<Utc>>,
    pub rainfall_daily: Option<f64>,
    pub rainfall_monthly: Option<f64>,
    pub rainfall_year: Option<f64>,

    #[serde(rename = "wind_speed_hi_last_10_min")]
    pub wind_gust_10_min: Option<f64>,
    #[serde(rename = "wind_dir_at_hi_speed_last_10_min")]
    pub wind_gust_dir_10_min: Option<f64>,
}

/// Envelope of a broadcast lease response.
#[derive(Debug, Deserialize)]
pub struct LeaseResponse {
    pub data: Option<LeaseGrant>,
    pub error: Option<UnitError>,
}

/// Push-channel lease granted by the unit.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LeaseGrant {
    #[serde(rename = "broadcast_port")]
    pub port: u16,
    #[serde(rename = "duration")]
    pub duration_secs: u64,
}

/// Receiver signal-lock state reported by the sensor suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalState {
    Synced,
    Rescan,
    Lost,
}

impl SignalState {
    /// Maps the unit's wire code; unknown codes yield `None` so a newer
    /// firmware value leaves the previous state in place.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SignalState::Synced),
            1 => Some(SignalState::Rescan),
            2 => Some(SignalState::Lost),
            _ => None,
        }
    }
}

/// Transmitter battery state reported by the sensor suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryState {
    Nominal,
    Warning,
}

impl BatteryState {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(BatteryState::Nominal),
            1 => Some(BatteryState::Warning),
            _ => None,
        }
    }
}

/// Decodes a pull-channel conditions response envelope.
pub fn decode_pull(payload: &[u8]) -> Result<PullResponse, DecodeError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Decodes a single push-channel broadcast datagram.
pub fn decode_push(payload: &[u8]) -> Result<PushConditions, DecodeError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Decodes the response to a broadcast lease request.
pub fn decode_lease_response(payload: &[u8]) -> Result<LeaseResponse, DecodeError> {
    Ok(serde_json::from_slice(payload)?)
}
