//! Canonical reading record and the one-minute aggregate row read back by
//! the streaming-RPC and upload sinks.

pub mod derived;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A station type tag, used by drivers to decide which fields they
/// populate and by nothing else — the distributor and sinks are
/// station-type agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StationType {
    DavisConsole,
    CampbellScientific,
    AmbientCustomized,
    SnowGauge,
}

/// One normalised sample, immutable once a driver produces it.
///
/// Every numeric field is optional: a `None` means "not reported" by
/// this station, distinct from a reported zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub station_name: String,
    pub station_type: StationType,

    pub outside_temperature: Option<f64>,
    pub outside_humidity: Option<f64>,
    pub barometer: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_gust_10m: Option<f64>,
    pub wind_direction: Option<u16>,

    pub rain_incremental: Option<f64>,
    pub rain_day: Option<f64>,
    pub rain_month: Option<f64>,
    pub rain_year: Option<f64>,

    pub snow_distance_mm: Option<i32>,

    pub indoor_temperature: Option<f64>,
    pub indoor_humidity: Option<f64>,

    pub solar_radiation: Option<f64>,
    pub uv_index: Option<f64>,
    pub transmitter_battery: Option<u8>,

    pub wind_chill: Option<f64>,
    pub heat_index: Option<f64>,
}

impl Reading {
    pub fn new(station_name: impl Into<String>, station_type: StationType) -> Self {
        Self {
            timestamp: Utc::now(),
            station_name: station_name.into(),
            station_type,
            outside_temperature: None,
            outside_humidity: None,
            barometer: None,
            wind_speed: None,
            wind_gust_10m: None,
            wind_direction: None,
            rain_incremental: None,
            rain_day: None,
            rain_month: None,
            rain_year: None,
            snow_distance_mm: None,
            indoor_temperature: None,
            indoor_humidity: None,
            solar_radiation: None,
            uv_index: None,
            transmitter_battery: None,
            wind_chill: None,
            heat_index: None,
        }
    }

    /// Populates `wind_chill` and `heat_index` from the current
    /// temperature/humidity/wind fields. Drivers call this once, right
    /// before handing the reading to the distributor.
    pub fn compute_derived(&mut self) {
        if let (Some(temp), Some(wind)) = (self.outside_temperature, self.wind_speed) {
            self.wind_chill = Some(derived::wind_chill(temp, wind));
        }
        if let (Some(temp), Some(rh)) = (self.outside_temperature, self.outside_humidity) {
            self.heat_index = Some(derived::heat_index(temp, rh));
        }
    }

    /// Applies a device's configured wind-direction correction, wrapping
    /// into `0..360`.
    pub fn apply_wind_dir_correction(&mut self, correction_deg: i32) {
        if correction_deg == 0 {
            return;
        }
        if let Some(raw) = self.wind_direction {
            let corrected = (raw as i32 + correction_deg).rem_euclid(360);
            self.wind_direction = Some(corrected as u16);
        }
    }
}

/// One-minute aggregation row, as persisted by the time-series sink and
/// read back by the RPC and upload sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketReading {
    pub bucket: DateTime<Utc>,
    pub station_name: String,

    pub out_temp_avg: Option<f64>,
    pub out_temp_min: Option<f64>,
    pub out_temp_max: Option<f64>,

    pub out_humidity_avg: Option<f64>,
    pub barometer_avg: Option<f64>,

    pub wind_speed_avg: Option<f64>,
    pub wind_gust_max: Option<f64>,
    pub wind_direction_avg: Option<f64>,

    pub rain_incremental_sum: Option<f64>,
    pub rain_day: Option<f64>,

    pub snow_distance_avg: Option<f64>,

    pub solar_radiation_avg: Option<f64>,
    pub uv_index_avg: Option<f64>,
}

impl BucketReading {
    /// `base_distance - snow_distance`, per spec.md §4.4. Callers resolve
    /// `base_distance` from the owning device's configuration; this
    /// function does not look it up itself so it stays a pure helper.
    pub fn snow_depth_mm(&self, base_distance_mm: f64) -> Option<f64> {
        self.snow_distance_avg.map(|d| base_distance_mm - d)
    }
}
