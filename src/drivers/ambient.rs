//! Ambient Weather "customized server" protocol driver: an embedded
//! HTTP listener per device, since Ambient-compatible consoles push
//! readings rather than being polled (spec.md §4.2).

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use chrono::{NaiveDateTime, TimeZone, Utc};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::DeviceConfig;
use crate::error::ConnectionError;
use crate::reading::{Reading, StationType};

use super::{submit_reading, DeviceDriver};

const REQUIRED_PARAMS: &[&str] = &["ID", "PASSWORD", "dateutc"];
const DATEUTC_FMT: &str = "%Y-%m-%d %H:%M:%S";

pub struct AmbientDriver {
    config: DeviceConfig,
}

impl AmbientDriver {
    pub fn new(config: DeviceConfig) -> Self {
        Self { config }
    }
}

#[derive(Clone)]
struct AppState {
    station_name: String,
    wind_dir_correction: i32,
    intake: mpsc::Sender<Reading>,
    dropped: Arc<AtomicU64>,
}

#[async_trait::async_trait]
impl DeviceDriver for AmbientDriver {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn start(
        self: Box<Self>,
        intake: mpsc::Sender<Reading>,
        cancel: CancellationToken,
    ) -> Result<(), ConnectionError> {
        let host = self
            .config
            .hostname
            .clone()
            .unwrap_or_else(|| "0.0.0.0".into());
        let port = self.config.port.unwrap_or(8080);
        let addr = format!("{host}:{port}");

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ConnectionError::Unreachable { target: addr, source: e })?;

        let state = AppState {
            station_name: self.config.name.clone(),
            wind_dir_correction: self.config.wind_dir_correction,
            intake,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        let app = axum::Router::new()
            .route("/", get(handle_report))
            .with_state(state);

        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                cancel.cancelled().await;
            });
            if let Err(e) = server.await {
                tracing::error!(error = %e, "ambient HTTP listener exited unexpectedly");
            }
        });

        Ok(())
    }
}

async fn handle_report(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, &'static str) {
    for required in REQUIRED_PARAMS {
        if !params.contains_key(*required) {
            return (StatusCode::BAD_REQUEST, "missing required field");
        }
    }
    if params.get("action").map(String::as_str) != Some("updateraw") {
        return (StatusCode::BAD_REQUEST, "unsupported action");
    }

    let Some(mut reading) = reading_from_params(&state.station_name, &params) else {
        return (StatusCode::BAD_REQUEST, "unparseable dateutc");
    };
    reading.apply_wind_dir_correction(state.wind_dir_correction);
    reading.compute_derived();
    submit_reading(&state.intake, reading, &state.dropped).await;

    (StatusCode::OK, "success")
}

fn reading_from_params(station_name: &str, params: &HashMap<String, String>) -> Option<Reading> {
    let naive = NaiveDateTime::parse_from_str(params.get("dateutc")?, DATEUTC_FMT).ok()?;

    let mut r = Reading::new(station_name.to_string(), StationType::AmbientCustomized);
    r.timestamp = Utc.from_utc_datetime(&naive);

    let f = |key: &str| params.get(key).and_then(|v| v.parse::<f64>().ok());

    r.outside_temperature = f("tempf");
    r.outside_humidity = f("humidity");
    r.barometer = f("baromin");
    r.wind_speed = f("windspeedmph");
    r.wind_gust_10m = f("windgustmph");
    r.wind_direction = f("winddir").map(|d| d.rem_euclid(360.0) as u16);
    r.rain_incremental = f("rainin");
    r.rain_day = f("dailyrainin");
    r.rain_month = f("monthlyrainin");
    r.rain_year = f("yearlyrainin");
    r.indoor_temperature = f("indoortempf");
    r.indoor_humidity = f("indoorhumidity");
    r.solar_radiation = f("solarradiation");
    r.uv_index = f("UV");

    Some(r)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_params() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("dateutc".into(), "2024-06-21 12:00:00".into());
        m.insert("tempf".into(), "72.5".into());
        m.insert("humidity".into(), "45".into());
        m.insert("winddir".into(), "370".into());
        m
    }

    #[test]
    fn maps_standard_ambient_fields() {
        let r = reading_from_params("station-a", &sample_params()).unwrap();
        assert_eq!(r.outside_temperature, Some(72.5));
        assert_eq!(r.outside_humidity, Some(45.0));
        assert_eq!(r.wind_direction, Some(10));
    }

    #[test]
    fn rejects_unparseable_dateutc() {
        let mut params = sample_params();
        params.insert("dateutc".into(), "not-a-date".into());
        assert!(reading_from_params("station-a", &params).is_none());
    }
}
