//! PWS Weather uploader: same query-string shape as Weather Underground
//! but against PWS Weather's own endpoint and field names (spec.md §4.6).

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;

use super::{fresh_latest_bucket, opt_f64};
use crate::sinks::timeseries::TimeSeriesSink;

const DEFAULT_ENDPOINT: &str = "https://pwsupdate.pwsweather.com/api/v1/submitwx";

pub struct Config {
    pub name: String,
    pub endpoint: Option<String>,
    pub station_id: String,
    pub password: String,
    pub interval: Duration,
    pub pull_from_device: String,
}

pub async fn run(cfg: Config, timeseries: Arc<TimeSeriesSink>, cancel: CancellationToken) {
    let client = Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("reqwest client");
    let mut ticker = tokio::time::interval(cfg.interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = tick(&cfg, &client, &timeseries).await {
                    tracing::debug!(uploader = %cfg.name, error = %e, "pwsweather tick skipped");
                }
            }
        }
    }
}

async fn tick(cfg: &Config, client: &Client, timeseries: &TimeSeriesSink) -> Result<(), String> {
    let bucket = fresh_latest_bucket(timeseries, &cfg.pull_from_device).await?;

    let dateutc = bucket.bucket.format("%Y-%m-%d %H:%M:%S").to_string();
    let winddir = bucket.wind_direction_avg.map(|d| d.round().to_string()).unwrap_or_default();
    let windspeedmph = opt_f64(bucket.wind_speed_avg);
    let humidity = opt_f64(bucket.out_humidity_avg);
    let tempf = opt_f64(bucket.out_temp_avg);
    let baromin = opt_f64(bucket.barometer_avg);

    let endpoint = cfg.endpoint.clone().unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
    let response = client
        .get(endpoint)
        .query(&[
            ("ID", cfg.station_id.as_str()),
            ("PASSWORD", cfg.password.as_str()),
            ("dateutc", dateutc.as_str()),
            ("action", "updateraw"),
            ("winddir", winddir.as_str()),
            ("windspeedmph", windspeedmph.as_str()),
            ("humidity", humidity.as_str()),
            ("tempf", tempf.as_str()),
            ("baromin", baromin.as_str()),
            ("softwaretype", "weather-relay"),
        ])
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if !response.status().is_success() {
        tracing::warn!(uploader = %cfg.name, status = %response.status(), "pwsweather upload rejected");
    }
    Ok(())
}
