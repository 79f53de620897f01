//! APRS/CWOP uploader: logs into APRS-IS over a plain TCP connection
//! and sends a standard APRS weather packet on each tick (spec.md §4.6).

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::fresh_latest_bucket;
use crate::reading::BucketReading;
use crate::sinks::timeseries::TimeSeriesSink;

const DEFAULT_ENDPOINT: &str = "noam.aprs2.net:14580";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Config {
    pub name: String,
    pub endpoint: Option<String>,
    pub callsign: String,
    pub passcode: String,
    pub interval: Duration,
    pub pull_from_device: String,
    pub lat_deg: f64,
    pub lon_deg: f64,
}

pub async fn run(cfg: Config, timeseries: Arc<TimeSeriesSink>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(cfg.interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = tick(&cfg, &timeseries).await {
                    tracing::debug!(uploader = %cfg.name, error = %e, "aprs tick skipped");
                }
            }
        }
    }
}

async fn tick(cfg: &Config, timeseries: &TimeSeriesSink) -> Result<(), String> {
    let bucket = fresh_latest_bucket(timeseries, &cfg.pull_from_device).await?;
    let packet = weather_packet(cfg, &bucket);

    let endpoint = cfg.endpoint.clone().unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&endpoint))
        .await
        .map_err(|_| "connect timed out".to_string())?
        .map_err(|e| e.to_string())?;

    let login = format!("user {} pass {} vers weather-relay 0.1\r\n", cfg.callsign, cfg.passcode);
    stream.write_all(login.as_bytes()).await.map_err(|e| e.to_string())?;

    let mut ack = [0u8; 256];
    let _ = tokio::time::timeout(CONNECT_TIMEOUT, stream.read(&mut ack)).await;

    stream
        .write_all(format!("{packet}\r\n").as_bytes())
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

fn aprs_coord(lat_deg: f64, lon_deg: f64) -> String {
    let lat_hemi = if lat_deg >= 0.0 { 'N' } else { 'S' };
    let lon_hemi = if lon_deg >= 0.0 { 'E' } else { 'W' };
    let (lat_d, lat_m) = deg_min(lat_deg.abs());
    let (lon_d, lon_m) = deg_min(lon_deg.abs());
    format!(
        "{lat_d:02}{lat_m:05.2}{lat_hemi}/{lon_d:03}{lon_m:05.2}{lon_hemi}",
        lat_m = lat_m,
        lon_m = lon_m
    )
}

fn deg_min(decimal_deg: f64) -> (u32, f64) {
    let d = decimal_deg.trunc() as u32;
    let m = (decimal_deg.fract()) * 60.0;
    (d, m)
}

/// Builds a standard APRS weather report, e.g.
/// `CALL>APRS,TCPIP*:@011200z4903.50N/07201.75W_180/008g012t072h45b10132`.
fn weather_packet(cfg: &Config, bucket: &BucketReading) -> String {
    let ts = bucket.bucket.format("%d%H%M").to_string();
    let coord = aprs_coord(cfg.lat_deg, cfg.lon_deg);

    let dir = bucket.wind_direction_avg.map(|d| d.round() as i64).unwrap_or(0);
    let speed = bucket.wind_speed_avg.map(|s| s.round() as i64).unwrap_or(0);
    let gust = bucket.wind_gust_max.map(|g| g.round() as i64).unwrap_or(0);
    let temp = bucket.out_temp_avg.map(|t| t.round() as i64).unwrap_or(0);
    let humidity = bucket.out_humidity_avg.map(|h| (h.round() as i64).min(99)).unwrap_or(0);
    let baro_tenths_mb = bucket
        .barometer_avg
        .map(|inhg| (inhg * 33.8639 * 10.0).round() as i64)
        .unwrap_or(0);

    format!(
        "{call}>APRS,TCPIP*:@{ts}z{coord}_{dir:03}/{speed:03}g{gust:03}t{temp:03}h{humidity:02}b{baro:05}",
        call = cfg.callsign,
        baro = baro_tenths_mb
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample_bucket() -> BucketReading {
        BucketReading {
            bucket: Utc.with_ymd_and_hms(2024, 6, 21, 12, 0, 0).unwrap(),
            station_name: "station-a".into(),
            out_temp_avg: Some(72.0),
            out_temp_min: None,
            out_temp_max: None,
            out_humidity_avg: Some(45.0),
            barometer_avg: Some(29.92),
            wind_speed_avg: Some(8.0),
            wind_gust_max: Some(12.0),
            wind_direction_avg: Some(180.0),
            rain_incremental_sum: None,
            rain_day: None,
            snow_distance_avg: None,
            solar_radiation_avg: None,
            uv_index_avg: None,
        }
    }

    #[test]
    fn packet_contains_wind_and_temp_fields() {
        let cfg = Config {
            name: "aprs".into(),
            endpoint: None,
            callsign: "N0CALL".into(),
            passcode: "-1".into(),
            interval: Duration::from_secs(600),
            pull_from_device: "station-a".into(),
            lat_deg: 40.0,
            lon_deg: -105.0,
        };
        let packet = weather_packet(&cfg, &sample_bucket());
        assert!(packet.starts_with("N0CALL>APRS,TCPIP*:@"));
        assert!(packet.contains("_180/008g012t072h45b"));
    }
}
