//! Campbell Scientific datalogger driver: serial line frames, one
//! record per line, comma-separated fields with the datalogger's own
//! timestamp preferred over the host clock when present (spec.md §4.2,
//! Open Question resolved in DESIGN.md).

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, TimeZone, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;

use crate::config::DeviceConfig;
use crate::error::ConnectionError;
use crate::reading::{Reading, StationType};

use super::{submit_reading, Backoff, DeviceDriver, DriverState};

const DATALOGGER_TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S";

pub struct CampbellDriver {
    config: DeviceConfig,
}

impl CampbellDriver {
    pub fn new(config: DeviceConfig) -> Self {
        Self { config }
    }

    fn open(&self) -> Result<tokio_serial::SerialStream, ConnectionError> {
        let path = self.config.serial_device.clone().ok_or_else(|| {
            ConnectionError::HandshakeFailed(
                self.name().to_string(),
                "no serial_device configured".into(),
            )
        })?;
        tokio_serial::new(&path, self.config.baud)
            .timeout(Duration::from_secs(5))
            .open_native_async()
            .map_err(|e| ConnectionError::Unreachable {
                target: path,
                source: std::io::Error::other(e),
            })
    }
}

#[async_trait::async_trait]
impl DeviceDriver for CampbellDriver {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn start(
        self: Box<Self>,
        intake: mpsc::Sender<Reading>,
        cancel: CancellationToken,
    ) -> Result<(), ConnectionError> {
        let dropped = Arc::new(AtomicU64::new(0));
        tokio::spawn(run_loop(*self, intake, cancel, dropped));
        Ok(())
    }
}

async fn run_loop(
    driver: CampbellDriver,
    intake: mpsc::Sender<Reading>,
    cancel: CancellationToken,
    dropped: Arc<AtomicU64>,
) {
    let mut state = DriverState::Disconnected;
    let mut backoff = Backoff::new();

    loop {
        if cancel.is_cancelled() {
            return;
        }
        match state {
            DriverState::Disconnected => match driver.open() {
                Ok(port) => {
                    backoff.reset();
                    state = DriverState::Streaming;
                    read_lines(&driver, port, &intake, &cancel, &dropped).await;
                    state = DriverState::Backoff;
                }
                Err(e) => {
                    tracing::warn!(device = driver.name(), error = %e, "serial open failed");
                    state = DriverState::Backoff;
                }
            },
            DriverState::Backoff => {
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return,
                }
                state = DriverState::Disconnected;
            }
            _ => state = DriverState::Disconnected,
        }
    }
}

async fn read_lines(
    driver: &CampbellDriver,
    port: tokio_serial::SerialStream,
    intake: &mpsc::Sender<Reading>,
    cancel: &CancellationToken,
    dropped: &Arc<AtomicU64>,
) {
    let mut lines = BufReader::new(port).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Some(mut reading) = parse_record(&driver.config.name, &line) {
                            reading.apply_wind_dir_correction(driver.config.wind_dir_correction);
                            reading.compute_derived();
                            submit_reading(intake, reading, dropped).await;
                        }
                    }
                    Ok(None) => {
                        tracing::warn!(device = driver.name(), "serial stream ended, reconnecting");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(device = driver.name(), error = %e, "serial read error, reconnecting");
                        return;
                    }
                }
            }
        }
    }
}

/// Parses one comma-separated record. Expected field order:
/// `timestamp,outside_temp_f,outside_humidity,barometer_inhg,wind_speed_mph,wind_direction_deg,solar_wm2`.
/// Fields beyond what's present are left `None`; a bare `NAN` marks a
/// reported-but-missing field. The first field is tried as the
/// datalogger's own clock; if it doesn't parse, the host wall clock is
/// used for `timestamp` instead.
fn parse_record(station_name: &str, line: &str) -> Option<Reading> {
    let fields: Vec<&str> = line.trim().split(',').collect();
    if fields.is_empty() || fields[0].is_empty() {
        return None;
    }

    let mut reading = Reading::new(station_name.to_string(), StationType::CampbellScientific);

    if let Ok(naive) = NaiveDateTime::parse_from_str(fields[0], DATALOGGER_TIMESTAMP_FMT) {
        reading.timestamp = Utc.from_utc_datetime(&naive);
    }
    // else: Reading::new() already seeded `timestamp` from the host clock.

    let field = |idx: usize| -> Option<f64> {
        fields
            .get(idx)
            .filter(|s| !s.eq_ignore_ascii_case("nan") && !s.is_empty())
            .and_then(|s| s.parse::<f64>().ok())
    };

    reading.outside_temperature = field(1);
    reading.outside_humidity = field(2);
    reading.barometer = field(3);
    reading.wind_speed = field(4);
    reading.wind_direction = field(5).map(|d| (d.rem_euclid(360.0)) as u16);
    reading.solar_radiation = field(6);

    Some(reading)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_record_with_datalogger_clock() {
        let r = parse_record("station-a", "2024-06-21 12:00:00,72.5,45,29.92,8,180,650").unwrap();
        assert_eq!(r.outside_temperature, Some(72.5));
        assert_eq!(r.wind_direction, Some(180));
        assert_eq!(r.timestamp.format("%H:%M:%S").to_string(), "12:00:00");
    }

    #[test]
    fn falls_back_to_host_clock_when_timestamp_unparseable() {
        let before = Utc::now();
        let r = parse_record("station-a", "garbage-ts,72.5,45,29.92,8,180,650").unwrap();
        assert!(r.timestamp >= before);
    }

    #[test]
    fn nan_fields_map_to_none() {
        let r = parse_record("station-a", "2024-06-21 12:00:00,NAN,45,29.92,8,180,650").unwrap();
        assert_eq!(r.outside_temperature, None);
        assert_eq!(r.outside_humidity, Some(45.0));
    }

    #[test]
    fn blank_line_is_rejected() {
        assert!(parse_record("station-a", "").is_none());
    }
}
