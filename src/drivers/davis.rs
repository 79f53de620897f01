//! Davis-family network console driver: TCP "LOOP n" polling with a
//! wake handshake, CRC-checked 99-byte binary frames (spec.md §4.2).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::DeviceConfig;
use crate::error::ConnectionError;
use crate::reading::{Reading, StationType};

use super::{submit_reading, Backoff, DeviceDriver, DriverState};

const LOOP_PACKET_LEN: usize = 99;
const WAKE_ACK: u8 = 0x06;
const POLL_PERIOD: Duration = Duration::from_millis(2_500);

pub struct DavisDriver {
    config: DeviceConfig,
    /// Bumped every time a LOOP frame is rejected (bad CRC or malformed
    /// payload) and the driver re-polls instead of emitting a reading
    /// (spec.md §8 S1).
    retries: Arc<AtomicU64>,
}

impl DavisDriver {
    pub fn new(config: DeviceConfig) -> Self {
        Self { config, retries: Arc::new(AtomicU64::new(0)) }
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    async fn connect(&self) -> Result<TcpStream, ConnectionError> {
        let host = self
            .config
            .hostname
            .clone()
            .unwrap_or_else(|| "127.0.0.1".into());
        let port = self.config.port.unwrap_or(22222);
        let addr = format!("{host}:{port}");
        TcpStream::connect(&addr)
            .await
            .map_err(|e| ConnectionError::Unreachable { target: addr, source: e })
    }

    /// Sends a newline and expects a single `0x06` ack back, retrying
    /// up to three times.
    async fn wake(&self, stream: &mut TcpStream) -> Result<(), ConnectionError> {
        for attempt in 0..3 {
            stream
                .write_all(b"\n")
                .await
                .map_err(|e| ConnectionError::Unreachable {
                    target: self.name().to_string(),
                    source: e,
                })?;
            let mut buf = [0u8; 1];
            let res = tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut buf)).await;
            if matches!(res, Ok(Ok(_)) if buf[0] == WAKE_ACK) {
                return Ok(());
            }
            tracing::debug!(device = self.name(), attempt, "wake attempt failed, retrying");
        }
        Err(ConnectionError::HandshakeFailed(
            self.name().to_string(),
            "no wake ack after 3 attempts".into(),
        ))
    }

    async fn poll_loop(&self, stream: &mut TcpStream) -> Result<Option<Reading>, ConnectionError> {
        stream
            .write_all(b"LOOP 1\n")
            .await
            .map_err(|e| ConnectionError::Unreachable {
                target: self.name().to_string(),
                source: e,
            })?;

        let mut buf = [0u8; LOOP_PACKET_LEN];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| ConnectionError::Unreachable {
                target: self.name().to_string(),
                source: e,
            })?;

        match parse_loop_packet(&buf) {
            Ok(mut reading) => {
                reading.station_name = self.config.name.clone();
                Ok(Some(reading))
            }
            Err(e) => {
                self.retries.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(device = self.name(), error = %e, "LOOP packet rejected, will re-poll");
                Ok(None)
            }
        }
    }
}

#[async_trait::async_trait]
impl DeviceDriver for DavisDriver {
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
    driver: DavisDriver,
    intake: mpsc::Sender<Reading>,
    cancel: CancellationToken,
    dropped: Arc<AtomicU64>,
) {
    let mut state = DriverState::Disconnected;
    let mut backoff = Backoff::new();

    loop {
        if cancel.is_cancelled() {
            state = DriverState::Shutdown;
        }

        match state {
            DriverState::Shutdown => return,
            DriverState::Disconnected => match driver.connect().await {
                Ok(mut stream) => {
                    if driver.wake(&mut stream).await.is_ok() {
                        backoff.reset();
                        state = DriverState::Streaming;
                        poll_until_error(&driver, &mut stream, &intake, &cancel, &dropped).await;
                        state = DriverState::Backoff;
                    } else {
                        state = DriverState::Backoff;
                    }
                }
                Err(e) => {
                    tracing::warn!(device = driver.name(), error = %e, "connect failed");
                    state = DriverState::Backoff;
                }
            },
            DriverState::Backoff => {
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => { state = DriverState::Shutdown; continue; }
                }
                state = DriverState::Disconnected;
            }
            DriverState::Connected | DriverState::Streaming => {
                // handled inline within the Disconnected branch above
                state = DriverState::Disconnected;
            }
        }
    }
}

async fn poll_until_error(
    driver: &DavisDriver,
    stream: &mut TcpStream,
    intake: &mpsc::Sender<Reading>,
    cancel: &CancellationToken,
    dropped: &Arc<AtomicU64>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = driver.poll_loop(stream) => {
                match result {
                    Ok(Some(mut reading)) => {
                        reading.apply_wind_dir_correction(driver.config.wind_dir_correction);
                        reading.compute_derived();
                        submit_reading(intake, reading, dropped).await;
                    }
                    Ok(None) => { /* CRC/parse failure, just re-poll */ }
                    Err(e) => {
                        tracing::warn!(device = driver.name(), error = %e, "LOOP poll failed, reconnecting");
                        return;
                    }
                }
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(POLL_PERIOD) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

/// CRC-16/CCITT (poly 0x1021, init 0), as used by the Davis LOOP frame.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn le_i16(buf: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn le_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

/// Parses a 99-byte LOOP frame, verifying the CRC over bytes `0..95`
/// against the big-endian value in bytes `96..97` (spec.md §4.2).
/// Dashed sentinel values (`0x7FFF`, `0xFF`) map to `None`.
fn parse_loop_packet(buf: &[u8; LOOP_PACKET_LEN]) -> Result<Reading, crate::error::ProtocolError> {
    let computed = crc16_ccitt(&buf[0..96]);
    let expected = u16::from_be_bytes([buf[96], buf[97]]);
    if computed != expected {
        return Err(crate::error::ProtocolError::CrcMismatch("davis".into()));
    }

    let mut r = Reading::new(String::new(), StationType::DavisConsole);

    let bar_raw = le_u16(buf, 7);
    r.barometer = (bar_raw != 0).then(|| bar_raw as f64 / 1000.0);

    let in_temp = le_i16(buf, 9);
    r.indoor_temperature = (in_temp != 0x7FFF).then(|| in_temp as f64 / 10.0);

    let in_hum = buf[11];
    r.indoor_humidity = (in_hum != 0xFF).then_some(in_hum as f64);

    let out_temp = le_i16(buf, 12);
    r.outside_temperature = (out_temp != 0x7FFF).then(|| out_temp as f64 / 10.0);

    let wind_speed = buf[14];
    r.wind_speed = (wind_speed != 0xFF).then_some(wind_speed as f64);

    let wind_gust = buf[15];
    r.wind_gust_10m = (wind_gust != 0xFF).then_some(wind_gust as f64);

    let wind_dir = le_u16(buf, 16);
    r.wind_direction = (wind_dir != 0 && wind_dir <= 360).then_some(wind_dir % 360);

    let out_hum = buf[33];
    r.outside_humidity = (out_hum != 0xFF).then_some(out_hum as f64);

    let uv = buf[43];
    r.uv_index = (uv != 0xFF).then(|| uv as f64 / 10.0);

    let solar = le_u16(buf, 44);
    r.solar_radiation = (solar != 0x7FFF).then_some(solar as f64);

    let day_rain = le_u16(buf, 50);
    r.rain_day = Some(day_rain as f64 * 0.01);

    let month_rain = le_u16(buf, 52);
    r.rain_month = Some(month_rain as f64 * 0.01);

    let year_rain = le_u16(buf, 54);
    r.rain_year = Some(year_rain as f64 * 0.01);

    let battery = buf[86];
    r.transmitter_battery = Some(battery);

    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_frame() -> [u8; LOOP_PACKET_LEN] {
        let mut buf = [0u8; LOOP_PACKET_LEN];
        buf[0] = b'L';
        buf[1] = b'O';
        buf[2] = b'O';
        // barometer 29.92 inHg -> 29920
        buf[7..9].copy_from_slice(&29920u16.to_le_bytes());
        // outside temp 72.3F -> 723
        buf[12..14].copy_from_slice(&723i16.to_le_bytes());
        buf[33] = 45; // outside humidity
        buf[14] = 8; // wind speed mph
        buf[16..18].copy_from_slice(&180u16.to_le_bytes());
        let crc = crc16_ccitt(&buf[0..96]);
        buf[96..98].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    #[test]
    fn parses_a_well_formed_loop_frame() {
        let buf = valid_frame();
        let r = parse_loop_packet(&buf).unwrap();
        assert_eq!(r.barometer, Some(29.92));
        assert_eq!(r.outside_temperature, Some(72.3));
        assert_eq!(r.outside_humidity, Some(45.0));
        assert_eq!(r.wind_direction, Some(180));
    }

    #[test]
    fn rejects_a_frame_with_bad_crc() {
        let mut buf = valid_frame();
        buf[97] ^= 0xFF;
        assert!(matches!(
            parse_loop_packet(&buf),
            Err(crate::error::ProtocolError::CrcMismatch(_))
        ));
    }

    #[test]
    fn dashed_values_map_to_none() {
        let mut buf = valid_frame();
        buf[12..14].copy_from_slice(&0x7FFFi16.to_le_bytes());
        let crc = crc16_ccitt(&buf[0..96]);
        buf[96..98].copy_from_slice(&crc.to_be_bytes());
        let r = parse_loop_packet(&buf).unwrap();
        assert_eq!(r.outside_temperature, None);
    }

    #[tokio::test]
    async fn crc_failure_increments_retry_counter_and_emits_no_reading() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut frame = valid_frame();
        frame[97] ^= 0xFF; // corrupt the CRC
        let responder = tokio::spawn(async move {
            let (mut server, _) = listener.accept().await.unwrap();
            let mut cmd = [0u8; 7];
            server.read_exact(&mut cmd).await.unwrap();
            server.write_all(&frame).await.unwrap();
        });

        let driver = DavisDriver::new(DeviceConfig {
            name: "station-a".into(),
            device_type: crate::config::DeviceType::Davis,
            hostname: Some(addr.ip().to_string()),
            port: Some(addr.port()),
            serial_device: None,
            baud: 9600,
            wind_dir_correction: 0,
            base_snow_distance: 0.0,
            solar: None,
        });

        let mut client = driver.connect().await.unwrap();

        assert_eq!(driver.retries(), 0);
        let result = driver.poll_loop(&mut client).await.unwrap();
        assert!(result.is_none(), "a CRC-rejected frame must not emit a reading");
        assert_eq!(driver.retries(), 1);

        responder.await.unwrap();
    }
}
