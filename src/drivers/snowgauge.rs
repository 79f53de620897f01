//! Snow-gauge streaming client: an outbound server-streaming RPC to the
//! gauge's own `host:port`, with HTTP/2 keepalive pings standing in for
//! the gauge-level ping/pong the field hardware expects (spec.md §4.2).

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};

use crate::config::DeviceConfig;
use crate::error::ConnectionError;
use crate::proto::snowgauge::snow_gauge_service_client::SnowGaugeServiceClient;
use crate::proto::snowgauge::StreamDistanceRequest;
use crate::reading::{Reading, StationType};

use super::{submit_reading, Backoff, DeviceDriver};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);
const RECONNECT_SLEEP: Duration = Duration::from_secs(5);

pub struct SnowGaugeDriver {
    config: DeviceConfig,
}

impl SnowGaugeDriver {
    pub fn new(config: DeviceConfig) -> Self {
        Self { config }
    }

    fn endpoint(&self) -> Result<Endpoint, ConnectionError> {
        let host = self.config.hostname.clone().ok_or_else(|| {
            ConnectionError::HandshakeFailed(self.name().to_string(), "no hostname configured".into())
        })?;
        let port = self.config.port.unwrap_or(50052);
        let uri = format!("http://{host}:{port}");
        Endpoint::from_shared(uri.clone())
            .map(|ep| {
                ep.keep_alive_while_idle(true)
                    .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
                    .keep_alive_timeout(KEEPALIVE_TIMEOUT)
            })
            .map_err(|e| ConnectionError::HandshakeFailed(self.name().to_string(), e.to_string()))
    }

    async fn connect(&self) -> Result<Channel, ConnectionError> {
        self.endpoint()?
            .connect()
            .await
            .map_err(|e| ConnectionError::HandshakeFailed(self.name().to_string(), e.to_string()))
    }
}

#[async_trait::async_trait]
impl DeviceDriver for SnowGaugeDriver {
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
    driver: SnowGaugeDriver,
    intake: mpsc::Sender<Reading>,
    cancel: CancellationToken,
    dropped: Arc<AtomicU64>,
) {
    let mut backoff = Backoff::new();

    loop {
        if cancel.is_cancelled() {
            return;
        }

        match driver.connect().await {
            Ok(channel) => {
                backoff.reset();
                if let Err(e) = stream_samples(&driver, channel, &intake, &cancel, &dropped).await {
                    tracing::warn!(device = driver.name(), error = %e, "snow gauge stream ended");
                }
                if cancel.is_cancelled() {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_SLEEP) => {}
                    _ = cancel.cancelled() => return,
                }
            }
            Err(e) => {
                tracing::warn!(device = driver.name(), error = %e, "snow gauge connect failed");
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }
}

async fn stream_samples(
    driver: &SnowGaugeDriver,
    channel: Channel,
    intake: &mpsc::Sender<Reading>,
    cancel: &CancellationToken,
    dropped: &Arc<AtomicU64>,
) -> Result<(), ConnectionError> {
    let mut client = SnowGaugeServiceClient::new(channel);
    let mut stream = client
        .stream_distance(StreamDistanceRequest {
            gauge_name: driver.config.name.clone(),
        })
        .await
        .map_err(|e| ConnectionError::HandshakeFailed(driver.name().to_string(), e.to_string()))?
        .into_inner();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            message = stream.message() => {
                match message {
                    Ok(Some(sample)) => {
                        if (sample.distance_mm as f64) > driver.config.base_snow_distance {
                            tracing::debug!(device = driver.name(), distance_mm = sample.distance_mm, "discarding out-of-range snow sample");
                            continue;
                        }
                        let mut reading = Reading::new(driver.config.name.clone(), StationType::SnowGauge);
                        reading.snow_distance_mm = Some(sample.distance_mm);
                        submit_reading(intake, reading, dropped).await;
                    }
                    Ok(None) => return Ok(()),
                    Err(status) => return Err(ConnectionError::Closed(status.to_string())),
                }
            }
        }
    }
}
