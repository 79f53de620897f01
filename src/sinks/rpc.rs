//! Streaming-RPC sink: the `Weather` gRPC service, broadcasting live
//! readings to subscribed clients and answering span/latest queries
//! against the time-series sink (spec.md §4.5).

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};

use crate::config::ConfigSnapshot;
use crate::error::{ConnectionError, ValidationError};
use crate::proto::weather::weather_server::{Weather, WeatherServer};
use crate::proto::weather::{
    LatestReadingRequest, LiveWeatherRequest, WeatherReading, WeatherSpan, WeatherSpanRequest,
};
use crate::reading::{BucketReading, Reading};

use super::timeseries::TimeSeriesSink;
use super::HealthCheckable;

const CLIENT_QUEUE_CAPACITY: usize = 10;

struct ClientSubscription {
    id: u64,
    station_name: Option<String>,
    tx: mpsc::Sender<Reading>,
}

/// Drops itself from the registry on stream end, including an ungraceful
/// client disconnect — removal must happen even then (spec.md §9).
struct SubscriptionGuard {
    id: u64,
    clients: Arc<RwLock<Vec<ClientSubscription>>>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let mut guard = self.clients.write().unwrap();
        if let Some(pos) = guard.iter().position(|c| c.id == self.id) {
            guard.swap_remove(pos);
        }
    }
}

struct LiveWeatherStream {
    inner: ReceiverStream<Reading>,
    _guard: SubscriptionGuard,
}

impl Stream for LiveWeatherStream {
    type Item = Result<WeatherReading, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner)
            .poll_next(cx)
            .map(|opt| opt.map(|r| Ok(reading_to_proto(&r))))
    }
}

pub struct RpcSink {
    name: String,
    clients: Arc<RwLock<Vec<ClientSubscription>>>,
    next_client_id: AtomicU64,
    timeseries: Arc<TimeSeriesSink>,
    devices: Arc<ConfigSnapshot>,
}

impl RpcSink {
    pub fn new(
        name: impl Into<String>,
        timeseries: Arc<TimeSeriesSink>,
        devices: Arc<ConfigSnapshot>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            clients: Arc::new(RwLock::new(Vec::new())),
            next_client_id: AtomicU64::new(0),
            timeseries,
            devices,
        })
    }

    /// Drains the distributor-registered channel and broadcasts every
    /// reading to matching client queues by non-blocking send; a full
    /// client queue drops that one delivery (spec.md §5).
    pub async fn run_ingest(self: Arc<Self>, mut rx: mpsc::Receiver<Reading>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    rx.close();
                    while let Ok(reading) = rx.try_recv() {
                        self.broadcast(reading);
                    }
                    break;
                }
                maybe_reading = rx.recv() => {
                    match maybe_reading {
                        Some(reading) => self.broadcast(reading),
                        None => break,
                    }
                }
            }
        }
    }

    fn broadcast(&self, reading: Reading) {
        let clients = self.clients.read().unwrap();
        for client in clients.iter() {
            if let Some(name) = &client.station_name {
                if name != &reading.station_name {
                    continue;
                }
            }
            let _ = client.tx.try_send(reading.clone());
        }
    }

    fn base_snow_distance(&self, station_name: &str) -> f64 {
        self.devices
            .device(station_name)
            .map(|d| d.base_snow_distance)
            .unwrap_or(0.0)
    }
}

#[async_trait::async_trait]
impl HealthCheckable for RpcSink {
    fn sink_name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<(), String> {
        Ok(())
    }
}

#[tonic::async_trait]
impl Weather for Arc<RpcSink> {
    type LiveWeatherStream = Pin<Box<dyn Stream<Item = Result<WeatherReading, Status>> + Send>>;

    async fn live_weather(
        &self,
        request: Request<LiveWeatherRequest>,
    ) -> Result<Response<Self::LiveWeatherStream>, Status> {
        let station_name = request.into_inner().station_name;
        if let Some(name) = &station_name {
            if self.devices.device(name).is_none() {
                return Err(ValidationError::UnknownStation(name.clone()).into());
            }
        }

        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.clients.write().unwrap().push(ClientSubscription {
            id,
            station_name,
            tx,
        });

        let stream = LiveWeatherStream {
            inner: ReceiverStream::new(rx),
            _guard: SubscriptionGuard {
                id,
                clients: self.clients.clone(),
            },
        };
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_weather_span(
        &self,
        request: Request<WeatherSpanRequest>,
    ) -> Result<Response<WeatherSpan>, Status> {
        let req = request.into_inner();
        let station = req
            .station_name
            .ok_or_else(|| Status::invalid_argument("station_name is required"))?;
        if self.devices.device(&station).is_none() {
            return Err(ValidationError::UnknownStation(station).into());
        }

        let span = Duration::from_secs(req.span_duration_seconds.max(0) as u64);
        let (span_start, rows) = self
            .timeseries
            .weather_span(&station, span)
            .await
            .map_err(Status::from)?;

        let base_distance = self.base_snow_distance(&station);
        Ok(Response::new(WeatherSpan {
            span_start: Some(to_timestamp(span_start)),
            readings: rows.iter().map(|b| bucket_to_proto(b, base_distance)).collect(),
        }))
    }

    async fn get_latest_reading(
        &self,
        request: Request<LatestReadingRequest>,
    ) -> Result<Response<WeatherReading>, Status> {
        let req = request.into_inner();
        let station = req
            .station_name
            .ok_or_else(|| Status::invalid_argument("station_name is required"))?;
        if self.devices.device(&station).is_none() {
            return Err(ValidationError::UnknownStation(station).into());
        }

        let bucket = self
            .timeseries
            .latest_reading(&station)
            .await
            .map_err(Status::from)?;
        let base_distance = self.base_snow_distance(&station);
        Ok(Response::new(bucket_to_proto(&bucket, base_distance)))
    }
}

fn to_timestamp(dt: chrono::DateTime<chrono::Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}

fn reading_to_proto(r: &Reading) -> WeatherReading {
    WeatherReading {
        timestamp: Some(to_timestamp(r.timestamp)),
        station_name: r.station_name.clone(),
        outside_temperature: r.outside_temperature,
        outside_humidity: r.outside_humidity,
        barometer: r.barometer,
        wind_speed: r.wind_speed,
        wind_gust_10m: r.wind_gust_10m,
        wind_direction: r.wind_direction.map(|d| d as u32),
        rain_incremental: r.rain_incremental,
        rain_day: r.rain_day,
        rain_month: r.rain_month,
        rain_year: r.rain_year,
        snow_depth_mm: None,
        indoor_temperature: r.indoor_temperature,
        indoor_humidity: r.indoor_humidity,
        solar_radiation: r.solar_radiation,
        uv_index: r.uv_index,
        wind_chill: r.wind_chill,
        heat_index: r.heat_index,
    }
}

fn bucket_to_proto(b: &BucketReading, base_distance: f64) -> WeatherReading {
    WeatherReading {
        timestamp: Some(to_timestamp(b.bucket)),
        station_name: b.station_name.clone(),
        outside_temperature: b.out_temp_avg,
        outside_humidity: b.out_humidity_avg,
        barometer: b.barometer_avg,
        wind_speed: b.wind_speed_avg,
        wind_gust_10m: b.wind_gust_max,
        wind_direction: b.wind_direction_avg.map(|d| d.round() as u32),
        rain_incremental: b.rain_incremental_sum,
        rain_day: b.rain_day,
        rain_month: None,
        rain_year: None,
        snow_depth_mm: b.snow_depth_mm(base_distance),
        indoor_temperature: None,
        indoor_humidity: None,
        solar_radiation: b.solar_radiation_avg,
        uv_index: b.uv_index_avg,
        wind_chill: None,
        heat_index: None,
    }
}

/// Serves the `Weather` service (plus reflection) on `listen_address:port`
/// until `cancel` fires. TLS is enabled when both a cert and key path are
/// configured.
pub async fn serve(
    sink: Arc<RpcSink>,
    listen_address: &str,
    port: u16,
    tls: Option<(std::path::PathBuf, std::path::PathBuf)>,
    cancel: CancellationToken,
) -> Result<(), ConnectionError> {
    let addr = format!("{listen_address}:{port}")
        .parse()
        .map_err(|e: std::net::AddrParseError| {
            ConnectionError::HandshakeFailed(listen_address.to_string(), e.to_string())
        })?;

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(crate::proto::WEATHER_DESCRIPTOR_SET)
        .build_v1()
        .map_err(|e| ConnectionError::HandshakeFailed("reflection".into(), e.to_string()))?;

    let mut builder = Server::builder();
    if let Some((cert_path, key_path)) = tls {
        let cert = tokio::fs::read(&cert_path)
            .await
            .map_err(|e| ConnectionError::Unreachable { target: format!("{cert_path:?}"), source: e })?;
        let key = tokio::fs::read(&key_path)
            .await
            .map_err(|e| ConnectionError::Unreachable { target: format!("{key_path:?}"), source: e })?;
        builder = builder
            .tls_config(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))
            .map_err(|e| ConnectionError::HandshakeFailed("tls".into(), e.to_string()))?;
    }

    builder
        .add_service(WeatherServer::new(sink))
        .add_service(reflection)
        .serve_with_shutdown(addr, async move { cancel.cancelled().await })
        .await
        .map_err(|e| ConnectionError::HandshakeFailed(listen_address.to_string(), e.to_string()))
}
