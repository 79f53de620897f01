//! Lifecycle supervisor: owns the root cancellation token and the
//! wait barrier, and builds every component in the order spec.md §4.8
//! requires — configuration, time-series sink, RPC sink, upload sinks,
//! health monitor, device drivers — so that each layer can assume the
//! ones before it are already live.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{CachedConfigProvider, ConfigProvider, JsonFileConfigProvider, SinkConfig, UploadVariant};
use crate::distributor::{Distributor, DEFAULT_SINK_CHANNEL_CAPACITY};
use crate::drivers::build_driver;
use crate::health::{self, HealthRegistry};
use crate::sinks::rpc::RpcSink;
use crate::sinks::timeseries::TimeSeriesSink;
use crate::sinks::upload::{aeris, aprs, pwsweather, wunderground};
use crate::sinks::HealthCheckable;

pub struct Supervisor {
    pub health: Arc<HealthRegistry>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl Supervisor {
    pub async fn bootstrap(config_path: PathBuf, enable_management_api: bool) -> anyhow::Result<Self> {
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        if enable_management_api {
            crate::config::bootstrap_management_state(&PathBuf::from("management.db"))?;
        }

        let provider = CachedConfigProvider::new(Arc::new(JsonFileConfigProvider::new(config_path)));
        let snapshot = Arc::new(provider.load().await?);

        let mut distributor = Distributor::new(DEFAULT_SINK_CHANNEL_CAPACITY);

        let timeseries_cfg = snapshot.sinks.iter().find_map(|s| match s {
            SinkConfig::TimeSeries { name, connection_string } => Some((name.clone(), connection_string.clone())),
            _ => None,
        });
        let Some((ts_name, connection_string)) = timeseries_cfg else {
            anyhow::bail!("configuration must declare exactly one time-series sink");
        };
        let timeseries = Arc::new(TimeSeriesSink::connect(ts_name, &connection_string).await?);

        let ts_rx = distributor.register_sink("timeseries", DEFAULT_SINK_CHANNEL_CAPACITY);
        let ts_for_insert = timeseries.clone();
        let cancel_ts = cancel.clone();
        tasks.spawn(async move { run_timeseries_insert(ts_for_insert, ts_rx, cancel_ts).await });

        let mut health_sinks: Vec<Arc<dyn HealthCheckable>> = vec![timeseries.clone()];

        for sink_cfg in &snapshot.sinks {
            match sink_cfg {
                SinkConfig::TimeSeries { .. } => {}
                SinkConfig::Rpc { name, listen_address, port, tls_cert_path, tls_key_path, .. } => {
                    let rpc_sink = RpcSink::new(name.clone(), timeseries.clone(), snapshot.clone());
                    health_sinks.push(rpc_sink.clone());

                    let rpc_rx = distributor.register_sink(name.clone(), DEFAULT_SINK_CHANNEL_CAPACITY);
                    let cancel_ingest = cancel.clone();
                    let ingest_sink = rpc_sink.clone();
                    tasks.spawn(async move { ingest_sink.run_ingest(rpc_rx, cancel_ingest).await });

                    let tls = match (tls_cert_path, tls_key_path) {
                        (Some(c), Some(k)) => Some((c.clone(), k.clone())),
                        _ => None,
                    };
                    let listen_address = listen_address.clone();
                    let port = *port;
                    let cancel_serve = cancel.clone();
                    tasks.spawn(async move {
                        if let Err(e) = crate::sinks::rpc::serve(rpc_sink, &listen_address, port, tls, cancel_serve).await {
                            tracing::error!(error = %e, "RPC sink exited");
                        }
                    });
                }
                SinkConfig::Upload { name, variant, endpoint, station_id, password, interval_seconds, pull_from_device } => {
                    let interval = Duration::from_secs(*interval_seconds);
                    let cancel_upload = cancel.clone();
                    let ts = timeseries.clone();
                    match variant {
                        UploadVariant::WeatherUnderground => {
                            let cfg = wunderground::Config {
                                name: name.clone(),
                                endpoint: endpoint.clone(),
                                station_id: station_id.clone(),
                                password: password.clone(),
                                interval,
                                pull_from_device: pull_from_device.clone(),
                            };
                            tasks.spawn(async move { wunderground::run(cfg, ts, cancel_upload).await });
                        }
                        UploadVariant::PwsWeather => {
                            let cfg = pwsweather::Config {
                                name: name.clone(),
                                endpoint: endpoint.clone(),
                                station_id: station_id.clone(),
                                password: password.clone(),
                                interval,
                                pull_from_device: pull_from_device.clone(),
                            };
                            tasks.spawn(async move { pwsweather::run(cfg, ts, cancel_upload).await });
                        }
                        UploadVariant::Aprs => {
                            let (lat_deg, lon_deg) = snapshot
                                .device(pull_from_device)
                                .and_then(|d| d.solar.as_ref())
                                .map(|s| (s.lat, s.lon))
                                .unwrap_or((0.0, 0.0));
                            let cfg = aprs::Config {
                                name: name.clone(),
                                endpoint: endpoint.clone(),
                                callsign: station_id.clone(),
                                passcode: password.clone(),
                                interval,
                                pull_from_device: pull_from_device.clone(),
                                lat_deg,
                                lon_deg,
                            };
                            tasks.spawn(async move { aprs::run(cfg, ts, cancel_upload).await });
                        }
                    }
                }
                SinkConfig::Forecast { name, client_id, client_secret, endpoint } => {
                    // On-demand fetch client: constructed so it's ready
                    // to serve a future consumer, but nothing ticks it.
                    let _client = aeris::AerisClient::new(client_id.clone(), client_secret.clone(), endpoint.clone());
                    tracing::info!(sink = %name, "aeris forecast client ready");
                }
            }
        }

        let health_registry = HealthRegistry::new();
        let cancel_health = cancel.clone();
        let registry_for_task = health_registry.clone();
        tasks.spawn(async move {
            health::run(registry_for_task, health_sinks, health::DEFAULT_TICK_INTERVAL, cancel_health).await
        });

        for device in &snapshot.devices {
            let driver = build_driver(device);
            let intake = distributor.intake();
            let cancel_driver = cancel.clone();
            if let Err(e) = driver.start(intake, cancel_driver).await {
                tracing::error!(device = %device.name, error = %e, "driver failed to start");
            }
        }

        let cancel_dist = cancel.clone();
        tasks.spawn(async move { distributor.run(cancel_dist).await });

        Ok(Self { health: health_registry, cancel, tasks })
    }

    /// Blocks until SIGINT or SIGTERM, then cancels every component and
    /// waits for all spawned tasks to finish.
    pub async fn run_until_shutdown(mut self) -> anyhow::Result<()> {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received, cancelling all components");
        self.cancel.cancel();
        while self.tasks.join_next().await.is_some() {}
        Ok(())
    }
}

async fn run_timeseries_insert(
    sink: Arc<TimeSeriesSink>,
    mut rx: tokio::sync::mpsc::Receiver<crate::reading::Reading>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                rx.close();
                while let Ok(reading) = rx.try_recv() {
                    sink.insert(&reading).await;
                }
                return;
            }
            maybe_reading = rx.recv() => {
                match maybe_reading {
                    Some(reading) => sink.insert(&reading).await,
                    None => return,
                }
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
