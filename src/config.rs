//! Configuration contract.
//!
//! The core treats configuration as an opaque [`ConfigProvider`]: load a
//! snapshot, optionally push a new controller row, close. The concrete
//! provider shipped here reads a JSON file (a stand-in for whatever
//! operator-facing config store a full deployment would use) and wraps
//! it in a 30-second-TTL cache, per spec.md §6.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Davis,
    CampbellScientific,
    AmbientCustomized,
    SnowGauge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolarSiteParams {
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub serial_device: Option<String>,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default)]
    pub wind_dir_correction: i32,
    #[serde(default)]
    pub base_snow_distance: f64,
    pub solar: Option<SolarSiteParams>,
}

fn default_baud() -> u32 {
    9600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    TimeSeries {
        name: String,
        connection_string: String,
    },
    Rpc {
        name: String,
        listen_address: String,
        port: u16,
        tls_cert_path: Option<PathBuf>,
        tls_key_path: Option<PathBuf>,
        default_pull_from_device: Option<String>,
    },
    Upload {
        name: String,
        variant: UploadVariant,
        endpoint: Option<String>,
        station_id: String,
        password: String,
        interval_seconds: u64,
        pull_from_device: String,
    },
    /// On-demand forecast fetch, not a ticking uploader (spec.md §4.6).
    Forecast {
        name: String,
        client_id: String,
        client_secret: String,
        endpoint: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadVariant {
    WeatherUnderground,
    PwsWeather,
    Aprs,
}

impl SinkConfig {
    pub fn name(&self) -> &str {
        match self {
            SinkConfig::TimeSeries { name, .. } => name,
            SinkConfig::Rpc { name, .. } => name,
            SinkConfig::Upload { name, .. } => name,
            SinkConfig::Forecast { name, .. } => name,
        }
    }

    fn pull_from_device(&self) -> Option<&str> {
        match self {
            SinkConfig::TimeSeries { .. } => None,
            SinkConfig::Forecast { .. } => None,
            SinkConfig::Rpc {
                default_pull_from_device,
                ..
            } => default_pull_from_device.as_deref(),
            SinkConfig::Upload {
                pull_from_device, ..
            } => Some(pull_from_device.as_str()),
        }
    }
}

/// A fully validated configuration snapshot. Construction is the only
/// place device-name uniqueness and pull-from-device resolution are
/// checked — once built, a snapshot is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub devices: Vec<DeviceConfig>,
    pub sinks: Vec<SinkConfig>,
}

impl ConfigSnapshot {
    pub fn validate(self) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for d in &self.devices {
            if !seen.insert(d.name.clone()) {
                return Err(ConfigError::DuplicateDeviceName(d.name.clone()));
            }
        }
        for s in &self.sinks {
            if let Some(pull_from) = s.pull_from_device() {
                if !seen.contains(pull_from) {
                    return Err(ConfigError::UnresolvedPullFromDevice {
                        sink: s.name().to_string(),
                        device: pull_from.to_string(),
                    });
                }
            }
        }
        Ok(self)
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }
}

/// Opaque configuration source. A real deployment might back this with
/// a database or a remote config service; the core only ever calls
/// these three methods.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn load(&self) -> Result<ConfigSnapshot, ConfigError>;
    /// Persists a newly discovered controller (sink) definition. Out of
    /// scope for the bundled JSON provider beyond a no-op acknowledging
    /// the call — see spec.md §9's hot-reload Open Question.
    async fn add_controller(&self, sink: SinkConfig) -> Result<(), ConfigError>;
    async fn close(&self) -> Result<(), ConfigError>;
}

/// Reads `ConfigSnapshot` from a JSON file on disk.
pub struct JsonFileConfigProvider {
    path: PathBuf,
}

impl JsonFileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigProvider for JsonFileConfigProvider {
    async fn load(&self) -> Result<ConfigSnapshot, ConfigError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let snapshot: ConfigSnapshot = serde_json::from_str(&content)?;
        snapshot.validate()
    }

    async fn add_controller(&self, _sink: SinkConfig) -> Result<(), ConfigError> {
        tracing::warn!("add_controller is a no-op on JsonFileConfigProvider; restart required");
        Ok(())
    }

    async fn close(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

struct CacheEntry {
    snapshot: ConfigSnapshot,
    loaded_at: Instant,
}

/// Wraps any [`ConfigProvider`] with a 30-second TTL cache, so that the
/// distributor, drivers and sinks — which each ask for the snapshot on
/// their own schedule — don't all hammer the underlying store.
pub struct CachedConfigProvider {
    inner: Arc<dyn ConfigProvider>,
    ttl: Duration,
    cache: RwLock<Option<CacheEntry>>,
}

impl CachedConfigProvider {
    pub fn new(inner: Arc<dyn ConfigProvider>) -> Self {
        Self::with_ttl(inner, Duration::from_secs(30))
    }

    pub fn with_ttl(inner: Arc<dyn ConfigProvider>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: RwLock::new(None),
        }
    }
}

#[async_trait]
impl ConfigProvider for CachedConfigProvider {
    async fn load(&self) -> Result<ConfigSnapshot, ConfigError> {
        {
            let guard = self.cache.read().await;
            if let Some(entry) = guard.as_ref() {
                if entry.loaded_at.elapsed() < self.ttl {
                    return Ok(entry.snapshot.clone());
                }
            }
        }
        let snapshot = self.inner.load().await?;
        let mut guard = self.cache.write().await;
        *guard = Some(CacheEntry {
            snapshot: snapshot.clone(),
            loaded_at: Instant::now(),
        });
        Ok(snapshot)
    }

    async fn add_controller(&self, sink: SinkConfig) -> Result<(), ConfigError> {
        self.inner.add_controller(sink).await?;
        // Invalidate so the next load picks up the change rather than
        // waiting out the TTL.
        *self.cache.write().await = None;
        Ok(())
    }

    async fn close(&self) -> Result<(), ConfigError> {
        self.inner.close().await
    }
}

/// Seeds the bootstrap SQLite file with one management-API controller
/// row carrying a fresh UUID auth token, if the file doesn't already
/// exist. Printed once so the operator can pick it up. Management-API
/// serving itself is out of scope here (spec.md §1) — this only owns
/// the persisted-state bootstrap described in spec.md §6.
pub fn bootstrap_management_state(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        return Ok(());
    }
    let conn = rusqlite::Connection::open(path)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS controllers (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            listen_address TEXT NOT NULL,
            auth_token TEXT NOT NULL
        );",
    )?;
    let token = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO controllers (id, kind, listen_address, auth_token) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            uuid::Uuid::new_v4().to_string(),
            "management_api",
            "localhost:8081",
            token,
        ],
    )?;
    tracing::info!(%token, "bootstrapped management API controller on localhost:8081");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> ConfigSnapshot {
        ConfigSnapshot {
            devices: vec![DeviceConfig {
                name: "station-a".into(),
                device_type: DeviceType::Davis,
                hostname: Some("10.0.0.5".into()),
                port: Some(22222),
                serial_device: None,
                baud: 9600,
                wind_dir_correction: 0,
                base_snow_distance: 3000.0,
                solar: None,
            }],
            sinks: vec![],
        }
    }

    #[test]
    fn validate_accepts_unique_device_names() {
        assert!(sample_snapshot().validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_device_names() {
        let mut snap = sample_snapshot();
        let dup = snap.devices[0].clone();
        snap.devices.push(dup);
        assert!(matches!(
            snap.validate(),
            Err(ConfigError::DuplicateDeviceName(_))
        ));
    }

    #[test]
    fn validate_rejects_unresolved_pull_from_device() {
        let mut snap = sample_snapshot();
        snap.sinks.push(SinkConfig::Upload {
            name: "wu".into(),
            variant: UploadVariant::WeatherUnderground,
            endpoint: None,
            station_id: "X".into(),
            password: "Y".into(),
            interval_seconds: 60,
            pull_from_device: "does-not-exist".into(),
        });
        assert!(matches!(
            snap.validate(),
            Err(ConfigError::UnresolvedPullFromDevice { .. })
        ));
    }

    #[tokio::test]
    async fn json_file_provider_round_trips_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let snap = sample_snapshot();
        tokio::fs::write(&path, serde_json::to_string(&snap).unwrap())
            .await
            .unwrap();

        let provider = JsonFileConfigProvider::new(&path);
        let loaded = provider.load().await.unwrap();
        assert_eq!(loaded.devices.len(), 1);
        assert_eq!(loaded.devices[0].name, "station-a");
    }

    #[tokio::test]
    async fn cached_provider_serves_stale_snapshot_within_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, serde_json::to_string(&sample_snapshot()).unwrap())
            .await
            .unwrap();

        let inner = Arc::new(JsonFileConfigProvider::new(&path));
        let cached = CachedConfigProvider::with_ttl(inner, Duration::from_secs(60));

        let first = cached.load().await.unwrap();
        tokio::fs::write(&path, "{\"devices\":[],\"sinks\":[]}")
            .await
            .unwrap();
        let second = cached.load().await.unwrap();

        assert_eq!(first.devices.len(), second.devices.len());
    }
}
