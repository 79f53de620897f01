//! Sink layer: time-series storage, the streaming-RPC feed, and the
//! periodic third-party uploaders, each reachable through a shared
//! health-check contract (spec.md §4.7).

pub mod rpc;
pub mod timeseries;
pub mod upload;

use std::time::Duration;

use chrono::{DateTime, Utc};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthRecord {
    pub name: String,
    pub healthy: bool,
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Implemented by every sink that the health monitor polls. `probe`
/// does the actual work; [`check_health`](Self::check_health) wraps it
/// with the shared 5s timeout so no single slow sink can stall the
/// monitor's tick.
#[async_trait::async_trait]
pub trait HealthCheckable: Send + Sync {
    fn sink_name(&self) -> &str;
    async fn probe(&self) -> Result<(), String>;

    async fn check_health(&self) -> HealthRecord {
        let outcome = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.probe()).await;
        let (healthy, detail) = match outcome {
            Ok(Ok(())) => (true, None),
            Ok(Err(e)) => (false, Some(e)),
            Err(_) => (false, Some("health check timed out".to_string())),
        };
        HealthRecord {
            name: self.sink_name().to_string(),
            healthy,
            detail,
            checked_at: Utc::now(),
        }
    }
}
