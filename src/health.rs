//! Health monitor: polls every sink on a shared tick and publishes the
//! latest result under a read-write-locked map (spec.md §4.7).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::sinks::HealthCheckable;
use crate::sinks::HealthRecord;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
pub struct HealthRegistry {
    records: RwLock<HashMap<String, HealthRecord>>,
}

impl HealthRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn snapshot(&self) -> HashMap<String, HealthRecord> {
        self.records.read().await.clone()
    }

    async fn set(&self, record: HealthRecord) {
        self.records.write().await.insert(record.name.clone(), record);
    }
}

/// Ticks every `interval`, polling every sink's `check_health` (itself
/// bounded by a 5s timeout) and publishing into `registry`.
pub async fn run(
    registry: Arc<HealthRegistry>,
    sinks: Vec<Arc<dyn HealthCheckable>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                for sink in &sinks {
                    let record = sink.check_health().await;
                    if !record.healthy {
                        tracing::warn!(sink = %record.name, detail = ?record.detail, "sink unhealthy");
                    }
                    registry.set(record).await;
                }
            }
        }
    }
}
