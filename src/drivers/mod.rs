//! Device driver layer: one task per configured device, each running
//! its own protocol state machine and feeding the distributor's
//! intake. The set of drivers is closed and enumerable — dispatch is a
//! plain match on `DeviceType`, no reflection or plugin loading
//! (spec.md §9).

pub mod ambient;
pub mod campbell;
pub mod davis;
pub mod snowgauge;

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::DeviceConfig;
use crate::error::ConnectionError;
use crate::reading::Reading;

/// Connection lifecycle shared by every network/serial driver variant
/// (spec.md §4.2's state diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Disconnected,
    Connected,
    Streaming,
    Backoff,
    Shutdown,
}

/// Exponential backoff capped at 30s, shared by every reconnecting
/// driver.
pub struct Backoff {
    attempt: u32,
    cap: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            cap: Duration::from_secs(30),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = Duration::from_millis(500 * 2u64.saturating_pow(self.attempt));
        self.attempt = self.attempt.saturating_add(1);
        base.min(self.cap)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Common contract implemented by every driver variant.
#[async_trait::async_trait]
pub trait DeviceDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Non-blocking: spawns the driver's own background work and
    /// returns once the initial connection attempt is under way.
    async fn start(
        self: Box<Self>,
        intake: mpsc::Sender<Reading>,
        cancel: CancellationToken,
    ) -> Result<(), ConnectionError>;
}

/// Sends `reading` to the distributor's intake with a short timeout;
/// drivers never block on the intake beyond this — if the distributor
/// isn't draining, the reading is dropped with a debug log and a
/// counter bump (spec.md §4.2).
pub async fn submit_reading(
    intake: &mpsc::Sender<Reading>,
    reading: Reading,
    dropped: &std::sync::atomic::AtomicU64,
) {
    match tokio::time::timeout(Duration::from_millis(200), intake.send(reading)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            tracing::debug!("distributor intake closed, dropping reading");
        }
        Err(_) => {
            dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            tracing::debug!("distributor intake busy, dropping reading");
        }
    }
}

/// Builds the driver for a configured device. Constructing from
/// `device.device_type` keeps this a closed, enumerable match rather
/// than an open plugin registry.
pub fn build_driver(device: &DeviceConfig) -> Box<dyn DeviceDriver> {
    use crate::config::DeviceType;
    match device.device_type {
        DeviceType::Davis => Box::new(davis::DavisDriver::new(device.clone())),
        DeviceType::CampbellScientific => Box::new(campbell::CampbellDriver::new(device.clone())),
        DeviceType::AmbientCustomized => Box::new(ambient::AmbientDriver::new(device.clone())),
        DeviceType::SnowGauge => Box::new(snowgauge::SnowGaugeDriver::new(device.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped_at_30s() {
        let mut b = Backoff::new();
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            last = b.next_delay();
        }
        assert_eq!(last, Duration::from_secs(30));
    }

    #[test]
    fn backoff_resets_to_initial_delay() {
        let mut b = Backoff::new();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(500));
    }
}
