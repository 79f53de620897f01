//! The reading distributor: a single fan-in hub that guarantees a
//! measurement delivered by any device reaches every enabled sink
//! without one slow sink blocking another (spec.md §4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::reading::Reading;

pub const DEFAULT_SINK_CHANNEL_CAPACITY: usize = 128;

/// Per-sink drop counter, readable by the health monitor without
/// touching the sink itself.
#[derive(Default)]
pub struct DropCounters {
    counts: std::sync::RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl DropCounters {
    fn counter_for(&self, sink: &str) -> Arc<AtomicU64> {
        if let Some(c) = self.counts.read().unwrap().get(sink) {
            return c.clone();
        }
        let mut guard = self.counts.write().unwrap();
        guard
            .entry(sink.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    pub fn get(&self, sink: &str) -> u64 {
        self.counts
            .read()
            .unwrap()
            .get(sink)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

struct SinkEndpoint {
    name: String,
    tx: mpsc::Sender<Reading>,
    dropped: Arc<AtomicU64>,
}

/// Owns the single intake channel and fans every reading out to every
/// registered sink channel with a non-blocking send. A full sink
/// channel only drops the reading for *that* sink — it never
/// backpressures the device layer or any other sink.
pub struct Distributor {
    intake_tx: mpsc::Sender<Reading>,
    intake_rx: Option<mpsc::Receiver<Reading>>,
    sinks: Vec<SinkEndpoint>,
    drop_counters: Arc<DropCounters>,
}

impl Distributor {
    pub fn new(intake_capacity: usize) -> Self {
        let (intake_tx, intake_rx) = mpsc::channel(intake_capacity);
        Self {
            intake_tx,
            intake_rx: Some(intake_rx),
            sinks: Vec::new(),
            drop_counters: Arc::new(DropCounters::default()),
        }
    }

    pub fn intake(&self) -> mpsc::Sender<Reading> {
        self.intake_tx.clone()
    }

    pub fn drop_counters(&self) -> Arc<DropCounters> {
        self.drop_counters.clone()
    }

    /// Registers a new downstream sink and returns the receiving end of
    /// its bounded channel.
    pub fn register_sink(&mut self, name: impl Into<String>, capacity: usize) -> mpsc::Receiver<Reading> {
        let name = name.into();
        let (tx, rx) = mpsc::channel(capacity);
        let dropped = self.drop_counters.counter_for(&name);
        self.sinks.push(SinkEndpoint { name, tx, dropped });
        rx
    }

    /// Runs the fan-out worker until `cancel` fires, then drains any
    /// remaining intake items (bounded by the channel already being
    /// closed by every driver) and drops all sink senders so their
    /// channels close.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut intake_rx = self.intake_rx.take().expect("run() called once");
        drop(self.intake_tx);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    intake_rx.close();
                    while let Ok(reading) = intake_rx.try_recv() {
                        Self::fan_out(&self.sinks, reading);
                    }
                    break;
                }
                maybe_reading = intake_rx.recv() => {
                    match maybe_reading {
                        Some(reading) => Self::fan_out(&self.sinks, reading),
                        None => break,
                    }
                }
            }
        }
        // Dropping `self.sinks` drops every sender, closing each sink's
        // channel so its task observes end-of-stream.
    }

    fn fan_out(sinks: &[SinkEndpoint], reading: Reading) {
        for sink in sinks {
            match sink.tx.try_send(reading.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sink.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(sink = %sink.name, "sink queue full, dropping reading");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(sink = %sink.name, "sink channel closed, dropping reading");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::StationType;
    use std::time::Duration;

    fn sample_reading(station: &str) -> Reading {
        Reading::new(station, StationType::DavisConsole)
    }

    #[tokio::test]
    async fn fast_sink_keeps_full_throughput_despite_slow_sibling() {
        let mut dist = Distributor::new(64);
        let intake = dist.intake();
        let mut fast_rx = dist.register_sink("fast", DEFAULT_SINK_CHANNEL_CAPACITY);
        let slow_rx = dist.register_sink("slow", 1);
        // Never drained: "slow" fills up immediately and starts dropping.
        drop(tokio::spawn(async move {
            let _keep = slow_rx;
            tokio::time::sleep(Duration::from_secs(5)).await;
        }));

        let cancel = CancellationToken::new();
        let cancel_child = cancel.clone();
        let handle = tokio::spawn(dist.run(cancel_child));

        for i in 0..50 {
            intake
                .send(sample_reading(&format!("s{i}")))
                .await
                .unwrap();
        }

        let mut received = 0;
        while tokio::time::timeout(Duration::from_millis(50), fast_rx.recv())
            .await
            .ok()
            .flatten()
            .is_some()
        {
            received += 1;
        }
        assert_eq!(received, 50, "fast sink must receive every reading");

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn per_station_order_is_preserved_to_a_single_sink() {
        let mut dist = Distributor::new(64);
        let intake = dist.intake();
        let mut rx = dist.register_sink("only", DEFAULT_SINK_CHANNEL_CAPACITY);

        let cancel = CancellationToken::new();
        let cancel_child = cancel.clone();
        let handle = tokio::spawn(dist.run(cancel_child));

        for i in 0..10 {
            let mut r = sample_reading("station-a");
            r.transmitter_battery = Some(i as u8);
            intake.send(r).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..10 {
            let r = rx.recv().await.unwrap();
            seen.push(r.transmitter_battery.unwrap());
        }
        assert_eq!(seen, (0..10).collect::<Vec<u8>>());

        cancel.cancel();
        let _ = handle.await;
    }
}
