
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Duration;

use crate::endpoint::{EndpointStats, LatencyPercentiles, StatsSnapshot};

/// One gathering interval's worth of statistics for one endpoint.
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub endpoint_name: String,
    pub timestamp: SystemTime,
    pub interval: StatsSnapshot,
    pub cumulative: StatsSnapshot,
    pub latency: LatencyPercentiles,
}

/// Destination for periodic statistics reports.
#[async_trait]
pub trait MetricsSink {
    async fn emit(&self, report: StatsReport);
}

/// Fallback sink that writes reports to the log.
#[derive(Default, Debug)]
pub struct LoggingSink;

#[async_trait]
impl MetricsSink for LoggingSink {
    async fn emit(&self, report: StatsReport) {
        log::info!(
            "[{}] transferred={} dropped={} late={} bytes={} p50={:?} p90={:?} p99={:?}",
            report.endpoint_name,
            report.interval.payloads_transferred,
            report.interval.payloads_dropped,
            report.interval.payloads_late,
            report.interval.bytes_transferred,
            report.latency.p50_microsecs,
            report.latency.p90_microsecs,
            report.latency.p99_microsecs,
        );
    }
}

/// Periodically snapshots an endpoint's counters, diffs them against the
/// prior snapshot and hands the result to the sink.
pub struct StatsGatherer {
    endpoint_name: String,
    stats: Arc<EndpointStats>,
    sink: Arc<dyn MetricsSink + Send + Sync>,
    prior: StatsSnapshot,
}

impl StatsGatherer {
    pub fn new(
        endpoint_name: String,
        stats: Arc<EndpointStats>,
        sink: Arc<dyn MetricsSink + Send + Sync>,
    ) -> Self {
        StatsGatherer {
            endpoint_name,
            stats,
            sink,
            prior: StatsSnapshot::default(),
        }
    }

    /// One gathering step: snapshot, delta, percentiles, emit. The interval
    /// digest is reset as a side effect of extracting the percentiles.
    pub async fn gather(&mut self) {
        let cumulative = self.stats.snapshot();
        let interval = cumulative.delta(&self.prior);
        self.prior = cumulative;

        let report = StatsReport {
            endpoint_name: self.endpoint_name.clone(),
            timestamp: SystemTime::now(),
            interval,
            cumulative,
            latency: self.stats.take_latency_percentiles(),
        };
        self.sink.emit(report).await;
    }

    /// Drives `gather` on a fixed period until the close channel fires; a
    /// final gather on the way out flushes the partial interval.
    pub async fn run(mut self, period: Duration, mut close_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // completes immediately
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.gather().await;
                }
                _ = close_rx.recv() => {
                    self.gather().await;
                    return;
                }
            }
        }
    }
}
