use std::sync::atomic::Ordering;
use std::sync::Mutex;

use portable_atomic::AtomicU64;

use crate::digest::TDigest;

/// Per-endpoint transfer counters.
///
/// Counters only ever accumulate; the gatherer diffs successive snapshots
/// to produce interval values. The latency digest is interval-scoped and
/// reset at every gather.
#[derive(Default, Debug)]
pub struct EndpointStats {
    payloads_transferred: AtomicU64,
    payloads_dropped: AtomicU64,
    payloads_late: AtomicU64,
    bytes_transferred: AtomicU64,
    disconnections: AtomicU64,
    probe_retries: AtomicU64,
    latency_digest: Mutex<TDigest>,
}

/// Point-in-time copy of every counter.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub payloads_transferred: u64,
    pub payloads_dropped: u64,
    pub payloads_late: u64,
    pub bytes_transferred: u64,
    pub disconnections: u64,
    pub probe_retries: u64,
}

impl StatsSnapshot {
    pub fn delta(&self, prior: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            payloads_transferred: self.payloads_transferred - prior.payloads_transferred,
            payloads_dropped: self.payloads_dropped - prior.payloads_dropped,
            payloads_late: self.payloads_late - prior.payloads_late,
            bytes_transferred: self.bytes_transferred - prior.bytes_transferred,
            disconnections: self.disconnections - prior.disconnections,
            probe_retries: self.probe_retries - prior.probe_retries,
        }
    }
}

impl EndpointStats {
    pub fn new() -> Self {
        EndpointStats::default()
    }

    /// Applies the per-payload update rule: success or drop, lateness
    /// against the payload's latency budget, bytes, and a digest sample.
    pub fn record_payload(
        &self,
        success: bool,
        elapsed_microsecs: u64,
        max_latency_microsecs: u64,
        bytes_transferred: u64,
    ) {
        if success {
            self.payloads_transferred.fetch_add(1, Ordering::SeqCst);
        } else {
            self.payloads_dropped.fetch_add(1, Ordering::SeqCst);
        }
        if max_latency_microsecs > 0 && elapsed_microsecs > max_latency_microsecs {
            self.payloads_late.fetch_add(1, Ordering::SeqCst);
        }
        self.bytes_transferred
            .fetch_add(bytes_transferred, Ordering::SeqCst);

        if let Ok(mut digest) = self.latency_digest.lock() {
            digest.add(elapsed_microsecs as f64);
        }
    }

    pub fn inc_disconnections(&self) {
        self.disconnections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn inc_probe_retries(&self) {
        self.probe_retries.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            payloads_transferred: self.payloads_transferred.load(Ordering::SeqCst),
            payloads_dropped: self.payloads_dropped.load(Ordering::SeqCst),
            payloads_late: self.payloads_late.load(Ordering::SeqCst),
            bytes_transferred: self.bytes_transferred.load(Ordering::SeqCst),
            disconnections: self.disconnections.load(Ordering::SeqCst),
            probe_retries: self.probe_retries.load(Ordering::SeqCst),
        }
    }

    /// Extracts the interval percentiles and starts a fresh interval.
    pub fn take_latency_percentiles(&self) -> LatencyPercentiles {
        let mut digest = match self.latency_digest.lock() {
            Ok(digest) => digest,
            Err(poisoned) => poisoned.into_inner(),
        };
        let percentiles = LatencyPercentiles {
            p50_microsecs: digest.percentile(50.0).map(|v| v as u64),
            p90_microsecs: digest.percentile(90.0).map(|v| v as u64),
            p99_microsecs: digest.percentile(99.0).map(|v| v as u64),
        };
        digest.reset();
        percentiles
    }
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct LatencyPercentiles {
    pub p50_microsecs: Option<u64>,
    pub p90_microsecs: Option<u64>,
    pub p99_microsecs: Option<u64>,
}
