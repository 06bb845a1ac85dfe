//! Per-connection statistics.
//!
//! Counters are updated for every completed operation; latency is only
//! recorded for operations the sampler selected. Latencies go into an
//! HdrHistogram with microsecond resolution so percentile queries stay
//! cheap and memory stays fixed regardless of run length.

use crate::protocols::Outcome;
use crate::runtime::OpKind;
use hdrhistogram::Histogram;
use std::time::Duration;
use tracing::warn;

/// Highest trackable latency in microseconds (one hour).
const MAX_LATENCY_US: u64 = 3_600_000_000;

const SIGNIFICANT_FIGURES: u8 = 3;

/// Receiver of completed operations.
pub trait StatsSink {
    /// Called once per completed operation.
    fn log_completion(&mut self, kind: OpKind, outcome: &Outcome);

    /// Called for completed operations selected for sampling.
    fn log_latency(&mut self, kind: OpKind, latency: Duration);
}

/// Latency histogram with microsecond resolution.
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    histogram: Histogram<u64>,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        // Constant bounds; construction only fails for invalid bounds.
        let histogram = Histogram::new_with_bounds(1, MAX_LATENCY_US, SIGNIFICANT_FIGURES)
            .expect("valid histogram bounds");
        Self { histogram }
    }
}

impl LatencyHistogram {
    /// Record one latency; values past one hour are clamped.
    pub fn record(&mut self, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.histogram.saturating_record(us);
    }

    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    pub fn mean(&self) -> Duration {
        if self.is_empty() {
            return Duration::ZERO;
        }
        Duration::from_nanos((self.histogram.mean() * 1000.0).round() as u64)
    }

    /// Latency at quantile `q` (0.0 - 1.0).
    pub fn value_at_quantile(&self, q: f64) -> Duration {
        Duration::from_micros(self.histogram.value_at_quantile(q))
    }

    pub fn accumulate(&mut self, other: &LatencyHistogram) {
        if let Err(e) = self.histogram.add(&other.histogram) {
            warn!(error = ?e, samples = other.len(), "dropping latency samples");
        }
    }
}

/// Counters and latency histograms for one connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Measured operations issued (warm-up writes excluded).
    pub issued: u64,
    pub gets: u64,
    pub sets: u64,
    pub get_misses: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Issue slots dropped to catch up with the schedule.
    pub skips: u64,
    pub resets: u64,
    /// Outstanding operations discarded by resets.
    pub dropped: u64,
    pub server_errors: u64,
    pub http_errors: u64,
    pub get_latency: LatencyHistogram,
    pub set_latency: LatencyHistogram,
}

impl ConnectionStats {
    /// Operations finalized by the read machine.
    pub fn completed(&self) -> u64 {
        self.gets + self.sets
    }

    pub fn accumulate(&mut self, other: &ConnectionStats) {
        self.issued += other.issued;
        self.gets += other.gets;
        self.sets += other.sets;
        self.get_misses += other.get_misses;
        self.rx_bytes += other.rx_bytes;
        self.tx_bytes += other.tx_bytes;
        self.skips += other.skips;
        self.resets += other.resets;
        self.dropped += other.dropped;
        self.server_errors += other.server_errors;
        self.http_errors += other.http_errors;
        self.get_latency.accumulate(&other.get_latency);
        self.set_latency.accumulate(&other.set_latency);
    }
}

impl StatsSink for ConnectionStats {
    fn log_completion(&mut self, kind: OpKind, outcome: &Outcome) {
        match kind {
            OpKind::Get => self.gets += 1,
            OpKind::Post => self.sets += 1,
        }

        match outcome {
            Outcome::Miss => self.get_misses += 1,
            Outcome::ServerError => self.server_errors += 1,
            Outcome::Http { status } if status.is_client_error() || status.is_server_error() => {
                self.http_errors += 1
            }
            _ => {}
        }
    }

    fn log_latency(&mut self, kind: OpKind, latency: Duration) {
        match kind {
            OpKind::Get => self.get_latency.record(latency),
            OpKind::Post => self.set_latency.record(latency),
        }
    }
}
