//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes the counters and gauges the transfer bridge updates on its hot path.

use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

/// Final state a transfer was resolved with, used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The engine reported a response.
    Succeeded,
    /// The engine reported a per-transfer failure.
    Failed,
    /// The transfer was cancelled before completion.
    Cancelled,
    /// The engine rejected or lost the transfer.
    Faulted,
    /// The bridge shut down before the transfer reached the engine.
    Closed,
}

impl ResolveOutcome {
    /// Label value recorded for this outcome.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Faulted => "faulted",
            Self::Closed => "closed",
        }
    }
}

/// Prometheus-backed metrics registry shared across the bridge and its callers.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    transfers_submitted_total: IntCounter,
    transfers_resolved_total: IntCounterVec,
    transfers_in_flight: IntGauge,
    sockets_watched: IntGauge,
    engine_actions_total: IntCounterVec,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Transfers accepted by the bridge.
    pub transfers_submitted_total: u64,
    /// Transfers resolved with a response.
    pub transfers_succeeded_total: u64,
    /// Transfers resolved with anything other than a response.
    pub transfers_unsuccessful_total: u64,
    /// Transfers currently owned by the engine.
    pub transfers_in_flight: i64,
    /// Sockets currently registered with the reactor.
    pub sockets_watched: i64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let transfers_submitted_total = IntCounter::with_opts(Opts::new(
            "transfers_submitted_total",
            "Transfers accepted by the bridge",
        ))?;
        let transfers_resolved_total = IntCounterVec::new(
            Opts::new("transfers_resolved_total", "Transfers resolved by outcome"),
            &["outcome"],
        )?;
        let transfers_in_flight = IntGauge::with_opts(Opts::new(
            "transfers_in_flight",
            "Transfers currently owned by the engine",
        ))?;
        let sockets_watched = IntGauge::with_opts(Opts::new(
            "sockets_watched",
            "Engine sockets registered with the reactor",
        ))?;
        let engine_actions_total = IntCounterVec::new(
            Opts::new(
                "engine_actions_total",
                "Engine notifications issued by stimulus kind",
            ),
            &["kind"],
        )?;

        registry.register(Box::new(transfers_submitted_total.clone()))?;
        registry.register(Box::new(transfers_resolved_total.clone()))?;
        registry.register(Box::new(transfers_in_flight.clone()))?;
        registry.register(Box::new(sockets_watched.clone()))?;
        registry.register(Box::new(engine_actions_total.clone()))?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                transfers_submitted_total,
                transfers_resolved_total,
                transfers_in_flight,
                sockets_watched,
                engine_actions_total,
            }),
        })
    }

    /// Increment the accepted transfer counter.
    pub fn inc_submitted(&self) {
        self.inner.transfers_submitted_total.inc();
    }

    /// Increment the resolved transfer counter for `outcome`.
    pub fn inc_resolved(&self, outcome: ResolveOutcome) {
        self.inner
            .transfers_resolved_total
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    /// Set the in-flight transfer gauge.
    pub fn set_in_flight(&self, count: usize) {
        self.inner.transfers_in_flight.set(saturating_i64(count));
    }

    /// Set the watched socket gauge.
    pub fn set_sockets_watched(&self, count: usize) {
        self.inner.sockets_watched.set(saturating_i64(count));
    }

    /// Increment the engine notification counter (`socket` or `timeout`).
    pub fn inc_engine_action(&self, kind: &str) {
        self.inner
            .engine_actions_total
            .with_label_values(&[kind])
            .inc();
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("failed to encode Prometheus metrics")?;
        String::from_utf8(buffer).context("metrics output was not valid UTF-8")
    }

    /// Take a point-in-time snapshot of the most relevant gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let resolved = |outcome: ResolveOutcome| {
            self.inner
                .transfers_resolved_total
                .with_label_values(&[outcome.as_str()])
                .get()
        };
        let unsuccessful = [
            ResolveOutcome::Failed,
            ResolveOutcome::Cancelled,
            ResolveOutcome::Faulted,
            ResolveOutcome::Closed,
        ]
        .into_iter()
        .map(resolved)
        .sum();

        MetricsSnapshot {
            transfers_submitted_total: self.inner.transfers_submitted_total.get(),
            transfers_succeeded_total: resolved(ResolveOutcome::Succeeded),
            transfers_unsuccessful_total: unsuccessful,
            transfers_in_flight: self.inner.transfers_in_flight.get(),
            sockets_watched: self.inner.sockets_watched.get(),
        }
    }
}

fn saturating_i64(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_snapshot_reflects_updates() -> Result<()> {
        let metrics = Metrics::new()?;
        metrics.inc_submitted();
        metrics.inc_submitted();
        metrics.inc_submitted();
        metrics.inc_resolved(ResolveOutcome::Succeeded);
        metrics.inc_resolved(ResolveOutcome::Cancelled);
        metrics.set_in_flight(1);
        metrics.set_sockets_watched(2);
        metrics.inc_engine_action("socket");
        metrics.inc_engine_action("timeout");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.transfers_submitted_total, 3);
        assert_eq!(snapshot.transfers_succeeded_total, 1);
        assert_eq!(snapshot.transfers_unsuccessful_total, 1);
        assert_eq!(snapshot.transfers_in_flight, 1);
        assert_eq!(snapshot.sockets_watched, 2);

        let rendered = metrics.render()?;
        assert!(rendered.contains("transfers_submitted_total 3"));
        assert!(rendered.contains(r#"transfers_resolved_total{outcome="cancelled"} 1"#));
        assert!(rendered.contains(r#"engine_actions_total{kind="timeout"} 1"#));
        Ok(())
    }

    #[test]
    fn gauges_saturate_instead_of_wrapping() {
        assert_eq!(saturating_i64(usize::MAX), i64::MAX);
        assert_eq!(saturating_i64(7), 7);
    }

    #[test]
    fn snapshot_serialises_to_json() -> Result<()> {
        let metrics = Metrics::new()?;
        metrics.inc_resolved(ResolveOutcome::Faulted);
        let value = serde_json::to_value(metrics.snapshot())?;
        assert_eq!(value["transfers_unsuccessful_total"], 1);
        Ok(())
    }
}
