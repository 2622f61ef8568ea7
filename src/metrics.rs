//! Prometheus metrics for the background fabric.

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::services::circuit_breaker::CircuitState;

pub struct MetricsCollector {
    registry: Registry,
    work_items_total: IntCounterVec,
    downloads_total: IntCounterVec,
    token_refresh_total: IntCounterVec,
    circuit_breaker_state: IntGaugeVec,
}

impl MetricsCollector {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let work_items_total = IntCounterVec::new(
            Opts::new("work_items_total", "Work items settled, by type and outcome")
                .namespace("library"),
            &["job_type", "outcome"],
        )?;
        let downloads_total = IntCounterVec::new(
            Opts::new("downloads_total", "Download lifecycle events").namespace("library"),
            &["outcome"],
        )?;
        let token_refresh_total = IntCounterVec::new(
            Opts::new("token_refresh_total", "Token refresh attempts by outcome")
                .namespace("library"),
            &["outcome"],
        )?;
        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Breaker state (0=closed, 1=open, 2=half_open)",
            )
            .namespace("library"),
            &["breaker"],
        )?;

        registry.register(Box::new(work_items_total.clone()))?;
        registry.register(Box::new(downloads_total.clone()))?;
        registry.register(Box::new(token_refresh_total.clone()))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        Ok(Self {
            registry,
            work_items_total,
            downloads_total,
            token_refresh_total,
            circuit_breaker_state,
        })
    }

    pub fn record_work_item(&self, job_type: &str, outcome: &str) {
        self.work_items_total
            .with_label_values(&[job_type, outcome])
            .inc();
    }

    pub fn record_download(&self, outcome: &str) {
        self.downloads_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_token_refresh(&self, outcome: &str) {
        self.token_refresh_total.with_label_values(&[outcome]).inc();
    }

    pub fn set_breaker_state(&self, breaker: &str, state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        };
        self.circuit_breaker_state
            .with_label_values(&[breaker])
            .set(value);
    }

    /// Render the registry in the Prometheus text exposition format
    pub fn gather(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_records_and_renders() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_work_item("artist_sync", "completed");
        metrics.record_download("failed");
        metrics.record_token_refresh("refreshed");
        metrics.set_breaker_state("slskd", CircuitState::Open);

        let rendered = metrics.gather();
        assert!(rendered.contains("library_work_items_total"));
        assert!(rendered.contains("library_circuit_breaker_state"));
    }
}
