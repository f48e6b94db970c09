use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Process-wide relay counters.
pub struct RelayMetrics {
    registry: Registry,
    requests_total: IntCounter,
    rejected_requests_total: IntCounter,
    upstream_responses_total: IntCounterVec,
    upstream_failures_total: IntCounterVec,
    failovers_total: IntCounter,
    exhausted_total: IntCounter,
}

impl RelayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounter::with_opts(Opts::new(
            "dohrelay_requests_total",
            "Total number of DoH requests received",
        ))?;
        let rejected_requests_total = IntCounter::with_opts(Opts::new(
            "dohrelay_rejected_requests_total",
            "Requests rejected before any upstream call (bad request or method)",
        ))?;
        let upstream_responses_total = IntCounterVec::new(
            Opts::new(
                "dohrelay_upstream_responses_total",
                "Responses relayed to clients, by answering provider",
            ),
            &["provider"],
        )?;
        let upstream_failures_total = IntCounterVec::new(
            Opts::new(
                "dohrelay_upstream_failures_total",
                "Upstream attempts that failed, by provider and failure kind",
            ),
            &["provider", "kind"],
        )?;
        let failovers_total = IntCounter::with_opts(Opts::new(
            "dohrelay_failovers_total",
            "Requests that entered sequential failover",
        ))?;
        let exhausted_total = IntCounter::with_opts(Opts::new(
            "dohrelay_exhausted_total",
            "Requests answered with 503 after every provider failed",
        ))?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(rejected_requests_total.clone()))?;
        registry.register(Box::new(upstream_responses_total.clone()))?;
        registry.register(Box::new(upstream_failures_total.clone()))?;
        registry.register(Box::new(failovers_total.clone()))?;
        registry.register(Box::new(exhausted_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            rejected_requests_total,
            upstream_responses_total,
            upstream_failures_total,
            failovers_total,
            exhausted_total,
        })
    }

    pub fn inc_request(&self) {
        self.requests_total.inc();
    }

    pub fn inc_rejected(&self) {
        self.rejected_requests_total.inc();
    }

    pub fn inc_upstream_response(&self, provider: &str) {
        self.upstream_responses_total
            .with_label_values(&[provider])
            .inc();
    }

    pub fn inc_upstream_failure(&self, provider: &str, kind: &str) {
        self.upstream_failures_total
            .with_label_values(&[provider, kind])
            .inc();
    }

    pub fn inc_failover(&self) {
        self.failovers_total.inc();
    }

    pub fn inc_exhausted(&self) {
        self.exhausted_total.inc();
    }

    pub fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_labelled_counters() {
        let metrics = RelayMetrics::new().expect("metrics");
        metrics.inc_request();
        metrics.inc_upstream_response("cloudflare");
        metrics.inc_upstream_failure("google", "timeout");
        metrics.inc_failover();

        let text = String::from_utf8(metrics.render().expect("render")).expect("utf8");
        assert!(text.contains("dohrelay_requests_total 1"));
        assert!(text.contains("dohrelay_upstream_responses_total{provider=\"cloudflare\"} 1"));
        assert!(
            text.contains("dohrelay_upstream_failures_total{kind=\"timeout\",provider=\"google\"} 1")
        );
        assert!(text.contains("dohrelay_failovers_total 1"));
    }
}
