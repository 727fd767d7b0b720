use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Metrics collector for the gateway.
///
/// Request counters, latency histograms, egress accounting, and the
/// admission-denial breakdown, exposed as Prometheus text.
pub struct MetricsCollector {
    registry: Registry,

    /// Total HTTP requests by file type, method, status
    pub http_requests_total: IntCounterVec,

    /// Request latency histogram by file type
    pub http_request_duration: HistogramVec,

    /// Bytes served by file type
    pub egress_bytes: IntCounterVec,

    /// Admission denials by reason
    pub admission_denied_total: IntCounterVec,

    /// Currently tracked live transfers
    pub active_transfers: IntGauge,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("hlsgate_http_requests_total", "Total HTTP requests"),
            &["file_type", "method", "status"],
        )?;

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new("hlsgate_http_request_duration_seconds", "Request latency")
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
            &["file_type"],
        )?;

        let egress_bytes = IntCounterVec::new(
            Opts::new("hlsgate_egress_bytes_total", "Total egress bandwidth"),
            &["file_type"],
        )?;

        let admission_denied_total = IntCounterVec::new(
            Opts::new("hlsgate_admission_denied_total", "Denied admissions"),
            &["reason"],
        )?;

        let active_transfers = IntGauge::new(
            "hlsgate_active_transfers",
            "Number of live transfers being tracked",
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;
        registry.register(Box::new(egress_bytes.clone()))?;
        registry.register(Box::new(admission_denied_total.clone()))?;
        registry.register(Box::new(active_transfers.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration,
            egress_bytes,
            admission_denied_total,
            active_transfers,
        })
    }

    /// Record a completed HTTP request.
    pub fn record_request(&self, file_type: &str, method: &str, status: u16, duration_secs: f64) {
        self.http_requests_total
            .with_label_values(&[file_type, method, &status.to_string()])
            .inc();
        self.http_request_duration
            .with_label_values(&[file_type])
            .observe(duration_secs);
    }

    pub fn record_denial(&self, reason: &str) {
        self.admission_denied_total.with_label_values(&[reason]).inc();
    }

    pub fn record_egress(&self, file_type: &str, bytes: u64) {
        self.egress_bytes.with_label_values(&[file_type]).inc_by(bytes);
    }

    /// Prometheus text exposition.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metrics = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metrics, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics collector")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_gather() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_request("m3u8", "GET", 200, 0.012);
        metrics.record_denial("replay");
        metrics.record_egress("ts", 1_048_576);
        metrics.active_transfers.set(3);

        let text = metrics.gather_text();
        assert!(text.contains("hlsgate_http_requests_total"));
        assert!(text.contains("hlsgate_admission_denied_total"));
        assert!(text.contains("hlsgate_egress_bytes_total"));
        assert!(text.contains("hlsgate_active_transfers 3"));
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        // Each collector owns its registry; two instances never clash
        let a = MetricsCollector::new();
        let b = MetricsCollector::new();
        assert!(a.is_ok());
        assert!(b.is_ok());
    }
}
