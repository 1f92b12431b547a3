use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

pub struct MetricsCollector {
    registry: Registry,

    // Session metrics
    pub sessions_active: Gauge,
    pub connections_rejected: CounterVec,

    // Generation metrics
    pub generations_total: CounterVec,
    pub generation_duration: Histogram,
    pub stream_events: CounterVec,
    pub upstream_parse_errors: Counter,

    // Quota and hierarchy metrics
    pub quota_rejections: CounterVec,
    pub delegations: CounterVec,
    pub persistence_failures: Counter,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        // Session metrics
        let sessions_active = Gauge::new(
            "stratum_sessions_active",
            "Number of currently open execution sessions",
        )?;
        registry.register(Box::new(sessions_active.clone()))?;

        let connections_rejected = CounterVec::new(
            Opts::new(
                "stratum_connections_rejected_total",
                "Connections closed by the connection gate",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(connections_rejected.clone()))?;

        // Generation metrics
        let generations_total = CounterVec::new(
            Opts::new("stratum_generations_total", "Finished generation turns"),
            &["outcome"],
        )?;
        registry.register(Box::new(generations_total.clone()))?;

        let generation_duration = Histogram::with_opts(HistogramOpts::new(
            "stratum_generation_duration_seconds",
            "Wall time from opening a generation to its terminal event",
        ))?;
        registry.register(Box::new(generation_duration.clone()))?;

        let stream_events = CounterVec::new(
            Opts::new("stratum_stream_events_total", "Stream events relayed to clients"),
            &["kind"],
        )?;
        registry.register(Box::new(stream_events.clone()))?;

        let upstream_parse_errors = Counter::new(
            "stratum_upstream_parse_errors_total",
            "Upstream lines skipped because they could not be parsed",
        )?;
        registry.register(Box::new(upstream_parse_errors.clone()))?;

        // Quota and hierarchy metrics
        let quota_rejections = CounterVec::new(
            Opts::new("stratum_quota_rejections_total", "Messages rejected by the quota gate"),
            &["limit"],
        )?;
        registry.register(Box::new(quota_rejections.clone()))?;

        let delegations = CounterVec::new(
            Opts::new("stratum_delegations_total", "Delegation attempts"),
            &["result"],
        )?;
        registry.register(Box::new(delegations.clone()))?;

        let persistence_failures = Counter::new(
            "stratum_persistence_failures_total",
            "Turn records that could not be persisted",
        )?;
        registry.register(Box::new(persistence_failures.clone()))?;

        Ok(Self {
            registry,
            sessions_active,
            connections_rejected,
            generations_total,
            generation_duration,
            stream_events,
            upstream_parse_errors,
            quota_rejections,
            delegations,
            persistence_failures,
        })
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

pub struct MetricsHandler {
    collector: Arc<MetricsCollector>,
}

impl MetricsHandler {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self { collector }
    }

    pub async fn metrics(&self) -> String {
        self.collector.encode().unwrap_or_else(|e| {
            tracing::error!("Failed to encode metrics: {}", e);
            String::from("# Error encoding metrics\n")
        })
    }
}
