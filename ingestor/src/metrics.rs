use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "ingestor_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref DISPATCHED_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "ingestor_dispatched_total",
        "Total valid messages handed to the storage workers"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "ingestor_invalid_messages_total",
        "Total messages discarded by decoding or validation"
    ))
    .unwrap();
    pub static ref REFUSED_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "ingestor_refused_total",
        "Total valid messages refused because shutdown had begun"
    ))
    .unwrap();
    pub static ref STORED_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "ingestor_stored_total",
        "Total telemetry records committed"
    ))
    .unwrap();
    pub static ref STORE_FAILURES_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "ingestor_store_failures_total",
        "Total units of work that failed permanently"
    ))
    .unwrap();
    pub static ref DB_RETRIES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_db_retries_total",
        "Total transient database failures that were retried"
    ))
    .unwrap();
    pub static ref STORE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_store_latency_seconds",
            "Time taken to commit one unit of work"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref DISPATCH_PENDING: IntGauge = IntGauge::with_opts(Opts::new(
        "ingestor_dispatch_pending",
        "Messages dispatched but not yet stored"
    ))
    .unwrap();
    pub static ref BRIDGE_RECONNECTS_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "ingestor_bridge_reconnects_total",
        "Total MQTT connection faults followed by a reconnect attempt"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DISPATCHED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVALID_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REFUSED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_RETRIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORE_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(DISPATCH_PENDING.clone()))?;
    REGISTRY.register(Box::new(BRIDGE_RECONNECTS_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
