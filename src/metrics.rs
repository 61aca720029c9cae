use once_cell::sync::Lazy;
use prometheus::{HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

/// Process-wide metrics registry. Scraping it (e.g. wiring `/metrics` into the
/// HTTP bridge) is left to the deployment; this module only defines and
/// updates the series.
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("dreamqueue_queue_depth", "Queued jobs per priority lane"),
        &["priority"],
    )
    .expect("metric construction is static and infallible");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("metric registered exactly once at startup");
    gauge
});

pub static JOBS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("dreamqueue_jobs_total", "Jobs reaching a terminal state"),
        &["outcome", "job_type"],
    )
    .expect("metric construction is static and infallible");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registered exactly once at startup");
    counter
});

pub static WORKER_BUSY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "dreamqueue_worker_busy_seconds",
            "Wall-clock time the worker thread spent executing a job",
        ),
        &["job_type"],
    )
    .expect("metric construction is static and infallible");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("metric registered exactly once at startup");
    histogram
});

pub static WORKERS_LOADED: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("dreamqueue_models_loaded", "Models currently resident in VRAM")
        .expect("metric construction is static and infallible");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("metric registered exactly once at startup");
    gauge
});

/// Renders the registry in the Prometheus text exposition format.
pub fn encode() -> Vec<u8> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    encoder
        .encode(&metric_families, &mut buf)
        .expect("text encoding of gathered metrics cannot fail");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_includes_registered_series_names() {
        QUEUE_DEPTH.with_label_values(&["urgent"]).set(3);
        JOBS_TOTAL.with_label_values(&["done", "generate"]).inc();
        let text = String::from_utf8(encode()).unwrap();
        assert!(text.contains("dreamqueue_queue_depth"));
        assert!(text.contains("dreamqueue_jobs_total"));
    }
}
