//! Prometheus metrics registry and metric definitions.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::cache::CacheTierStats;

/// Global registry under crate namespace
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("statstore".into()), None)
        .expect("failed to create Prometheus registry")
});

fn register<C: prometheus::core::Collector + Clone + 'static>(c: C) -> C {
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric registered twice");
    c
}

/// Statements issued, by store and operation kind
pub static QUERY_COUNTER: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("queries_total", "Total number of statements issued");
    register(IntCounterVec::new(opts, &["store", "op"]).expect("counter opts"))
});

/// Statements that failed or timed out
pub static QUERY_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("query_failures_total", "Statements that failed or timed out");
    register(IntCounterVec::new(opts, &["store"]).expect("counter opts"))
});

/// Statement latency including the wait for the store lock
pub static QUERY_HISTOGRAM: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "query_duration_seconds",
        "Duration of statement execution in seconds",
    );
    register(Histogram::with_opts(opts).expect("histogram opts"))
});

pub static CACHE_HITS: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_hits_total", "Result cache hits per tier");
    register(IntCounterVec::new(opts, &["tier"]).expect("counter opts"))
});

pub static CACHE_MISSES: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_misses_total", "Result cache misses per tier");
    register(IntCounterVec::new(opts, &["tier"]).expect("counter opts"))
});

/// Evictions by reason: `expired`, `capacity` or `invalidated`
pub static CACHE_EVICTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_evictions_total", "Result cache evictions per tier");
    register(IntCounterVec::new(opts, &["tier", "reason"]).expect("counter opts"))
});

pub static CACHE_ENTRIES: Lazy<IntGaugeVec> = Lazy::new(|| {
    let opts = Opts::new("cache_entries", "Entries currently held per tier");
    register(IntGaugeVec::new(opts, &["tier"]).expect("gauge opts"))
});

pub static CACHE_HIT_RATE: Lazy<GaugeVec> = Lazy::new(|| {
    let opts = Opts::new("cache_hit_rate", "hits / (hits + misses) per tier");
    register(GaugeVec::new(opts, &["tier"]).expect("gauge opts"))
});

/// Time spent waiting on the per-source throttle
pub static RATE_LIMIT_WAIT: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "rate_limit_wait_seconds",
        "Time spent waiting for a source's minimum delay",
    );
    register(HistogramVec::new(opts, &["source"]).expect("histogram opts"))
});

/// Total fetch attempts
pub static FETCH_COUNTER: Lazy<IntCounter> = Lazy::new(|| {
    let opts = Opts::new("fetches_total", "Total number of external fetch attempts");
    register(IntCounter::with_opts(opts).expect("counter opts"))
});

/// Histogram of fetch+decode durations
pub static FETCH_HISTOGRAM: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "fetch_duration_seconds",
        "Duration of external fetch+decode in seconds",
    );
    register(Histogram::with_opts(opts).expect("histogram opts"))
});

pub static FETCH_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("fetch_failures_total", "Failed external fetches per source");
    register(IntCounterVec::new(opts, &["source"]).expect("counter opts"))
});

pub static RECORDS_INGESTED: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("records_ingested_total", "Records persisted per source");
    register(IntCounterVec::new(opts, &["source"]).expect("counter opts"))
});

/// Copy a stats snapshot into the per-tier gauges.
pub fn record_cache_stats(stats: &[CacheTierStats]) {
    for s in stats {
        let tier = s.tier.as_str();
        CACHE_ENTRIES
            .with_label_values(&[tier])
            .set(s.entries as i64);
        CACHE_HIT_RATE.with_label_values(&[tier]).set(s.hit_rate);
    }
}

/// Encode all metrics as text
pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let mf = REGISTRY.gather();
    if let Err(e) = encoder.encode(&mf, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
