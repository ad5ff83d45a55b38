use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static SERVE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("fpcache_serve_total", "Cache lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register fpcache_serve_total");
    vec
});

static STORE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("fpcache_store_total", "Responses admitted to the cache")
        .expect("create fpcache_store_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register fpcache_store_total");
    counter
});

static SKIP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("fpcache_skip_total", "Responses refused admission by reason");
    let vec = IntCounterVec::new(opts, &["reason"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register fpcache_skip_total");
    vec
});

static SWEEP_RUNS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter =
        IntCounter::new("fpcache_sweep_runs_total", "Sweep passes").expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register fpcache_sweep_runs_total");
    counter
});

static SWEEP_DELETED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "fpcache_sweep_deleted_total",
        "Expired entries removed by the sweeper",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register fpcache_sweep_deleted_total");
    counter
});

static LEDGER_FLUSH_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "fpcache_ledger_flush_total",
        "Successful invalidation ledger flushes",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register fpcache_ledger_flush_total");
    counter
});

pub fn record_serve(result: &str) {
    SERVE_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_store() {
    STORE_TOTAL.inc();
}

pub fn record_skip(reason: &str) {
    SKIP_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_sweep(deleted: usize) {
    SWEEP_RUNS_TOTAL.inc();
    if deleted > 0 {
        SWEEP_DELETED_TOTAL.inc_by(deleted as u64);
    }
}

pub fn record_ledger_flush() {
    LEDGER_FLUSH_TOTAL.inc();
}

pub fn render() -> Result<String> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
