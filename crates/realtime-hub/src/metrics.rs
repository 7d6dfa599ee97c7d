use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static CONNECTIONS_OPENED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "realtime_connections_opened_total",
            "Realtime channels opened by connection group",
        ),
        &["group"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CONNECTIONS_CLOSED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "realtime_connections_closed_total",
            "Realtime channels closed by reason",
        ),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::with_opts(Opts::new(
        "realtime_active_connections",
        "Realtime channels currently held by the hub",
    ))
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static WRITES_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::with_opts(Opts::new(
        "realtime_writes_in_flight",
        "Write operations currently blocking connection teardown",
    ))
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static CALLBACK_FAULTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "realtime_callback_faults_total",
            "Subscriber callbacks that returned an error or panicked",
        ),
        &["resource", "fault"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static TRANSPORT_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "realtime_transport_failures_total",
            "Channel failures observed by the hub",
        ),
        &["status"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RECREATE_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "realtime_recreate_attempts_total",
            "Backoff driven connection recreation attempts by outcome",
        ),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RETRY_DELAY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new(
            "realtime_retry_delay_seconds",
            "Backoff delay scheduled before recreating a failed connection",
        )
        .buckets(vec![1.0, 2.0, 4.0, 8.0, 10.0, 30.0]),
    )
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

pub static STALE_CONNECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "realtime_stale_connections_total",
        "Health check observations of connections past the staleness threshold",
    ))
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static DEFERRED_TEARDOWNS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "realtime_deferred_teardowns_total",
            "Deferred idle connection checks by outcome",
        ),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CLEANUP_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "realtime_cleanup_runs_total",
            "Global cleanup passes by trigger",
        ),
        &["trigger"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "metrics encode error");
    }
    buffer
}
