use std::net::SocketAddr;

// ── Dispatch ────────────────────────────────────────────────────

/// Counter: jobs claimed and handed to the executor.
pub const JOBS_DISPATCHED_TOTAL: &str = "snipe_jobs_dispatched_total";

/// Counter: jobs leaving `executing`. Labels: state.
pub const JOBS_COMPLETED_TOTAL: &str = "snipe_jobs_completed_total";

/// Gauge: armed jobs held in the in-memory due queue.
pub const DUE_QUEUE_DEPTH: &str = "snipe_due_queue_depth";

/// Histogram: seconds between a job's scheduled time and its dispatch.
pub const DISPATCH_LAG_SECONDS: &str = "snipe_dispatch_lag_seconds";

// ── Attempts ────────────────────────────────────────────────────

/// Counter: booking attempts. Labels: outcome.
pub const ATTEMPTS_TOTAL: &str = "snipe_attempts_total";

/// Histogram: vendor booking call latency in seconds.
pub const ATTEMPT_DURATION_SECONDS: &str = "snipe_attempt_duration_seconds";

// ── Cache ───────────────────────────────────────────────────────

/// Counter: availability refreshes. Labels: status.
pub const CACHE_REFRESH_TOTAL: &str = "snipe_cache_refresh_total";

/// Gauge: cached slot entries.
pub const CACHE_ENTRIES: &str = "snipe_cache_entries";

// ── Store ───────────────────────────────────────────────────────

/// Counter: store operations retried after a persistence failure.
pub const STORE_RETRIES_TOTAL: &str = "snipe_store_retries_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "snipe_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "snipe_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}
