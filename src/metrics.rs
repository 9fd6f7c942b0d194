/// Prometheus instrumentation (spec §10.4), trimmed to what this crate's
/// pipeline actually measures: ingestion throughput, reorg and invariant
/// events, db error counters, parse/RPC latency, batch-flush behavior, and
/// chain-tip/uptime gauges.
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::time::Instant;

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total blocks ingested, by source (rest, direct).
    pub static ref BLOCKS_PROCESSED: IntCounterVec = IntCounterVec::new(
        Opts::new("combcore_blocks_processed_total", "Total blocks ingested by source"),
        &["source"]
    ).unwrap();

    /// Chain tip height, by origin (local, remote).
    pub static ref CHAIN_TIP_HEIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("combcore_chain_tip_height", "Chain tip height by origin"),
        &["origin"]
    ).unwrap();

    /// Gap between the locally ingested tip and the remote node's tip.
    pub static ref BLOCKS_BEHIND_TIP: IntGauge = IntGauge::new(
        "combcore_blocks_behind_tip",
        "Number of blocks behind the remote chain tip"
    ).unwrap();

    /// Block parse latency.
    pub static ref BLOCK_PARSE_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("combcore_block_parse_duration_seconds", "Block parsing latency").buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    /// REST call latency, by endpoint (chaininfo, headers, block).
    pub static ref RPC_CALL_DURATION: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new("combcore_rpc_call_duration_seconds", "REST call latency").buckets(LATENCY_BUCKETS.to_vec()),
        &["endpoint"]
    ).unwrap();

    /// Database errors by operation (get, put, delete, iterator).
    pub static ref DB_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("combcore_db_errors_total", "Database errors by operation"),
        &["op"]
    ).unwrap();

    /// Reorg events observed.
    pub static ref REORG_EVENTS: IntCounter = IntCounter::new(
        "combcore_reorg_events_total",
        "Total reorg events handled"
    ).unwrap();

    /// Depth of the most recent reorg, in blocks.
    pub static ref REORG_DEPTH_BLOCKS: IntGauge = IntGauge::new(
        "combcore_reorg_depth_blocks",
        "Depth of the most recent reorg in blocks"
    ).unwrap();

    /// Invariant violations by kind (see `CoreError::Invariant` messages).
    pub static ref INVARIANT_VIOLATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("combcore_invariant_violations_total", "Invariant violations by kind"),
        &["kind"]
    ).unwrap();

    /// Batch flush count and latency.
    pub static ref BATCH_FLUSH_COUNT: IntCounter = IntCounter::new(
        "combcore_batch_flush_count_total",
        "Total batch flushes committed to the database"
    ).unwrap();

    pub static ref BATCH_FLUSH_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("combcore_batch_flush_duration_seconds", "Batch flush latency").buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    /// Process uptime and start timestamp.
    pub static ref UPTIME_SECONDS: IntGauge = IntGauge::new(
        "combcore_uptime_seconds",
        "Process uptime in seconds"
    ).unwrap();

    pub static ref SERVICE_START_TIMESTAMP: IntGauge = IntGauge::new(
        "combcore_service_start_timestamp_seconds",
        "Unix timestamp when the process started"
    ).unwrap();
}

/// Registers every metric with [`REGISTRY`] and stamps the start timestamp.
/// Call once at process start, before the first `gather_metrics` scrape.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    REGISTRY.register(Box::new(BLOCKS_PROCESSED.clone()))?;
    REGISTRY.register(Box::new(CHAIN_TIP_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(BLOCKS_BEHIND_TIP.clone()))?;
    REGISTRY.register(Box::new(BLOCK_PARSE_DURATION.clone()))?;
    REGISTRY.register(Box::new(RPC_CALL_DURATION.clone()))?;
    REGISTRY.register(Box::new(DB_ERRORS.clone()))?;
    REGISTRY.register(Box::new(REORG_EVENTS.clone()))?;
    REGISTRY.register(Box::new(REORG_DEPTH_BLOCKS.clone()))?;
    REGISTRY.register(Box::new(INVARIANT_VIOLATIONS.clone()))?;
    REGISTRY.register(Box::new(BATCH_FLUSH_COUNT.clone()))?;
    REGISTRY.register(Box::new(BATCH_FLUSH_DURATION.clone()))?;
    REGISTRY.register(Box::new(UPTIME_SECONDS.clone()))?;
    REGISTRY.register(Box::new(SERVICE_START_TIMESTAMP.clone()))?;

    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH)?.as_secs();
    SERVICE_START_TIMESTAMP.set(now as i64);
    Ok(())
}

/// Renders the registry in Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Refreshes the uptime gauge from the recorded start timestamp. Call
/// periodically (e.g. from the idle-poll tick) rather than on every block.
pub fn update_uptime() {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0) as i64;
    let started = SERVICE_START_TIMESTAMP.get();
    if started > 0 {
        UPTIME_SECONDS.set(now - started);
    }
}

pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn increment_blocks_processed(source: &str, count: u64) {
    BLOCKS_PROCESSED.with_label_values(&[source]).inc_by(count);
}

pub fn set_chain_tip_height(origin: &str, height: i64) {
    CHAIN_TIP_HEIGHT.with_label_values(&[origin]).set(height);
}

pub fn set_blocks_behind_tip(count: i64) {
    BLOCKS_BEHIND_TIP.set(count);
}

pub fn record_block_parse_duration(duration_secs: f64) {
    BLOCK_PARSE_DURATION.observe(duration_secs);
}

pub fn record_rpc_call_duration(endpoint: &str, duration_secs: f64) {
    RPC_CALL_DURATION.with_label_values(&[endpoint]).observe(duration_secs);
}

pub fn increment_db_errors(op: &str) {
    DB_ERRORS.with_label_values(&[op]).inc();
}

pub fn increment_reorg_events(depth: i64) {
    REORG_EVENTS.inc();
    REORG_DEPTH_BLOCKS.set(depth);
}

pub fn increment_invariant_violations(kind: &str) {
    INVARIANT_VIOLATIONS.with_label_values(&[kind]).inc();
}

pub fn record_batch_flush(duration_secs: f64) {
    BATCH_FLUSH_COUNT.inc();
    BATCH_FLUSH_DURATION.observe(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_metrics_includes_registered_families() {
        let registry = Registry::new();
        let counter = IntCounter::new("test_counter_total", "test").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc();

        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&registry.gather(), &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("test_counter_total 1"));
    }

    #[test]
    fn timer_reports_nonzero_elapsed() {
        let timer = Timer::new();
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(timer.elapsed_secs() > 0.0);
    }
}
