// src/metrics.rs
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Histogram bucket upper bounds in seconds: 1ms, 10ms, 100ms, 1s, +Inf.
const BUCKET_BOUNDS: [f64; 4] = [0.001, 0.01, 0.1, 1.0];
const BUCKET_LABELS: [&str; 5] = ["0.001", "0.01", "0.1", "1.0", "+Inf"];

/// How long request timestamps are retained for the RPS gauge.
const RPS_WINDOW: Duration = Duration::from_secs(60);

/// Process-wide metrics registry.
///
/// One instance per process, created in main and passed explicitly (as an
/// `Arc`) to the server, the router, and the handlers. All mutation is
/// lock-free except the recent-timestamp window behind `recent`.
pub struct Metrics {
    // Request counters
    requests_total: AtomicU64,
    requests_successful: AtomicU64,
    requests_failed: AtomicU64,

    // Connection counters
    connections_total: AtomicU64,
    active_connections: AtomicI64,

    // Throughput counters
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,

    // Request duration: last-value gauge plus a non-cumulative histogram.
    // Durations are stored in microseconds to stay on integer atomics.
    last_duration_us: AtomicU64,
    duration_buckets: [AtomicU64; 5],
    duration_sum_us: AtomicU64,
    duration_count: AtomicU64,

    // Connection lifetime accounting, recorded on close.
    conn_duration_sum_us: AtomicU64,
    conn_duration_count: AtomicU64,

    // Buffer high-water gauges
    read_buf_high_water: AtomicU64,
    write_buf_high_water: AtomicU64,

    // Timestamps of recent requests for the 1-second RPS gauge.
    recent: Mutex<VecDeque<Instant>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            requests_successful: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            active_connections: AtomicI64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            last_duration_us: AtomicU64::new(0),
            duration_buckets: Default::default(),
            duration_sum_us: AtomicU64::new(0),
            duration_count: AtomicU64::new(0),
            conn_duration_sum_us: AtomicU64::new(0),
            conn_duration_count: AtomicU64::new(0),
            read_buf_high_water: AtomicU64::new(0),
            write_buf_high_water: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn inc_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_success(&self) {
        self.requests_successful.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fail(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bytes_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_bytes_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_connections(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_connections(&self) {
        // Saturate at zero rather than going negative on double accounting.
        let prev = self.active_connections.fetch_sub(1, Ordering::Relaxed);
        if prev <= 0 {
            self.active_connections.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record one request duration: last-value gauge, sum, count, and the
    /// first bucket whose upper bound exceeds the value.
    pub fn observe_duration(&self, d: Duration) {
        let us = d.as_micros() as u64;
        let secs = d.as_secs_f64();
        self.last_duration_us.store(us, Ordering::Relaxed);
        self.duration_sum_us.fetch_add(us, Ordering::Relaxed);
        self.duration_count.fetch_add(1, Ordering::Relaxed);
        let idx = BUCKET_BOUNDS
            .iter()
            .position(|b| secs < *b)
            .unwrap_or(BUCKET_BOUNDS.len());
        self.duration_buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_connection_duration(&self, d: Duration) {
        self.conn_duration_sum_us
            .fetch_add(d.as_micros() as u64, Ordering::Relaxed);
        self.conn_duration_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_read_buf(&self, n: usize) {
        self.read_buf_high_water.fetch_max(n as u64, Ordering::Relaxed);
    }

    pub fn observe_write_buf(&self, n: usize) {
        self.write_buf_high_water.fetch_max(n as u64, Ordering::Relaxed);
    }

    /// Stamp the arrival of a request for the RPS window. Entries older than
    /// the window are pruned here so the deque stays bounded.
    pub fn record_request_instant(&self) {
        let now = Instant::now();
        let mut recent = self.recent.lock().unwrap();
        recent.push_back(now);
        while let Some(front) = recent.front() {
            if now.duration_since(*front) > RPS_WINDOW {
                recent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Requests observed within the last second.
    pub fn rps(&self) -> u64 {
        let now = Instant::now();
        let recent = self.recent.lock().unwrap();
        recent
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) <= Duration::from_secs(1))
            .count() as u64
    }

    // Read accessors, used by render() and by tests.

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn requests_successful(&self) -> u64 {
        self.requests_successful.load(Ordering::Relaxed)
    }

    pub fn requests_failed(&self) -> u64 {
        self.requests_failed.load(Ordering::Relaxed)
    }

    pub fn connections_total(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Render the registry in Prometheus exposition format. Metric names are
    /// stable; gauges may change between calls but counters only move when
    /// requests or connections do.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2048);

        let counter = |name: &str, help: &str, value: u64, out: &mut String| {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}\n", name, value);
        };

        counter(
            "tallyd_requests_total",
            "Total number of HTTP requests",
            self.requests_total(),
            &mut out,
        );
        counter(
            "tallyd_requests_successful",
            "Total successful HTTP requests",
            self.requests_successful(),
            &mut out,
        );
        counter(
            "tallyd_requests_failed",
            "Total failed HTTP requests",
            self.requests_failed(),
            &mut out,
        );
        counter(
            "tallyd_connections_total",
            "Total number of connections",
            self.connections_total(),
            &mut out,
        );

        let _ = writeln!(
            out,
            "# HELP tallyd_active_connections Current active connections"
        );
        let _ = writeln!(out, "# TYPE tallyd_active_connections gauge");
        let _ = writeln!(out, "tallyd_active_connections {}\n", self.active_connections());

        let _ = writeln!(
            out,
            "# HELP tallyd_request_duration_seconds Last request duration in seconds"
        );
        let _ = writeln!(out, "# TYPE tallyd_request_duration_seconds gauge");
        let _ = writeln!(
            out,
            "tallyd_request_duration_seconds {}\n",
            self.last_duration_us.load(Ordering::Relaxed) as f64 / 1e6
        );

        let _ = writeln!(
            out,
            "# HELP tallyd_request_duration_seconds_histogram Request duration histogram"
        );
        let _ = writeln!(out, "# TYPE tallyd_request_duration_seconds_histogram histogram");
        for (label, bucket) in BUCKET_LABELS.iter().zip(self.duration_buckets.iter()) {
            let _ = writeln!(
                out,
                "tallyd_request_duration_seconds_histogram_bucket{{le=\"{}\"}} {}",
                label,
                bucket.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(
            out,
            "tallyd_request_duration_seconds_histogram_sum {}",
            self.duration_sum_us.load(Ordering::Relaxed) as f64 / 1e6
        );
        let _ = writeln!(
            out,
            "tallyd_request_duration_seconds_histogram_count {}\n",
            self.duration_count.load(Ordering::Relaxed)
        );

        counter(
            "tallyd_bytes_received_total",
            "Total bytes received",
            self.bytes_received(),
            &mut out,
        );
        counter(
            "tallyd_bytes_sent_total",
            "Total bytes sent",
            self.bytes_sent(),
            &mut out,
        );

        let _ = writeln!(
            out,
            "# HELP tallyd_connection_duration_seconds Total connection lifetime"
        );
        let _ = writeln!(out, "# TYPE tallyd_connection_duration_seconds histogram");
        let _ = writeln!(
            out,
            "tallyd_connection_duration_seconds_sum {}",
            self.conn_duration_sum_us.load(Ordering::Relaxed) as f64 / 1e6
        );
        let _ = writeln!(
            out,
            "tallyd_connection_duration_seconds_count {}\n",
            self.conn_duration_count.load(Ordering::Relaxed)
        );

        let _ = writeln!(
            out,
            "# HELP tallyd_read_buffer_high_water_bytes Largest read buffer observed"
        );
        let _ = writeln!(out, "# TYPE tallyd_read_buffer_high_water_bytes gauge");
        let _ = writeln!(
            out,
            "tallyd_read_buffer_high_water_bytes {}\n",
            self.read_buf_high_water.load(Ordering::Relaxed)
        );

        let _ = writeln!(
            out,
            "# HELP tallyd_write_buffer_high_water_bytes Largest write buffer observed"
        );
        let _ = writeln!(out, "# TYPE tallyd_write_buffer_high_water_bytes gauge");
        let _ = writeln!(
            out,
            "tallyd_write_buffer_high_water_bytes {}\n",
            self.write_buf_high_water.load(Ordering::Relaxed)
        );

        let _ = writeln!(
            out,
            "# HELP tallyd_requests_per_second Requests observed in the last second"
        );
        let _ = writeln!(out, "# TYPE tallyd_requests_per_second gauge");
        let _ = writeln!(out, "tallyd_requests_per_second {}\n", self.rps());

        let _ = writeln!(out, "# HELP tallyd_info Server information");
        let _ = writeln!(out, "# TYPE tallyd_info gauge");
        let _ = writeln!(
            out,
            "tallyd_info{{version=\"{}\"}} 1",
            env!("CARGO_PKG_VERSION")
        );

        out
    }

    /// Zero every counter and gauge and clear the RPS window. Test support.
    pub fn reset(&self) {
        self.requests_total.store(0, Ordering::Relaxed);
        self.requests_successful.store(0, Ordering::Relaxed);
        self.requests_failed.store(0, Ordering::Relaxed);
        self.connections_total.store(0, Ordering::Relaxed);
        self.active_connections.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.last_duration_us.store(0, Ordering::Relaxed);
        for bucket in &self.duration_buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.duration_sum_us.store(0, Ordering::Relaxed);
        self.duration_count.store(0, Ordering::Relaxed);
        self.conn_duration_sum_us.store(0, Ordering::Relaxed);
        self.conn_duration_count.store(0, Ordering::Relaxed);
        self.read_buf_high_water.store(0, Ordering::Relaxed);
        self.write_buf_high_water.store(0, Ordering::Relaxed);
        self.recent.lock().unwrap().clear();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let m = Metrics::new();
        m.inc_connections();
        m.inc_connections();
        m.dec_connections();
        assert_eq!(m.connections_total(), 2);
        assert_eq!(m.active_connections(), 1);
        // Never below zero
        m.dec_connections();
        m.dec_connections();
        assert_eq!(m.active_connections(), 0);
    }

    #[test]
    fn test_duration_bucket_placement() {
        let m = Metrics::new();
        m.observe_duration(Duration::from_micros(500)); // < 1ms
        m.observe_duration(Duration::from_millis(5)); // < 10ms
        m.observe_duration(Duration::from_millis(50)); // < 100ms
        m.observe_duration(Duration::from_millis(500)); // < 1s
        m.observe_duration(Duration::from_secs(2)); // +Inf
        let rendered = m.render();
        for label in BUCKET_LABELS {
            assert!(rendered.contains(&format!("{{le=\"{}\"}} 1", label)), "{}", label);
        }
        assert!(rendered.contains("tallyd_request_duration_seconds_histogram_count 5"));
    }

    #[test]
    fn test_render_idempotent_without_activity() {
        let m = Metrics::new();
        m.inc_requests();
        m.inc_success();
        m.inc_bytes_received(10);
        let counters = |s: &str| -> Vec<String> {
            s.lines()
                .filter(|l| {
                    !l.starts_with('#')
                        && !l.is_empty()
                        && !l.contains("per_second")
                        && !l.contains("duration_seconds ")
                })
                .map(|l| l.to_string())
                .collect()
        };
        assert_eq!(counters(&m.render()), counters(&m.render()));
    }

    #[test]
    fn test_high_water_takes_max() {
        let m = Metrics::new();
        m.observe_read_buf(100);
        m.observe_read_buf(50);
        m.observe_write_buf(7);
        let rendered = m.render();
        assert!(rendered.contains("tallyd_read_buffer_high_water_bytes 100"));
        assert!(rendered.contains("tallyd_write_buffer_high_water_bytes 7"));
    }

    #[test]
    fn test_rps_counts_last_second_only() {
        let m = Metrics::new();
        m.record_request_instant();
        m.record_request_instant();
        assert_eq!(m.rps(), 2);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let m = Metrics::new();
        m.inc_requests();
        m.inc_fail();
        m.inc_connections();
        m.observe_duration(Duration::from_millis(3));
        m.record_request_instant();
        m.reset();
        assert_eq!(m.requests_total(), 0);
        assert_eq!(m.requests_failed(), 0);
        assert_eq!(m.connections_total(), 0);
        assert_eq!(m.active_connections(), 0);
        assert_eq!(m.rps(), 0);
        assert!(m.render().contains("tallyd_request_duration_seconds_histogram_count 0"));
    }

    #[test]
    fn test_render_has_help_and_type_lines() {
        let rendered = Metrics::new().render();
        assert!(rendered.contains("# HELP tallyd_requests_total"));
        assert!(rendered.contains("# TYPE tallyd_requests_total counter"));
        assert!(rendered.contains("# TYPE tallyd_active_connections gauge"));
        assert!(rendered.contains("tallyd_info{version="));
    }
}
