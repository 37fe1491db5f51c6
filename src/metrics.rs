#![forbid(unsafe_code)]

// Server metrics - atomic counters rendered on demand in Prometheus
// text exposition format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Prefix shared by every exported metric name.
const METRIC_PREFIX: &str = "streamhub";

/// Upper bounds of the message-handling latency buckets.
const LATENCY_BOUNDS: [Duration; 10] = [
    Duration::from_millis(1),
    Duration::from_millis(5),
    Duration::from_millis(10),
    Duration::from_millis(25),
    Duration::from_millis(50),
    Duration::from_millis(100),
    Duration::from_millis(250),
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(5),
];

/// Latency histogram. Each slot counts only its own bucket; the
/// cumulative series Prometheus expects is summed up at render time.
struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BOUNDS.len()],
    overflow: AtomicU64,
    total_us: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            overflow: AtomicU64::new(0),
            total_us: AtomicU64::new(0),
        }
    }
}

impl LatencyHistogram {
    fn observe(&self, duration: Duration) {
        self.total_us
            .fetch_add(duration.as_micros() as u64, Relaxed);
        match LATENCY_BOUNDS.iter().position(|bound| duration <= *bound) {
            Some(slot) => &self.buckets[slot],
            None => &self.overflow,
        }
        .fetch_add(1, Relaxed);
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        let mut cumulative = 0u64;
        for (bound, bucket) in LATENCY_BOUNDS.iter().zip(&self.buckets) {
            cumulative += bucket.load(Relaxed);
            let _ = writeln!(
                out,
                "{name}_bucket{{le=\"{}\"}} {cumulative}",
                bound.as_secs_f64()
            );
        }
        let count = cumulative + self.overflow.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let _ = writeln!(
            out,
            "{name}_sum {:.6}",
            self.total_us.load(Relaxed) as f64 / 1e6
        );
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Server-wide metrics, cheap to clone and share.
#[derive(Clone, Default)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    connections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    messages_dropped_total: AtomicU64,
    errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
    tracks_published_total: AtomicU64,
    renegotiations_total: AtomicU64,
    connections_active: AtomicU64,
    message_handling: LatencyHistogram,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.inner.messages_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_dropped(&self) {
        self.inner.messages_dropped_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.inner.leaves_total.fetch_add(1, Relaxed);
    }

    pub fn inc_tracks_published(&self) {
        self.inner.tracks_published_total.fetch_add(1, Relaxed);
    }

    pub fn inc_renegotiations(&self) {
        self.inner.renegotiations_total.fetch_add(1, Relaxed);
    }

    /// Bumps the active-connection gauge and returns a guard that
    /// undoes the bump on drop, surviving handler panics.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            metrics: self.clone(),
        }
    }

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    /// Renders every metric. `rooms_active` and `participants_active`
    /// are on-demand gauges supplied by the RoomManager.
    pub fn render_prometheus(&self, rooms_active: usize, participants_active: usize) -> String {
        let i = &self.inner;
        let counters = [
            ("connections_total", "Total WebSocket connections", i.connections_total.load(Relaxed)),
            ("messages_received_total", "Total signaling messages received", i.messages_received_total.load(Relaxed)),
            ("messages_sent_total", "Total signaling messages sent", i.messages_sent_total.load(Relaxed)),
            ("messages_dropped_total", "Messages dropped because an outbound queue was full", i.messages_dropped_total.load(Relaxed)),
            ("errors_total", "Total errors", i.errors_total.load(Relaxed)),
            ("rooms_created_total", "Total rooms created", i.rooms_created_total.load(Relaxed)),
            ("joins_total", "Total room joins", i.joins_total.load(Relaxed)),
            ("leaves_total", "Total room leaves", i.leaves_total.load(Relaxed)),
            ("tracks_published_total", "Total forwarding tracks published", i.tracks_published_total.load(Relaxed)),
            ("renegotiations_total", "Total renegotiation passes", i.renegotiations_total.load(Relaxed)),
        ];
        let gauges = [
            ("connections_active", "Currently active WebSocket connections", i.connections_active.load(Relaxed)),
            ("rooms_active", "Currently active rooms", rooms_active as u64),
            ("participants_active", "Currently active participants", participants_active as u64),
        ];

        let mut out = String::with_capacity(4096);
        for (name, help, value) in counters {
            write_sample(&mut out, name, help, "counter", value);
        }
        for (name, help, value) in gauges {
            write_sample(&mut out, name, help, "gauge", value);
        }
        i.message_handling.render(
            &format!("{METRIC_PREFIX}_message_handling_seconds"),
            "Message handling latency in seconds",
            &mut out,
        );
        out
    }
}

/// Guard returned by `connection_active_guard`.
pub struct ConnectionGuard {
    metrics: ServerMetrics,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn write_sample(out: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = writeln!(out, "# HELP {METRIC_PREFIX}_{name} {help}");
    let _ = writeln!(out, "# TYPE {METRIC_PREFIX}_{name} {kind}");
    let _ = writeln!(out, "{METRIC_PREFIX}_{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters_and_gauges() {
        let metrics = ServerMetrics::new();
        metrics.inc_connections_total();
        metrics.inc_messages_dropped();
        metrics.observe_message_handling(Duration::from_millis(2));

        let out = metrics.render_prometheus(3, 7);
        assert!(out.contains("streamhub_connections_total 1"));
        assert!(out.contains("streamhub_messages_dropped_total 1"));
        assert!(out.contains("streamhub_rooms_active 3"));
        assert!(out.contains("streamhub_participants_active 7"));
        assert!(out.contains("streamhub_message_handling_seconds_count 1"));
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let metrics = ServerMetrics::new();
        metrics.observe_message_handling(Duration::from_millis(2));
        metrics.observe_message_handling(Duration::from_millis(30));
        metrics.observe_message_handling(Duration::from_secs(60));

        let out = metrics.render_prometheus(0, 0);
        assert!(out.contains(r#"streamhub_message_handling_seconds_bucket{le="0.001"} 0"#));
        assert!(out.contains(r#"streamhub_message_handling_seconds_bucket{le="0.005"} 1"#));
        assert!(out.contains(r#"streamhub_message_handling_seconds_bucket{le="0.05"} 2"#));
        // the 60 s observation only lands in +Inf
        assert!(out.contains(r#"streamhub_message_handling_seconds_bucket{le="5"} 2"#));
        assert!(out.contains(r#"streamhub_message_handling_seconds_bucket{le="+Inf"} 3"#));
        assert!(out.contains("streamhub_message_handling_seconds_count 3"));
    }

    #[test]
    fn test_connection_guard_decrements() {
        let metrics = ServerMetrics::new();
        {
            let _guard = metrics.connection_active_guard();
            assert!(metrics
                .render_prometheus(0, 0)
                .contains("streamhub_connections_active 1"));
        }
        assert!(metrics
            .render_prometheus(0, 0)
            .contains("streamhub_connections_active 0"));
    }
}
