//! Pipeline metrics for flowtap
//!
//! Counters are plain atomics so every stage can bump them without locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Global metrics collector
#[derive(Debug)]
pub struct MetricsCollector {
    /// When the collector was started
    start_time: Instant,
    /// Frame source and classifier metrics
    pub capture: CaptureMetrics,
    /// Reassembly engine metrics
    pub reassembly: ReassemblyMetrics,
    /// Decoder and publisher metrics
    pub pipeline: PipelineMetrics,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame source and classifier metrics
#[derive(Debug, Default)]
pub struct CaptureMetrics {
    pub frames_seen: AtomicU64,
    pub frames_skipped: AtomicU64,
    pub bytes_captured: AtomicU64,
    pub read_errors: AtomicU64,
}

/// Reassembly engine metrics
#[derive(Debug, Default)]
pub struct ReassemblyMetrics {
    pub segments: AtomicU64,
    pub bytes_delivered: AtomicU64,
    pub duplicate_segments: AtomicU64,
    pub out_of_order_segments: AtomicU64,
    pub late_segments_dropped: AtomicU64,
    pub flows_created: AtomicU64,
    pub flows_closed: AtomicU64,
    pub flows_evicted: AtomicU64,
    pub buffer_cap_flushes: AtomicU64,
}

/// Decoder and publisher metrics
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub events_published: AtomicU64,
    pub events_dropped: AtomicU64,
    pub events_exported: AtomicU64,
    pub truncated_events: AtomicU64,
    pub decode_failures: AtomicU64,
}

struct Counter<'a> {
    name: &'static str,
    help: &'static str,
    value: &'a AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            capture: CaptureMetrics::default(),
            reassembly: ReassemblyMetrics::default(),
            pipeline: PipelineMetrics::default(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn counters(&self) -> Vec<Counter<'_>> {
        let c = &self.capture;
        let r = &self.reassembly;
        let p = &self.pipeline;
        vec![
            Counter { name: "capture_frames_seen_total", help: "Frames read from the source", value: &c.frames_seen },
            Counter { name: "capture_frames_skipped_total", help: "Frames that were not IPv4/IPv6 TCP", value: &c.frames_skipped },
            Counter { name: "capture_bytes_total", help: "Raw frame bytes read", value: &c.bytes_captured },
            Counter { name: "capture_read_errors_total", help: "Recoverable frame source errors", value: &c.read_errors },
            Counter { name: "reassembly_segments_total", help: "TCP segments ingested", value: &r.segments },
            Counter { name: "reassembly_bytes_delivered_total", help: "Stream bytes handed to decoders", value: &r.bytes_delivered },
            Counter { name: "reassembly_duplicate_segments_total", help: "Segments fully covered by delivered data", value: &r.duplicate_segments },
            Counter { name: "reassembly_out_of_order_segments_total", help: "Segments buffered ahead of a gap", value: &r.out_of_order_segments },
            Counter { name: "reassembly_late_segments_dropped_total", help: "Non-SYN segments for recently removed flows", value: &r.late_segments_dropped },
            Counter { name: "reassembly_flows_created_total", help: "Flows created", value: &r.flows_created },
            Counter { name: "reassembly_flows_closed_total", help: "Flows removed after FIN/RST", value: &r.flows_closed },
            Counter { name: "reassembly_flows_evicted_total", help: "Flows removed by idle or capacity flush", value: &r.flows_evicted },
            Counter { name: "reassembly_buffer_cap_flushes_total", help: "Early flushes forced by the buffer cap", value: &r.buffer_cap_flushes },
            Counter { name: "pipeline_events_published_total", help: "Events accepted by the publisher", value: &p.events_published },
            Counter { name: "pipeline_events_dropped_total", help: "Events lost to the overflow policy", value: &p.events_dropped },
            Counter { name: "pipeline_events_exported_total", help: "Events handed to sinks", value: &p.events_exported },
            Counter { name: "pipeline_truncated_events_total", help: "Events emitted with missing bytes", value: &p.truncated_events },
            Counter { name: "pipeline_decode_failures_total", help: "Streams abandoned by the decoder", value: &p.decode_failures },
        ]
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP flowtap_uptime_seconds Time since sensor started\n");
        output.push_str("# TYPE flowtap_uptime_seconds gauge\n");
        output.push_str(&format!(
            "flowtap_uptime_seconds {}\n\n",
            self.uptime_seconds()
        ));

        for counter in self.counters() {
            output.push_str(&format!("# HELP flowtap_{} {}\n", counter.name, counter.help));
            output.push_str(&format!("# TYPE flowtap_{} counter\n", counter.name));
            output.push_str(&format!(
                "flowtap_{} {}\n\n",
                counter.name,
                counter.value.load(Ordering::Relaxed)
            ));
        }

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        let c = &self.capture;
        let r = &self.reassembly;
        let p = &self.pipeline;
        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "capture": {
                "frames_seen": c.frames_seen.load(Ordering::Relaxed),
                "frames_skipped": c.frames_skipped.load(Ordering::Relaxed),
                "bytes_captured": c.bytes_captured.load(Ordering::Relaxed),
                "read_errors": c.read_errors.load(Ordering::Relaxed),
            },
            "reassembly": {
                "segments": r.segments.load(Ordering::Relaxed),
                "bytes_delivered": r.bytes_delivered.load(Ordering::Relaxed),
                "duplicate_segments": r.duplicate_segments.load(Ordering::Relaxed),
                "out_of_order_segments": r.out_of_order_segments.load(Ordering::Relaxed),
                "late_segments_dropped": r.late_segments_dropped.load(Ordering::Relaxed),
                "flows_created": r.flows_created.load(Ordering::Relaxed),
                "flows_closed": r.flows_closed.load(Ordering::Relaxed),
                "flows_evicted": r.flows_evicted.load(Ordering::Relaxed),
                "buffer_cap_flushes": r.buffer_cap_flushes.load(Ordering::Relaxed),
            },
            "pipeline": {
                "events_published": p.events_published.load(Ordering::Relaxed),
                "events_dropped": p.events_dropped.load(Ordering::Relaxed),
                "events_exported": p.events_exported.load(Ordering::Relaxed),
                "truncated_events": p.truncated_events.load(Ordering::Relaxed),
                "decode_failures": p.decode_failures.load(Ordering::Relaxed),
            },
        })
    }
}

/// Shared metrics instance
pub type SharedMetrics = Arc<MetricsCollector>;

/// Create a new shared metrics collector
pub fn create_metrics() -> SharedMetrics {
    Arc::new(MetricsCollector::new())
}
