//! Reassembly engine - the flow table and per-flow reordering state
//!
//! The engine is single-owner: the capture loop calls [`ReassemblyEngine::ingest`]
//! and the idle flush from the same task, so no locking is involved.
//! Decoders run inline; the events they produce are appended to the
//! caller's buffer in emission order.

use crate::half::{Delivery, HalfStream, SegmentOutcome};
use chrono::{DateTime, Duration, Utc};
use flowtap_core::{
    DecoderFactory, Direction, FlowKey, HttpMessageEvent, SharedMetrics, StreamDecoder,
    TcpSegment,
};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

/// Reassembly limits
#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    /// Capture-time inactivity after which a flow is flushed, and for which
    /// late segments of a removed flow are ignored
    pub idle_window: Duration,

    /// Cap on out-of-order bytes held per direction
    pub max_buffered_bytes_per_direction: usize,

    /// Cap on concurrently tracked flows
    pub max_flows: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            idle_window: Duration::seconds(120),
            max_buffered_bytes_per_direction: 1024 * 1024,
            max_flows: 65_536,
        }
    }
}

/// State for one tracked connection
struct FlowState {
    halves: [HalfStream; 2],
    decoders: [Box<dyn StreamDecoder>; 2],
    last_activity: DateTime<Utc>,
}

impl FlowState {
    fn is_finished(&self) -> bool {
        self.halves.iter().all(HalfStream::is_closed)
    }

    fn buffered_bytes(&self) -> usize {
        self.halves.iter().map(HalfStream::buffered_bytes).sum()
    }
}

/// TCP reassembly over every observed flow
pub struct ReassemblyEngine {
    config: ReassemblyConfig,
    factory: Arc<dyn DecoderFactory>,
    flows: HashMap<FlowKey, FlowState>,
    /// Removed flows and the capture time until which their late segments are ignored
    tombstones: HashMap<FlowKey, DateTime<Utc>>,
    /// Latest capture timestamp ingested
    latest: Option<DateTime<Utc>>,
    metrics: SharedMetrics,
    deliveries: Vec<Delivery>,
}

impl ReassemblyEngine {
    pub fn new(
        config: ReassemblyConfig,
        factory: Arc<dyn DecoderFactory>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            config,
            factory,
            flows: HashMap::new(),
            tombstones: HashMap::new(),
            latest: None,
            metrics,
            deliveries: Vec::new(),
        }
    }

    pub fn config(&self) -> &ReassemblyConfig {
        &self.config
    }

    /// Number of flows currently tracked
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.flows.contains_key(key)
    }

    /// Out-of-order bytes held across every flow
    pub fn buffered_bytes(&self) -> usize {
        self.flows.values().map(FlowState::buffered_bytes).sum()
    }

    /// Capture timestamp of the most recent segment
    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.latest
    }

    /// Route one segment into its flow.
    ///
    /// Events decoded as a consequence are appended to `out`.
    pub fn ingest(
        &mut self,
        segment: TcpSegment,
        key: FlowKey,
        direction: Direction,
        out: &mut Vec<HttpMessageEvent>,
    ) {
        let ts = segment.timestamp;
        self.latest = Some(self.latest.map_or(ts, |latest| latest.max(ts)));
        self.metrics
            .reassembly
            .segments
            .fetch_add(1, Ordering::Relaxed);

        if !self.flows.contains_key(&key) && !self.admit(&key, &segment, out) {
            return;
        }

        let Some(flow) = self.flows.get_mut(&key) else {
            return;
        };
        flow.last_activity = flow.last_activity.max(ts);

        let rst = segment.flags.rst;
        let outcome = flow.halves[direction.index()].accept(
            segment.seq,
            segment.flags,
            segment.payload,
            ts,
            self.config.max_buffered_bytes_per_direction,
            &mut self.deliveries,
        );
        trace!("{} {} seq={} -> {:?}", key, direction, segment.seq, outcome);
        count_outcome(&self.metrics, outcome);
        dispatch(
            &key,
            flow.decoders[direction.index()].as_mut(),
            &mut self.deliveries,
            &self.metrics,
            out,
        );

        if rst {
            debug!("{} reset by {}", key, direction);
            for dir in Direction::BOTH {
                flow.halves[dir.index()].reset(&mut self.deliveries);
                dispatch(
                    &key,
                    flow.decoders[dir.index()].as_mut(),
                    &mut self.deliveries,
                    &self.metrics,
                    out,
                );
            }
        }

        if flow.is_finished() {
            debug!("{} closed", key);
            self.flows.remove(&key);
            self.bury(key);
            self.metrics
                .reassembly
                .flows_closed
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Decide whether a segment for an untracked key starts a new flow
    fn admit(
        &mut self,
        key: &FlowKey,
        segment: &TcpSegment,
        out: &mut Vec<HttpMessageEvent>,
    ) -> bool {
        if let Some(until) = self.tombstones.get(key) {
            if !segment.flags.syn && segment.timestamp < *until {
                trace!("{} late segment for removed flow dropped", key);
                self.metrics
                    .reassembly
                    .late_segments_dropped
                    .fetch_add(1, Ordering::Relaxed);
                return false;
            }
            self.tombstones.remove(key);
        }

        if segment.flags.rst {
            return false;
        }

        if self.flows.len() >= self.config.max_flows {
            self.evict_least_recent(out);
        }

        let decoders = [
            self.factory.create(key, Direction::ClientToServer),
            self.factory.create(key, Direction::ServerToClient),
        ];
        self.flows.insert(
            *key,
            FlowState {
                halves: [HalfStream::new(), HalfStream::new()],
                decoders,
                last_activity: segment.timestamp,
            },
        );
        self.metrics
            .reassembly
            .flows_created
            .fetch_add(1, Ordering::Relaxed);
        debug!("{} new flow ({} tracked)", key, self.flows.len());
        true
    }

    fn evict_least_recent(&mut self, out: &mut Vec<HttpMessageEvent>) {
        let victim = self
            .flows
            .iter()
            .min_by_key(|(key, flow)| (flow.last_activity, **key))
            .map(|(key, _)| *key);

        if let Some(key) = victim {
            debug!("{} evicted, flow table full", key);
            self.remove_flushed(key, out);
        }
    }

    /// Force-flush and remove a flow, leaving a tombstone
    fn remove_flushed(&mut self, key: FlowKey, out: &mut Vec<HttpMessageEvent>) {
        if let Some(mut flow) = self.flows.remove(&key) {
            self.flush_flow(&key, &mut flow, out);
            self.bury(key);
            self.metrics
                .reassembly
                .flows_evicted
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flush_flow(&mut self, key: &FlowKey, flow: &mut FlowState, out: &mut Vec<HttpMessageEvent>) {
        for dir in Direction::BOTH {
            flow.halves[dir.index()].force_flush(&mut self.deliveries);
            dispatch(
                key,
                flow.decoders[dir.index()].as_mut(),
                &mut self.deliveries,
                &self.metrics,
                out,
            );
        }
    }

    fn bury(&mut self, key: FlowKey) {
        if let Some(latest) = self.latest {
            self.tombstones.insert(key, latest + self.config.idle_window);
        }
    }

    /// Flush and remove every flow whose last activity is older than `threshold`.
    ///
    /// Returns the number of flows removed.
    pub fn flush_older_than(
        &mut self,
        threshold: DateTime<Utc>,
        out: &mut Vec<HttpMessageEvent>,
    ) -> usize {
        let mut stale: Vec<(DateTime<Utc>, FlowKey)> = self
            .flows
            .iter()
            .filter(|(_, flow)| flow.last_activity < threshold)
            .map(|(key, flow)| (flow.last_activity, *key))
            .collect();
        stale.sort();

        for (_, key) in &stale {
            debug!("{} idle, flushing", key);
            self.remove_flushed(*key, out);
        }

        if let Some(latest) = self.latest {
            self.tombstones.retain(|_, until| *until > latest);
        }

        stale.len()
    }

    /// Force-flush every flow, e.g. at the end of a trace
    pub fn flush_all(&mut self, out: &mut Vec<HttpMessageEvent>) -> usize {
        let mut keys: Vec<FlowKey> = self.flows.keys().copied().collect();
        keys.sort();

        for key in &keys {
            if let Some(mut flow) = self.flows.remove(key) {
                self.flush_flow(key, &mut flow, out);
                self.metrics
                    .reassembly
                    .flows_evicted
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        self.tombstones.clear();
        keys.len()
    }

    /// Drop every flow without delivering anything
    pub fn clear(&mut self) {
        if !self.flows.is_empty() {
            debug!("Discarding {} in-flight flows", self.flows.len());
        }
        self.flows.clear();
        self.tombstones.clear();
    }
}

fn count_outcome(metrics: &SharedMetrics, outcome: SegmentOutcome) {
    let r = &metrics.reassembly;
    match outcome {
        SegmentOutcome::Duplicate => {
            r.duplicate_segments.fetch_add(1, Ordering::Relaxed);
        }
        SegmentOutcome::Buffered => {
            r.out_of_order_segments.fetch_add(1, Ordering::Relaxed);
        }
        SegmentOutcome::CapFlushed => {
            r.out_of_order_segments.fetch_add(1, Ordering::Relaxed);
            r.buffer_cap_flushes.fetch_add(1, Ordering::Relaxed);
        }
        SegmentOutcome::Delivered
        | SegmentOutcome::Held
        | SegmentOutcome::Control
        | SegmentOutcome::Ignored => {}
    }
}

/// Hand queued deliveries to a decoder
fn dispatch(
    key: &FlowKey,
    decoder: &mut dyn StreamDecoder,
    deliveries: &mut Vec<Delivery>,
    metrics: &SharedMetrics,
    out: &mut Vec<HttpMessageEvent>,
) {
    let first_new = out.len();
    let was_abandoned = decoder.is_abandoned();

    for delivery in deliveries.drain(..) {
        if decoder.is_abandoned() {
            continue;
        }
        match delivery {
            Delivery::Data { bytes, ts } => {
                metrics
                    .reassembly
                    .bytes_delivered
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                decoder.on_data(&bytes, ts, out);
            }
            Delivery::Gap => decoder.on_gap(out),
            Delivery::End(reason) => decoder.on_end(reason, out),
        }
    }

    if !was_abandoned && decoder.is_abandoned() {
        debug!("{} decoder gave up on stream", key);
    }

    let truncated = out[first_new..].iter().filter(|e| e.truncated).count();
    if truncated > 0 {
        metrics
            .pipeline
            .truncated_events
            .fetch_add(truncated as u64, Ordering::Relaxed);
    }
}
