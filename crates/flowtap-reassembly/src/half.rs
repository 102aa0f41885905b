//! Reordering state for one direction of a flow
//!
//! Positions are tracked as 64-bit stream offsets so the buffer map never
//! has to reason about sequence wraparound. Incoming sequence numbers are
//! converted using the signed 32-bit distance from the next expected
//! sequence number.
//!
//! A direction picked up without a SYN has no known start. Its payloads are
//! held, with the provisional start moving back to the lowest sequence number
//! seen, until a SYN or RST arrives, the buffer cap is hit or the stream is
//! flushed. Delivery then begins at the lowest held byte.

use chrono::{DateTime, Utc};
use flowtap_core::{EndReason, TcpFlags};
use std::collections::BTreeMap;

/// Something the decoder for this direction must be told, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Contiguous bytes following everything delivered before
    Data { bytes: Vec<u8>, ts: DateTime<Utc> },
    /// Bytes are missing before the next `Data`
    Gap,
    /// The direction is finished
    End(EndReason),
}

/// What happened to an accepted segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Payload (or its unseen suffix) delivered immediately
    Delivered,
    /// Payload held until the gap before it fills
    Buffered,
    /// Payload held until the start of the stream is known
    Held,
    /// Payload held, and the buffer cap forced an early flush
    CapFlushed,
    /// Payload already delivered or already buffered
    Duplicate,
    /// No payload to deliver
    Control,
    /// Direction already closed
    Ignored,
}

#[derive(Debug)]
struct Pending {
    bytes: Vec<u8>,
    ts: DateTime<Utc>,
}

/// One direction of a TCP connection
#[derive(Debug, Default)]
pub struct HalfStream {
    /// Sequence number of the next byte to deliver; `None` until anchored
    next_seq: Option<u32>,
    /// Stream offset of `next_seq`
    offset: u64,
    /// Out-of-order payloads keyed by stream offset
    pending: BTreeMap<u64, Pending>,
    buffered_bytes: usize,
    /// Stream offset just past the last byte before FIN
    fin_offset: Option<u64>,
    /// Delivery has begun; `next_seq` no longer moves backwards
    released: bool,
    closed: bool,
}

impl HalfStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes held out of order
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// Bytes delivered so far (including skipped gaps)
    pub fn delivered_offset(&self) -> u64 {
        self.offset
    }

    /// Route one segment's payload through the reordering buffer.
    ///
    /// A SYN anchors the stream at `seq + 1`. Without one, payloads are held
    /// from the lowest sequence number seen until delivery is released.
    pub fn accept(
        &mut self,
        seq: u32,
        flags: TcpFlags,
        payload: Vec<u8>,
        ts: DateTime<Utc>,
        max_buffered: usize,
        out: &mut Vec<Delivery>,
    ) -> SegmentOutcome {
        if self.closed {
            return SegmentOutcome::Ignored;
        }

        let data_seq = if flags.syn { seq.wrapping_add(1) } else { seq };
        if !self.released {
            if flags.syn {
                self.rebase(data_seq);
                self.released = true;
                self.drain_contiguous(out);
            } else {
                let earlier = match self.next_seq {
                    None => true,
                    Some(base) => {
                        !payload.is_empty() && (data_seq.wrapping_sub(base) as i32) < 0
                    }
                };
                if earlier {
                    self.rebase(data_seq);
                }
            }
        }
        let next_seq = *self.next_seq.get_or_insert(data_seq);

        let distance = data_seq.wrapping_sub(next_seq) as i32 as i64;
        let start = self.offset as i64 + distance;
        let end = start + payload.len() as i64;

        if flags.fin && self.fin_offset.is_none() && end >= 0 {
            self.fin_offset = Some(end as u64);
        }

        let outcome = if payload.is_empty() {
            SegmentOutcome::Control
        } else if !self.released {
            match self.buffer(start as u64, payload, ts, max_buffered, out) {
                SegmentOutcome::Buffered => SegmentOutcome::Held,
                other => other,
            }
        } else if end <= self.offset as i64 {
            SegmentOutcome::Duplicate
        } else if start <= self.offset as i64 {
            let skip = (self.offset as i64 - start) as usize;
            let mut payload = payload;
            payload.drain(..skip);
            self.deliver(payload, ts, out);
            self.drain_contiguous(out);
            SegmentOutcome::Delivered
        } else {
            self.buffer(start as u64, payload, ts, max_buffered, out)
        };

        self.check_fin(out);
        outcome
    }

    /// Move the provisional start of a held stream to `seq`, re-keying
    /// everything held so far
    fn rebase(&mut self, seq: u32) {
        let Some(base) = self.next_seq.replace(seq) else {
            return;
        };
        let shift = seq.wrapping_sub(base) as i32 as i64;
        if shift == 0 {
            return;
        }

        let held = std::mem::take(&mut self.pending);
        self.buffered_bytes = 0;
        for (start, mut pending) in held {
            let start = start as i64 - shift;
            if start + pending.bytes.len() as i64 <= 0 {
                continue;
            }
            if start < 0 {
                pending.bytes.drain(..(-start) as usize);
            }
            self.insert_pending(start.max(0) as u64, pending);
        }
        self.fin_offset = self
            .fin_offset
            .and_then(|fin| u64::try_from(fin as i64 - shift).ok());
    }

    /// Begin delivery of a held stream at its lowest held byte
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(&first) = self.pending.keys().next() {
            if first > self.offset {
                self.advance(first - self.offset);
            }
        }
    }

    /// Keep the longer payload when two start at the same offset
    fn insert_pending(&mut self, start: u64, pending: Pending) -> bool {
        if let Some(existing) = self.pending.get(&start) {
            if existing.bytes.len() >= pending.bytes.len() {
                return false;
            }
        }
        let len = pending.bytes.len();
        if let Some(replaced) = self.pending.insert(start, pending) {
            self.buffered_bytes -= replaced.bytes.len();
        }
        self.buffered_bytes += len;
        true
    }

    fn buffer(
        &mut self,
        start: u64,
        payload: Vec<u8>,
        ts: DateTime<Utc>,
        max_buffered: usize,
        out: &mut Vec<Delivery>,
    ) -> SegmentOutcome {
        if !self.insert_pending(start, Pending { bytes: payload, ts }) {
            return SegmentOutcome::Duplicate;
        }

        if self.buffered_bytes > max_buffered {
            self.release();
            self.flush_pending(out);
            SegmentOutcome::CapFlushed
        } else {
            SegmentOutcome::Buffered
        }
    }

    fn deliver(&mut self, bytes: Vec<u8>, ts: DateTime<Utc>, out: &mut Vec<Delivery>) {
        if bytes.is_empty() {
            return;
        }
        self.advance(bytes.len() as u64);
        out.push(Delivery::Data { bytes, ts });
    }

    fn advance(&mut self, n: u64) {
        self.offset += n;
        if let Some(next) = self.next_seq.as_mut() {
            *next = next.wrapping_add(n as u32);
        }
    }

    /// Deliver buffered payloads that now follow the delivered prefix
    fn drain_contiguous(&mut self, out: &mut Vec<Delivery>) {
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() > self.offset {
                break;
            }
            let start = *entry.key();
            let pending = entry.remove();
            self.buffered_bytes -= pending.bytes.len();
            self.deliver_from(start, pending, out);
        }
    }

    /// Deliver every buffered payload in order, signalling a gap before
    /// each discontinuity
    fn flush_pending(&mut self, out: &mut Vec<Delivery>) {
        while let Some((start, pending)) = self.pending.pop_first() {
            self.buffered_bytes -= pending.bytes.len();
            if start > self.offset {
                out.push(Delivery::Gap);
                self.advance(start - self.offset);
            }
            self.deliver_from(start, pending, out);
        }
    }

    fn deliver_from(&mut self, start: u64, pending: Pending, out: &mut Vec<Delivery>) {
        let end = start + pending.bytes.len() as u64;
        if end <= self.offset {
            return;
        }
        let mut bytes = pending.bytes;
        bytes.drain(..(self.offset - start) as usize);
        self.deliver(bytes, pending.ts, out);
    }

    fn check_fin(&mut self, out: &mut Vec<Delivery>) {
        if let Some(fin) = self.fin_offset {
            if self.released && !self.closed && self.offset >= fin {
                self.close(EndReason::Closed, out);
            }
        }
    }

    fn close(&mut self, reason: EndReason, out: &mut Vec<Delivery>) {
        self.closed = true;
        self.pending.clear();
        self.buffered_bytes = 0;
        out.push(Delivery::End(reason));
    }

    /// RST: end the direction now, discarding bytes that cannot be
    /// delivered contiguously
    pub fn reset(&mut self, out: &mut Vec<Delivery>) {
        if !self.closed {
            self.release();
            self.drain_contiguous(out);
            self.close(EndReason::Reset, out);
        }
    }

    /// Deliver everything buffered, gaps included, then end the direction
    pub fn force_flush(&mut self, out: &mut Vec<Delivery>) {
        if self.closed {
            return;
        }
        self.release();
        self.flush_pending(out);
        self.check_fin(out);
        if !self.closed {
            self.close(EndReason::Flushed, out);
        }
    }
}
