//! Incremental HTTP/1.x stream decoder
//!
//! One [`HttpStreamDecoder`] follows one direction of one flow. Bytes arrive
//! in arbitrary slices; the decoder keeps only the unparsed tail of the
//! current line or header block, and counts body bytes without storing them.

use crate::http::{body_policy, parse_chunk_size, parse_header_block, parse_start_line};
use crate::DecodeError;
use chrono::{DateTime, Utc};
use flowtap_core::config::DecoderSettings;
use flowtap_core::{
    BodyLength, DecoderFactory, Direction, EndReason, FlowKey, HeaderMap, HttpMessageEvent,
    PluginInfo, SharedMetrics, StartLine, StreamDecoder,
};
use std::sync::atomic::Ordering;
use tracing::{debug, trace};

/// Byte budgets applied per stream
#[derive(Debug, Clone)]
pub struct DecoderLimits {
    pub max_start_line_bytes: usize,
    pub max_header_bytes: usize,
    pub max_headers: usize,
}

impl Default for DecoderLimits {
    fn default() -> Self {
        Self {
            max_start_line_bytes: 8 * 1024,
            max_header_bytes: 64 * 1024,
            max_headers: 100,
        }
    }
}

impl From<&DecoderSettings> for DecoderLimits {
    fn from(settings: &DecoderSettings) -> Self {
        Self {
            max_start_line_bytes: settings.max_start_line_bytes,
            max_header_bytes: settings.max_header_bytes,
            max_headers: settings.max_headers,
        }
    }
}

/// A message whose start line has been parsed
#[derive(Debug)]
struct Message {
    start_line: StartLine,
    headers: HeaderMap,
    body: BodyLength,
    body_bytes: u64,
    ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
    Fixed { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkEnd,
    Trailers,
    UntilClose,
}

#[derive(Debug)]
enum State {
    /// Waiting for a start line; in resync mode lines that are not start
    /// lines are skipped instead of failing the stream
    AwaitingStartLine { resync: bool },
    ParsingHeaders(Message),
    ParsingBody(Message, Body),
    Abandoned,
}

enum Step {
    Continue,
    NeedMore,
}

/// Decoder for one direction of one flow
pub struct HttpStreamDecoder {
    flow: FlowKey,
    direction: Direction,
    limits: DecoderLimits,
    metrics: SharedMetrics,
    state: State,
    /// Unparsed bytes
    buf: Vec<u8>,
    /// Capture time of the first byte in `buf`
    buf_ts: DateTime<Utc>,
    /// Position in `buf` where bytes of the latest `on_data` call begin
    fresh_from: usize,
    error: Option<DecodeError>,
}

impl HttpStreamDecoder {
    pub fn new(
        flow: FlowKey,
        direction: Direction,
        limits: DecoderLimits,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            flow,
            direction,
            limits,
            metrics,
            state: State::AwaitingStartLine { resync: false },
            buf: Vec::new(),
            buf_ts: DateTime::<Utc>::UNIX_EPOCH,
            fresh_from: 0,
            error: None,
        }
    }

    /// The failure that made the decoder give up, if any
    pub fn error(&self) -> Option<&DecodeError> {
        self.error.as_ref()
    }

    fn consume(&mut self, n: usize, ts: DateTime<Utc>) {
        self.buf.drain(..n);
        if n >= self.fresh_from {
            self.fresh_from = 0;
            self.buf_ts = ts;
        } else {
            self.fresh_from -= n;
        }
    }

    fn abandon(&mut self, err: DecodeError) {
        debug!("{} {}: abandoning stream: {}", self.flow, self.direction, err);
        self.metrics
            .pipeline
            .decode_failures
            .fetch_add(1, Ordering::Relaxed);
        self.state = State::Abandoned;
        self.buf = Vec::new();
        self.error = Some(err);
    }

    fn emit(&self, message: Message, truncated: bool, out: &mut Vec<HttpMessageEvent>) {
        let event = HttpMessageEvent::new(self.flow, self.direction, message.start_line, message.ts)
            .with_headers(message.headers)
            .with_body(message.body, message.body_bytes);
        let event = if truncated { event.truncated() } else { event };
        trace!(
            "{} {}: {} {}",
            self.flow,
            self.direction,
            event.event_type(),
            if truncated { "(truncated)" } else { "" }
        );
        out.push(event);
    }

    fn step(&mut self, ts: DateTime<Utc>, out: &mut Vec<HttpMessageEvent>) -> Step {
        match std::mem::replace(&mut self.state, State::Abandoned) {
            State::AwaitingStartLine { resync } => self.start_line(resync, ts),
            State::ParsingHeaders(message) => self.headers(message, ts, out),
            State::ParsingBody(message, body) => self.body(message, body, ts, out),
            State::Abandoned => Step::NeedMore,
        }
    }

    fn start_line(&mut self, resync: bool, ts: DateTime<Utc>) -> Step {
        let Some(newline) = find_newline(&self.buf) else {
            self.state = State::AwaitingStartLine { resync };
            if self.buf.len() > self.limits.max_start_line_bytes {
                if resync {
                    self.buf.clear();
                    self.fresh_from = 0;
                } else {
                    self.abandon(DecodeError::StartLineTooLong(self.limits.max_start_line_bytes));
                }
            }
            return Step::NeedMore;
        };

        let line = trim_cr(&self.buf[..newline]);
        let parsed = if line.is_empty() {
            None
        } else if line.len() > self.limits.max_start_line_bytes {
            Some(Err(DecodeError::StartLineTooLong(
                self.limits.max_start_line_bytes,
            )))
        } else {
            Some(parse_start_line(line))
        };
        let line_ts = self.buf_ts;
        self.consume(newline + 1, ts);

        match parsed {
            // Leading empty lines are skipped
            None => {
                self.state = State::AwaitingStartLine { resync };
                Step::Continue
            }
            Some(Ok(start_line)) => {
                self.state = State::ParsingHeaders(Message {
                    start_line,
                    headers: HeaderMap::new(),
                    body: BodyLength::Empty,
                    body_bytes: 0,
                    ts: line_ts,
                });
                Step::Continue
            }
            Some(Err(err)) if resync => {
                trace!("{} {}: skipping line while resyncing: {}", self.flow, self.direction, err);
                self.state = State::AwaitingStartLine { resync };
                Step::Continue
            }
            Some(Err(err)) => {
                self.abandon(err);
                Step::NeedMore
            }
        }
    }

    fn headers(
        &mut self,
        mut message: Message,
        ts: DateTime<Utc>,
        out: &mut Vec<HttpMessageEvent>,
    ) -> Step {
        let Some(end) = find_header_end(&self.buf) else {
            if self.buf.len() > self.limits.max_header_bytes {
                self.abandon(DecodeError::HeadersTooLarge(self.limits.max_header_bytes));
            } else {
                self.state = State::ParsingHeaders(message);
            }
            return Step::NeedMore;
        };

        if end > self.limits.max_header_bytes {
            self.abandon(DecodeError::HeadersTooLarge(self.limits.max_header_bytes));
            return Step::NeedMore;
        }

        let parsed = parse_header_block(&self.buf[..end], self.limits.max_headers).and_then(
            |headers| body_policy(&message.start_line, &headers).map(|body| (headers, body)),
        );
        let (headers, body) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                self.abandon(err);
                return Step::NeedMore;
            }
        };
        self.consume(end, ts);

        message.headers = headers;
        message.body = body;
        let body_state = match body {
            BodyLength::Empty | BodyLength::ContentLength(0) => {
                self.emit(message, false, out);
                self.state = State::AwaitingStartLine { resync: false };
                return Step::Continue;
            }
            BodyLength::ContentLength(n) => Body::Fixed { remaining: n },
            BodyLength::Chunked => Body::ChunkSize,
            BodyLength::UntilClose => Body::UntilClose,
        };
        self.state = State::ParsingBody(message, body_state);
        Step::Continue
    }

    fn body(
        &mut self,
        mut message: Message,
        body: Body,
        ts: DateTime<Utc>,
        out: &mut Vec<HttpMessageEvent>,
    ) -> Step {
        let next = match body {
            Body::Fixed { remaining } | Body::ChunkData { remaining } => {
                if self.buf.is_empty() {
                    self.state = State::ParsingBody(message, body);
                    return Step::NeedMore;
                }
                let take = remaining.min(self.buf.len() as u64);
                message.body_bytes += take;
                self.consume(take as usize, ts);

                match (body, remaining - take) {
                    (Body::Fixed { .. }, 0) => {
                        self.emit(message, false, out);
                        self.state = State::AwaitingStartLine { resync: false };
                        return Step::Continue;
                    }
                    (Body::Fixed { .. }, left) => Body::Fixed { remaining: left },
                    (_, 0) => Body::ChunkEnd,
                    (_, left) => Body::ChunkData { remaining: left },
                }
            }
            Body::UntilClose => {
                message.body_bytes += self.buf.len() as u64;
                let n = self.buf.len();
                self.consume(n, ts);
                self.state = State::ParsingBody(message, body);
                return Step::NeedMore;
            }
            Body::ChunkSize | Body::ChunkEnd | Body::Trailers => {
                let Some(newline) = find_newline(&self.buf) else {
                    let budget = match body {
                        Body::ChunkEnd => 2,
                        Body::Trailers => self.limits.max_header_bytes,
                        _ => self.limits.max_start_line_bytes,
                    };
                    if self.buf.len() > budget {
                        self.abandon(DecodeError::MalformedChunk(
                            "chunk framing line too long".to_string(),
                        ));
                    } else {
                        self.state = State::ParsingBody(message, body);
                    }
                    return Step::NeedMore;
                };
                let line = trim_cr(&self.buf[..newline]);

                let next = match body {
                    Body::ChunkSize => match parse_chunk_size(line) {
                        Ok(0) => Body::Trailers,
                        Ok(size) => Body::ChunkData { remaining: size },
                        Err(err) => {
                            self.abandon(err);
                            return Step::NeedMore;
                        }
                    },
                    Body::ChunkEnd if line.is_empty() => Body::ChunkSize,
                    Body::ChunkEnd => {
                        self.abandon(DecodeError::MalformedChunk(
                            "missing CRLF after chunk data".to_string(),
                        ));
                        return Step::NeedMore;
                    }
                    _ if line.is_empty() => {
                        self.consume(newline + 1, ts);
                        self.emit(message, false, out);
                        self.state = State::AwaitingStartLine { resync: false };
                        return Step::Continue;
                    }
                    // Trailer fields are skipped
                    _ => Body::Trailers,
                };
                self.consume(newline + 1, ts);
                next
            }
        };

        self.state = State::ParsingBody(message, next);
        Step::Continue
    }
}

impl StreamDecoder for HttpStreamDecoder {
    fn on_data(&mut self, data: &[u8], ts: DateTime<Utc>, out: &mut Vec<HttpMessageEvent>) {
        if matches!(self.state, State::Abandoned) {
            return;
        }
        if self.buf.is_empty() {
            self.buf_ts = ts;
        }
        self.fresh_from = self.buf.len();
        self.buf.extend_from_slice(data);

        while let Step::Continue = self.step(ts, out) {}
    }

    fn on_gap(&mut self, out: &mut Vec<HttpMessageEvent>) {
        match std::mem::replace(&mut self.state, State::AwaitingStartLine { resync: true }) {
            State::ParsingHeaders(message) | State::ParsingBody(message, _) => {
                self.emit(message, true, out);
            }
            State::AwaitingStartLine { .. } => {}
            State::Abandoned => {
                self.state = State::Abandoned;
                return;
            }
        }
        trace!("{} {}: gap, resyncing", self.flow, self.direction);
        self.buf.clear();
        self.fresh_from = 0;
    }

    fn on_end(&mut self, reason: EndReason, out: &mut Vec<HttpMessageEvent>) {
        match std::mem::replace(&mut self.state, State::AwaitingStartLine { resync: false }) {
            State::ParsingBody(message, Body::UntilClose) => self.emit(message, false, out),
            State::ParsingHeaders(message) | State::ParsingBody(message, _) => {
                debug!(
                    "{} {}: stream ended ({:?}) mid-message",
                    self.flow, self.direction, reason
                );
                self.emit(message, true, out);
            }
            State::AwaitingStartLine { .. } => {}
            State::Abandoned => self.state = State::Abandoned,
        }
        self.buf = Vec::new();
        self.fresh_from = 0;
    }

    fn is_abandoned(&self) -> bool {
        matches!(self.state, State::Abandoned)
    }
}

fn find_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Index just past the blank line ending a header block
fn find_header_end(buf: &[u8]) -> Option<usize> {
    let mut pos = 0;
    while let Some(offset) = find_newline(&buf[pos..]) {
        let line = trim_cr(&buf[pos..pos + offset]);
        pos += offset + 1;
        if line.is_empty() {
            return Some(pos);
        }
    }
    None
}

/// Creates an [`HttpStreamDecoder`] for every flow direction
pub struct HttpDecoderFactory {
    limits: DecoderLimits,
    metrics: SharedMetrics,
}

impl HttpDecoderFactory {
    pub fn new(limits: DecoderLimits, metrics: SharedMetrics) -> Self {
        Self { limits, metrics }
    }
}

impl PluginInfo for HttpDecoderFactory {
    fn name(&self) -> &str {
        "http"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "HTTP/1.x request and response boundary decoder"
    }
}

impl DecoderFactory for HttpDecoderFactory {
    fn create(&self, flow: &FlowKey, direction: Direction) -> Box<dyn StreamDecoder> {
        Box::new(HttpStreamDecoder::new(
            *flow,
            direction,
            self.limits.clone(),
            self.metrics.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtap_core::{create_metrics, MessageKind, Protocol};

    fn flow() -> FlowKey {
        FlowKey {
            protocol: Protocol::Tcp,
            lower: "10.0.0.1:40000".parse().unwrap(),
            higher: "10.0.0.2:80".parse().unwrap(),
        }
    }

    fn decoder() -> HttpStreamDecoder {
        HttpStreamDecoder::new(
            flow(),
            Direction::ClientToServer,
            DecoderLimits::default(),
            create_metrics(),
        )
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(secs)
    }

    fn feed_all(decoder: &mut HttpStreamDecoder, chunks: &[&[u8]]) -> Vec<HttpMessageEvent> {
        let mut out = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            decoder.on_data(chunk, at(i as i64), &mut out);
        }
        out
    }

    #[test]
    fn test_request_split_at_every_point() {
        let request = b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n";
        for split in 1..request.len() {
            let mut decoder = decoder();
            let out = feed_all(&mut decoder, &[&request[..split], &request[split..]]);

            assert_eq!(out.len(), 1, "split at {}", split);
            assert_eq!(out[0].method(), Some("GET"));
            assert_eq!(out[0].target(), Some("/x"));
            assert_eq!(out[0].header("Host"), Some("a"));
            assert_eq!(out[0].body, BodyLength::Empty);
            assert_eq!(out[0].ts, at(0));
        }
    }

    #[test]
    fn test_request_byte_by_byte() {
        let request = b"POST /submit HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc";
        let chunks: Vec<&[u8]> = request.chunks(1).collect();
        let mut decoder = decoder();
        let out = feed_all(&mut decoder, &chunks);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].body, BodyLength::ContentLength(3));
        assert_eq!(out[0].body_bytes, 3);
        assert!(!out[0].truncated);
    }

    #[test]
    fn test_pipelined_requests() {
        let stream = b"GET /1 HTTP/1.1\r\n\r\nPOST /2 HTTP/1.1\r\nContent-Length: 2\r\n\r\nokGET /3 HTTP/1.1\r\n\r\n";
        let mut decoder = decoder();
        let out = feed_all(&mut decoder, &[stream]);

        let targets: Vec<_> = out.iter().filter_map(|e| e.target()).collect();
        assert_eq!(targets, vec!["/1", "/2", "/3"]);
        assert_eq!(out[1].body_bytes, 2);
    }

    #[test]
    fn test_message_timestamp_is_first_byte() {
        let mut decoder = decoder();
        let out = feed_all(
            &mut decoder,
            &[b"GET /1 HTTP/1.1\r\n\r\nGE", b"T /2 HTTP/1.1\r\n", b"\r\n"],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].ts, at(0));
        assert_eq!(out[1].ts, at(0));

        let out = feed_all(&mut decoder, &[b"", b"GET /3 HTTP/1.1\r\n\r\n"]);
        assert_eq!(out[0].ts, at(1));
    }

    #[test]
    fn test_chunked_response() {
        let response: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
            5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: yes\r\n\r\n\
            HTTP/1.1 204 No Content\r\n\r\n";
        for size in [1, 3, 7, response.len()] {
            let chunks: Vec<&[u8]> = response.chunks(size).collect();
            let mut decoder = decoder();
            let out = feed_all(&mut decoder, &chunks);

            assert_eq!(out.len(), 2, "chunks of {}", size);
            assert_eq!(out[0].body, BodyLength::Chunked);
            assert_eq!(out[0].body_bytes, 11);
            assert_eq!(out[0].kind, MessageKind::Response);
            assert_eq!(out[1].status(), Some(204));
        }
    }

    #[test]
    fn test_until_close_body_completes_on_end() {
        let mut decoder = decoder();
        let mut out = feed_all(&mut decoder, &[b"HTTP/1.0 200 OK\r\n\r\nsome ", b"body"]);
        assert!(out.is_empty());

        decoder.on_end(EndReason::Closed, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].body, BodyLength::UntilClose);
        assert_eq!(out[0].body_bytes, 9);
        assert!(!out[0].truncated);
    }

    #[test]
    fn test_leading_empty_lines_skipped() {
        let mut decoder = decoder();
        let out = feed_all(&mut decoder, &[b"\r\n\r\nGET / HTTP/1.1\r\n\r\n"]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_malformed_start_line_abandons_stream() {
        let metrics = create_metrics();
        let mut decoder = HttpStreamDecoder::new(
            flow(),
            Direction::ClientToServer,
            DecoderLimits::default(),
            metrics.clone(),
        );
        let out = feed_all(
            &mut decoder,
            &[b"SSH-2.0-OpenSSH_9.6\r\n", b"GET / HTTP/1.1\r\n\r\n"],
        );

        assert!(out.is_empty());
        assert!(decoder.is_abandoned());
        assert!(matches!(decoder.error(), Some(DecodeError::MalformedStartLine(_))));
        assert_eq!(metrics.pipeline.decode_failures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_start_line_budget() {
        let limits = DecoderLimits {
            max_start_line_bytes: 16,
            ..Default::default()
        };
        let mut decoder =
            HttpStreamDecoder::new(flow(), Direction::ClientToServer, limits, create_metrics());
        let out = feed_all(&mut decoder, &[&[0x16; 17][..]]);

        assert!(out.is_empty());
        assert!(matches!(decoder.error(), Some(DecodeError::StartLineTooLong(16))));
    }

    #[test]
    fn test_header_budget() {
        let limits = DecoderLimits {
            max_header_bytes: 32,
            ..Default::default()
        };
        let mut decoder =
            HttpStreamDecoder::new(flow(), Direction::ClientToServer, limits, create_metrics());
        let out = feed_all(
            &mut decoder,
            &[b"GET / HTTP/1.1\r\n", b"X-Long: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"],
        );

        assert!(out.is_empty());
        assert!(matches!(decoder.error(), Some(DecodeError::HeadersTooLarge(32))));
    }

    #[test]
    fn test_gap_mid_body_emits_truncated_and_resyncs() {
        let mut decoder = decoder();
        let mut out = feed_all(
            &mut decoder,
            &[b"POST /up HTTP/1.1\r\nContent-Length: 100\r\n\r\npartial"],
        );
        decoder.on_gap(&mut out);

        assert_eq!(out.len(), 1);
        assert!(out[0].truncated);
        assert_eq!(out[0].body_bytes, 7);

        // Remainder of the lost body is skipped until the next start line
        decoder.on_data(b"ody tail\r\nGET /next HTTP/1.1\r\n\r\n", at(5), &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].target(), Some("/next"));
        assert!(!out[1].truncated);
        assert!(!decoder.is_abandoned());
    }

    #[test]
    fn test_gap_before_start_line_emits_nothing() {
        let mut decoder = decoder();
        let mut out = feed_all(&mut decoder, &[b"GET /half"]);
        decoder.on_gap(&mut out);
        decoder.on_data(b"garbage\r\nHTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", at(1), &mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].status(), Some(200));
    }

    #[test]
    fn test_end_mid_headers_emits_truncated() {
        let mut decoder = decoder();
        let mut out = feed_all(&mut decoder, &[b"GET /slow HTTP/1.1\r\nHost: a\r\n"]);
        decoder.on_end(EndReason::Flushed, &mut out);

        assert_eq!(out.len(), 1);
        assert!(out[0].truncated);
        assert_eq!(out[0].target(), Some("/slow"));
    }

    #[test]
    fn test_end_mid_fixed_body_emits_truncated() {
        let mut decoder = decoder();
        let mut out = feed_all(
            &mut decoder,
            &[b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n12345"],
        );
        decoder.on_end(EndReason::Reset, &mut out);

        assert_eq!(out.len(), 1);
        assert!(out[0].truncated);
        assert_eq!(out[0].body_bytes, 5);
    }

    #[test]
    fn test_end_with_partial_start_line_emits_nothing() {
        let mut decoder = decoder();
        let mut out = feed_all(&mut decoder, &[b"GET /x HT"]);
        decoder.on_end(EndReason::Closed, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_factory_creates_independent_decoders() {
        let factory = HttpDecoderFactory::new(DecoderLimits::default(), create_metrics());
        let mut a = factory.create(&flow(), Direction::ClientToServer);
        let mut b = factory.create(&flow(), Direction::ServerToClient);
        let mut out = Vec::new();

        a.on_data(b"GET /a HTTP/1.1\r\n", at(0), &mut out);
        b.on_data(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", at(0), &mut out);
        a.on_data(b"\r\n", at(1), &mut out);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].direction, Direction::ServerToClient);
        assert_eq!(out[1].direction, Direction::ClientToServer);
        assert_eq!(factory.name(), "http");
    }
}
