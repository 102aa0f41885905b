//! HTTP message events

use super::flow::{Direction, FlowKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// HTTP message event emitted once per decoded message boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpMessageEvent {
    /// Unique event identifier (ULID)
    pub event_id: String,

    /// Connection this message travelled on
    pub flow: FlowKey,

    pub direction: Direction,

    /// Sender of the message
    pub source: SocketAddr,

    /// Receiver of the message
    pub destination: SocketAddr,

    pub kind: MessageKind,

    pub start_line: StartLine,

    #[serde(default, skip_serializing_if = "HeaderMap::is_empty")]
    pub headers: HeaderMap,

    /// How the message body is delimited
    pub body: BodyLength,

    /// Body bytes actually observed (after dechunking)
    pub body_bytes: u64,

    /// Capture timestamp of the first byte of the message
    pub ts: DateTime<Utc>,

    /// Set when the message was cut short by a gap, flush or close
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

impl HttpMessageEvent {
    /// Create a complete (non-truncated) event with an empty body
    pub fn new(
        flow: FlowKey,
        direction: Direction,
        start_line: StartLine,
        ts: DateTime<Utc>,
    ) -> Self {
        let (source, destination) = flow.endpoints(direction);
        Self {
            event_id: ulid::Ulid::new().to_string(),
            flow,
            direction,
            source,
            destination,
            kind: start_line.kind(),
            start_line,
            headers: HeaderMap::new(),
            body: BodyLength::Empty,
            body_bytes: 0,
            ts,
            truncated: false,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: BodyLength, body_bytes: u64) -> Self {
        self.body = body;
        self.body_bytes = body_bytes;
        self
    }

    pub fn truncated(mut self) -> Self {
        self.truncated = true;
        self
    }

    /// Event type string (`http.request` / `http.response`)
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            MessageKind::Request => "http.request",
            MessageKind::Response => "http.response",
        }
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn target(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { target, .. } => Some(target),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Request { .. } => None,
            StartLine::Response { status, .. } => Some(*status),
        }
    }

    /// First header value with this name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }
}

/// Request or response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
}

/// Parsed HTTP start line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StartLine {
    Request {
        method: String,
        target: String,
        version: String,
    },
    Response {
        version: String,
        status: u16,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        reason: String,
    },
}

impl StartLine {
    pub fn kind(&self) -> MessageKind {
        match self {
            StartLine::Request { .. } => MessageKind::Request,
            StartLine::Response { .. } => MessageKind::Response,
        }
    }

    pub fn version(&self) -> &str {
        match self {
            StartLine::Request { version, .. } | StartLine::Response { version, .. } => version,
        }
    }
}

/// Body length policy derived from the header block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "length", rename_all = "snake_case")]
pub enum BodyLength {
    /// No body (no framing headers on a request, 1xx/204/304 responses)
    Empty,
    ContentLength(u64),
    Chunked,
    /// Response body delimited by connection close
    UntilClose,
}

/// A single header field, as it appeared on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Ordered header list with case-insensitive lookup.
///
/// Duplicate names are kept, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderMap {
    entries: Vec<Header>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// All values for `name`, in wire order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut map = HeaderMap::new();
        for (name, value) in iter {
            map.push(name, value);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Protocol;

    fn flow() -> FlowKey {
        FlowKey {
            protocol: Protocol::Tcp,
            lower: "192.168.1.10:51000".parse().unwrap(),
            higher: "93.184.216.34:80".parse().unwrap(),
        }
    }

    #[test]
    fn test_header_lookup_is_case_insensitive_and_ordered() {
        let headers: HeaderMap = [
            ("Set-Cookie", "a=1"),
            ("Content-Type", "text/plain"),
            ("set-cookie", "b=2"),
        ]
        .into_iter()
        .collect();

        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get_all("SET-COOKIE").collect::<Vec<_>>(), vec!["a=1", "b=2"]);
        assert!(!headers.contains("host"));
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn test_header_value_outlives_lookup_name() {
        let headers: HeaderMap = [("Host", "example.com")].into_iter().collect();
        let host = {
            let name = String::from("HOST");
            headers.get(&name)
        };
        assert_eq!(host, Some("example.com"));
    }

    #[test]
    fn test_event_endpoints_follow_direction() {
        let start = StartLine::Response {
            version: "HTTP/1.1".into(),
            status: 200,
            reason: "OK".into(),
        };
        let event = HttpMessageEvent::new(flow(), Direction::ServerToClient, start, Utc::now());

        assert_eq!(event.kind, MessageKind::Response);
        assert_eq!(event.source, flow().higher);
        assert_eq!(event.destination, flow().lower);
        assert_eq!(event.status(), Some(200));
        assert_eq!(event.method(), None);
        assert_eq!(event.event_type(), "http.response");
    }

    #[test]
    fn test_event_serialization() {
        let start = StartLine::Request {
            method: "GET".into(),
            target: "/x".into(),
            version: "HTTP/1.1".into(),
        };
        let headers: HeaderMap = [("Host", "a")].into_iter().collect();
        let event = HttpMessageEvent::new(flow(), Direction::ClientToServer, start, Utc::now())
            .with_headers(headers)
            .with_body(BodyLength::ContentLength(5), 5);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "request");
        assert_eq!(json["start_line"]["type"], "request");
        assert_eq!(json["start_line"]["method"], "GET");
        assert_eq!(json["headers"][0]["name"], "Host");
        assert_eq!(json["body"]["policy"], "content_length");
        assert_eq!(json["body"]["length"], 5);
        assert!(json.get("truncated").is_none());

        let back: HttpMessageEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.header("host"), Some("a"));
        assert!(!back.truncated);
    }
}
