//! Synthetic traffic
//!
//! Builds well-formed Ethernet frames for scripted TCP conversations. Used by
//! the `demo` command and by tests to drive the full pipeline without a
//! capture device.

use crate::source::{Frame, LinkType};
use crate::CaptureError;
use chrono::{DateTime, Duration, Utc};
use etherparse::PacketBuilder;
use flowtap_core::TcpFlags;
use std::net::{IpAddr, SocketAddr};

const CLIENT_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
const SERVER_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];
const WINDOW: u16 = 65_535;

/// Which side of a conversation sends a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Scripted TCP conversation between one client and one server
#[derive(Debug, Clone)]
pub struct Conversation {
    client: SocketAddr,
    server: SocketAddr,
    /// Next sequence number per side
    client_seq: u32,
    server_seq: u32,
    clock: DateTime<Utc>,
    tick: Duration,
    frames: Vec<Frame>,
}

impl Conversation {
    pub fn new(client: SocketAddr, server: SocketAddr, start: DateTime<Utc>) -> Self {
        Self {
            client,
            server,
            client_seq: 1_000,
            server_seq: 50_000,
            clock: start,
            tick: Duration::milliseconds(1),
            frames: Vec::new(),
        }
    }

    /// Initial sequence numbers (the SYN's own sequence number)
    pub fn with_isns(mut self, client: u32, server: u32) -> Self {
        self.client_seq = client;
        self.server_seq = server;
        self
    }

    /// Capture-time spacing between consecutive frames
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Current capture clock
    pub fn clock(&self) -> DateTime<Utc> {
        self.clock
    }

    /// Advance the capture clock without sending anything
    pub fn idle(&mut self, duration: Duration) -> &mut Self {
        self.clock += duration;
        self
    }

    /// SYN, SYN-ACK, ACK
    pub fn handshake(&mut self) -> Result<&mut Self, CaptureError> {
        let syn = TcpFlags {
            syn: true,
            ..Default::default()
        };
        let syn_ack = TcpFlags {
            syn: true,
            ack: true,
            ..Default::default()
        };
        self.send(Side::Client, syn, &[])?;
        self.client_seq = self.client_seq.wrapping_add(1);
        self.send(Side::Server, syn_ack, &[])?;
        self.server_seq = self.server_seq.wrapping_add(1);
        self.send(Side::Client, ack(), &[])?;
        Ok(self)
    }

    /// Send `payload` from `side`, split into segments of at most `mss` bytes
    pub fn send_data(
        &mut self,
        side: Side,
        payload: &[u8],
        mss: usize,
    ) -> Result<&mut Self, CaptureError> {
        for chunk in payload.chunks(mss.max(1)) {
            let flags = TcpFlags {
                ack: true,
                ..Default::default()
            };
            self.send(side, flags, chunk)?;
            self.advance(side, chunk.len());
        }
        Ok(self)
    }

    /// FIN from `side`
    pub fn close(&mut self, side: Side) -> Result<&mut Self, CaptureError> {
        let fin = TcpFlags {
            fin: true,
            ack: true,
            ..Default::default()
        };
        self.send(side, fin, &[])?;
        self.advance(side, 1);
        Ok(self)
    }

    /// RST from `side`
    pub fn reset(&mut self, side: Side) -> Result<&mut Self, CaptureError> {
        let rst = TcpFlags {
            rst: true,
            ..Default::default()
        };
        self.send(side, rst, &[])?;
        Ok(self)
    }

    /// Append one frame at the current sequence number of `side`
    pub fn send(
        &mut self,
        side: Side,
        flags: TcpFlags,
        payload: &[u8],
    ) -> Result<&mut Self, CaptureError> {
        let (src, dst, seq, ack_no) = match side {
            Side::Client => (self.client, self.server, self.client_seq, self.server_seq),
            Side::Server => (self.server, self.client, self.server_seq, self.client_seq),
        };
        let data = tcp_frame(src, dst, seq, ack_no, flags, payload)?;
        self.frames.push(Frame {
            timestamp: self.clock,
            data,
            link_type: LinkType::Ethernet,
        });
        self.clock += self.tick;
        Ok(self)
    }

    fn advance(&mut self, side: Side, n: usize) {
        let seq = match side {
            Side::Client => &mut self.client_seq,
            Side::Server => &mut self.server_seq,
        };
        *seq = seq.wrapping_add(n as u32);
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}

fn ack() -> TcpFlags {
    TcpFlags {
        ack: true,
        ..Default::default()
    }
}

/// Build one Ethernet/IP/TCP frame
pub fn tcp_frame(
    source: SocketAddr,
    destination: SocketAddr,
    seq: u32,
    ack_no: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Result<Vec<u8>, CaptureError> {
    let link = PacketBuilder::ethernet2(CLIENT_MAC, SERVER_MAC);
    let ip = match (source.ip(), destination.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => link.ipv4(src.octets(), dst.octets(), 64),
        (IpAddr::V6(src), IpAddr::V6(dst)) => link.ipv6(src.octets(), dst.octets(), 64),
        _ => {
            return Err(CaptureError::Synthetic(format!(
                "mixed address families {} -> {}",
                source, destination
            )))
        }
    };

    let mut tcp = ip.tcp(source.port(), destination.port(), seq, WINDOW);
    if flags.syn {
        tcp = tcp.syn();
    }
    if flags.fin {
        tcp = tcp.fin();
    }
    if flags.rst {
        tcp = tcp.rst();
    }
    if flags.ack {
        tcp = tcp.ack(ack_no);
    }

    let mut buf = Vec::with_capacity(tcp.size(payload.len()));
    tcp.write(&mut buf, payload)
        .map_err(|e| CaptureError::Synthetic(e.to_string()))?;
    Ok(buf)
}

/// Parameters for the demo traffic generator
#[derive(Debug, Clone)]
pub struct DemoConfig {
    /// Number of client connections
    pub conversations: usize,

    /// Segment size used for request and response bodies
    pub mss: usize,

    /// Capture time of the first frame
    pub start: DateTime<Utc>,

    /// Reorder and duplicate segments on every other connection
    pub disorder: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            conversations: 4,
            mss: 64,
            start: Utc::now(),
            disorder: true,
        }
    }
}

/// Interleaved HTTP conversations exercising pipelining, chunked bodies,
/// reordering, retransmission and an abandoned connection
pub fn demo_traffic(config: &DemoConfig) -> Result<Vec<Frame>, CaptureError> {
    let server: SocketAddr = SocketAddr::from(([93, 184, 216, 34], 80));
    let mut per_connection = Vec::with_capacity(config.conversations);

    for i in 0..config.conversations {
        let client = SocketAddr::from(([192, 168, 1, 10], 50_000 + i as u16));
        let start = config.start + Duration::milliseconds(3 * i as i64);
        let mut conv = Conversation::new(client, server, start).with_isns(
            1_000 + 7_919 * i as u32,
            90_000 + 104_729 * i as u32,
        );
        conv.handshake()?;

        let path = format!("/api/items/{}", i);
        match i % 4 {
            0 => {
                let body = "{\"status\":\"ok\"}";
                conv.send_data(Side::Client, request("GET", &path, "").as_bytes(), config.mss)?
                    .send_data(Side::Server, response(200, body).as_bytes(), config.mss)?
                    .close(Side::Client)?
                    .close(Side::Server)?;
            }
            1 => {
                let pipelined = format!("{}{}", request("GET", &path, ""), request("HEAD", "/health", ""));
                let chunked = "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                    7\r\npartial\r\n6\r\n-data-\r\n0\r\n\r\n\
                    HTTP/1.1 204 No Content\r\n\r\n";
                conv.send_data(Side::Client, pipelined.as_bytes(), config.mss)?
                    .send_data(Side::Server, chunked.as_bytes(), config.mss)?
                    .close(Side::Server)?
                    .close(Side::Client)?;
            }
            2 => {
                let body = "name=flowtap&mode=demo";
                conv.send_data(Side::Client, request("POST", &path, body).as_bytes(), config.mss)?
                    .send_data(Side::Server, response(201, "").as_bytes(), config.mss)?
                    .reset(Side::Client)?;
            }
            _ => {
                // Start line only; the connection then goes quiet
                conv.send_data(
                    Side::Client,
                    format!("GET {} HTTP/1.1\r\nHost: demo.local\r\n", path).as_bytes(),
                    config.mss,
                )?;
            }
        }

        let mut frames = conv.into_frames();
        if config.disorder && i % 2 == 1 {
            disorder(&mut frames);
        }
        per_connection.push(frames);
    }

    let mut frames: Vec<Frame> = per_connection.into_iter().flatten().collect();
    frames.sort_by_key(|f| f.timestamp);
    Ok(frames)
}

/// Swap the first two data frames and retransmit one of them
fn disorder(frames: &mut Vec<Frame>) {
    // Handshake is three frames; keep it in place
    if frames.len() < 5 {
        return;
    }
    let (first, second) = (frames[3].timestamp, frames[4].timestamp);
    frames.swap(3, 4);
    frames[3].timestamp = first;
    frames[4].timestamp = second;
    let retransmit = Frame {
        timestamp: second,
        ..frames[3].clone()
    };
    frames.insert(5, retransmit);
}

fn request(method: &str, path: &str, body: &str) -> String {
    if body.is_empty() {
        format!("{} {} HTTP/1.1\r\nHost: demo.local\r\n\r\n", method, path)
    } else {
        format!(
            "{} {} HTTP/1.1\r\nHost: demo.local\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
            method,
            path,
            body.len(),
            body
        )
    }
}

fn response(status: u16, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        status,
        if status == 201 { "Created" } else { "OK" },
        body.len(),
        body
    )
}
