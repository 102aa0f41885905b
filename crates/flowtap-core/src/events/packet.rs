//! Classified transport segments

use chrono::{DateTime, Utc};
use std::net::SocketAddr;

/// TCP control flags relevant to reassembly
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub ack: bool,
}

/// One TCP segment extracted from a captured frame
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub source: SocketAddr,
    pub destination: SocketAddr,

    /// Sequence number of the first payload byte (or of the SYN itself)
    pub seq: u32,

    pub flags: TcpFlags,

    pub payload: Vec<u8>,

    /// Capture timestamp of the carrying frame
    pub timestamp: DateTime<Utc>,
}
