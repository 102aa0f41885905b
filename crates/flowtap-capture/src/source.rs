//! Frame sources

use crate::CaptureError;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Link-layer framing of captured frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// Bare IPv4/IPv6 packets
    RawIp,
    /// Linux cooked capture v1
    LinuxSll,
    /// Linux cooked capture v2
    LinuxSll2,
    /// BSD loopback, 4-byte address family header
    Null,
    Unsupported(i32),
}

impl LinkType {
    /// Map a libpcap DLT value
    pub fn from_dlt(dlt: i32) -> Self {
        match dlt {
            1 => LinkType::Ethernet,
            12 | 14 | 101 | 228 | 229 => LinkType::RawIp,
            113 => LinkType::LinuxSll,
            276 => LinkType::LinuxSll2,
            0 | 108 => LinkType::Null,
            other => LinkType::Unsupported(other),
        }
    }
}

/// One captured link-layer frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
    pub link_type: LinkType,
}

/// Result of polling a source
#[derive(Debug)]
pub enum Next {
    Frame(Frame),
    /// Nothing arrived within the read timeout
    Timeout,
    /// The source is exhausted
    End,
}

/// Blocking producer of frames, drained on a dedicated reader thread
pub trait FrameSource: Send {
    /// Human-readable description for logs
    fn describe(&self) -> String;

    fn next_frame(&mut self) -> Result<Next, CaptureError>;
}

/// Replays frames held in memory
pub struct MemorySource {
    frames: VecDeque<Frame>,
}

impl MemorySource {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }
}

impl FrameSource for MemorySource {
    fn describe(&self) -> String {
        format!("memory ({} frames)", self.frames.len())
    }

    fn next_frame(&mut self) -> Result<Next, CaptureError> {
        Ok(match self.frames.pop_front() {
            Some(frame) => Next::Frame(frame),
            None => Next::End,
        })
    }
}
