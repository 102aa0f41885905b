//! libpcap-backed frame sources (live interface or trace file)

use crate::filter::CaptureFilter;
use crate::source::{Frame, FrameSource, LinkType, Next};
use crate::CaptureError;
use chrono::{DateTime, Utc};
use pcap::{Activated, Active, Capture, Device, Offline};
use serde::Serialize;
use std::net::IpAddr;
use std::path::Path;
use tracing::info;

/// Live capture parameters
#[derive(Debug, Clone)]
pub struct LiveOptions {
    pub promiscuous: bool,
    pub snaplen: i32,
    pub read_timeout_ms: i32,
}

impl Default for LiveOptions {
    fn default() -> Self {
        Self {
            promiscuous: true,
            snaplen: 262_144,
            read_timeout_ms: 500,
        }
    }
}

enum Handle {
    Live(Capture<Active>),
    Offline(Capture<Offline>),
}

/// Frame source over a libpcap handle
pub struct PcapSource {
    handle: Handle,
    link_type: LinkType,
    label: String,
}

impl PcapSource {
    /// Open an interface for live capture and apply `filter`
    pub fn open_live(
        interface: &str,
        options: &LiveOptions,
        filter: &CaptureFilter,
    ) -> Result<Self, CaptureError> {
        let device = Device::list()
            .map_err(|e| CaptureError::open(interface, e))?
            .into_iter()
            .find(|d| d.name == interface)
            .ok_or_else(|| CaptureError::InterfaceNotFound(interface.to_string()))?;

        let mut cap = Capture::from_device(device)
            .map_err(|e| CaptureError::open(interface, e))?
            .promisc(options.promiscuous)
            .snaplen(options.snaplen)
            .timeout(options.read_timeout_ms)
            .open()
            .map_err(|e| CaptureError::open(interface, e))?;
        filter.apply(&mut cap)?;

        let link_type = LinkType::from_dlt(cap.get_datalink().0);
        info!(
            "Capturing on {} (filter {:?}, {:?})",
            interface,
            filter.expression(),
            link_type
        );
        Ok(Self {
            handle: Handle::Live(cap),
            link_type,
            label: format!("interface {}", interface),
        })
    }

    /// Open a stored trace file and apply `filter`
    pub fn open_file(path: &Path, filter: &CaptureFilter) -> Result<Self, CaptureError> {
        let target = path.display().to_string();
        let mut cap = Capture::from_file(path).map_err(|e| CaptureError::open(&target, e))?;
        filter.apply(&mut cap)?;

        let link_type = LinkType::from_dlt(cap.get_datalink().0);
        info!(
            "Replaying {} (filter {:?}, {:?})",
            target,
            filter.expression(),
            link_type
        );
        Ok(Self {
            handle: Handle::Offline(cap),
            link_type,
            label: format!("file {}", target),
        })
    }
}

fn read<T: Activated + ?Sized>(
    cap: &mut Capture<T>,
    link_type: LinkType,
) -> Result<Next, CaptureError> {
    match cap.next_packet() {
        Ok(packet) => {
            let ts = packet.header.ts;
            Ok(Next::Frame(Frame {
                timestamp: frame_timestamp(ts.tv_sec as i64, ts.tv_usec as i64),
                data: packet.data.to_vec(),
                link_type,
            }))
        }
        Err(pcap::Error::TimeoutExpired) => Ok(Next::Timeout),
        Err(pcap::Error::NoMorePackets) => Ok(Next::End),
        Err(e) => Err(CaptureError::Read(e)),
    }
}

/// Capture time of a record header; out-of-range values fall back to the epoch
fn frame_timestamp(secs: i64, micros: i64) -> DateTime<Utc> {
    u32::try_from(micros)
        .ok()
        .and_then(|us| us.checked_mul(1000))
        .and_then(|nanos| DateTime::<Utc>::from_timestamp(secs, nanos))
        .unwrap_or_default()
}

impl FrameSource for PcapSource {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn next_frame(&mut self) -> Result<Next, CaptureError> {
        match &mut self.handle {
            Handle::Live(cap) => read(cap, self.link_type),
            Handle::Offline(cap) => read(cap, self.link_type),
        }
    }
}

/// A capture device as reported by libpcap
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub description: Option<String>,
    pub addresses: Vec<IpAddr>,
}

/// List devices available for live capture
pub fn list_interfaces() -> Result<Vec<InterfaceInfo>, CaptureError> {
    let devices = Device::list().map_err(|e| CaptureError::open("device list", e))?;
    Ok(devices
        .into_iter()
        .map(|d| InterfaceInfo {
            addresses: d.addresses.iter().map(|a| a.addr).collect(),
            name: d.name,
            description: d.desc,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_timestamp() {
        let ts = frame_timestamp(1_700_000_000, 250);
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_micros(), 250);
    }

    #[test]
    fn test_corrupt_frame_timestamp_falls_back() {
        assert_eq!(frame_timestamp(1, 5_000_000), DateTime::<Utc>::default());
        assert_eq!(frame_timestamp(1, -1), DateTime::<Utc>::default());
    }
}
