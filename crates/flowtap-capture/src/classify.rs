//! Frame classification
//!
//! Extracts the TCP segment carried by a frame. Anything that is not
//! complete, unfragmented IPv4/IPv6 TCP yields `None`.

use crate::source::{Frame, LinkType};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use flowtap_core::{TcpFlags, TcpSegment};
use std::net::{IpAddr, SocketAddr};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;

/// Classify one frame
pub fn classify(frame: &Frame) -> Option<TcpSegment> {
    let data = frame.data.as_slice();
    let sliced = match frame.link_type {
        LinkType::Ethernet => SlicedPacket::from_ethernet(data).ok()?,
        LinkType::RawIp => SlicedPacket::from_ip(data).ok()?,
        LinkType::Null => SlicedPacket::from_ip(data.get(4..)?).ok()?,
        LinkType::LinuxSll => cooked(data, 14, 16)?,
        LinkType::LinuxSll2 => cooked(data, 0, 20)?,
        LinkType::Unsupported(_) => return None,
    };

    let (source_ip, destination_ip): (IpAddr, IpAddr) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => (
            ipv4.header().source_addr().into(),
            ipv4.header().destination_addr().into(),
        ),
        Some(NetSlice::Ipv6(ipv6)) => (
            ipv6.header().source_addr().into(),
            ipv6.header().destination_addr().into(),
        ),
        _ => return None,
    };

    // Fragmented payloads carry no transport slice
    let Some(TransportSlice::Tcp(tcp)) = &sliced.transport else {
        return None;
    };

    Some(TcpSegment {
        source: SocketAddr::new(source_ip, tcp.source_port()),
        destination: SocketAddr::new(destination_ip, tcp.destination_port()),
        seq: tcp.sequence_number(),
        flags: TcpFlags {
            syn: tcp.syn(),
            fin: tcp.fin(),
            rst: tcp.rst(),
            ack: tcp.ack(),
        },
        payload: tcp.payload().to_vec(),
        timestamp: frame.timestamp,
    })
}

/// Slice the IP packet behind a Linux cooked header
fn cooked(data: &[u8], protocol_at: usize, header_len: usize) -> Option<SlicedPacket<'_>> {
    let protocol = u16::from_be_bytes([*data.get(protocol_at)?, *data.get(protocol_at + 1)?]);
    match protocol {
        ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => SlicedPacket::from_ip(data.get(header_len..)?).ok(),
        _ => None,
    }
}
