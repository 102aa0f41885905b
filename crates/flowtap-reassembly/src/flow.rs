//! Flow key resolution

use flowtap_core::{Direction, FlowKey, Protocol, TcpSegment};

/// Derive the direction-independent key and the direction of travel for a segment.
///
/// The smaller socket address anchors the key; traffic it sends is
/// [`Direction::ClientToServer`].
pub fn resolve(segment: &TcpSegment) -> (FlowKey, Direction) {
    if segment.source <= segment.destination {
        (
            FlowKey {
                protocol: Protocol::Tcp,
                lower: segment.source,
                higher: segment.destination,
            },
            Direction::ClientToServer,
        )
    } else {
        (
            FlowKey {
                protocol: Protocol::Tcp,
                lower: segment.destination,
                higher: segment.source,
            },
            Direction::ServerToClient,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowtap_core::TcpFlags;

    fn segment(src: &str, dst: &str) -> TcpSegment {
        TcpSegment {
            source: src.parse().unwrap(),
            destination: dst.parse().unwrap(),
            seq: 0,
            flags: TcpFlags::default(),
            payload: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_both_directions_share_a_key() {
        let (a, dir_a) = resolve(&segment("10.0.0.1:51000", "10.0.0.2:80"));
        let (b, dir_b) = resolve(&segment("10.0.0.2:80", "10.0.0.1:51000"));

        assert_eq!(a, b);
        assert_eq!(dir_a, Direction::ClientToServer);
        assert_eq!(dir_b, Direction::ServerToClient);
        assert_eq!(a.lower, "10.0.0.1:51000".parse().unwrap());
    }

    #[test]
    fn test_port_breaks_address_ties() {
        let (key, dir) = resolve(&segment("10.0.0.1:8080", "10.0.0.1:443"));
        assert_eq!(key.lower.port(), 443);
        assert_eq!(dir, Direction::ServerToClient);
    }

    #[test]
    fn test_ipv6_endpoints() {
        let (key, dir) = resolve(&segment("[2001:db8::2]:80", "[2001:db8::1]:40000"));
        assert_eq!(key.lower, "[2001:db8::1]:40000".parse().unwrap());
        assert_eq!(dir, Direction::ServerToClient);
    }
}
