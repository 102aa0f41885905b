//! Flow identity

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
        }
    }
}

/// Direction-independent identity of one connection.
///
/// `lower` is always the smaller endpoint under the total order of
/// [`SocketAddr`], so both directions of a connection share one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub lower: SocketAddr,
    pub higher: SocketAddr,
}

impl FlowKey {
    /// Source and destination endpoints for traffic travelling in `direction`
    pub fn endpoints(&self, direction: Direction) -> (SocketAddr, SocketAddr) {
        match direction {
            Direction::ClientToServer => (self.lower, self.higher),
            Direction::ServerToClient => (self.higher, self.lower),
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} <-> {}", self.protocol, self.lower, self.higher)
    }
}

/// Direction of travel within a flow.
///
/// `ClientToServer` is traffic sent by the key's lower endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::ClientToServer, Direction::ServerToClient];

    /// Slot of this direction in per-flow arrays
    pub fn index(self) -> usize {
        match self {
            Direction::ClientToServer => 0,
            Direction::ServerToClient => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => f.write_str("c2s"),
            Direction::ServerToClient => f.write_str("s2c"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FlowKey {
        FlowKey {
            protocol: Protocol::Tcp,
            lower: "10.0.0.1:40000".parse().unwrap(),
            higher: "10.0.0.2:80".parse().unwrap(),
        }
    }

    #[test]
    fn test_endpoints_follow_direction() {
        let key = key();
        assert_eq!(key.endpoints(Direction::ClientToServer), (key.lower, key.higher));
        assert_eq!(key.endpoints(Direction::ServerToClient), (key.higher, key.lower));
    }

    #[test]
    fn test_direction_slots() {
        assert_eq!(Direction::ClientToServer.index(), 0);
        assert_eq!(Direction::ServerToClient.index(), 1);
    }

    #[test]
    fn test_flow_key_display() {
        assert_eq!(key().to_string(), "tcp 10.0.0.1:40000 <-> 10.0.0.2:80");
    }
}
