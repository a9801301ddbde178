//! Packet handling module
//!
//! This module defines the unit of work the detection workers inspect.

use std::net::{IpAddr, Ipv4Addr};
use std::time::SystemTime;

/// Protocol types supported by Norx
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    TCP,
    UDP,
    ICMP,
    ICMPv6,
    Unknown(u8),
}

impl From<u8> for Protocol {
    /// IP protocol number
    fn from(protocol: u8) -> Self {
        match protocol {
            6 => Protocol::TCP,
            17 => Protocol::UDP,
            1 => Protocol::ICMP,
            58 => Protocol::ICMPv6,
            other => Protocol::Unknown(other),
        }
    }
}

impl Protocol {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::TCP),
            "udp" => Some(Protocol::UDP),
            "icmp" => Some(Protocol::ICMP),
            "icmpv6" => Some(Protocol::ICMPv6),
            other => other.parse::<u8>().ok().map(Protocol::from),
        }
    }
}

/// Represents a network packet with metadata
#[derive(Debug, Clone)]
pub struct NorxPacket {
    /// Application payload
    pub payload: Vec<u8>,
    /// Normalized request uri, when a protocol parser produced one
    pub uri: Option<Vec<u8>>,
    /// Source IP address
    pub src_ip: IpAddr,
    /// Destination IP address
    pub dst_ip: IpAddr,
    /// Source port (for TCP/UDP)
    pub src_port: Option<u16>,
    /// Destination port (for TCP/UDP)
    pub dst_port: Option<u16>,
    /// Protocol
    pub protocol: Protocol,
    /// Timestamp when the packet was captured
    pub timestamp: SystemTime,
    /// Reassembled stream segment slot, selects a staged match queue
    pub stream_slot: Option<usize>,
    /// Synthetic packet injected by an idle worker
    pub pseudo: bool,
}

impl NorxPacket {
    pub fn builder(protocol: Protocol) -> PacketBuilder {
        PacketBuilder::new(protocol)
    }

    /// An empty packet that runs a worker through one inspection cycle
    pub fn pseudo() -> Self {
        let mut packet: NorxPacket = PacketBuilder::new(Protocol::Unknown(0)).build();
        packet.pseudo = true;
        packet
    }

    /// Parse a replay line: `<proto> <src>[:port] <dst>[:port] [payload]`.
    /// A payload starting with `uri=` up to the first space fills the uri buffer.
    pub fn from_replay_line(line: &str) -> Option<Self> {
        let line: &str = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let mut parts = line.splitn(4, ' ');
        let protocol: Protocol = Protocol::from_name(parts.next()?)?;
        let (src_ip, src_port) = parse_endpoint(parts.next()?)?;
        let (dst_ip, dst_port) = parse_endpoint(parts.next()?)?;
        let rest: &str = parts.next().unwrap_or_default();

        let mut builder: PacketBuilder = PacketBuilder::new(protocol);
        builder.src_ip = src_ip;
        builder.src_port = src_port;
        builder.dst_ip = dst_ip;
        builder.dst_port = dst_port;

        let payload: &str = match rest.strip_prefix("uri=") {
            Some(with_uri) => {
                let (uri, payload) = with_uri.split_once(' ').unwrap_or((with_uri, ""));
                builder = builder.uri(uri.as_bytes());
                payload
            }
            None => rest,
        };

        Some(builder.payload(payload.as_bytes()).build())
    }

    /// Get a tuple of (source IP, source port, destination IP, destination port) for flow tracking
    pub fn flow_tuple(&self) -> (IpAddr, Option<u16>, IpAddr, Option<u16>) {
        (self.src_ip, self.src_port, self.dst_ip, self.dst_port)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

fn parse_endpoint(s: &str) -> Option<(IpAddr, Option<u16>)> {
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Some((ip, None));
    }
    let (ip, port) = s.rsplit_once(':')?;
    let ip: &str = ip.trim_start_matches('[').trim_end_matches(']');
    Some((ip.parse().ok()?, Some(port.parse().ok()?)))
}

/// Builder for synthetic and replayed packets
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    protocol: Protocol,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    src_port: Option<u16>,
    dst_port: Option<u16>,
    payload: Vec<u8>,
    uri: Option<Vec<u8>>,
    stream_slot: Option<usize>,
}

impl PacketBuilder {
    fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: None,
            dst_port: None,
            payload: Vec::new(),
            uri: None,
            stream_slot: None,
        }
    }

    pub fn src(mut self, ip: IpAddr, port: u16) -> Self {
        self.src_ip = ip;
        self.src_port = Some(port);
        self
    }

    pub fn dst(mut self, ip: IpAddr, port: u16) -> Self {
        self.dst_ip = ip;
        self.dst_port = Some(port);
        self
    }

    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn uri(mut self, uri: impl Into<Vec<u8>>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn stream_slot(mut self, slot: usize) -> Self {
        self.stream_slot = Some(slot);
        self
    }

    pub fn build(self) -> NorxPacket {
        NorxPacket {
            payload: self.payload,
            uri: self.uri,
            src_ip: self.src_ip,
            dst_ip: self.dst_ip,
            src_port: self.src_port,
            dst_port: self.dst_port,
            protocol: self.protocol,
            timestamp: SystemTime::now(),
            stream_slot: self.stream_slot,
            pseudo: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_line() {
        let packet: NorxPacket =
            NorxPacket::from_replay_line("tcp 10.0.0.1:40000 10.0.0.2:80 uri=/admin GET /admin HTTP/1.1").unwrap();
        assert_eq!(packet.protocol, Protocol::TCP);
        assert_eq!(packet.dst_port, Some(80));
        assert_eq!(packet.uri.as_deref(), Some(&b"/admin"[..]));
        assert_eq!(packet.payload, b"GET /admin HTTP/1.1".to_vec());

        let icmp: NorxPacket = NorxPacket::from_replay_line("icmp 10.0.0.1 10.0.0.2").unwrap();
        assert_eq!(icmp.src_port, None);
        assert!(icmp.is_empty());

        assert!(NorxPacket::from_replay_line("# comment").is_none());
        assert!(NorxPacket::from_replay_line("tcp nowhere 10.0.0.2:80 x").is_none());
    }

    #[test]
    fn test_protocol_numbers() {
        assert_eq!(Protocol::from(6u8), Protocol::TCP);
        assert_eq!(Protocol::from(47u8), Protocol::Unknown(47));
        assert!(NorxPacket::pseudo().pseudo);
    }
}
