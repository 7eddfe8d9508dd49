pub mod dns;

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use thiserror::Error;

/// Reserved protocol number for transports the classifier does not decode.
/// Packets carrying it never reach the aggregation fabric.
pub const UNHANDLED_TRANSPORT: u8 = 255;

/// Transport-level flow identity in observed direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl FiveTuple {
    /// The same flow with source and destination swapped.
    pub fn reverse(&self) -> FiveTuple {
        FiveTuple {
            src: self.dst,
            dst: self.src,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }

    /// The ordered representative of `{self, self.reverse()}`.
    ///
    /// Orders by network endpoint, so both directions of a bidirectional flow
    /// key the same aggregator. Loopback (src == dst) breaks the tie on the
    /// transport ports.
    pub fn canonical(&self) -> FiveTuple {
        if self.src == self.dst {
            if self.src_port <= self.dst_port {
                *self
            } else {
                self.reverse()
            }
        } else if self.src < self.dst {
            *self
        } else {
            self.reverse()
        }
    }

    /// True if `other` is the same bidirectional flow.
    pub fn same_bidirectional_flow(&self, other: &FiveTuple) -> bool {
        self.canonical() == other.canonical()
    }
}

impl std::fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} > {}:{} proto={}",
            self.src, self.src_port, self.dst, self.dst_port, self.protocol
        )
    }
}

/// Link framing of the capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Point-to-point tunnel device carrying bare IP.
    Tunnel,
    /// Anything with a link header. Not supported for accounting.
    Ethernet,
}

#[derive(Debug, Error)]
pub enum PacketParseError {
    #[error("link layer is not a point-to-point tunnel")]
    UnsupportedLinkLayer,
    #[error("packet truncated or corrupt")]
    Malformed,
    #[error("no decodable transport layer")]
    UnhandledTransport,
}

/// One classified packet: the flow it belongs to, the bytes it carries, and
/// an extracted DNS response when the payload held one.
#[derive(Debug)]
pub struct PacketInfo {
    pub tuple: FiveTuple,
    /// Network-layer payload length (transport header included).
    pub payload_length: u16,
    pub dns: Option<dns::DnsResponseRecord>,
}

/// Decode one captured frame into a [`PacketInfo`].
///
/// Frames from non-tunnel link layers and packets without a TCP or UDP
/// transport are rejected; the caller decides how loudly to drop them.
pub fn parse_frame(link: LinkKind, data: &[u8]) -> Result<PacketInfo, PacketParseError> {
    match link {
        LinkKind::Ethernet => Err(PacketParseError::UnsupportedLinkLayer),
        LinkKind::Tunnel => parse_ip(data),
    }
}

fn parse_ip(data: &[u8]) -> Result<PacketInfo, PacketParseError> {
    match data.first().map(|b| b >> 4) {
        Some(4) => parse_ipv4(data),
        Some(6) => parse_ipv6(data),
        _ => Err(PacketParseError::Malformed),
    }
}

fn parse_ipv4(data: &[u8]) -> Result<PacketInfo, PacketParseError> {
    let header = Ipv4Packet::new(data).ok_or(PacketParseError::Malformed)?;
    let header_bytes = u16::from(header.get_header_length()) * 4;
    if header_bytes < 20 {
        return Err(PacketParseError::Malformed);
    }
    // IPv4 does not carry the payload length directly.
    let payload_length = header
        .get_total_length()
        .checked_sub(header_bytes)
        .ok_or(PacketParseError::Malformed)?;
    parse_transport(
        IpAddr::V4(header.get_source()),
        IpAddr::V4(header.get_destination()),
        payload_length,
        header.get_next_level_protocol().0,
        header.payload(),
    )
}

fn parse_ipv6(data: &[u8]) -> Result<PacketInfo, PacketParseError> {
    let header = Ipv6Packet::new(data).ok_or(PacketParseError::Malformed)?;
    parse_transport(
        IpAddr::V6(header.get_source()),
        IpAddr::V6(header.get_destination()),
        header.get_payload_length(),
        header.get_next_header().0,
        header.payload(),
    )
}

fn parse_transport(
    src: IpAddr,
    dst: IpAddr,
    payload_length: u16,
    protocol: u8,
    payload: &[u8],
) -> Result<PacketInfo, PacketParseError> {
    if payload.len() < payload_length as usize {
        return Err(PacketParseError::Malformed);
    }
    let payload = &payload[..payload_length as usize];

    match protocol {
        p if p == IpNextHeaderProtocols::Tcp.0 => {
            let tcp = TcpPacket::new(payload).ok_or(PacketParseError::Malformed)?;
            Ok(PacketInfo {
                tuple: FiveTuple {
                    src,
                    dst,
                    src_port: tcp.get_source(),
                    dst_port: tcp.get_destination(),
                    protocol,
                },
                payload_length,
                dns: None,
            })
        }
        p if p == IpNextHeaderProtocols::Udp.0 => {
            let udp = UdpPacket::new(payload).ok_or(PacketParseError::Malformed)?;
            let tuple = FiveTuple {
                src,
                dst,
                src_port: udp.get_source(),
                dst_port: udp.get_destination(),
                protocol,
            };

            // Authoritative answers come from port 53. Anything that does not
            // parse as a well-formed single-question response is not an error
            // worth failing the packet over.
            let dns = if tuple.src_port == dns::DNS_PORT {
                match dns::parse_response(udp.payload(), tuple) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        tracing::debug!("discarding DNS candidate from {}: {}", tuple.src, e);
                        None
                    }
                }
            } else {
                None
            };

            Ok(PacketInfo {
                tuple,
                payload_length,
                dns,
            })
        }
        _ => Err(PacketParseError::UnhandledTransport),
    }
}

/// Deployment-scoped predicates splitting addresses into subscriber, local,
/// and external space.
#[derive(Debug, Clone)]
pub struct AddressClassifier {
    user_subnet: IpNet,
    ignored_user_addresses: HashSet<IpAddr>,
}

impl AddressClassifier {
    pub fn new(user_subnet: IpNet, ignored_user_addresses: HashSet<IpAddr>) -> Self {
        Self {
            user_subnet,
            ignored_user_addresses,
        }
    }

    /// True for addresses billed as subscribers: inside the subscriber CIDR
    /// and not one of the infrastructure addresses carved out of it.
    pub fn is_user(&self, addr: IpAddr) -> bool {
        self.user_subnet.contains(&addr) && !self.ignored_user_addresses.contains(&addr)
    }

    /// True for endpoints that never cross the backhaul: RFC 1918 space and
    /// anything not globally routable unicast.
    pub fn is_local(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => {
                v4.is_private()
                    || v4.is_loopback()
                    || v4.is_link_local()
                    || v4.is_broadcast()
                    || v4.is_multicast()
                    || v4.is_unspecified()
            }
            IpAddr::V6(v6) => {
                // Unique-local fc00::/7 and link-local fe80::/10.
                (v6.segments()[0] & 0xfe00) == 0xfc00
                    || (v6.segments()[0] & 0xffc0) == 0xfe80
                    || v6.is_loopback()
                    || v6.is_multicast()
                    || v6.is_unspecified()
            }
        }
    }
}
