//! Wire formats of the simulated protocol stack: Ethernet, ARP, IPv4, ICMP and TCP.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::device::MacAddr;

/// EtherType of IPv4 payload.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// EtherType of ARP payload.
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// IP protocol number of ICMP.
pub const IPPROTO_ICMP: u8 = 1;
/// IP protocol number of TCP.
pub const IPPROTO_TCP: u8 = 6;
/// IP protocol number of UDP.
pub const IPPROTO_UDP: u8 = 17;

/// Default TTL of packets originated by the stack.
pub const DEFAULT_TTL: u8 = 64;

const ETHERNET_HEADER_LEN: usize = 14;
const ARP_LEN: usize = 28;
const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;
const ICMP_HEADER_LEN: usize = 8;

/// Errors of packet parsing.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// Packet is shorter than its headers claim.
    #[error("truncated {0} packet")]
    Truncated(&'static str),
    /// Checksum verification failed.
    #[error("bad {0} checksum")]
    BadChecksum(&'static str),
    /// Packet uses a feature the stack does not implement.
    #[error("unsupported {0}")]
    Unsupported(&'static str),
}

// Checksum ------------------------------------------------------------------------------------------------------------

/// Incremental computation of the Internet checksum (RFC 1071) over several byte ranges.
#[derive(Default)]
pub struct Checksum {
    sum: u32,
    odd: Option<u8>,
}

impl Checksum {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds bytes to the checksum.
    pub fn add(&mut self, bytes: &[u8]) -> &mut Self {
        let mut bytes = bytes;
        if let Some(hi) = self.odd.take() {
            match bytes.split_first() {
                Some((lo, rest)) => {
                    self.sum += u16::from_be_bytes([hi, *lo]) as u32;
                    bytes = rest;
                }
                None => {
                    self.odd = Some(hi);
                    return self;
                }
            }
        }
        let mut chunks = bytes.chunks_exact(2);
        for chunk in &mut chunks {
            self.sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        }
        if let [last] = chunks.remainder() {
            self.odd = Some(*last);
        }
        self
    }

    /// Returns the one's complement of the folded sum.
    pub fn finish(&self) -> u16 {
        let mut sum = self.sum;
        if let Some(hi) = self.odd {
            sum += (hi as u32) << 8;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }
}

/// Computes the Internet checksum of the bytes.
pub fn internet_checksum(bytes: &[u8]) -> u16 {
    Checksum::new().add(bytes).finish()
}

fn pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: usize) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[0..4].copy_from_slice(&src.octets());
    header[4..8].copy_from_slice(&dst.octets());
    header[9] = protocol;
    header[10..12].copy_from_slice(&(len as u16).to_be_bytes());
    header
}

fn be_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn be_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

fn ipv4_at(bytes: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3])
}

// Ethernet ------------------------------------------------------------------------------------------------------------

/// Ethernet II frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EthernetFrame {
    /// Destination address.
    pub dst: MacAddr,
    /// Source address.
    pub src: MacAddr,
    /// Type of the payload.
    pub ethertype: u16,
    /// Frame payload.
    pub payload: Vec<u8>,
}

impl EthernetFrame {
    /// Creates a frame.
    pub fn new(dst: MacAddr, src: MacAddr, ethertype: u16, payload: Vec<u8>) -> Self {
        Self {
            dst,
            src,
            ethertype,
            payload,
        }
    }

    /// Parses a raw frame.
    pub fn parse(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < ETHERNET_HEADER_LEN {
            return Err(PacketError::Truncated("ethernet"));
        }
        Ok(Self {
            dst: MacAddr::from_slice(&bytes[0..6]),
            src: MacAddr::from_slice(&bytes[6..12]),
            ethertype: be_u16(bytes, 12),
            payload: bytes[ETHERNET_HEADER_LEN..].to_vec(),
        })
    }

    /// Serializes the frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ETHERNET_HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(&self.dst.octets());
        bytes.extend_from_slice(&self.src.octets());
        bytes.extend_from_slice(&self.ethertype.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Returns the destination address of a raw frame.
pub fn frame_dst(frame: &[u8]) -> Option<MacAddr> {
    (frame.len() >= ETHERNET_HEADER_LEN).then(|| MacAddr::from_slice(&frame[0..6]))
}

/// Returns the source address of a raw frame.
pub fn frame_src(frame: &[u8]) -> Option<MacAddr> {
    (frame.len() >= ETHERNET_HEADER_LEN).then(|| MacAddr::from_slice(&frame[6..12]))
}

/// Overwrites the destination address of a raw frame, returns `false` if the frame is too short.
pub fn set_frame_dst(frame: &mut [u8], mac: MacAddr) -> bool {
    if frame.len() < ETHERNET_HEADER_LEN {
        return false;
    }
    frame[0..6].copy_from_slice(&mac.octets());
    true
}

/// Overwrites the source address of a raw frame, returns `false` if the frame is too short.
pub fn set_frame_src(frame: &mut [u8], mac: MacAddr) -> bool {
    if frame.len() < ETHERNET_HEADER_LEN {
        return false;
    }
    frame[6..12].copy_from_slice(&mac.octets());
    true
}

// ARP -----------------------------------------------------------------------------------------------------------------

/// ARP request operation code.
pub const ARP_REQUEST: u16 = 1;
/// ARP reply operation code.
pub const ARP_REPLY: u16 = 2;

/// ARP packet for IPv4 over Ethernet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArpPacket {
    /// Operation code.
    pub op: u16,
    /// Sender hardware address.
    pub sender_mac: MacAddr,
    /// Sender protocol address.
    pub sender_ip: Ipv4Addr,
    /// Target hardware address.
    pub target_mac: MacAddr,
    /// Target protocol address.
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Creates a request asking who has `target_ip`.
    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            op: ARP_REQUEST,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::default(),
            target_ip,
        }
    }

    /// Creates the reply to this request on behalf of `mac`.
    pub fn reply(&self, mac: MacAddr) -> Self {
        Self {
            op: ARP_REPLY,
            sender_mac: mac,
            sender_ip: self.target_ip,
            target_mac: self.sender_mac,
            target_ip: self.sender_ip,
        }
    }

    /// Parses ARP payload of an Ethernet frame.
    pub fn parse(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < ARP_LEN {
            return Err(PacketError::Truncated("arp"));
        }
        if be_u16(bytes, 0) != 1 || be_u16(bytes, 2) != ETHERTYPE_IPV4 || bytes[4] != 6 || bytes[5] != 4 {
            return Err(PacketError::Unsupported("arp address format"));
        }
        Ok(Self {
            op: be_u16(bytes, 6),
            sender_mac: MacAddr::from_slice(&bytes[8..14]),
            sender_ip: ipv4_at(bytes, 14),
            target_mac: MacAddr::from_slice(&bytes[18..24]),
            target_ip: ipv4_at(bytes, 24),
        })
    }

    /// Serializes the packet.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ARP_LEN);
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        bytes.push(6);
        bytes.push(4);
        bytes.extend_from_slice(&self.op.to_be_bytes());
        bytes.extend_from_slice(&self.sender_mac.octets());
        bytes.extend_from_slice(&self.sender_ip.octets());
        bytes.extend_from_slice(&self.target_mac.octets());
        bytes.extend_from_slice(&self.target_ip.octets());
        bytes
    }
}

// IPv4 ----------------------------------------------------------------------------------------------------------------

/// IPv4 packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv4Packet {
    /// Source address.
    pub src: Ipv4Addr,
    /// Destination address.
    pub dst: Ipv4Addr,
    /// Payload protocol.
    pub protocol: u8,
    /// Time to live.
    pub ttl: u8,
    /// Type of service (DSCP and ECN bits).
    pub tos: u8,
    /// Identification field.
    pub identification: u16,
    /// Flags (top 3 bits) and fragment offset in 8-byte units.
    pub flags_fragment: u16,
    /// Header options, a multiple of 4 bytes.
    pub options: Vec<u8>,
    /// Packet payload.
    pub payload: Vec<u8>,
}

/// Don't fragment flag of the IPv4 header.
pub const IPV4_DONT_FRAGMENT: u16 = 0x4000;
/// More fragments flag of the IPv4 header.
pub const IPV4_MORE_FRAGMENTS: u16 = 0x2000;
const IPV4_FRAGMENT_OFFSET: u16 = 0x1fff;

impl Ipv4Packet {
    /// Creates a packet with default TTL.
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: Vec<u8>) -> Self {
        Self {
            src,
            dst,
            protocol,
            ttl: DEFAULT_TTL,
            tos: 0,
            identification: 0,
            flags_fragment: 0,
            options: Vec::new(),
            payload,
        }
    }

    /// Parses a packet, verifying the header checksum if `validate` is set.
    pub fn parse(bytes: &[u8], validate: bool) -> Result<Self, PacketError> {
        if bytes.len() < IPV4_HEADER_LEN {
            return Err(PacketError::Truncated("ipv4"));
        }
        if bytes[0] >> 4 != 4 {
            return Err(PacketError::Unsupported("ip version"));
        }
        let header_len = ((bytes[0] & 0x0f) as usize) * 4;
        let total_len = be_u16(bytes, 2) as usize;
        if header_len < IPV4_HEADER_LEN || total_len < header_len || total_len > bytes.len() {
            return Err(PacketError::Truncated("ipv4"));
        }
        if validate && internet_checksum(&bytes[..header_len]) != 0 {
            return Err(PacketError::BadChecksum("ipv4"));
        }
        Ok(Self {
            src: ipv4_at(bytes, 12),
            dst: ipv4_at(bytes, 16),
            protocol: bytes[9],
            ttl: bytes[8],
            tos: bytes[1],
            identification: be_u16(bytes, 4),
            flags_fragment: be_u16(bytes, 6),
            options: bytes[IPV4_HEADER_LEN..header_len].to_vec(),
            // ethernet padding is dropped
            payload: bytes[header_len..total_len].to_vec(),
        })
    }

    /// Checks whether the don't fragment flag is set.
    pub fn dont_fragment(&self) -> bool {
        self.flags_fragment & IPV4_DONT_FRAGMENT != 0
    }

    /// Checks whether the packet is a fragment of a larger datagram.
    pub fn is_fragment(&self) -> bool {
        self.flags_fragment & (IPV4_MORE_FRAGMENTS | IPV4_FRAGMENT_OFFSET) != 0
    }

    /// Returns the serialized header, options and checksum included.
    pub fn header_bytes(&self) -> Vec<u8> {
        let header_len = IPV4_HEADER_LEN + self.options.len();
        let total_len = (header_len + self.payload.len()) as u16;
        let mut header = Vec::with_capacity(header_len);
        header.push(0x40 | (header_len / 4) as u8);
        header.push(self.tos);
        header.extend_from_slice(&total_len.to_be_bytes());
        header.extend_from_slice(&self.identification.to_be_bytes());
        header.extend_from_slice(&self.flags_fragment.to_be_bytes());
        header.push(self.ttl);
        header.push(self.protocol);
        header.extend_from_slice(&[0, 0]);
        header.extend_from_slice(&self.src.octets());
        header.extend_from_slice(&self.dst.octets());
        header.extend_from_slice(&self.options);
        let checksum = internet_checksum(&header);
        header[10..12].copy_from_slice(&checksum.to_be_bytes());
        header
    }

    /// Serializes the packet.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.header_bytes();
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

// ICMP ----------------------------------------------------------------------------------------------------------------

/// Echo reply message type.
pub const ICMP_ECHO_REPLY: u8 = 0;
/// Destination unreachable message type.
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
/// Echo request message type.
pub const ICMP_ECHO_REQUEST: u8 = 8;
/// Time exceeded message type.
pub const ICMP_TIME_EXCEEDED: u8 = 11;
/// Network unreachable code of the destination unreachable message.
pub const ICMP_NET_UNREACHABLE: u8 = 0;
/// Destination unreachable code: host unreachable.
pub const ICMP_HOST_UNREACHABLE: u8 = 1;

/// ICMP message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IcmpPacket {
    /// Message type.
    pub icmp_type: u8,
    /// Message code.
    pub code: u8,
    /// Rest of the header (identifier and sequence number for echo messages).
    pub rest: [u8; 4],
    /// Message payload.
    pub payload: Vec<u8>,
}

impl IcmpPacket {
    /// Creates an echo request.
    pub fn echo_request(id: u16, seq: u16, payload: Vec<u8>) -> Self {
        let mut rest = [0u8; 4];
        rest[0..2].copy_from_slice(&id.to_be_bytes());
        rest[2..4].copy_from_slice(&seq.to_be_bytes());
        Self {
            icmp_type: ICMP_ECHO_REQUEST,
            code: 0,
            rest,
            payload,
        }
    }

    /// Creates an error message quoting the offending packet header and the first 8 bytes of its payload.
    pub fn error(icmp_type: u8, code: u8, offending: &Ipv4Packet) -> Self {
        let mut payload = offending.header_bytes();
        payload.extend(offending.payload.iter().take(8));
        Self {
            icmp_type,
            code,
            rest: [0; 4],
            payload,
        }
    }

    /// Parses a message, verifying the checksum if `validate` is set.
    pub fn parse(bytes: &[u8], validate: bool) -> Result<Self, PacketError> {
        if bytes.len() < ICMP_HEADER_LEN {
            return Err(PacketError::Truncated("icmp"));
        }
        if validate && internet_checksum(bytes) != 0 {
            return Err(PacketError::BadChecksum("icmp"));
        }
        Ok(Self {
            icmp_type: bytes[0],
            code: bytes[1],
            rest: [bytes[4], bytes[5], bytes[6], bytes[7]],
            payload: bytes[ICMP_HEADER_LEN..].to_vec(),
        })
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ICMP_HEADER_LEN + self.payload.len());
        bytes.push(self.icmp_type);
        bytes.push(self.code);
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&self.rest);
        bytes.extend_from_slice(&self.payload);
        let checksum = internet_checksum(&bytes);
        bytes[2..4].copy_from_slice(&checksum.to_be_bytes());
        bytes
    }
}

// TCP -----------------------------------------------------------------------------------------------------------------

/// FIN flag.
pub const TCP_FIN: u8 = 0x01;
/// SYN flag.
pub const TCP_SYN: u8 = 0x02;
/// RST flag.
pub const TCP_RST: u8 = 0x04;
/// PSH flag.
pub const TCP_PSH: u8 = 0x08;
/// ACK flag.
pub const TCP_ACK: u8 = 0x10;

/// TCP segment (options are not preserved).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpSegment {
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// Sequence number.
    pub seq: u32,
    /// Acknowledgement number.
    pub ack: u32,
    /// Control flags.
    pub flags: u8,
    /// Receive window.
    pub window: u16,
    /// Segment payload.
    pub payload: Vec<u8>,
}

impl TcpSegment {
    /// Creates a segment without payload.
    pub fn new(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: u8) -> Self {
        Self {
            src_port,
            dst_port,
            seq,
            ack,
            flags,
            window: u16::MAX,
            payload: Vec::new(),
        }
    }

    /// Checks whether all specified flags are set.
    pub fn has(&self, flags: u8) -> bool {
        self.flags & flags == flags
    }

    /// Returns the amount of sequence space occupied by the segment.
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + self.has(TCP_SYN) as u32 + self.has(TCP_FIN) as u32
    }

    /// Parses a segment carried between `src` and `dst`, verifying the checksum if `validate` is set.
    pub fn parse(bytes: &[u8], src: Ipv4Addr, dst: Ipv4Addr, validate: bool) -> Result<Self, PacketError> {
        if bytes.len() < TCP_HEADER_LEN {
            return Err(PacketError::Truncated("tcp"));
        }
        let data_offset = ((bytes[12] >> 4) as usize) * 4;
        if data_offset < TCP_HEADER_LEN || data_offset > bytes.len() {
            return Err(PacketError::Truncated("tcp"));
        }
        if validate {
            let pseudo = pseudo_header(src, dst, IPPROTO_TCP, bytes.len());
            if Checksum::new().add(&pseudo).add(bytes).finish() != 0 {
                return Err(PacketError::BadChecksum("tcp"));
            }
        }
        Ok(Self {
            src_port: be_u16(bytes, 0),
            dst_port: be_u16(bytes, 2),
            seq: be_u32(bytes, 4),
            ack: be_u32(bytes, 8),
            flags: bytes[13],
            window: be_u16(bytes, 14),
            payload: bytes[data_offset..].to_vec(),
        })
    }

    /// Serializes the segment carried between `src` and `dst`.
    pub fn to_bytes(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(TCP_HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(&self.src_port.to_be_bytes());
        bytes.extend_from_slice(&self.dst_port.to_be_bytes());
        bytes.extend_from_slice(&self.seq.to_be_bytes());
        bytes.extend_from_slice(&self.ack.to_be_bytes());
        bytes.push(((TCP_HEADER_LEN / 4) as u8) << 4);
        bytes.push(self.flags);
        bytes.extend_from_slice(&self.window.to_be_bytes());
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes.extend_from_slice(&self.payload);
        let pseudo = pseudo_header(src, dst, IPPROTO_TCP, bytes.len());
        let checksum = Checksum::new().add(&pseudo).add(&bytes).finish();
        bytes[16..18].copy_from_slice(&checksum.to_be_bytes());
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_reference_value() {
        // RFC 1071 example
        let bytes = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(internet_checksum(&bytes), !0xddf2);
    }

    #[test]
    fn test_checksum_over_split_ranges() {
        let bytes = [0x45, 0x00, 0x00, 0x54, 0x12, 0x34, 0x40, 0x00, 0x40];
        let whole = internet_checksum(&bytes);
        let split = Checksum::new().add(&bytes[..3]).add(&bytes[3..]).finish();
        assert_eq!(whole, split);
    }

    #[test]
    fn test_ipv4_checksum_is_verified() {
        let packet = Ipv4Packet::new(
            Ipv4Addr::new(10, 12, 0, 2),
            Ipv4Addr::new(10, 12, 1, 2),
            IPPROTO_UDP,
            vec![1, 2, 3],
        );
        let mut bytes = packet.to_bytes();
        assert_eq!(Ipv4Packet::parse(&bytes, true).unwrap(), packet);
        bytes[8] ^= 0xff;
        assert_eq!(Ipv4Packet::parse(&bytes, true), Err(PacketError::BadChecksum("ipv4")));
        assert!(Ipv4Packet::parse(&bytes, false).is_ok());
    }

    #[test]
    fn test_ipv4_padding_is_dropped() {
        let packet = Ipv4Packet::new(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, IPPROTO_UDP, vec![7]);
        let mut bytes = packet.to_bytes();
        bytes.extend_from_slice(&[0; 25]);
        assert_eq!(Ipv4Packet::parse(&bytes, true).unwrap().payload, vec![7]);
    }

    #[test]
    fn test_ipv4_header_fields_survive_reserialization() {
        let (src, dst) = (Ipv4Addr::new(10, 12, 0, 2), Ipv4Addr::new(10, 12, 1, 2));
        let mut packet = Ipv4Packet::new(src, dst, IPPROTO_UDP, vec![1]);
        packet.tos = 0xb8;
        packet.flags_fragment = IPV4_MORE_FRAGMENTS | 0x0010;
        packet.options = vec![0x94, 0x04, 0x00, 0x00];
        let bytes = packet.to_bytes();
        assert_eq!(bytes[0], 0x46);
        assert_eq!(bytes.len(), 25);
        let parsed = Ipv4Packet::parse(&bytes, true).unwrap();
        assert_eq!(parsed, packet);
        assert!(parsed.is_fragment());
        assert!(!parsed.dont_fragment());
        assert_eq!(parsed.to_bytes(), bytes);

        packet.flags_fragment = IPV4_DONT_FRAGMENT;
        assert!(packet.dont_fragment());
        assert!(!packet.is_fragment());
    }

    #[test]
    fn test_tcp_checksum_covers_pseudo_header() {
        let src = Ipv4Addr::new(10, 12, 0, 2);
        let dst = Ipv4Addr::new(10, 12, 0, 1);
        let mut segment = TcpSegment::new(40000, 5000, 1, 0, TCP_SYN);
        segment.payload = b"odd".to_vec();
        let bytes = segment.to_bytes(src, dst);
        assert_eq!(TcpSegment::parse(&bytes, src, dst, true).unwrap(), segment);
        assert!(TcpSegment::parse(&bytes, src, Ipv4Addr::new(10, 12, 0, 3), true).is_err());
    }

    #[test]
    fn test_raw_frame_addresses() {
        let mut frame = EthernetFrame::new(MacAddr::BROADCAST, MacAddr::allocate(2), ETHERTYPE_ARP, vec![]).to_bytes();
        assert_eq!(frame_dst(&frame), Some(MacAddr::BROADCAST));
        assert!(set_frame_src(&mut frame, MacAddr::allocate(9)));
        assert_eq!(frame_src(&frame), Some(MacAddr::allocate(9)));
        assert!(!set_frame_dst(&mut [0u8; 4], MacAddr::BROADCAST));
    }
}
