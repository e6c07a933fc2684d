//! Bounded packet parser.
//!
//! ```text
//!   eth ──► ipv4 (ihl) ─┬─► tcp (doff) ──► payload
//!       └─► ipv6 (40) ──┼─► udp (8)
//!                       └─► icmp / icmpv6
//! ```
//!
//! Addresses are widened to 16 bytes, IPv4 in the first four. Ports are host
//! order. IPv6 extension headers are not walked: a packet whose next header
//! is not a known L4 protocol keeps a zero L4 and an empty payload.

use crate::consts::{
    ETH_P_IP, ETH_P_IPV6, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP,
};
use crate::event::Flow;
use crate::kernel::{plain, Kernel, Map};
use crate::stats;

const ETH_HLEN: u32 = 14;
const IPV4_MIN_HLEN: u32 = 20;
const IPV6_HLEN: u32 = 40;
const TCP_MIN_HLEN: u32 = 20;
const UDP_HLEN: u32 = 8;
const ICMP_HLEN: u32 = 8;

/// Read access to the socket buffer a classifier runs on.
pub trait PacketReader {
    fn len(&self) -> u32;

    /// Copies `dst.len()` bytes starting at `offset`; false when out of bounds.
    fn load(&self, offset: u32, dst: &mut [u8]) -> bool;

    fn ifindex(&self) -> u32;

    /// Cookie of the socket attached to the buffer, 0 if none.
    fn socket_cookie(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct NamespacedFlow {
    pub flow: Flow,
    pub netns: u32,
    pub _pad: u32,
}

impl NamespacedFlow {
    pub fn new(flow: Flow, netns: u32) -> Self {
        Self {
            flow,
            netns,
            _pad: 0,
        }
    }

    pub fn flipped(&self) -> Self {
        Self::new(self.flow.flipped(), self.netns)
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ingress = 1,
    Egress = 2,
}

impl Direction {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Direction::Ingress),
            2 => Some(Direction::Egress),
            _ => None,
        }
    }
}

/// Parser output, kept in a per-CPU slot for the tail-called programs.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub ns_flow: NamespacedFlow,
    /// `ns_flow` after conntrack translation.
    pub translated_ns_flow: NamespacedFlow,
    pub payload_offset: u32,
    pub payload_len: u32,
    pub ifindex: u32,
    pub direction: u32,
    pub pid: u32,
    pub size: u32,
    pub icmp_type: u8,
    pub icmp_code: u8,
    /// Questions left for the DNS request parser.
    pub dns_remaining: u16,
    /// Offset of the next DNS question, 0 before the header was read.
    pub dns_cursor: u32,
    pub sk_cookie: u64,
}

plain!(NamespacedFlow, Packet);

impl Packet {
    pub fn direction(&self) -> Direction {
        Direction::from_u32(self.direction).unwrap_or(Direction::Ingress)
    }

    /// The task the packet was attributed to, as a `pid_tgid`.
    pub fn owner(&self) -> u64 {
        if self.pid == 0 {
            return 0;
        }
        ((self.pid as u64) << 32) | self.pid as u64
    }
}

fn be16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn parse_l4<P: PacketReader>(skb: &P, pkt: &mut Packet, offset: u32) -> Option<u32> {
    let flow = &mut pkt.ns_flow.flow;
    match flow.l4_protocol {
        IPPROTO_TCP => {
            let mut hdr = [0u8; TCP_MIN_HLEN as usize];
            if !skb.load(offset, &mut hdr) {
                return None;
            }
            flow.sport = be16(&hdr[0..2]);
            flow.dport = be16(&hdr[2..4]);
            let doff = (hdr[12] >> 4) as u32 * 4;
            if doff < TCP_MIN_HLEN {
                return None;
            }
            Some(offset + doff)
        }
        IPPROTO_UDP => {
            let mut hdr = [0u8; UDP_HLEN as usize];
            if !skb.load(offset, &mut hdr) {
                return None;
            }
            flow.sport = be16(&hdr[0..2]);
            flow.dport = be16(&hdr[2..4]);
            Some(offset + UDP_HLEN)
        }
        IPPROTO_ICMP | IPPROTO_ICMPV6 => {
            let mut hdr = [0u8; ICMP_HLEN as usize];
            if !skb.load(offset, &mut hdr) {
                return None;
            }
            pkt.icmp_type = hdr[0];
            pkt.icmp_code = hdr[1];
            // echo id stands in for the port
            flow.sport = be16(&hdr[4..6]);
            Some(offset + ICMP_HLEN)
        }
        _ => Some(skb.len()),
    }
}

fn parse<P: PacketReader>(skb: &P, pkt: &mut Packet) -> Option<()> {
    let mut eth = [0u8; ETH_HLEN as usize];
    if !skb.load(0, &mut eth) {
        return None;
    }
    let flow = &mut pkt.ns_flow.flow;
    flow.l3_protocol = be16(&eth[12..14]);

    let l4_offset = match flow.l3_protocol {
        ETH_P_IP => {
            let mut hdr = [0u8; IPV4_MIN_HLEN as usize];
            if !skb.load(ETH_HLEN, &mut hdr) {
                return None;
            }
            let ihl = (hdr[0] & 0x0f) as u32 * 4;
            if ihl < IPV4_MIN_HLEN {
                return None;
            }
            flow.l4_protocol = hdr[9] as u16;
            flow.saddr[..4].copy_from_slice(&hdr[12..16]);
            flow.daddr[..4].copy_from_slice(&hdr[16..20]);
            ETH_HLEN + ihl
        }
        ETH_P_IPV6 => {
            let mut hdr = [0u8; IPV6_HLEN as usize];
            if !skb.load(ETH_HLEN, &mut hdr) {
                return None;
            }
            flow.l4_protocol = hdr[6] as u16;
            flow.saddr.copy_from_slice(&hdr[8..24]);
            flow.daddr.copy_from_slice(&hdr[24..40]);
            ETH_HLEN + IPV6_HLEN
        }
        _ => return None,
    };

    let payload_offset = parse_l4(skb, pkt, l4_offset)?.min(skb.len());
    pkt.payload_offset = payload_offset;
    pkt.payload_len = skb.len() - payload_offset;
    Some(())
}

/// Parses `skb` and namespaces its flow by the receiving interface.
pub fn parse_packet<K: Kernel, P: PacketReader>(k: &K, skb: &P, direction: Direction) -> Option<Packet> {
    stats::net(k, |s| s.packets += 1);
    let mut pkt = Packet {
        ifindex: skb.ifindex(),
        direction: direction as u32,
        size: skb.len(),
        sk_cookie: skb.socket_cookie(),
        ..Packet::default()
    };
    if parse(skb, &mut pkt).is_none() {
        stats::net(k, |s| s.parse_errors += 1);
        return None;
    }
    pkt.ns_flow.netns = k.ifindex_netns().lookup(&pkt.ifindex).unwrap_or(0);
    pkt.translated_ns_flow = pkt.ns_flow;
    Some(pkt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::UpdateFlag;
    use crate::sim::{SimKernel, SimPacket};

    #[test]
    fn udp4_fields_are_host_order() {
        let k = SimKernel::new();
        k.ifindex_netns().store(&3, &4026531993, UpdateFlag::Any).unwrap();
        let skb = SimPacket::udp4([10, 0, 0, 2], 40000, [10, 0, 0, 1], 53, b"hello").on_ifindex(3);
        let pkt = parse_packet(&k, &skb, Direction::Egress).unwrap();

        let flow = pkt.ns_flow.flow;
        assert_eq!(flow.l3_protocol, ETH_P_IP);
        assert_eq!(flow.l4_protocol, IPPROTO_UDP);
        assert_eq!(&flow.saddr[..4], &[10, 0, 0, 2]);
        assert_eq!(&flow.saddr[4..], &[0; 12]);
        assert_eq!(flow.sport, 40000);
        assert_eq!(flow.dport, 53);
        assert_eq!(pkt.ns_flow.netns, 4026531993);
        assert_eq!(pkt.payload_len, 5);
        assert_eq!(pkt.payload_offset, 14 + 20 + 8);
        assert_eq!(pkt.translated_ns_flow, pkt.ns_flow);
    }

    #[test]
    fn ip_and_tcp_options_are_skipped() {
        let k = SimKernel::new();
        let skb = SimPacket::tcp4([1, 1, 1, 1], 1234, [2, 2, 2, 2], 80, b"GET /")
            .with_ipv4_options(8)
            .with_tcp_options(12);
        let pkt = parse_packet(&k, &skb, Direction::Ingress).unwrap();
        assert_eq!(pkt.ns_flow.flow.dport, 80);
        assert_eq!(pkt.payload_offset, 14 + 28 + 32);
        assert_eq!(pkt.payload_len, 5);
    }

    #[test]
    fn ipv6_addresses_fill_sixteen_bytes() {
        let k = SimKernel::new();
        let src = [0xfd, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let dst = [0xfd, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];
        let skb = SimPacket::udp6(src, 5353, dst, 53, b"q");
        let pkt = parse_packet(&k, &skb, Direction::Egress).unwrap();
        assert_eq!(pkt.ns_flow.flow.saddr, src);
        assert_eq!(pkt.ns_flow.flow.daddr, dst);
        assert_eq!(pkt.ns_flow.flow.l3_protocol, ETH_P_IPV6);
    }

    #[test]
    fn truncated_headers_count_parse_errors() {
        let k = SimKernel::new();
        let mut skb = SimPacket::tcp4([1, 1, 1, 1], 1, [2, 2, 2, 2], 2, b"");
        skb.truncate(30);
        assert!(parse_packet(&k, &skb, Direction::Ingress).is_none());
        let stats = k.net_stats_total();
        assert_eq!(stats.packets, 1);
        assert_eq!(stats.parse_errors, 1);
    }
}
