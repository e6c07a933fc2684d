//! Packet path.
//!
//! ```text
//!   TC ingress/egress
//!        │
//!   parse ──► translate (conntrack) ──► resolve pid ──► packets[cpu]
//!        │
//!        ├─ udp :53 egress ───► DnsRequest ─┐ (loops per question)
//!        ├─ udp :53 ingress ──► DnsResponse
//!        ├─ tcp to/from IMDS ─► Imds
//!        └─ raw sampling on ──► RawPacketDrop (egress) ──► RawPacket
//! ```
//!
//! Classifiers never drop on their own; only the raw packet drop list can
//! turn a verdict into a drop.

pub mod conntrack;
pub mod device;
pub mod dns;
pub mod flow;
pub mod imds;
pub mod packet;
pub mod raw;

use crate::consts::{RuntimeConst, DNS_PORT, IPPROTO_TCP, IPPROTO_UDP};
use crate::event::NetworkContext;
use crate::kernel::{Kernel, Map, Next, Prog, UpdateFlag};
use crate::stats;

use packet::{Direction, Packet, PacketReader};

pub fn network_context(pkt: &Packet) -> NetworkContext {
    NetworkContext {
        flow: pkt.ns_flow.flow,
        netns: pkt.ns_flow.netns,
        ifindex: pkt.ifindex,
        size: pkt.size,
        direction: pkt.direction,
    }
}

/// Protocol program a parsed packet is handed to.
pub fn route<K: Kernel>(k: &K, pkt: &Packet) -> Next {
    let flow = &pkt.ns_flow.flow;
    let direction = pkt.direction();
    if pkt.payload_len > 0 {
        match flow.l4_protocol {
            IPPROTO_UDP if direction == Direction::Egress && flow.dport == DNS_PORT => {
                return Next::TailCall(Prog::DnsRequest)
            }
            IPPROTO_UDP if direction == Direction::Ingress && flow.sport == DNS_PORT => {
                return Next::TailCall(Prog::DnsResponse)
            }
            IPPROTO_TCP if imds::is_imds_flow(&pkt.ns_flow) => return Next::TailCall(Prog::Imds),
            _ => {}
        }
    }
    if k.constant(RuntimeConst::RawPacketEnabled) == 0 {
        return Next::Done;
    }
    match direction {
        Direction::Egress => Next::TailCall(Prog::RawPacketDrop),
        Direction::Ingress => Next::TailCall(Prog::RawPacket),
    }
}

/// Entry point of both TC classifiers.
pub fn classify<K: Kernel, P: PacketReader>(k: &K, skb: &P, direction: Direction) -> Next {
    let Some(mut pkt) = packet::parse_packet(k, skb, direction) else {
        return Next::Done;
    };
    pkt.translated_ns_flow = conntrack::translate(k, &pkt.ns_flow);
    pkt.pid = flow::resolve_pid(k, &pkt);
    if pkt.pid == 0 {
        stats::net(k, |s| s.pid_unresolved += 1);
    }
    if k.packets().store(&0, &pkt, UpdateFlag::Any).is_err() {
        return Next::Done;
    }
    route(k, &pkt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{ETH_P_IP, IMDS_IPV4};
    use crate::event::{DnsEvent, EventType, Flow};
    use crate::net::packet::NamespacedFlow;
    use crate::sim::{SimKernel, SimPacket};

    #[test]
    fn dns_routing_depends_on_direction() {
        let k = SimKernel::new();
        let out = SimPacket::udp4([10, 0, 0, 2], 40000, [8, 8, 8, 8], 53, b"q");
        assert_eq!(classify(&k, &out, Direction::Egress), Next::TailCall(Prog::DnsRequest));
        let back = SimPacket::udp4([8, 8, 8, 8], 53, [10, 0, 0, 2], 40000, b"r");
        assert_eq!(classify(&k, &back, Direction::Ingress), Next::TailCall(Prog::DnsResponse));
        // a query arriving at a local resolver is not a response
        let query_in = SimPacket::udp4([10, 0, 0, 9], 40000, [10, 0, 0, 2], 53, b"q");
        assert_eq!(classify(&k, &query_in, Direction::Ingress), Next::Done);
    }

    #[test]
    fn imds_and_raw_sampling_routes() {
        let k = SimKernel::new();
        let imds = SimPacket::tcp4([10, 0, 0, 2], 41000, IMDS_IPV4, 80, b"GET /");
        assert_eq!(classify(&k, &imds, Direction::Egress), Next::TailCall(Prog::Imds));

        let plain = SimPacket::tcp4([10, 0, 0, 2], 41000, [10, 0, 0, 3], 80, b"GET /");
        assert_eq!(classify(&k, &plain, Direction::Egress), Next::Done);
        k.set_constant(RuntimeConst::RawPacketEnabled, 1);
        assert_eq!(classify(&k, &plain, Direction::Egress), Next::TailCall(Prog::RawPacketDrop));
        assert_eq!(classify(&k, &plain, Direction::Ingress), Next::TailCall(Prog::RawPacket));
    }

    #[test]
    fn snat_flows_are_attributed_through_the_translation() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Dns]);
        let v4 = |s: [u8; 4], sp: u16, d: [u8; 4], dp: u16| {
            let mut flow = Flow {
                sport: sp,
                dport: dp,
                l3_protocol: ETH_P_IP,
                l4_protocol: IPPROTO_UDP,
                ..Flow::default()
            };
            flow.saddr[..4].copy_from_slice(&s);
            flow.daddr[..4].copy_from_slice(&d);
            flow
        };
        // pod 10.244.0.7:40000 is masqueraded behind the node 192.168.1.10:50000
        let orig = NamespacedFlow::new(v4([10, 244, 0, 7], 40000, [8, 8, 8, 8], 53), 0);
        let reply = NamespacedFlow::new(v4([8, 8, 8, 8], 53, [192, 168, 1, 10], 50000), 0);
        conntrack::record_translation(&k, &orig, &reply);
        let mut pod = [0u8; 16];
        pod[..4].copy_from_slice(&[10, 244, 0, 7]);
        flow::register_flow_classification(&k, 0, &flow::route_key(&pod, 40000, 0, IPPROTO_UDP), 321);

        let mut msg = vec![0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        msg.extend_from_slice(&dns::encode_qname("example.com"));
        msg.extend_from_slice(&[0, 1, 0, 1]);
        let skb = SimPacket::udp4([192, 168, 1, 10], 50000, [8, 8, 8, 8], 53, &msg);
        k.run_classifier(&skb, Direction::Egress);

        let ev: DnsEvent = k.events_of(EventType::Dns)[0].decode();
        assert_eq!(ev.base.process.pid, 321);
        // the reported flow is the one seen on the wire
        assert_eq!(&ev.network.flow.saddr[..4], &[192, 168, 1, 10]);
        assert_eq!(k.net_stats_total().pid_unresolved, 0);
    }
}
