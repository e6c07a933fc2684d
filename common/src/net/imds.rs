//! Cloud instance metadata (IMDS) traffic.

use crate::consts::{ETH_P_IP, IMDS_IPV4, IMDS_MAX_LENGTH};
use crate::emit::send_event_with;
use crate::event::EventType;
use crate::kernel::{Kernel, Map, Next};
use crate::net::network_context;
use crate::net::packet::{NamespacedFlow, PacketReader};

/// True when either end of an IPv4 flow is the metadata endpoint.
pub fn is_imds_flow(ns_flow: &NamespacedFlow) -> bool {
    let flow = &ns_flow.flow;
    flow.l3_protocol == ETH_P_IP && (flow.saddr[..4] == IMDS_IPV4 || flow.daddr[..4] == IMDS_IPV4)
}

/// Body of the `Imds` tail-call target: reports the HTTP body as is.
pub fn imds_program<K: Kernel, P: PacketReader>(k: &K, skb: &P) -> Next {
    let Some(pkt) = k.packets().lookup(&0) else {
        return Next::Done;
    };
    let _ = k.imds_event().with_mut(&0, |ev| {
        ev.network = network_context(&pkt);
        let len = (pkt.payload_len as usize).min(IMDS_MAX_LENGTH);
        ev.body_len = if skb.load(pkt.payload_offset, &mut ev.body[..len]) {
            len as u32
        } else {
            0
        };
        send_event_with(k, EventType::Imds, ev, pkt.owner(), 0);
    });
    Next::Done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ImdsEvent;
    use crate::net::packet::Direction;
    use crate::sim::{SimKernel, SimPacket};

    const REQUEST: &[u8] = b"GET /latest/meta-data/iam/security-credentials/ HTTP/1.1\r\n\r\n";

    #[test]
    fn metadata_requests_are_reported() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Imds]);
        let skb = SimPacket::tcp4([10, 0, 0, 2], 41000, IMDS_IPV4, 80, REQUEST);
        k.run_classifier(&skb, Direction::Egress);

        let events = k.events_of(EventType::Imds);
        assert_eq!(events.len(), 1);
        let ev: ImdsEvent = events[0].decode();
        assert_eq!(&ev.body[..ev.body_len as usize], REQUEST);
        assert_eq!(ev.network.flow.dport, 80);
        assert_eq!(ev.network.direction, Direction::Egress as u32);
    }

    #[test]
    fn other_destinations_are_ignored() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Imds]);
        let skb = SimPacket::tcp4([10, 0, 0, 2], 41000, [169, 254, 169, 253], 80, REQUEST);
        k.run_classifier(&skb, Direction::Egress);
        assert!(k.events_of(EventType::Imds).is_empty());
    }
}
