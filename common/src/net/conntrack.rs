//! NAT translations learned from netfilter conntrack.
//!
//! Every NAT manipulation maps each orientation of a connection to its
//! counterpart:
//!
//! ```text
//!   orig          ──► reply.flipped      reply.flipped ──► orig
//!   reply         ──► orig.flipped       orig.flipped  ──► reply
//! ```
//!
//! A packet flow is translated by following the map for at most
//! `MAX_NAT_HOPS` steps, stopping when a step would lead back.

use crate::consts::MAX_NAT_HOPS;
use crate::kernel::{Kernel, Map, UpdateFlag};
use crate::kobj;
use crate::net::flow;
use crate::net::packet::NamespacedFlow;
use crate::stats;

/// Original and reply tuples of a conntrack entry.
pub fn read_conntrack<K: Kernel>(k: &K, ct: u64) -> Option<(NamespacedFlow, NamespacedFlow)> {
    let netns = kobj::conntrack_netns(k, ct);
    let orig = kobj::conntrack_tuple(k, ct, 0)?;
    let reply = kobj::conntrack_tuple(k, ct, 1)?;
    Some((NamespacedFlow::new(orig, netns), NamespacedFlow::new(reply, netns)))
}

pub fn record_translation<K: Kernel>(k: &K, orig: &NamespacedFlow, reply: &NamespacedFlow) {
    let translated = reply.flipped();
    if translated == *orig {
        // no NAT on this connection
        return;
    }
    let map = k.conntrack();
    let _ = map.store(orig, &translated, UpdateFlag::Any);
    let _ = map.store(&translated, orig, UpdateFlag::Any);
    let _ = map.store(reply, &orig.flipped(), UpdateFlag::Any);
    let _ = map.store(&orig.flipped(), reply, UpdateFlag::Any);
}

/// `nf_nat_manip_pkt` / `nf_nat_packet`.
pub fn record_nat<K: Kernel>(k: &K, ct: u64) {
    if let Some((orig, reply)) = read_conntrack(k, ct) {
        record_translation(k, &orig, &reply);
    }
}

/// `nf_ct_delete`: forgets the translations and the routes they fed.
pub fn delete<K: Kernel>(k: &K, ct: u64) {
    let Some((orig, reply)) = read_conntrack(k, ct) else {
        return;
    };
    let map = k.conntrack();
    for key in [orig, orig.flipped(), reply, reply.flipped()] {
        let _ = map.delete(&key);
    }
    for end in [orig, reply] {
        flow::delete_route(k, &flow::route_key(&end.flow.saddr, end.flow.sport, end.netns, end.flow.l4_protocol));
    }
}

/// Follows the translation chain of `start`.
pub fn translate<K: Kernel>(k: &K, start: &NamespacedFlow) -> NamespacedFlow {
    let mut prev = *start;
    let mut current = *start;
    for _ in 0..MAX_NAT_HOPS {
        let Some(next) = k.conntrack().lookup(&current) else {
            return current;
        };
        if next == *start || next == prev {
            return current;
        }
        prev = current;
        current = next;
    }
    stats::net(k, |s| s.nat_hop_limit += 1);
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{ETH_P_IP, IPPROTO_TCP};
    use crate::event::Flow;
    use crate::sim::SimKernel;

    fn v4(saddr: [u8; 4], sport: u16, daddr: [u8; 4], dport: u16) -> Flow {
        let mut flow = Flow {
            sport,
            dport,
            l3_protocol: ETH_P_IP,
            l4_protocol: IPPROTO_TCP,
            ..Flow::default()
        };
        flow.saddr[..4].copy_from_slice(&saddr);
        flow.daddr[..4].copy_from_slice(&daddr);
        flow
    }

    const NS: u32 = 4026532000;

    #[test]
    fn dnat_translates_both_directions() {
        let k = SimKernel::new();
        let orig = NamespacedFlow::new(v4([10, 0, 2, 5], 40000, [10, 0, 1, 1], 80), NS);
        let reply = NamespacedFlow::new(v4([10, 0, 1, 9], 8080, [10, 0, 2, 5], 40000), NS);
        let ct = k.alloc_conntrack(orig.flow, reply.flow, NS);
        record_nat(&k, ct);

        assert_eq!(translate(&k, &orig), reply.flipped());
        assert_eq!(translate(&k, &reply), orig.flipped());
        let unrelated = NamespacedFlow::new(v4([1, 1, 1, 1], 1, [2, 2, 2, 2], 2), NS);
        assert_eq!(translate(&k, &unrelated), unrelated);

        delete(&k, ct);
        assert_eq!(translate(&k, &orig), orig);
    }

    #[test]
    fn untranslated_connections_record_nothing() {
        let k = SimKernel::new();
        let orig = NamespacedFlow::new(v4([10, 0, 0, 1], 1000, [10, 0, 0, 2], 80), NS);
        record_translation(&k, &orig, &orig.flipped());
        assert!(!k.conntrack().contains(&orig));
    }

    #[test]
    fn chained_translations_are_followed() {
        let k = SimKernel::new();
        let a = NamespacedFlow::new(v4([10, 0, 0, 1], 1000, [192, 168, 0, 1], 80), NS);
        let b = NamespacedFlow::new(v4([10, 0, 0, 1], 1000, [172, 16, 0, 1], 80), NS);
        let c = NamespacedFlow::new(v4([10, 0, 0, 1], 1000, [172, 16, 0, 9], 8080), NS);
        record_translation(&k, &a, &b.flipped());
        record_translation(&k, &b, &c.flipped());
        assert_eq!(translate(&k, &a), c);
    }

    #[test]
    fn long_chains_stop_at_the_hop_limit() {
        let k = SimKernel::new();
        let hop = |i: u8| NamespacedFlow::new(v4([10, 0, 0, 1], 1000, [172, 16, 0, i], 80), NS);
        for i in 0..20u8 {
            k.conntrack().store(&hop(i), &hop(i + 1), UpdateFlag::Any).unwrap();
        }
        assert_eq!(translate(&k, &hop(0)), hop(MAX_NAT_HOPS as u8));
        assert_eq!(k.net_stats_total().nat_hop_limit, 1);
    }
}
