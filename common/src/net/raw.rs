//! Raw packet sampling.
//!
//! Egress packets go through the drop slot first, which applies the
//! agent's drop list before handing over to the sampler. The sampler is
//! gated by one global token bucket.

use crate::consts::{RuntimeConst, RAW_PACKET_MAX_LENGTH};
use crate::emit::send_event_with;
use crate::event::EventType;
use crate::kernel::{plain, Kernel, Map, Next, Prog};
use crate::net::flow::{local_route_key, PidRouteKey};
use crate::net::network_context;
use crate::net::packet::PacketReader;
use crate::stats;

const NS_PER_SEC: u128 = 1_000_000_000;

/// Token bucket written by the agent; `tokens` and `last_refill` are kernel
/// owned.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenBucket {
    pub tokens: u64,
    pub last_refill: u64,
    /// Tokens per second.
    pub rate: u64,
    pub burst: u64,
}

plain!(TokenBucket);

impl TokenBucket {
    pub fn new(rate: u64, burst: u64) -> Self {
        Self {
            rate,
            burst,
            ..Self::default()
        }
    }

    /// Takes one token at `now`; false when the bucket is empty.
    pub fn take(&mut self, now: u64) -> bool {
        if self.rate == 0 || self.burst == 0 {
            return false;
        }
        if self.last_refill == 0 {
            self.tokens = self.burst;
            self.last_refill = now;
        } else {
            let elapsed = now.saturating_sub(self.last_refill) as u128;
            let refill = elapsed * self.rate as u128 / NS_PER_SEC;
            if refill > 0 {
                self.tokens = (self.tokens as u128 + refill).min(self.burst as u128) as u64;
                self.last_refill = now;
            }
        }
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }
}

fn take_token<K: Kernel>(k: &K) -> bool {
    let now = k.now_ns();
    k.raw_packet_bucket()
        .with_mut(&0, |bucket| bucket.take(now))
        .unwrap_or(false)
}

fn drop_listed<K: Kernel>(k: &K, key: &PidRouteKey) -> bool {
    let hit = |key: &PidRouteKey| k.raw_packet_drop().lookup(key).map(|v| v != 0).unwrap_or(false);
    hit(key)
        || hit(&PidRouteKey {
            addr: [0; 16],
            ..*key
        })
}

/// Body of the `RawPacketDrop` tail-call target.
pub fn raw_packet_drop_program<K: Kernel>(k: &K) -> Next {
    let Some(pkt) = k.packets().lookup(&0) else {
        return Next::Done;
    };
    let key = local_route_key(&pkt.translated_ns_flow, pkt.direction());
    if drop_listed(k, &key) {
        stats::net(k, |s| s.raw_packet_dropped += 1);
        return Next::Drop;
    }
    Next::TailCall(Prog::RawPacket)
}

/// Body of the `RawPacket` tail-call target.
pub fn raw_packet_program<K: Kernel, P: PacketReader>(k: &K, skb: &P) -> Next {
    if k.constant(RuntimeConst::RawPacketEnabled) == 0 {
        return Next::Done;
    }
    let Some(pkt) = k.packets().lookup(&0) else {
        return Next::Done;
    };
    if !take_token(k) {
        stats::net(k, |s| s.raw_packet_throttled += 1);
        return Next::Done;
    }
    let _ = k.raw_packet_event().with_mut(&0, |ev| {
        ev.network = network_context(&pkt);
        let len = (skb.len() as usize).min(RAW_PACKET_MAX_LENGTH);
        ev.len = if skb.load(0, &mut ev.data[..len]) { len as u32 } else { 0 };
        send_event_with(k, EventType::RawPacket, ev, pkt.owner(), 0);
    });
    Next::Done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::IPPROTO_TCP;
    use crate::event::RawPacketEvent;
    use crate::kernel::UpdateFlag;
    use crate::net::flow::route_key;
    use crate::net::packet::Direction;
    use crate::sim::{SimKernel, SimPacket};

    fn setup(rate: u64, burst: u64) -> SimKernel {
        let k = SimKernel::new();
        k.enable_events(&[EventType::RawPacket]);
        k.set_constant(RuntimeConst::RawPacketEnabled, 1);
        k.raw_packet_bucket()
            .store(&0, &TokenBucket::new(rate, burst), UpdateFlag::Any)
            .unwrap();
        k
    }

    #[test]
    fn bucket_refills_at_its_rate() {
        let mut bucket = TokenBucket::new(2, 2);
        let t0 = 1_000;
        assert!(bucket.take(t0));
        assert!(bucket.take(t0));
        assert!(!bucket.take(t0));
        assert!(bucket.take(t0 + 500_000_000));
        assert!(!bucket.take(t0 + 500_000_000));
        // idle time never exceeds the burst
        assert!(bucket.take(t0 + 60_000_000_000));
        assert!(bucket.take(t0 + 60_000_000_000));
        assert!(!bucket.take(t0 + 60_000_000_000));
    }

    #[test]
    fn samples_are_throttled_and_truncated() {
        let k = setup(1, 1);
        let payload = [0xabu8; 400];
        let skb = SimPacket::tcp4([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000, &payload);
        k.run_classifier(&skb, Direction::Ingress);
        k.run_classifier(&skb, Direction::Ingress);

        let events = k.events_of(EventType::RawPacket);
        assert_eq!(events.len(), 1);
        let ev: RawPacketEvent = events[0].decode();
        assert_eq!(ev.len as usize, RAW_PACKET_MAX_LENGTH);
        assert_eq!(k.net_stats_total().raw_packet_throttled, 1);
    }

    #[test]
    fn listed_egress_flows_are_dropped() {
        let k = setup(100, 100);
        let mut local = [0u8; 16];
        local[..4].copy_from_slice(&[10, 0, 0, 1]);
        k.raw_packet_drop()
            .store(&route_key(&local, 1000, 0, IPPROTO_TCP), &1, UpdateFlag::Any)
            .unwrap();

        let listed = SimPacket::tcp4([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000, b"x");
        assert_eq!(k.run_classifier(&listed, Direction::Egress), Next::Drop);
        let other = SimPacket::tcp4([10, 0, 0, 1], 1001, [10, 0, 0, 2], 2000, b"x");
        assert_eq!(k.run_classifier(&other, Direction::Egress), Next::Done);

        assert_eq!(k.net_stats_total().raw_packet_dropped, 1);
        assert_eq!(k.events_of(EventType::RawPacket).len(), 1);
    }

    #[test]
    fn disabled_sampling_sends_nothing() {
        let k = setup(100, 100);
        k.set_constant(RuntimeConst::RawPacketEnabled, 0);
        let skb = SimPacket::tcp4([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000, b"x");
        k.run_classifier(&skb, Direction::Ingress);
        assert!(k.events_of(EventType::RawPacket).is_empty());
    }
}
