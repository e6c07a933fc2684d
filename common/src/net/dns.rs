//! DNS request and response parsers.
//!
//! Requests are parsed on egress, one question per program run; the parser
//! tail-calls itself while questions remain, up to `DNS_MAX_QUESTIONS`.
//! Responses are parsed on ingress and deduplicated on
//! `(id, size, netns)` for `DNS_RESPONSE_DEDUP_WINDOW_NS`.

use crate::consts::{
    DNS_HEADER_LEN, DNS_MAX_NAME_LEN, DNS_MAX_QUESTIONS, DNS_RESPONSE_DEDUP_WINDOW_NS,
    DNS_RESPONSE_PAYLOAD_LEN,
};
use crate::emit::send_event_with;
use crate::event::EventType;
use crate::kernel::{plain, Kernel, Map, Next, Prog, UpdateFlag};
use crate::net::network_context;
use crate::net::packet::{Packet, PacketReader};
use crate::stats;

const QR_RESPONSE: u16 = 1 << 15;
const MAX_LABEL_LEN: u8 = 63;
const COMPRESSION_MASK: u8 = 0xc0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
}

impl DnsHeader {
    pub fn is_response(&self) -> bool {
        self.flags & QR_RESPONSE != 0
    }

    pub fn rcode(&self) -> u16 {
        self.flags & 0x000f
    }
}

/// Dedup key of a response.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DnsResponseKey {
    pub id: u16,
    pub _pad: u16,
    pub size: u32,
    pub netns: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DnsResponseEntry {
    pub last_emitted: u64,
    /// Duplicates dropped since the last emission.
    pub suppressed: u32,
    pub _pad: u32,
}

plain!(DnsResponseKey, DnsResponseEntry);

fn read_header<P: PacketReader>(skb: &P, offset: u32) -> Option<DnsHeader> {
    let mut raw = [0u8; DNS_HEADER_LEN as usize];
    if !skb.load(offset, &mut raw) {
        return None;
    }
    let field = |i: usize| u16::from_be_bytes([raw[i], raw[i + 1]]);
    Some(DnsHeader {
        id: field(0),
        flags: field(2),
        qdcount: field(4),
        ancount: field(6),
    })
}

/// Copies the wire-format qname at `offset` into `out`, including the final
/// zero label. Returns the name length and the offset right after it.
///
/// A compression pointer ends the name; it is not followed.
pub fn read_qname<P: PacketReader>(
    skb: &P,
    offset: u32,
    out: &mut [u8; DNS_MAX_NAME_LEN],
) -> Option<(usize, u32)> {
    let mut pos = 0usize;
    let mut cursor = offset;
    while pos < DNS_MAX_NAME_LEN {
        let mut len = [0u8; 1];
        if !skb.load(cursor, &mut len) {
            return None;
        }
        let len = len[0];
        if len == 0 {
            out[pos] = 0;
            return Some((pos + 1, cursor + 1));
        }
        if len & COMPRESSION_MASK == COMPRESSION_MASK {
            out[pos] = 0;
            return Some((pos + 1, cursor + 2));
        }
        if len > MAX_LABEL_LEN {
            return None;
        }
        let end = pos + 1 + len as usize;
        if end >= DNS_MAX_NAME_LEN {
            return None;
        }
        if !skb.load(cursor, &mut out[pos..end]) {
            return None;
        }
        pos = end;
        cursor += 1 + len as u32;
    }
    None
}

/// Body of the `DnsRequest` tail-call target.
pub fn dns_request_program<K: Kernel, P: PacketReader>(k: &K, skb: &P) -> Next {
    let Some(mut pkt) = k.packets().lookup(&0) else {
        return Next::Done;
    };

    if pkt.dns_cursor == 0 {
        let Some(header) = read_header(skb, pkt.payload_offset) else {
            return Next::Done;
        };
        if header.is_response() || header.qdcount == 0 {
            return Next::Done;
        }
        pkt.dns_cursor = pkt.payload_offset + DNS_HEADER_LEN;
        pkt.dns_remaining = header.qdcount.min(DNS_MAX_QUESTIONS);
        let staged = k.dns_event().with_mut(&0, |ev| {
            ev.network = network_context(&pkt);
            ev.id = header.id;
            ev.qdcount = header.qdcount;
        });
        if staged.is_none() {
            return Next::Done;
        }
    }

    let sent = k.dns_event().with_mut(&0, |ev| {
        let (name_len, after) = read_qname(skb, pkt.dns_cursor, &mut ev.name)?;
        let mut tail = [0u8; 4];
        if !skb.load(after, &mut tail) {
            return None;
        }
        ev.name_len = name_len as u16;
        ev.qtype = u16::from_be_bytes([tail[0], tail[1]]);
        ev.qclass = u16::from_be_bytes([tail[2], tail[3]]);
        send_event_with(k, EventType::Dns, ev, pkt.owner(), 0);
        Some(after + 4)
    });
    let Some(Some(next_cursor)) = sent else {
        return Next::Done;
    };

    pkt.dns_remaining = pkt.dns_remaining.saturating_sub(1);
    pkt.dns_cursor = next_cursor;
    if k.packets().store(&0, &pkt, UpdateFlag::Any).is_err() {
        return Next::Done;
    }
    if pkt.dns_remaining == 0 || next_cursor >= skb.len() {
        return Next::Done;
    }
    Next::TailCall(Prog::DnsRequest)
}

/// Rcodes muted by the agent, one bit per code.
fn muted<K: Kernel>(k: &K, rcode: u16) -> bool {
    let mask = k.dns_rcode_mute().lookup(&0).unwrap_or(0);
    rcode < 32 && mask & (1 << rcode) != 0
}

/// Records an emission of `key`; returns the duplicates it replaces, or
/// `None` when the response is a duplicate itself.
fn dedup<K: Kernel>(k: &K, key: &DnsResponseKey, now: u64) -> Option<u32> {
    let fresh = k.dns_responses().with_mut(key, |entry| {
        if now.saturating_sub(entry.last_emitted) < DNS_RESPONSE_DEDUP_WINDOW_NS {
            entry.suppressed += 1;
            return None;
        }
        let suppressed = entry.suppressed;
        entry.last_emitted = now;
        entry.suppressed = 0;
        Some(suppressed)
    });
    match fresh {
        Some(result) => result,
        None => {
            let entry = DnsResponseEntry {
                last_emitted: now,
                ..DnsResponseEntry::default()
            };
            let _ = k.dns_responses().store(key, &entry, UpdateFlag::Any);
            Some(0)
        }
    }
}

/// Body of the `DnsResponse` tail-call target.
pub fn dns_response_program<K: Kernel, P: PacketReader>(k: &K, skb: &P) -> Next {
    let Some(pkt) = k.packets().lookup(&0) else {
        return Next::Done;
    };
    let Some(header) = read_header(skb, pkt.payload_offset) else {
        return Next::Done;
    };
    if !header.is_response() {
        return Next::Done;
    }
    let rcode = header.rcode();
    let is_muted = muted(k, rcode);
    if is_muted && rcode != 0 {
        stats::net(k, |s| s.dns_muted += 1);
        return Next::Done;
    }

    let key = DnsResponseKey {
        id: header.id,
        _pad: 0,
        size: pkt.payload_len,
        netns: pkt.ns_flow.netns,
    };
    let Some(suppressed) = dedup(k, &key, k.now_ns()) else {
        stats::net(k, |s| s.dns_suppressed += 1);
        return Next::Done;
    };

    let _ = k.dns_response_event().with_mut(&0, |ev| {
        ev.network = network_context(&pkt);
        ev.id = header.id;
        ev.rcode = rcode;
        ev.answer_count = header.ancount;
        ev.minimal = is_muted as u16;
        ev.suppressed = suppressed;
        ev.payload_len = 0;
        if !is_muted {
            let len = (pkt.payload_len as usize).min(DNS_RESPONSE_PAYLOAD_LEN);
            if skb.load(pkt.payload_offset, &mut ev.payload[..len]) {
                ev.payload_len = len as u32;
            }
        }
        send_event_with(k, EventType::DnsResponse, ev, pkt.owner(), 0);
    });
    Next::Done
}

/// Dotted form of a wire-format qname.
#[cfg(any(feature = "std", test))]
pub fn qname_to_string(name: &[u8]) -> String {
    let mut out = String::new();
    let mut rest = name;
    while let Some((&len, tail)) = rest.split_first() {
        let len = len as usize;
        if len == 0 || len > tail.len() {
            break;
        }
        if !out.is_empty() {
            out.push('.');
        }
        out.push_str(&String::from_utf8_lossy(&tail[..len]));
        rest = &tail[len..];
    }
    out
}

/// Builds a wire-format qname from its dotted form.
#[cfg(any(feature = "std", test))]
pub fn encode_qname(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 2);
    for label in name.split('.').filter(|l| !l.is_empty()) {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out
}

/// Packet in the per-CPU slot, for tests that drive a program directly.
#[cfg(test)]
fn staged<K: Kernel>(k: &K) -> Packet {
    k.packets().lookup(&0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DnsEvent, DnsResponseEvent};
    use crate::net::packet::Direction;
    use crate::sim::{SimKernel, SimPacket};

    fn query(id: u16, names: &[(&str, u16)]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&id.to_be_bytes());
        msg.extend_from_slice(&0x0100u16.to_be_bytes());
        msg.extend_from_slice(&(names.len() as u16).to_be_bytes());
        msg.extend_from_slice(&[0; 6]);
        for (name, qtype) in names {
            msg.extend_from_slice(&encode_qname(name));
            msg.extend_from_slice(&qtype.to_be_bytes());
            msg.extend_from_slice(&1u16.to_be_bytes());
        }
        msg
    }

    fn response(id: u16, rcode: u16, body: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&id.to_be_bytes());
        msg.extend_from_slice(&(0x8180u16 | rcode).to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&[0; 4]);
        msg.extend_from_slice(body);
        msg
    }

    fn setup() -> SimKernel {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Dns, EventType::DnsResponse]);
        k
    }

    #[test]
    fn every_question_is_reported() {
        let k = setup();
        let msg = query(0x1234, &[("example.com", 1), ("example.org", 28)]);
        let skb = SimPacket::udp4([10, 0, 0, 2], 40000, [10, 0, 0, 1], 53, &msg);
        k.run_classifier(&skb, Direction::Egress);

        let events = k.events_of(EventType::Dns);
        assert_eq!(events.len(), 2);
        let first: DnsEvent = events[0].decode();
        assert_eq!(first.id, 0x1234);
        assert_eq!(first.qdcount, 2);
        assert_eq!(qname_to_string(&first.name[..first.name_len as usize]), "example.com");
        assert_eq!(first.qtype, 1);
        assert_eq!(first.qclass, 1);
        let second: DnsEvent = events[1].decode();
        assert_eq!(qname_to_string(&second.name[..second.name_len as usize]), "example.org");
        assert_eq!(second.qtype, 28);
        assert_eq!(staged(&k).dns_remaining, 0);
    }

    #[test]
    fn last_question_leaves_the_cursor_at_the_end() {
        let k = setup();
        let msg = query(9, &[("a.test", 1)]);
        let skb = SimPacket::udp4([10, 0, 0, 2], 40000, [10, 0, 0, 1], 53, &msg);
        k.run_classifier(&skb, Direction::Egress);

        assert_eq!(k.events_of(EventType::Dns).len(), 1);
        let pkt = staged(&k);
        assert_eq!(pkt.dns_remaining, 0);
        assert_eq!(pkt.dns_cursor, pkt.payload_offset + msg.len() as u32);
    }

    #[test]
    fn question_count_is_capped() {
        let k = setup();
        let names: Vec<(String, u16)> = (0..12).map(|i| (format!("h{}.test", i), 1)).collect();
        let refs: Vec<(&str, u16)> = names.iter().map(|(n, t)| (n.as_str(), *t)).collect();
        let skb = SimPacket::udp4([10, 0, 0, 2], 40000, [10, 0, 0, 1], 53, &query(1, &refs));
        k.run_classifier(&skb, Direction::Egress);
        assert_eq!(k.events_of(EventType::Dns).len(), DNS_MAX_QUESTIONS as usize);
    }

    #[test]
    fn compression_pointer_ends_the_name() {
        let mut wire = encode_qname("www");
        wire.pop();
        wire.extend_from_slice(&[0xc0, 0x0c]);
        let skb = SimPacket::raw(wire);
        let mut out = [0u8; DNS_MAX_NAME_LEN];
        let (len, after) = read_qname(&skb, 0, &mut out).unwrap();
        assert_eq!(&out[..len], b"\x03www\x00");
        assert_eq!(after, 6);
    }

    #[test]
    fn duplicate_responses_are_suppressed_and_counted() {
        let k = setup();
        let msg = response(7, 0, b"answer");
        let skb = SimPacket::udp4([10, 0, 0, 1], 53, [10, 0, 0, 2], 40000, &msg);
        k.run_classifier(&skb, Direction::Ingress);
        k.run_classifier(&skb, Direction::Ingress);
        k.run_classifier(&skb, Direction::Ingress);
        assert_eq!(k.events_of(EventType::DnsResponse).len(), 1);
        assert_eq!(k.net_stats_total().dns_suppressed, 2);

        k.advance(DNS_RESPONSE_DEDUP_WINDOW_NS);
        k.run_classifier(&skb, Direction::Ingress);
        let events = k.events_of(EventType::DnsResponse);
        assert_eq!(events.len(), 2);
        let ev: DnsResponseEvent = events[1].decode();
        assert_eq!(ev.suppressed, 2);
        assert_eq!(ev.payload_len as usize, msg.len());
    }

    #[test]
    fn muted_rcodes_are_dropped_and_muted_success_is_minimal() {
        let k = setup();
        k.dns_rcode_mute().store(&0, &((1 << 3) | 1), UpdateFlag::Any).unwrap();

        let nxdomain = SimPacket::udp4([10, 0, 0, 1], 53, [10, 0, 0, 2], 40000, &response(8, 3, b""));
        k.run_classifier(&nxdomain, Direction::Ingress);
        assert!(k.events_of(EventType::DnsResponse).is_empty());
        assert_eq!(k.net_stats_total().dns_muted, 1);

        let ok = SimPacket::udp4([10, 0, 0, 1], 53, [10, 0, 0, 2], 40000, &response(9, 0, b"data"));
        k.run_classifier(&ok, Direction::Ingress);
        let ev: DnsResponseEvent = k.events_of(EventType::DnsResponse)[0].decode();
        assert_eq!(ev.minimal, 1);
        assert_eq!(ev.payload_len, 0);
        assert_eq!(ev.rcode, 0);
    }

    #[test]
    fn qname_encoding_round_trips() {
        assert_eq!(encode_qname("example.com"), b"\x07example\x03com\x00");
        assert_eq!(qname_to_string(b"\x07example\x03com\x00"), "example.com");
    }
}
