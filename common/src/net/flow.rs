//! Flow-to-pid routes.
//!
//! A route maps the local end of a flow, `(addr, port, netns, l4)`, to the
//! tgid owning it. Listening sockets register the wildcard address, so a
//! lookup retries with a zero address. BIND routes are authoritative: the
//! other sources never overwrite them and flow cleanup never deletes them.

use crate::consts::RuntimeConst;
use crate::kernel::{plain, Kernel, Map, UpdateFlag};
use crate::kobj::SockInfo;
use crate::net::packet::{Direction, NamespacedFlow, Packet};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PidRouteKey {
    pub addr: [u8; 16],
    pub netns: u32,
    pub port: u16,
    pub l4_protocol: u16,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteType {
    Bind = 0,
    FlowClassification = 1,
    Procfs = 2,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PidRouteEntry {
    /// `struct sock` that registered the route, 0 if unknown.
    pub owner_sk: u64,
    pub pid: u32,
    pub entry_type: u32,
}

/// Last route registered by a socket, so its release can find it.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SockMeta {
    pub key: PidRouteKey,
}

plain!(PidRouteKey, PidRouteEntry, SockMeta);

pub fn route_key(addr: &[u8; 16], port: u16, netns: u32, l4_protocol: u16) -> PidRouteKey {
    PidRouteKey {
        addr: *addr,
        netns,
        port,
        l4_protocol,
    }
}

/// Key of the local end of a socket.
pub fn sock_route_key(info: &SockInfo) -> PidRouteKey {
    route_key(&info.saddr, info.sport, info.netns, info.protocol)
}

/// Key of the local end of a packet flow.
pub fn local_route_key(ns_flow: &NamespacedFlow, direction: Direction) -> PidRouteKey {
    let flow = &ns_flow.flow;
    match direction {
        Direction::Egress => route_key(&flow.saddr, flow.sport, ns_flow.netns, flow.l4_protocol),
        Direction::Ingress => route_key(&flow.daddr, flow.dport, ns_flow.netns, flow.l4_protocol),
    }
}

fn register_route<K: Kernel>(k: &K, key: &PidRouteKey, pid: u32, sk: u64, entry_type: RouteType) -> bool {
    if pid == 0 {
        return false;
    }
    if entry_type != RouteType::Bind {
        if let Some(existing) = k.flow_pid().lookup(key) {
            if existing.entry_type == RouteType::Bind as u32 {
                return false;
            }
        }
    }
    let entry = PidRouteEntry {
        owner_sk: sk,
        pid,
        entry_type: entry_type as u32,
    };
    if k.flow_pid().store(key, &entry, UpdateFlag::Any).is_err() {
        return false;
    }
    if sk != 0 {
        let _ = k.sock_meta().store(&sk, &SockMeta { key: *key }, UpdateFlag::Any);
        if let Some(cookie) = k.socket_cookie(sk) {
            let _ = k.sock_cookie_pid().store(&cookie, &pid, UpdateFlag::Any);
        }
    }
    true
}

/// `inet_bind` / `inet6_bind` exit.
pub fn register_bind<K: Kernel>(k: &K, sk: u64, key: &PidRouteKey, pid: u32) -> bool {
    register_route(k, key, pid, sk, RouteType::Bind)
}

/// `security_sk_classify_flow`.
pub fn register_flow_classification<K: Kernel>(k: &K, sk: u64, key: &PidRouteKey, pid: u32) -> bool {
    register_route(k, key, pid, sk, RouteType::FlowClassification)
}

/// Socket found while the agent walked `/proc/<pid>/fd`.
pub fn register_procfs<K: Kernel>(k: &K, sk: u64, key: &PidRouteKey, pid: u32) -> bool {
    register_route(k, key, pid, sk, RouteType::Procfs)
}

/// Socket release paths. Only the owner, or an ownerless entry, is removed.
pub fn flush_sock<K: Kernel>(k: &K, sk: u64) {
    if sk == 0 {
        return;
    }
    if let Some(meta) = k.sock_meta().lookup(&sk) {
        let owned = k
            .flow_pid()
            .lookup(&meta.key)
            .map(|entry| entry.owner_sk == sk || entry.owner_sk == 0)
            .unwrap_or(false);
        if owned {
            let _ = k.flow_pid().delete(&meta.key);
        }
        let _ = k.sock_meta().delete(&sk);
    }
    if let Some(cookie) = k.socket_cookie(sk) {
        let _ = k.sock_cookie_pid().delete(&cookie);
    }
}

/// Removes a route learned from traffic; BIND routes stay.
pub fn delete_route<K: Kernel>(k: &K, key: &PidRouteKey) {
    let removable = k
        .flow_pid()
        .lookup(key)
        .map(|entry| entry.entry_type != RouteType::Bind as u32)
        .unwrap_or(false);
    if removable {
        let _ = k.flow_pid().delete(key);
    }
}

pub fn lookup_route<K: Kernel>(k: &K, key: &PidRouteKey) -> Option<PidRouteEntry> {
    if let Some(entry) = k.flow_pid().lookup(key) {
        return Some(entry);
    }
    let wildcard = PidRouteKey {
        addr: [0; 16],
        ..*key
    };
    k.flow_pid().lookup(&wildcard)
}

/// Owner of a parsed packet: socket cookie, then the current task where the
/// classifier can trust it, then the translated flow. 0 when unknown.
pub fn resolve_pid<K: Kernel>(k: &K, pkt: &Packet) -> u32 {
    if pkt.sk_cookie != 0 {
        if let Some(pid) = k.sock_cookie_pid().lookup(&pkt.sk_cookie).filter(|&pid| pid != 0) {
            return pid;
        }
    }
    let direction = pkt.direction();
    if direction == Direction::Egress && k.constant(RuntimeConst::CurrentPidInClassifier) != 0 {
        let tgid = k.tgid();
        if tgid != 0 {
            return tgid;
        }
    }
    let key = local_route_key(&pkt.translated_ns_flow, direction);
    lookup_route(k, &key).map(|entry| entry.pid).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{ETH_P_IP, IPPROTO_TCP};
    use crate::event::Flow;
    use crate::sim::SimKernel;

    const NS: u32 = 4026532100;

    fn key(addr: [u8; 4], port: u16) -> PidRouteKey {
        let mut a = [0u8; 16];
        a[..4].copy_from_slice(&addr);
        route_key(&a, port, NS, IPPROTO_TCP)
    }

    fn ingress_to(addr: [u8; 4], port: u16) -> Packet {
        let mut flow = Flow {
            sport: 50000,
            dport: port,
            l3_protocol: ETH_P_IP,
            l4_protocol: IPPROTO_TCP,
            ..Flow::default()
        };
        flow.saddr[..4].copy_from_slice(&[10, 9, 9, 9]);
        flow.daddr[..4].copy_from_slice(&addr);
        let ns_flow = NamespacedFlow::new(flow, NS);
        Packet {
            ns_flow,
            translated_ns_flow: ns_flow,
            direction: Direction::Ingress as u32,
            ..Packet::default()
        }
    }

    #[test]
    fn wildcard_bind_matches_any_local_address() {
        let k = SimKernel::new();
        assert!(register_bind(&k, 0x1000, &key([0, 0, 0, 0], 8080), 42));
        assert_eq!(resolve_pid(&k, &ingress_to([10, 0, 0, 7], 8080)), 42);
        assert_eq!(resolve_pid(&k, &ingress_to([10, 0, 0, 7], 8081)), 0);
    }

    #[test]
    fn bind_routes_are_not_overwritten_or_cleaned() {
        let k = SimKernel::new();
        let route = key([10, 0, 0, 7], 8080);
        register_bind(&k, 0x1000, &route, 42);
        assert!(!register_flow_classification(&k, 0x2000, &route, 43));
        assert!(!register_procfs(&k, 0x2000, &route, 44));
        delete_route(&k, &route);
        assert_eq!(lookup_route(&k, &route).unwrap().pid, 42);
    }

    #[test]
    fn release_only_removes_owned_routes() {
        let k = SimKernel::new();
        let route = key([10, 0, 0, 7], 9000);
        register_flow_classification(&k, 0x1000, &route, 42);
        // another socket takes the route over
        register_flow_classification(&k, 0x2000, &route, 43);
        flush_sock(&k, 0x1000);
        assert_eq!(lookup_route(&k, &route).unwrap().pid, 43);
        flush_sock(&k, 0x2000);
        assert!(lookup_route(&k, &route).is_none());
    }

    #[test]
    fn socket_cookie_wins_over_routes() {
        let k = SimKernel::new();
        let sk = k.alloc_sock_with_cookie(0xc00c1e);
        register_bind(&k, sk, &key([0, 0, 0, 0], 8080), 42);
        let mut pkt = ingress_to([10, 0, 0, 7], 9999);
        pkt.sk_cookie = 0xc00c1e;
        assert_eq!(resolve_pid(&k, &pkt), 42);
        flush_sock(&k, sk);
        assert_eq!(resolve_pid(&k, &pkt), 0);
    }

    #[test]
    fn current_task_is_used_on_egress_when_trusted() {
        let k = SimKernel::new();
        k.set_current(77, 77);
        let mut pkt = ingress_to([10, 0, 0, 7], 1);
        pkt.direction = Direction::Egress as u32;
        assert_eq!(resolve_pid(&k, &pkt), 0);
        k.set_constant(RuntimeConst::CurrentPidInClassifier, 1);
        assert_eq!(resolve_pid(&k, &pkt), 77);
    }
}
