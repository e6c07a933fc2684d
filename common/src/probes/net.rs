//! Socket, netfilter and net device hooks.
//!
//! These feed the flow-to-pid routes and the NAT translations the packet
//! classifiers rely on, and emit BIND, NET_DEVICE and VETH_PAIR.

use crate::consts::{AF_INET, AF_INET6, SEGMENT_BUFFER_LEN};
use crate::container::parse_pid;
use crate::event::EventType;
use crate::kernel::{Kernel, Map, Next, UpdateFlag};
use crate::kobj;
use crate::net::{conntrack, device, flow};
use crate::probes::callbacks::emit_syscall;
use crate::syscall_cache::{
    cache_tracked_syscall, is_unhandled_error, pop_syscall, update_syscall, SyscallCache, SyscallData,
};

// ─────────────────────────────────────────────────────────────────────────────
// bind
// ─────────────────────────────────────────────────────────────────────────────

/// `bind(2)` entry. Cached even when BIND is disabled: the route is needed.
pub fn sys_bind_enter<K: Kernel>(k: &K) -> Next {
    cache_tracked_syscall(
        k,
        SyscallCache::new(
            EventType::Bind,
            SyscallData::Bind {
                socket: 0,
                addr: [0; 16],
                family: 0,
                port: 0,
                protocol: 0,
            },
        ),
    );
    Next::Done
}

/// `security_socket_bind(sock, address, addrlen)`; `address` is the kernel
/// copy of the user sockaddr.
pub fn handle_security_socket_bind<K: Kernel>(k: &K, socket: u64, address: u64) -> Next {
    let sa_family: u16 = k.read(address).unwrap_or(0);
    let sa_port = u16::from_be(k.read(address.wrapping_add(2)).unwrap_or(0));
    let mut sa_addr = [0u8; 16];
    match sa_family {
        AF_INET => {
            let a: [u8; 4] = k.read(address.wrapping_add(4)).unwrap_or([0; 4]);
            sa_addr[..4].copy_from_slice(&a);
        }
        AF_INET6 => sa_addr = k.read(address.wrapping_add(8)).unwrap_or([0; 16]),
        _ => {}
    }
    let sk_protocol = kobj::read_sock(k, kobj::socket_sk(k, socket))
        .map(|info| info.protocol)
        .unwrap_or(0);
    let _ = update_syscall(k, EventType::Bind, |entry| {
        if let SyscallData::Bind {
            socket: slot,
            addr,
            family,
            port,
            protocol,
        } = &mut entry.data
        {
            *slot = socket;
            *addr = sa_addr;
            *family = sa_family;
            *port = sa_port;
            *protocol = sk_protocol;
        }
    });
    Next::Done
}

/// `bind(2)` exit: registers the route, then emits.
pub fn sys_bind_exit<K: Kernel>(k: &K, retval: i64) -> Next {
    let Some(mut entry) = pop_syscall(k, EventType::Bind) else {
        return Next::Done;
    };
    let SyscallData::Bind {
        socket,
        addr,
        port: requested_port,
        protocol,
        ..
    } = entry.data
    else {
        return Next::Done;
    };
    if retval == 0 && socket != 0 {
        let sk = kobj::socket_sk(k, socket);
        if let Some(info) = kobj::read_sock(k, sk) {
            // port 0 asked the kernel to pick one
            let port = if info.sport != 0 { info.sport } else { requested_port };
            let key = flow::route_key(&addr, port, info.netns, protocol);
            flow::register_bind(k, sk, &key, k.tgid());
            if let SyscallData::Bind { port: p, .. } = &mut entry.data {
                *p = port;
            }
        }
    }
    if !is_unhandled_error(retval) {
        entry.retval = retval;
        emit_syscall(k, &entry);
    }
    Next::Done
}

// ─────────────────────────────────────────────────────────────────────────────
// Flow attribution
// ─────────────────────────────────────────────────────────────────────────────

/// `security_sk_classify_flow(sk, flic)`: an outgoing flow is being set up
/// by the current task.
pub fn handle_sk_classify_flow<K: Kernel>(k: &K, sk: u64, fl: u64) -> Next {
    let tgid = k.tgid();
    if tgid == 0 {
        return Next::Done;
    }
    let Some(info) = kobj::read_sock(k, sk) else {
        return Next::Done;
    };
    let (mut addr, mut port) = kobj::read_flowi_source(k, fl, info.family);
    if port == 0 {
        port = info.sport;
    }
    if addr == [0; 16] {
        addr = info.saddr;
    }
    let key = flow::route_key(&addr, port, info.netns, info.protocol);
    flow::register_flow_classification(k, sk, &key, tgid);
    Next::Done
}

/// `sk_destruct`, `inet_release` and `inet_shutdown`.
pub fn handle_sock_release<K: Kernel>(k: &K, sk: u64) -> Next {
    flow::flush_sock(k, sk);
    Next::Done
}

/// `nf_nat_manip_pkt` / `nf_nat_packet`.
pub fn handle_nf_nat<K: Kernel>(k: &K, ct: u64) -> Next {
    conntrack::record_nat(k, ct);
    Next::Done
}

/// `nf_ct_delete`.
pub fn handle_nf_ct_delete<K: Kernel>(k: &K, ct: u64) -> Next {
    conntrack::delete(k, ct);
    Next::Done
}

// ─────────────────────────────────────────────────────────────────────────────
// procfs snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// `proc_fd_link(dentry, path)`: the agent is reading `/proc/<pid>/fd/<n>`.
pub fn handle_proc_fd_link<K: Kernel>(k: &K, dentry: u64) -> Next {
    if !k.is_agent() {
        return Next::Done;
    }
    let pid_dentry = kobj::dentry_parent(k, kobj::dentry_parent(k, dentry));
    let mut name = [0u8; SEGMENT_BUFFER_LEN];
    let len = kobj::dentry_name(k, pid_dentry, &mut name);
    if let Some(pid) = parse_pid(&name[..len]).filter(|&pid| pid != 0) {
        let _ = k.procfs_pid().store(&k.pid_tgid(), &pid, UpdateFlag::Any);
    }
    Next::Done
}

/// `path_get(path)` right after `proc_fd_link`: the link target, a socket
/// inode when the fd is a socket.
pub fn handle_path_get<K: Kernel>(k: &K, path: u64) -> Next {
    if !k.is_agent() {
        return Next::Done;
    }
    let key = k.pid_tgid();
    let Some(pid) = k.procfs_pid().lookup(&key) else {
        return Next::Done;
    };
    let _ = k.procfs_pid().delete(&key);
    let (dentry, _) = kobj::path_parts(k, path);
    let sk = kobj::inode_sock(k, kobj::dentry_inode(k, dentry));
    if let Some(info) = kobj::read_sock(k, sk) {
        flow::register_procfs(k, sk, &flow::sock_route_key(&info), pid);
    }
    Next::Done
}

// ─────────────────────────────────────────────────────────────────────────────
// Net devices
// ─────────────────────────────────────────────────────────────────────────────

pub fn veth_newlink_enter<K: Kernel>(k: &K) -> Next {
    device::handle_veth_newlink_enter(k);
    Next::Done
}

pub fn veth_newlink_exit<K: Kernel>(k: &K) -> Next {
    device::handle_veth_newlink_exit(k);
    Next::Done
}

pub fn register_netdevice_enter<K: Kernel>(k: &K, dev: u64) -> Next {
    device::handle_register_netdevice_enter(k, dev);
    Next::Done
}

pub fn register_netdevice_exit<K: Kernel>(k: &K, retval: i64) -> Next {
    device::handle_register_netdevice_exit(k, retval);
    Next::Done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{IPPROTO_TCP, IPPROTO_UDP, RuntimeConst};
    use crate::event::BindEvent;
    use crate::kobj::SockInfo;
    use crate::net::flow::{lookup_route, route_key};
    use crate::sim::SimKernel;

    const NS: u32 = 4026531993;

    fn v4(a: [u8; 4]) -> [u8; 16] {
        let mut addr = [0u8; 16];
        addr[..4].copy_from_slice(&a);
        addr
    }

    fn sockaddr_in(port: u16, addr: [u8; 4]) -> Vec<u8> {
        let mut sa = vec![0u8; 16];
        sa[..2].copy_from_slice(&AF_INET.to_ne_bytes());
        sa[2..4].copy_from_slice(&port.to_be_bytes());
        sa[4..8].copy_from_slice(&addr);
        sa
    }

    #[test]
    fn bind_registers_an_authoritative_route() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Bind]);
        k.spawn_task(70, 70, 1);
        k.set_current(70, 70);
        let sk = k.alloc_sock(SockInfo {
            family: AF_INET,
            protocol: IPPROTO_TCP,
            netns: NS,
            sport: 8080,
            ..SockInfo::default()
        });
        let (socket, _) = k.alloc_socket(sk);
        let sa = k.alloc_kernel_bytes(&sockaddr_in(8080, [0, 0, 0, 0]));

        sys_bind_enter(&k);
        handle_security_socket_bind(&k, socket, sa);
        sys_bind_exit(&k, 0);

        let route = lookup_route(&k, &route_key(&v4([10, 0, 0, 5]), 8080, NS, IPPROTO_TCP)).unwrap();
        assert_eq!(route.pid, 70);
        let ev: BindEvent = k.events_of(EventType::Bind)[0].decode();
        assert_eq!(ev.port, 8080);
        assert_eq!(ev.family, AF_INET);
        assert_eq!(ev.protocol, IPPROTO_TCP);
    }

    #[test]
    fn disabled_bind_still_registers_the_route() {
        let k = SimKernel::new();
        k.set_current(70, 70);
        let sk = k.alloc_sock(SockInfo {
            family: AF_INET,
            protocol: IPPROTO_UDP,
            netns: NS,
            sport: 5353,
            ..SockInfo::default()
        });
        let (socket, _) = k.alloc_socket(sk);
        let sa = k.alloc_kernel_bytes(&sockaddr_in(5353, [0, 0, 0, 0]));
        sys_bind_enter(&k);
        handle_security_socket_bind(&k, socket, sa);
        sys_bind_exit(&k, 0);
        assert!(k.events().is_empty());
        assert!(lookup_route(&k, &route_key(&[0; 16], 5353, NS, IPPROTO_UDP)).is_some());
    }

    #[test]
    fn classified_flows_are_routed_until_release() {
        let k = SimKernel::new();
        k.set_current(80, 81);
        let sk = k.alloc_sock(SockInfo {
            family: AF_INET,
            protocol: IPPROTO_TCP,
            netns: NS,
            ..SockInfo::default()
        });
        let fl = k.alloc_flowi4([10, 0, 0, 2], 43210);
        handle_sk_classify_flow(&k, sk, fl);
        let key = route_key(&v4([10, 0, 0, 2]), 43210, NS, IPPROTO_TCP);
        assert_eq!(lookup_route(&k, &key).unwrap().pid, 80);

        handle_sock_release(&k, sk);
        assert!(lookup_route(&k, &key).is_none());
    }

    #[test]
    fn procfs_walk_is_only_trusted_from_the_agent() {
        let k = SimKernel::new();
        k.set_constant(RuntimeConst::RuntimePid, 900);
        let sk = k.alloc_sock(SockInfo {
            family: AF_INET,
            protocol: IPPROTO_TCP,
            netns: NS,
            saddr: v4([10, 0, 0, 9]),
            sport: 9000,
            ..SockInfo::default()
        });
        let (_, inode) = k.alloc_socket(sk);
        let proc_root = k.root_dentry(1);
        let pid_dir = k.add_dentry(proc_root, "4242", 3);
        let fd_dir = k.add_dentry(pid_dir, "fd", 4);
        let fd = k.add_dentry(fd_dir, "7", 5);
        let sock_dentry = k.add_dentry_with_inode(proc_root, "socket:[1]", inode);
        let path = k.alloc_path(0, sock_dentry);
        let key = route_key(&v4([10, 0, 0, 9]), 9000, NS, IPPROTO_TCP);

        k.set_current(1000, 1000);
        handle_proc_fd_link(&k, fd);
        handle_path_get(&k, path);
        assert!(lookup_route(&k, &key).is_none());

        k.set_current(900, 901);
        handle_proc_fd_link(&k, fd);
        handle_path_get(&k, path);
        assert_eq!(lookup_route(&k, &key).unwrap().pid, 4242);
        assert!(k.procfs_pid().lookup(&k.pid_tgid()).is_none());
    }
}
