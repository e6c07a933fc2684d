//! Tail-call targets by [`Prog`] id.
//!
//! Both substrates resolve a `Next::TailCall` through these tables: the BPF
//! object registers one program per id in its program arrays, the
//! simulation loops over [`run_prog`] with the same depth cap the kernel
//! enforces.

use crate::args::args_envs_parser_program;
use crate::dentry::dentry_resolver_program;
use crate::erpc::erpc_resolve_path_program;
use crate::event::EventType;
use crate::kernel::{Kernel, Next, Prog};
use crate::net::dns::{dns_request_program, dns_response_program};
use crate::net::imds::imds_program;
use crate::net::packet::PacketReader;
use crate::net::raw::{raw_packet_drop_program, raw_packet_program};
use crate::probes::callbacks::dentry_callback_program;
use crate::stats;
use crate::syscall_cache::pop_syscall;

/// Kernel limit on chained tail calls.
pub const MAX_TAIL_CALLS: u32 = 33;

/// Runs a non-classifier tail-call target.
pub fn run_prog<K: Kernel>(k: &K, prog: Prog) -> Next {
    match prog {
        Prog::DentryResolver => dentry_resolver_program(k),
        Prog::DentryCallback => dentry_callback_program(k),
        Prog::ErpcResolvePath => erpc_resolve_path_program(k),
        Prog::ArgsEnvsParser => args_envs_parser_program(k),
        _ => Next::Done,
    }
}

/// Runs a classifier tail-call target on `skb`.
pub fn run_classifier_prog<K: Kernel, P: PacketReader>(k: &K, skb: &P, prog: Prog) -> Next {
    match prog {
        Prog::DnsRequest => dns_request_program(k, skb),
        Prog::DnsResponse => dns_response_program(k, skb),
        Prog::Imds => imds_program(k, skb),
        Prog::RawPacket => raw_packet_program(k, skb),
        Prog::RawPacketDrop => raw_packet_drop_program(k),
        _ => Next::Done,
    }
}

/// A tail call did not happen: the chain ends here. A syscall entry waiting
/// on the chain would never be popped, so it goes now.
pub fn tail_call_failed<K: Kernel>(k: &K, prog: Prog) {
    if prog.is_classifier() || prog == Prog::ErpcResolvePath {
        return;
    }
    if let Some(entry) = pop_syscall(k, EventType::Any) {
        stats::syscall(k, entry.event_type, |s| s.tail_call_failed += 1);
    }
}
