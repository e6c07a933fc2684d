//! Per-CPU counters.
//!
//! The data plane never reports errors upward; it counts them here and the
//! agent sums the per-CPU slots into prometheus counters.

use crate::event::EventType;
use crate::kernel::{plain, Kernel, Map};

/// Egress counters, indexed by event type.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventStats {
    pub bytes: u64,
    pub count: u64,
    pub lost: u64,
}

/// Approver and discarder outcomes, indexed by event type.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub basename_approved: u64,
    pub flags_approved: u64,
    pub pid_discarded: u64,
    pub inode_discarded: u64,
    pub discarders_added: u64,
    pub saved_by_activity_dump: u64,
}

/// Dentry resolver and eRPC failures. Single slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub invalid: u64,
    pub discarded: u64,
    pub error: u64,
    pub tail_call_exhausted: u64,
    pub erpc_cache_miss: u64,
    pub erpc_write_fault: u64,
    pub erpc_size_exceeded: u64,
    pub erpc_tail_call_exhausted: u64,
    pub erpc_read_fault: u64,
    pub erpc_denied: u64,
}

/// Syscall cache bookkeeping, indexed by event type.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyscallStats {
    pub cached: u64,
    pub popped: u64,
    pub overwritten: u64,
    pub self_filtered: u64,
    /// Entries dropped because a tail call of their chain failed.
    pub tail_call_failed: u64,
}

/// Packet path counters. Single slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetStats {
    pub packets: u64,
    pub parse_errors: u64,
    pub nat_hop_limit: u64,
    pub pid_unresolved: u64,
    pub dns_suppressed: u64,
    pub dns_muted: u64,
    pub raw_packet_throttled: u64,
    pub raw_packet_dropped: u64,
}

/// Values sampled on demand. Single slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Telemetry {
    pub ringbuf_usage: u64,
    pub sampled_at: u64,
}

plain!(EventStats, FilterStats, ResolverStats, SyscallStats, NetStats, Telemetry);

pub fn event<K: Kernel>(k: &K, t: EventType, f: impl FnOnce(&mut EventStats)) {
    let _ = k.event_stats().with_mut(&(t as u32), f);
}

pub fn filter<K: Kernel>(k: &K, t: EventType, f: impl FnOnce(&mut FilterStats)) {
    let _ = k.filter_stats().with_mut(&(t as u32), f);
}

pub fn resolver<K: Kernel>(k: &K, f: impl FnOnce(&mut ResolverStats)) {
    let _ = k.resolver_stats().with_mut(&0, f);
}

pub fn syscall<K: Kernel>(k: &K, t: EventType, f: impl FnOnce(&mut SyscallStats)) {
    let _ = k.syscall_stats().with_mut(&(t as u32), f);
}

pub fn net<K: Kernel>(k: &K, f: impl FnOnce(&mut NetStats)) {
    let _ = k.net_stats().with_mut(&0, f);
}
