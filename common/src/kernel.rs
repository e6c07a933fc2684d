//! The seam between the data plane and whatever executes it.
//!
//! Every component is written against [`Kernel`]. The BPF object implements
//! it over aya-ebpf maps and helpers; the simulation implements it over
//! in-process maps and a fake address space.
//!
//! ```text
//!   hook ──► component(&impl Kernel) ──► Next::TailCall(prog) ──► tail call
//!                     │                         (BPF: ProgramArray,
//!                     ▼                          sim: bounded loop)
//!              Kernel::output(bytes)
//! ```

use core::hash::Hash;
use core::mem::size_of;

use crate::consts::{RuntimeConst, TASK_COMM_LEN};
use crate::types::*;

/// Insert semantics, mirroring `BPF_ANY`, `BPF_NOEXIST` and `BPF_EXIST`.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateFlag {
    Any = 0,
    NoExist = 1,
    Exist = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    NotFound,
    Exists,
    Full,
    Other(i64),
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MapError::NotFound => f.write_str("key not found"),
            MapError::Exists => f.write_str("key already exists"),
            MapError::Full => f.write_str("map is full"),
            MapError::Other(code) => write!(f, "map update failed ({code})"),
        }
    }
}

#[cfg(any(feature = "std", test))]
impl std::error::Error for MapError {}

pub trait MapKey: Copy + Eq + Hash {}
impl<T: Copy + Eq + Hash> MapKey for T {}

/// Element-level access to a kernel map.
pub trait Map<K, V> {
    fn lookup(&self, key: &K) -> Option<V>;

    /// Mutates the element in place. Returns `None` when the key is absent.
    fn with_mut<R, F: FnOnce(&mut V) -> R>(&self, key: &K, f: F) -> Option<R>;

    fn store(&self, key: &K, value: &V, flag: UpdateFlag) -> Result<(), MapError>;

    fn delete(&self, key: &K) -> Result<(), MapError>;

    fn contains(&self, key: &K) -> bool {
        self.lookup(key).is_some()
    }
}

/// Marker for `#[repr(C)]` values with explicit padding, safe to view as bytes.
///
/// # Safety
///
/// Implementors must have no implicit padding and accept any bit pattern.
pub unsafe trait Plain: Copy + 'static {}

macro_rules! plain {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl $crate::kernel::Plain for $t {})*
    };
}
pub(crate) use plain;

plain!(u8, u16, u32, u64, i32, i64);
unsafe impl<const N: usize> Plain for [u8; N] {}
unsafe impl<const N: usize> Plain for [u64; N] {}

pub fn bytes_of<T: Plain>(value: &T) -> &[u8] {
    // SAFETY: Plain guarantees every byte of T is initialized.
    unsafe { core::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) }
}

pub fn bytes_of_mut<T: Plain>(value: &mut T) -> &mut [u8] {
    // SAFETY: Plain guarantees any bit pattern is a valid T.
    unsafe { core::slice::from_raw_parts_mut(value as *mut T as *mut u8, size_of::<T>()) }
}

pub fn zeroed<T: Plain>() -> T {
    // SAFETY: Plain guarantees the all-zero pattern is a valid T.
    unsafe { core::mem::zeroed() }
}

/// Reads a `T` from the front of `buf`, if it is long enough.
pub fn read_plain<T: Plain>(buf: &[u8]) -> Option<T> {
    if buf.len() < size_of::<T>() {
        return None;
    }
    // SAFETY: length checked above; Plain accepts any bit pattern.
    Some(unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const T) })
}

/// Tail-call targets. The BPF object keeps one program array per program
/// family and registers each target at `prog as u32`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Prog {
    DentryResolver = 0,
    DentryCallback = 1,
    ErpcResolvePath = 2,
    ArgsEnvsParser = 4,
    DnsRequest = 10,
    DnsResponse = 11,
    Imds = 12,
    RawPacket = 13,
    RawPacketDrop = 14,
}

impl Prog {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Prog::DentryResolver,
            1 => Prog::DentryCallback,
            2 => Prog::ErpcResolvePath,
            4 => Prog::ArgsEnvsParser,
            10 => Prog::DnsRequest,
            11 => Prog::DnsResponse,
            12 => Prog::Imds,
            13 => Prog::RawPacket,
            14 => Prog::RawPacketDrop,
            _ => return None,
        })
    }

    pub fn is_classifier(self) -> bool {
        self as u32 >= Prog::DnsRequest as u32
    }
}

/// What a hook body asks its dispatcher to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Next {
    Done,
    /// Classifier verdict: drop the packet.
    Drop,
    TailCall(Prog),
}

/// Execution substrate for the data plane.
pub trait Kernel {
    type Hash<K: MapKey, V: Copy>: Map<K, V>;
    type Lru<K: MapKey, V: Copy>: Map<K, V>;
    /// Preallocated: every index below the capacity reads as zero until written.
    type Array<V: Plain>: Map<u32, V>;
    type PerCpu<V: Plain>: Map<u32, V>;

    fn now_ns(&self) -> u64;
    fn pid_tgid(&self) -> u64;
    fn cpu(&self) -> u32;
    fn random_u32(&self) -> u32;
    fn comm(&self) -> [u8; TASK_COMM_LEN];
    fn current_task(&self) -> u64;
    fn send_signal(&self, sig: u32) -> bool;
    fn socket_cookie(&self, sk: u64) -> Option<u64>;

    fn read_kernel(&self, addr: u64, dst: &mut [u8]) -> bool;
    /// Copies a NUL-terminated string; returns its length without the NUL.
    fn read_kernel_str(&self, addr: u64, dst: &mut [u8]) -> Option<usize>;
    fn read_user(&self, addr: u64, dst: &mut [u8]) -> bool;
    fn read_user_str(&self, addr: u64, dst: &mut [u8]) -> Option<usize>;
    fn write_user(&self, addr: u64, src: &[u8]) -> bool;

    fn output(&self, data: &[u8]) -> Result<(), i64>;
    fn ringbuf_usage(&self) -> u64;

    // policy, written by the agent
    fn constants(&self) -> &Self::Array<u64>;
    fn enabled_events(&self) -> &Self::Array<u64>;
    fn filter_policy(&self) -> &Self::Array<FilterPolicy>;
    fn basename_approvers(&self) -> &Self::Hash<BasenameKey, u64>;
    fn flag_approvers(&self) -> &Self::Array<u64>;
    fn dns_rcode_mute(&self) -> &Self::Array<u32>;
    fn raw_packet_bucket(&self) -> &Self::Array<TokenBucket>;
    fn raw_packet_drop(&self) -> &Self::Hash<PidRouteKey, u32>;
    fn security_profiles(&self) -> &Self::Hash<ContainerId, SecurityProfile>;
    fn dump_control(&self) -> &Self::Array<DumpControl>;
    fn cgroup_mount_filter(&self) -> &Self::Hash<u32, u32>;

    // telemetry
    fn event_stats(&self) -> &Self::PerCpu<EventStats>;
    fn filter_stats(&self) -> &Self::PerCpu<FilterStats>;
    fn resolver_stats(&self) -> &Self::PerCpu<ResolverStats>;
    fn syscall_stats(&self) -> &Self::PerCpu<SyscallStats>;
    fn net_stats(&self) -> &Self::PerCpu<NetStats>;
    fn telemetry(&self) -> &Self::Array<Telemetry>;

    // paths
    fn path_cache(&self) -> &Self::Lru<PathKey, PathLeaf>;
    fn path_ids(&self) -> &Self::Array<u32>;
    fn erpc_state(&self) -> &Self::PerCpu<ErpcResolveState>;
    fn erpc_mmap(&self) -> &Self::Array<ErpcBuffer>;

    // discarders
    fn inode_discarders(&self) -> &Self::Lru<InodeDiscarderKey, InodeDiscarder>;
    fn pid_discarders(&self) -> &Self::Lru<u32, PidDiscarder>;
    fn discarders_revision(&self) -> &Self::Array<u32>;
    fn mount_revisions(&self) -> &Self::Array<u32>;

    // syscalls
    fn syscalls(&self) -> &Self::Lru<u64, SyscallCache>;
    fn exec_pid_transfer(&self) -> &Self::Lru<u32, u64>;
    fn syscall_ctx(&self) -> &Self::Lru<u32, SyscallArgs>;
    fn async_submitters(&self) -> &Self::Lru<u64, u64>;

    // processes
    fn proc_cache(&self) -> &Self::Lru<u64, ProcCacheEntry>;
    fn pid_cache(&self) -> &Self::Lru<u32, PidCacheEntry>;
    fn pid_ignored(&self) -> &Self::Lru<u32, u32>;
    fn args_envs_parser(&self) -> &Self::PerCpu<ArgsEnvsParser>;
    fn args_envs_event(&self) -> &Self::PerCpu<ArgsEnvsEvent>;
    fn process_event(&self) -> &Self::PerCpu<ProcessEvent>;
    fn span_tls(&self) -> &Self::Hash<u32, SpanTls>;
    fn user_sessions(&self) -> &Self::Lru<u64, UserSession>;
    fn pid_sessions(&self) -> &Self::Lru<u32, u64>;

    // mounts
    fn mount_refs(&self) -> &Self::Hash<u32, MountRef>;

    // network
    fn conntrack(&self) -> &Self::Lru<NamespacedFlow, NamespacedFlow>;
    fn flow_pid(&self) -> &Self::Lru<PidRouteKey, PidRouteEntry>;
    fn sock_meta(&self) -> &Self::Lru<u64, SockMeta>;
    fn sock_cookie_pid(&self) -> &Self::Lru<u64, u32>;
    fn ifindex_netns(&self) -> &Self::Lru<u32, u32>;
    fn packets(&self) -> &Self::PerCpu<Packet>;
    fn dns_event(&self) -> &Self::PerCpu<DnsEvent>;
    fn dns_responses(&self) -> &Self::Lru<DnsResponseKey, DnsResponseEntry>;
    fn dns_response_event(&self) -> &Self::PerCpu<DnsResponseEvent>;
    fn imds_event(&self) -> &Self::PerCpu<ImdsEvent>;
    fn raw_packet_event(&self) -> &Self::PerCpu<RawPacketEvent>;
    fn veth_state(&self) -> &Self::Lru<u64, VethState>;
    fn procfs_pid(&self) -> &Self::Lru<u64, u32>;

    // activity dumps and anomaly detection
    fn traced_cgroups(&self) -> &Self::Lru<ContainerId, u64>;
    fn traced_pids(&self) -> &Self::Lru<u32, u64>;
    fn activity_dumps_config(&self) -> &Self::Hash<u64, ActivityDumpConfig>;
    fn cgroup_wait_list(&self) -> &Self::Lru<ContainerId, u64>;
    fn rate_limiters(&self) -> &Self::Lru<u64, RateLimiterCtx>;
    fn syscall_drift(&self) -> &Self::Lru<u32, SyscallDriftState>;

    fn constant(&self, c: RuntimeConst) -> u64 {
        self.constants().lookup(&(c as u32)).unwrap_or(0)
    }

    fn tgid(&self) -> u32 {
        (self.pid_tgid() >> 32) as u32
    }

    fn read<T: Plain>(&self, addr: u64) -> Option<T> {
        if addr == 0 {
            return None;
        }
        let mut value = zeroed::<T>();
        if self.read_kernel(addr, bytes_of_mut(&mut value)) {
            Some(value)
        } else {
            None
        }
    }

    fn read_user_value<T: Plain>(&self, addr: u64) -> Option<T> {
        if addr == 0 {
            return None;
        }
        let mut value = zeroed::<T>();
        if self.read_user(addr, bytes_of_mut(&mut value)) {
            Some(value)
        } else {
            None
        }
    }

    /// Reads `base + offset(c)` where the offset comes from the constants table.
    fn read_at<T: Plain>(&self, base: u64, c: RuntimeConst) -> Option<T> {
        if base == 0 {
            return None;
        }
        self.read(base.wrapping_add(self.constant(c)))
    }

    /// True when the current task belongs to the agent.
    fn is_agent(&self) -> bool {
        let tgid = self.tgid() as u64;
        tgid != 0
            && (tgid == self.constant(RuntimeConst::RuntimePid)
                || tgid == self.constant(RuntimeConst::SystemProbePid))
    }
}
