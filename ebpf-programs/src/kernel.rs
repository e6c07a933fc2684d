//! aya-ebpf substrate.
//!
//! Every map the data plane touches is declared here, so that the object
//! carries exactly one copy of each no matter how many programs link this
//! crate. Wrappers are `repr(transparent)` over the aya-ebpf map types: the
//! loader sees the same `bpf_map_def` it would see without them.

use core::ffi::c_void;

use aya_ebpf::helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns, gen};
use aya_ebpf::macros::map;
use aya_ebpf::maps::{Array, HashMap, LruHashMap, PerCpuArray, RingBuf};

use secwatch_common::consts::{MOUNT_REVISION_SLOTS, RUNTIME_CONST_COUNT, TASK_COMM_LEN};
use secwatch_common::event::MAX_EVENT_TYPE;
use secwatch_common::kernel::{Kernel, Map, MapError, MapKey, Plain, UpdateFlag};
use secwatch_common::types::*;

const EEXIST: i64 = -17;
const ENOENT: i64 = -2;
const E2BIG: i64 = -7;
const ENOMEM: i64 = -12;
const BPF_RB_AVAIL_DATA: u64 = 0;

const EVENT_TYPES: u32 = MAX_EVENT_TYPE;
const RING_SIZE: u32 = 16 << 20;

fn map_error(code: i64) -> MapError {
    match code {
        EEXIST => MapError::Exists,
        ENOENT => MapError::NotFound,
        E2BIG | ENOMEM => MapError::Full,
        other => MapError::Other(other),
    }
}

macro_rules! hash_wrapper {
    ($name:ident, $inner:ident) => {
        #[repr(transparent)]
        pub struct $name<K, V>($inner<K, V>);

        impl<K, V> $name<K, V> {
            pub const fn with_max_entries(max_entries: u32) -> Self {
                Self($inner::with_max_entries(max_entries, 0))
            }
        }

        impl<K: MapKey, V: Copy> Map<K, V> for $name<K, V> {
            #[inline(always)]
            fn lookup(&self, key: &K) -> Option<V> {
                unsafe { self.0.get(key).copied() }
            }

            #[inline(always)]
            fn with_mut<R, F: FnOnce(&mut V) -> R>(&self, key: &K, f: F) -> Option<R> {
                let ptr = self.0.get_ptr_mut(key)?;
                // SAFETY: the pointer is to a live map value owned by the kernel.
                Some(f(unsafe { &mut *ptr }))
            }

            #[inline(always)]
            fn store(&self, key: &K, value: &V, flag: UpdateFlag) -> Result<(), MapError> {
                self.0.insert(key, value, flag as u64).map_err(map_error)
            }

            #[inline(always)]
            fn delete(&self, key: &K) -> Result<(), MapError> {
                self.0.remove(key).map_err(map_error)
            }
        }
    };
}

hash_wrapper!(BpfHash, HashMap);
hash_wrapper!(BpfLru, LruHashMap);

macro_rules! array_wrapper {
    ($name:ident, $inner:ident) => {
        #[repr(transparent)]
        pub struct $name<V>($inner<V>);

        impl<V> $name<V> {
            pub const fn with_max_entries(max_entries: u32) -> Self {
                Self($inner::with_max_entries(max_entries, 0))
            }
        }

        impl<V: Plain> Map<u32, V> for $name<V> {
            #[inline(always)]
            fn lookup(&self, key: &u32) -> Option<V> {
                self.0.get(*key).copied()
            }

            #[inline(always)]
            fn with_mut<R, F: FnOnce(&mut V) -> R>(&self, key: &u32, f: F) -> Option<R> {
                let ptr = self.0.get_ptr_mut(*key)?;
                // SAFETY: array slots are preallocated and never freed.
                Some(f(unsafe { &mut *ptr }))
            }

            #[inline(always)]
            fn store(&self, key: &u32, value: &V, flag: UpdateFlag) -> Result<(), MapError> {
                if flag == UpdateFlag::NoExist {
                    return Err(MapError::Exists);
                }
                match self.0.get_ptr_mut(*key) {
                    Some(ptr) => {
                        // SAFETY: as above.
                        unsafe { *ptr = *value };
                        Ok(())
                    }
                    None => Err(MapError::Other(E2BIG)),
                }
            }

            fn delete(&self, _key: &u32) -> Result<(), MapError> {
                Err(MapError::Other(-22))
            }
        }
    };
}

array_wrapper!(BpfArray, Array);
array_wrapper!(BpfPerCpu, PerCpuArray);

// ─────────────────────────────────────────────────────────────────────────────
// Maps
// ─────────────────────────────────────────────────────────────────────────────

#[map]
pub(crate) static EVENTS: RingBuf = RingBuf::with_byte_size(RING_SIZE, 0);

#[map]
pub(crate) static CONSTANTS: BpfArray<u64> = BpfArray::with_max_entries(RUNTIME_CONST_COUNT);
#[map]
pub(crate) static ENABLED_EVENTS: BpfArray<u64> = BpfArray::with_max_entries(1);
#[map]
pub(crate) static FILTER_POLICY: BpfArray<FilterPolicy> = BpfArray::with_max_entries(EVENT_TYPES);
#[map]
pub(crate) static BASENAME_APPROVERS: BpfHash<BasenameKey, u64> = BpfHash::with_max_entries(256);
#[map]
pub(crate) static FLAG_APPROVERS: BpfArray<u64> = BpfArray::with_max_entries(EVENT_TYPES);
#[map]
pub(crate) static DNS_RCODE_MUTE: BpfArray<u32> = BpfArray::with_max_entries(1);
#[map]
pub(crate) static RAW_PACKET_BUCKET: BpfArray<TokenBucket> = BpfArray::with_max_entries(1);
#[map]
pub(crate) static RAW_PACKET_DROP: BpfHash<PidRouteKey, u32> = BpfHash::with_max_entries(1024);
#[map]
pub(crate) static SECURITY_PROFILES: BpfHash<ContainerId, SecurityProfile> = BpfHash::with_max_entries(512);
#[map]
pub(crate) static DUMP_CONTROL: BpfArray<DumpControl> = BpfArray::with_max_entries(1);
#[map]
pub(crate) static CGROUP_MOUNT_FILTER: BpfHash<u32, u32> = BpfHash::with_max_entries(64);

#[map]
pub(crate) static EVENT_STATS: BpfPerCpu<EventStats> = BpfPerCpu::with_max_entries(EVENT_TYPES);
#[map]
pub(crate) static FILTER_STATS: BpfPerCpu<FilterStats> = BpfPerCpu::with_max_entries(EVENT_TYPES);
#[map]
pub(crate) static RESOLVER_STATS: BpfPerCpu<ResolverStats> = BpfPerCpu::with_max_entries(1);
#[map]
pub(crate) static SYSCALL_STATS: BpfPerCpu<SyscallStats> = BpfPerCpu::with_max_entries(EVENT_TYPES);
#[map]
pub(crate) static NET_STATS: BpfPerCpu<NetStats> = BpfPerCpu::with_max_entries(1);
#[map]
pub(crate) static TELEMETRY: BpfArray<Telemetry> = BpfArray::with_max_entries(1);

#[map]
pub(crate) static PATH_CACHE: BpfLru<PathKey, PathLeaf> = BpfLru::with_max_entries(65536);
#[map]
pub(crate) static PATH_IDS: BpfArray<u32> = BpfArray::with_max_entries(MOUNT_REVISION_SLOTS);
#[map]
pub(crate) static ERPC_STATE: BpfPerCpu<ErpcResolveState> = BpfPerCpu::with_max_entries(1);
#[map]
pub(crate) static ERPC_MMAP: BpfArray<ErpcBuffer> = BpfArray::with_max_entries(1);

#[map]
pub(crate) static INODE_DISCARDERS: BpfLru<InodeDiscarderKey, InodeDiscarder> = BpfLru::with_max_entries(4096);
#[map]
pub(crate) static PID_DISCARDERS: BpfLru<u32, PidDiscarder> = BpfLru::with_max_entries(512);
#[map]
pub(crate) static DISCARDERS_REV: BpfArray<u32> = BpfArray::with_max_entries(1);
#[map]
pub(crate) static MOUNT_REVISIONS: BpfArray<u32> = BpfArray::with_max_entries(MOUNT_REVISION_SLOTS);

#[map]
pub(crate) static SYSCALLS: BpfLru<u64, SyscallCache> = BpfLru::with_max_entries(1024);
#[map]
pub(crate) static EXEC_PID_XFER: BpfLru<u32, u64> = BpfLru::with_max_entries(512);
#[map]
pub(crate) static SYSCALL_CTX: BpfLru<u32, SyscallArgs> = BpfLru::with_max_entries(1024);
#[map]
pub(crate) static ASYNC_SUBMITTERS: BpfLru<u64, u64> = BpfLru::with_max_entries(1024);

#[map]
pub(crate) static PROC_CACHE: BpfLru<u64, ProcCacheEntry> = BpfLru::with_max_entries(16384);
#[map]
pub(crate) static PID_CACHE: BpfLru<u32, PidCacheEntry> = BpfLru::with_max_entries(16384);
#[map]
pub(crate) static PID_IGNORED: BpfLru<u32, u32> = BpfLru::with_max_entries(16384);
#[map]
pub(crate) static ARGS_ENVS_PARSER: BpfPerCpu<ArgsEnvsParser> = BpfPerCpu::with_max_entries(1);
#[map]
pub(crate) static ARGS_ENVS_EVENT: BpfPerCpu<ArgsEnvsEvent> = BpfPerCpu::with_max_entries(1);
#[map]
pub(crate) static PROCESS_EVENT: BpfPerCpu<ProcessEvent> = BpfPerCpu::with_max_entries(1);
#[map]
pub(crate) static SPAN_TLS: BpfHash<u32, SpanTls> = BpfHash::with_max_entries(4096);
#[map]
pub(crate) static USER_SESSIONS: BpfLru<u64, UserSession> = BpfLru::with_max_entries(1024);
#[map]
pub(crate) static PID_SESSIONS: BpfLru<u32, u64> = BpfLru::with_max_entries(4096);

#[map]
pub(crate) static MOUNT_REFS: BpfHash<u32, MountRef> = BpfHash::with_max_entries(4096);

#[map]
pub(crate) static CONNTRACK: BpfLru<NamespacedFlow, NamespacedFlow> = BpfLru::with_max_entries(4096);
#[map]
pub(crate) static FLOW_PID: BpfLru<PidRouteKey, PidRouteEntry> = BpfLru::with_max_entries(10240);
#[map]
pub(crate) static SOCK_META: BpfLru<u64, SockMeta> = BpfLru::with_max_entries(4096);
#[map]
pub(crate) static SOCK_COOKIE_PID: BpfLru<u64, u32> = BpfLru::with_max_entries(4096);
#[map]
pub(crate) static IFINDEX_NETNS: BpfLru<u32, u32> = BpfLru::with_max_entries(1024);
#[map]
pub(crate) static PACKETS: BpfPerCpu<Packet> = BpfPerCpu::with_max_entries(1);
#[map]
pub(crate) static DNS_EVENT: BpfPerCpu<DnsEvent> = BpfPerCpu::with_max_entries(1);
#[map]
pub(crate) static DNS_RESPONSES: BpfLru<DnsResponseKey, DnsResponseEntry> = BpfLru::with_max_entries(1024);
#[map]
pub(crate) static DNS_RESP_EVENT: BpfPerCpu<DnsResponseEvent> = BpfPerCpu::with_max_entries(1);
#[map]
pub(crate) static IMDS_EVENT: BpfPerCpu<ImdsEvent> = BpfPerCpu::with_max_entries(1);
#[map]
pub(crate) static RAW_PACKET_EVENT: BpfPerCpu<RawPacketEvent> = BpfPerCpu::with_max_entries(1);
#[map]
pub(crate) static VETH_STATE: BpfLru<u64, VethState> = BpfLru::with_max_entries(1024);
#[map]
pub(crate) static PROCFS_PID: BpfLru<u64, u32> = BpfLru::with_max_entries(4096);

#[map]
pub(crate) static TRACED_CGROUPS: BpfLru<ContainerId, u64> = BpfLru::with_max_entries(200);
#[map]
pub(crate) static TRACED_PIDS: BpfLru<u32, u64> = BpfLru::with_max_entries(8192);
#[map]
pub(crate) static AD_CONFIG: BpfHash<u64, ActivityDumpConfig> = BpfHash::with_max_entries(64);
#[map]
pub(crate) static CGROUP_WAIT_LIST: BpfLru<ContainerId, u64> = BpfLru::with_max_entries(200);
#[map]
pub(crate) static RATE_LIMITERS: BpfLru<u64, RateLimiterCtx> = BpfLru::with_max_entries(4096);
#[map]
pub(crate) static SYSCALL_DRIFT: BpfLru<u32, SyscallDriftState> = BpfLru::with_max_entries(4096);

// ─────────────────────────────────────────────────────────────────────────────
// Kernel
// ─────────────────────────────────────────────────────────────────────────────

/// The running kernel. Stateless: programs construct one per invocation.
#[derive(Clone, Copy, Default)]
pub struct BpfKernel;

impl Kernel for BpfKernel {
    type Hash<K: MapKey, V: Copy> = BpfHash<K, V>;
    type Lru<K: MapKey, V: Copy> = BpfLru<K, V>;
    type Array<V: Plain> = BpfArray<V>;
    type PerCpu<V: Plain> = BpfPerCpu<V>;

    #[inline(always)]
    fn now_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }

    #[inline(always)]
    fn pid_tgid(&self) -> u64 {
        bpf_get_current_pid_tgid()
    }

    #[inline(always)]
    fn cpu(&self) -> u32 {
        unsafe { gen::bpf_get_smp_processor_id() }
    }

    #[inline(always)]
    fn random_u32(&self) -> u32 {
        unsafe { gen::bpf_get_prandom_u32() }
    }

    fn comm(&self) -> [u8; TASK_COMM_LEN] {
        bpf_get_current_comm().unwrap_or([0u8; TASK_COMM_LEN])
    }

    #[inline(always)]
    fn current_task(&self) -> u64 {
        unsafe { gen::bpf_get_current_task() }
    }

    fn send_signal(&self, sig: u32) -> bool {
        unsafe { gen::bpf_send_signal(sig) == 0 }
    }

    fn socket_cookie(&self, sk: u64) -> Option<u64> {
        if sk == 0 {
            return None;
        }
        match unsafe { gen::bpf_get_socket_cookie(sk as *mut c_void) } {
            0 => None,
            cookie => Some(cookie),
        }
    }

    #[inline(always)]
    fn read_kernel(&self, addr: u64, dst: &mut [u8]) -> bool {
        let ret = unsafe {
            gen::bpf_probe_read_kernel(dst.as_mut_ptr() as *mut c_void, dst.len() as u32, addr as *const c_void)
        };
        ret == 0
    }

    #[inline(always)]
    fn read_kernel_str(&self, addr: u64, dst: &mut [u8]) -> Option<usize> {
        let ret = unsafe {
            gen::bpf_probe_read_kernel_str(dst.as_mut_ptr() as *mut c_void, dst.len() as u32, addr as *const c_void)
        };
        // the helper counts the terminator
        (ret > 0).then(|| ret as usize - 1)
    }

    #[inline(always)]
    fn read_user(&self, addr: u64, dst: &mut [u8]) -> bool {
        let ret = unsafe {
            gen::bpf_probe_read_user(dst.as_mut_ptr() as *mut c_void, dst.len() as u32, addr as *const c_void)
        };
        ret == 0
    }

    #[inline(always)]
    fn read_user_str(&self, addr: u64, dst: &mut [u8]) -> Option<usize> {
        let ret = unsafe {
            gen::bpf_probe_read_user_str(dst.as_mut_ptr() as *mut c_void, dst.len() as u32, addr as *const c_void)
        };
        (ret > 0).then(|| ret as usize - 1)
    }

    fn write_user(&self, addr: u64, src: &[u8]) -> bool {
        let ret = unsafe {
            gen::bpf_probe_write_user(addr as *mut c_void, src.as_ptr() as *const c_void, src.len() as u32)
        };
        ret == 0
    }

    fn output(&self, data: &[u8]) -> Result<(), i64> {
        EVENTS.output(data, 0)
    }

    fn ringbuf_usage(&self) -> u64 {
        EVENTS.query(BPF_RB_AVAIL_DATA)
    }

    fn constants(&self) -> &Self::Array<u64> {
        &CONSTANTS
    }
    fn enabled_events(&self) -> &Self::Array<u64> {
        &ENABLED_EVENTS
    }
    fn filter_policy(&self) -> &Self::Array<FilterPolicy> {
        &FILTER_POLICY
    }
    fn basename_approvers(&self) -> &Self::Hash<BasenameKey, u64> {
        &BASENAME_APPROVERS
    }
    fn flag_approvers(&self) -> &Self::Array<u64> {
        &FLAG_APPROVERS
    }
    fn dns_rcode_mute(&self) -> &Self::Array<u32> {
        &DNS_RCODE_MUTE
    }
    fn raw_packet_bucket(&self) -> &Self::Array<TokenBucket> {
        &RAW_PACKET_BUCKET
    }
    fn raw_packet_drop(&self) -> &Self::Hash<PidRouteKey, u32> {
        &RAW_PACKET_DROP
    }
    fn security_profiles(&self) -> &Self::Hash<ContainerId, SecurityProfile> {
        &SECURITY_PROFILES
    }
    fn dump_control(&self) -> &Self::Array<DumpControl> {
        &DUMP_CONTROL
    }
    fn cgroup_mount_filter(&self) -> &Self::Hash<u32, u32> {
        &CGROUP_MOUNT_FILTER
    }

    fn event_stats(&self) -> &Self::PerCpu<EventStats> {
        &EVENT_STATS
    }
    fn filter_stats(&self) -> &Self::PerCpu<FilterStats> {
        &FILTER_STATS
    }
    fn resolver_stats(&self) -> &Self::PerCpu<ResolverStats> {
        &RESOLVER_STATS
    }
    fn syscall_stats(&self) -> &Self::PerCpu<SyscallStats> {
        &SYSCALL_STATS
    }
    fn net_stats(&self) -> &Self::PerCpu<NetStats> {
        &NET_STATS
    }
    fn telemetry(&self) -> &Self::Array<Telemetry> {
        &TELEMETRY
    }

    fn path_cache(&self) -> &Self::Lru<PathKey, PathLeaf> {
        &PATH_CACHE
    }
    fn path_ids(&self) -> &Self::Array<u32> {
        &PATH_IDS
    }
    fn erpc_state(&self) -> &Self::PerCpu<ErpcResolveState> {
        &ERPC_STATE
    }
    fn erpc_mmap(&self) -> &Self::Array<ErpcBuffer> {
        &ERPC_MMAP
    }

    fn inode_discarders(&self) -> &Self::Lru<InodeDiscarderKey, InodeDiscarder> {
        &INODE_DISCARDERS
    }
    fn pid_discarders(&self) -> &Self::Lru<u32, PidDiscarder> {
        &PID_DISCARDERS
    }
    fn discarders_revision(&self) -> &Self::Array<u32> {
        &DISCARDERS_REV
    }
    fn mount_revisions(&self) -> &Self::Array<u32> {
        &MOUNT_REVISIONS
    }

    fn syscalls(&self) -> &Self::Lru<u64, SyscallCache> {
        &SYSCALLS
    }
    fn exec_pid_transfer(&self) -> &Self::Lru<u32, u64> {
        &EXEC_PID_XFER
    }
    fn syscall_ctx(&self) -> &Self::Lru<u32, SyscallArgs> {
        &SYSCALL_CTX
    }
    fn async_submitters(&self) -> &Self::Lru<u64, u64> {
        &ASYNC_SUBMITTERS
    }

    fn proc_cache(&self) -> &Self::Lru<u64, ProcCacheEntry> {
        &PROC_CACHE
    }
    fn pid_cache(&self) -> &Self::Lru<u32, PidCacheEntry> {
        &PID_CACHE
    }
    fn pid_ignored(&self) -> &Self::Lru<u32, u32> {
        &PID_IGNORED
    }
    fn args_envs_parser(&self) -> &Self::PerCpu<ArgsEnvsParser> {
        &ARGS_ENVS_PARSER
    }
    fn args_envs_event(&self) -> &Self::PerCpu<ArgsEnvsEvent> {
        &ARGS_ENVS_EVENT
    }
    fn process_event(&self) -> &Self::PerCpu<ProcessEvent> {
        &PROCESS_EVENT
    }
    fn span_tls(&self) -> &Self::Hash<u32, SpanTls> {
        &SPAN_TLS
    }
    fn user_sessions(&self) -> &Self::Lru<u64, UserSession> {
        &USER_SESSIONS
    }
    fn pid_sessions(&self) -> &Self::Lru<u32, u64> {
        &PID_SESSIONS
    }

    fn mount_refs(&self) -> &Self::Hash<u32, MountRef> {
        &MOUNT_REFS
    }

    fn conntrack(&self) -> &Self::Lru<NamespacedFlow, NamespacedFlow> {
        &CONNTRACK
    }
    fn flow_pid(&self) -> &Self::Lru<PidRouteKey, PidRouteEntry> {
        &FLOW_PID
    }
    fn sock_meta(&self) -> &Self::Lru<u64, SockMeta> {
        &SOCK_META
    }
    fn sock_cookie_pid(&self) -> &Self::Lru<u64, u32> {
        &SOCK_COOKIE_PID
    }
    fn ifindex_netns(&self) -> &Self::Lru<u32, u32> {
        &IFINDEX_NETNS
    }
    fn packets(&self) -> &Self::PerCpu<Packet> {
        &PACKETS
    }
    fn dns_event(&self) -> &Self::PerCpu<DnsEvent> {
        &DNS_EVENT
    }
    fn dns_responses(&self) -> &Self::Lru<DnsResponseKey, DnsResponseEntry> {
        &DNS_RESPONSES
    }
    fn dns_response_event(&self) -> &Self::PerCpu<DnsResponseEvent> {
        &DNS_RESP_EVENT
    }
    fn imds_event(&self) -> &Self::PerCpu<ImdsEvent> {
        &IMDS_EVENT
    }
    fn raw_packet_event(&self) -> &Self::PerCpu<RawPacketEvent> {
        &RAW_PACKET_EVENT
    }
    fn veth_state(&self) -> &Self::Lru<u64, VethState> {
        &VETH_STATE
    }
    fn procfs_pid(&self) -> &Self::Lru<u64, u32> {
        &PROCFS_PID
    }

    fn traced_cgroups(&self) -> &Self::Lru<ContainerId, u64> {
        &TRACED_CGROUPS
    }
    fn traced_pids(&self) -> &Self::Lru<u32, u64> {
        &TRACED_PIDS
    }
    fn activity_dumps_config(&self) -> &Self::Hash<u64, ActivityDumpConfig> {
        &AD_CONFIG
    }
    fn cgroup_wait_list(&self) -> &Self::Lru<ContainerId, u64> {
        &CGROUP_WAIT_LIST
    }
    fn rate_limiters(&self) -> &Self::Lru<u64, RateLimiterCtx> {
        &RATE_LIMITERS
    }
    fn syscall_drift(&self) -> &Self::Lru<u32, SyscallDriftState> {
        &SYSCALL_DRIFT
    }
}

/// The substrate every program runs the data plane against.
pub const KERNEL: &BpfKernel = &BpfKernel;
