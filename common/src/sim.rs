//! In-process kernel.
//!
//! Maps are plain collections behind `RefCell`s, memory is a set of byte
//! regions in two address spaces, and tail calls run in a loop capped the
//! way the kernel caps them. Builders lay objects out at the offsets of the
//! constants table, so the accessors in [`crate::kobj`] read them unchanged.
//!
//! A map must not be re-entered from inside its own `with_mut` closure: the
//! closure works on a copy that is written back afterwards.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};

use crate::consts::{
    RuntimeConst as C, AF_INET, AF_INET6, DEFAULT_CONSTANTS, DR_MAX_TAIL_CALL, ETH_P_IP,
    ETH_P_IPV6, IFNAMSIZ, IPPROTO_TCP, IPPROTO_UDP, MOUNT_REVISION_SLOTS, PF_KTHREAD, S_IFSOCK,
    TASK_COMM_LEN,
};
use crate::dentry::{resolve_chunk, DentryCallback, ResolverInput, Step};
use crate::event::{Credentials, EventType, Flow, KEventHeader};
use crate::kernel::{bytes_of, read_plain, zeroed, Kernel, Map, MapError, MapKey, Next, Plain, UpdateFlag};
use crate::kobj::{self, SockInfo};
use crate::net;
use crate::net::packet::{Direction, PacketReader};
use crate::process;
use crate::programs::{run_classifier_prog, run_prog, tail_call_failed, MAX_TAIL_CALLS};
use crate::types::*;

const S_IFREG: u16 = 0o100000;
const S_IFDIR: u16 = 0o040000;
const EXT4_SUPER_MAGIC: u64 = 0xef53;
const HOST_NETNS: u32 = 4026531992;
const KTHREADD: u32 = 2;

const DEFAULT_CAPACITY: usize = 4096;
const PATH_CACHE_CAPACITY: usize = 65536;
const ARRAY_SLOTS: u32 = MOUNT_REVISION_SLOTS;

const E2BIG: i64 = -7;
const EINVAL: i64 = -22;
const ENOSPC: i64 = -28;

fn lru<K: MapKey, V: Copy>() -> SimMap<K, V> {
    SimMap::lru(DEFAULT_CAPACITY)
}

fn hash<K: MapKey, V: Copy>() -> SimMap<K, V> {
    SimMap::hash(DEFAULT_CAPACITY)
}

// ─────────────────────────────────────────────────────────────────────────────
// Maps
// ─────────────────────────────────────────────────────────────────────────────

struct MapInner<K, V> {
    entries: HashMap<K, (V, u64)>,
    capacity: usize,
    lru: bool,
    tick: u64,
}

/// Hash or LRU map. A full hash map refuses inserts; a full LRU map evicts
/// its least recently used element.
pub struct SimMap<K, V> {
    inner: RefCell<MapInner<K, V>>,
}

impl<K: MapKey, V: Copy> SimMap<K, V> {
    fn with_capacity(capacity: usize, lru: bool) -> Self {
        Self {
            inner: RefCell::new(MapInner {
                entries: HashMap::new(),
                capacity,
                lru,
                tick: 0,
            }),
        }
    }

    pub fn hash(capacity: usize) -> Self {
        Self::with_capacity(capacity, false)
    }

    pub fn lru(capacity: usize) -> Self {
        Self::with_capacity(capacity, true)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.borrow().entries.keys().copied().collect()
    }
}

impl<K: MapKey, V: Copy> Map<K, V> for SimMap<K, V> {
    fn lookup(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.borrow_mut();
        inner.tick += 1;
        let tick = inner.tick;
        let lru = inner.lru;
        let slot = inner.entries.get_mut(key)?;
        if lru {
            slot.1 = tick;
        }
        Some(slot.0)
    }

    fn with_mut<R, F: FnOnce(&mut V) -> R>(&self, key: &K, f: F) -> Option<R> {
        let mut value = self.lookup(key)?;
        let r = f(&mut value);
        if let Some(slot) = self.inner.borrow_mut().entries.get_mut(key) {
            slot.0 = value;
        }
        Some(r)
    }

    fn store(&self, key: &K, value: &V, flag: UpdateFlag) -> Result<(), MapError> {
        let mut inner = self.inner.borrow_mut();
        let exists = inner.entries.contains_key(key);
        match flag {
            UpdateFlag::NoExist if exists => return Err(MapError::Exists),
            UpdateFlag::Exist if !exists => return Err(MapError::NotFound),
            _ => {}
        }
        if !exists && inner.entries.len() >= inner.capacity {
            if !inner.lru {
                return Err(MapError::Full);
            }
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, (_, tick))| *tick)
                .map(|(k, _)| *k);
            if let Some(oldest) = oldest {
                inner.entries.remove(&oldest);
            }
        }
        inner.tick += 1;
        let tick = inner.tick;
        inner.entries.insert(*key, (*value, tick));
        Ok(())
    }

    fn delete(&self, key: &K) -> Result<(), MapError> {
        match self.inner.borrow_mut().entries.remove(key) {
            Some(_) => Ok(()),
            None => Err(MapError::NotFound),
        }
    }
}

/// Preallocated array. Every slot below the capacity exists and reads as
/// zero until written; slots cannot be deleted. Per-CPU arrays use it too,
/// the simulation running on a single CPU.
pub struct SimArray<V> {
    slots: RefCell<HashMap<u32, V>>,
    capacity: u32,
}

impl<V: Plain> SimArray<V> {
    pub fn new(capacity: u32) -> Self {
        Self {
            slots: RefCell::new(HashMap::new()),
            capacity,
        }
    }
}

impl<V: Plain> Map<u32, V> for SimArray<V> {
    fn lookup(&self, key: &u32) -> Option<V> {
        if *key >= self.capacity {
            return None;
        }
        Some(self.slots.borrow().get(key).copied().unwrap_or_else(zeroed))
    }

    fn with_mut<R, F: FnOnce(&mut V) -> R>(&self, key: &u32, f: F) -> Option<R> {
        let mut value = self.lookup(key)?;
        let r = f(&mut value);
        self.slots.borrow_mut().insert(*key, value);
        Some(r)
    }

    fn store(&self, key: &u32, value: &V, flag: UpdateFlag) -> Result<(), MapError> {
        if *key >= self.capacity {
            return Err(MapError::Other(E2BIG));
        }
        if flag == UpdateFlag::NoExist {
            return Err(MapError::Exists);
        }
        self.slots.borrow_mut().insert(*key, *value);
        Ok(())
    }

    fn delete(&self, _key: &u32) -> Result<(), MapError> {
        Err(MapError::Other(EINVAL))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory
// ─────────────────────────────────────────────────────────────────────────────

/// Byte regions with unmapped gaps between them, so overruns fault.
struct Memory {
    regions: BTreeMap<u64, Vec<u8>>,
    next: u64,
}

impl Memory {
    fn new(base: u64) -> Self {
        Self {
            regions: BTreeMap::new(),
            next: base,
        }
    }

    fn alloc(&mut self, size: u64) -> u64 {
        let size = size.max(1);
        let addr = self.next;
        self.regions.insert(addr, vec![0; size as usize]);
        self.next += (size + 64 + 63) & !63;
        addr
    }

    fn locate(&self, addr: u64, len: usize) -> Option<(u64, usize)> {
        let (start, bytes) = self.regions.range(..=addr).next_back()?;
        let offset = (addr - start) as usize;
        if offset.checked_add(len)? > bytes.len() {
            return None;
        }
        Some((*start, offset))
    }

    fn read(&self, addr: u64, dst: &mut [u8]) -> bool {
        let Some((start, offset)) = self.locate(addr, dst.len()) else {
            return false;
        };
        match self.regions.get(&start) {
            Some(bytes) => {
                dst.copy_from_slice(&bytes[offset..offset + dst.len()]);
                true
            }
            None => false,
        }
    }

    fn write(&mut self, addr: u64, src: &[u8]) -> bool {
        let Some((start, offset)) = self.locate(addr, src.len()) else {
            return false;
        };
        match self.regions.get_mut(&start) {
            Some(bytes) => {
                bytes[offset..offset + src.len()].copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    /// `bpf_probe_read_str` semantics: truncates to `dst.len() - 1` bytes,
    /// always terminates, faults when the string runs off its region.
    fn read_str(&self, addr: u64, dst: &mut [u8]) -> Option<usize> {
        if dst.is_empty() {
            return None;
        }
        let (start, offset) = self.locate(addr, 1)?;
        let bytes = self.regions.get(&start)?;
        let src = &bytes[offset..];
        let max = dst.len() - 1;
        for i in 0..max {
            let b = *src.get(i)?;
            dst[i] = b;
            if b == 0 {
                return Some(i);
            }
        }
        dst[max] = 0;
        Some(max)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Captured events
// ─────────────────────────────────────────────────────────────────────────────

/// One record written to the ring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedEvent {
    pub bytes: Vec<u8>,
}

impl CapturedEvent {
    pub fn header(&self) -> KEventHeader {
        read_plain(&self.bytes).unwrap_or_default()
    }

    pub fn event_type(&self) -> Option<EventType> {
        EventType::from_u32(self.header().event_type)
    }

    /// Views the record as `T`.
    ///
    /// # Panics
    ///
    /// When the record is shorter than `T`.
    pub fn decode<T: Plain>(&self) -> T {
        match read_plain(&self.bytes) {
            Some(value) => value,
            None => panic!(
                "{} byte record is too short for {}",
                self.bytes.len(),
                std::any::type_name::<T>()
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Packets
// ─────────────────────────────────────────────────────────────────────────────

const ETH_HLEN: usize = 14;

/// A socket buffer, built from the Ethernet header up.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimPacket {
    data: Vec<u8>,
    ifindex: u32,
    cookie: u64,
}

fn eth_header(proto: u16) -> Vec<u8> {
    let mut eth = vec![0x02, 0, 0, 0, 0, 0x01, 0x02, 0, 0, 0, 0, 0x02];
    eth.extend_from_slice(&proto.to_be_bytes());
    eth
}

fn l4_header(protocol: u16, sport: u16, dport: u16, payload_len: usize) -> Vec<u8> {
    let mut hdr = Vec::new();
    hdr.extend_from_slice(&sport.to_be_bytes());
    hdr.extend_from_slice(&dport.to_be_bytes());
    if protocol == IPPROTO_UDP {
        hdr.extend_from_slice(&((8 + payload_len) as u16).to_be_bytes());
        hdr.extend_from_slice(&[0, 0]);
    } else {
        hdr.extend_from_slice(&[0; 8]);
        // doff 5, PSH|ACK, window, checksum, urgent
        hdr.extend_from_slice(&[0x50, 0x18, 0xff, 0xff, 0, 0, 0, 0]);
    }
    hdr
}

impl SimPacket {
    /// Bytes as they are, without any header.
    pub fn raw(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    fn ipv4(protocol: u16, src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, payload: &[u8]) -> Self {
        let l4 = l4_header(protocol, sport, dport, payload.len());
        let total = 20 + l4.len() + payload.len();
        let mut data = eth_header(ETH_P_IP);
        data.extend_from_slice(&[0x45, 0]);
        data.extend_from_slice(&(total as u16).to_be_bytes());
        data.extend_from_slice(&[0, 0, 0x40, 0, 64, protocol as u8, 0, 0]);
        data.extend_from_slice(&src);
        data.extend_from_slice(&dst);
        data.extend_from_slice(&l4);
        data.extend_from_slice(payload);
        Self::raw(data)
    }

    fn ipv6(protocol: u16, src: [u8; 16], sport: u16, dst: [u8; 16], dport: u16, payload: &[u8]) -> Self {
        let l4 = l4_header(protocol, sport, dport, payload.len());
        let mut data = eth_header(ETH_P_IPV6);
        data.extend_from_slice(&[0x60, 0, 0, 0]);
        data.extend_from_slice(&((l4.len() + payload.len()) as u16).to_be_bytes());
        data.extend_from_slice(&[protocol as u8, 64]);
        data.extend_from_slice(&src);
        data.extend_from_slice(&dst);
        data.extend_from_slice(&l4);
        data.extend_from_slice(payload);
        Self::raw(data)
    }

    pub fn udp4(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, payload: &[u8]) -> Self {
        Self::ipv4(IPPROTO_UDP, src, sport, dst, dport, payload)
    }

    pub fn tcp4(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, payload: &[u8]) -> Self {
        Self::ipv4(IPPROTO_TCP, src, sport, dst, dport, payload)
    }

    pub fn udp6(src: [u8; 16], sport: u16, dst: [u8; 16], dport: u16, payload: &[u8]) -> Self {
        Self::ipv6(IPPROTO_UDP, src, sport, dst, dport, payload)
    }

    pub fn tcp6(src: [u8; 16], sport: u16, dst: [u8; 16], dport: u16, payload: &[u8]) -> Self {
        Self::ipv6(IPPROTO_TCP, src, sport, dst, dport, payload)
    }

    pub fn on_ifindex(mut self, ifindex: u32) -> Self {
        self.ifindex = ifindex;
        self
    }

    pub fn with_cookie(mut self, cookie: u64) -> Self {
        self.cookie = cookie;
        self
    }

    fn ipv4_hlen(&self) -> usize {
        (self.data.get(ETH_HLEN).copied().unwrap_or(0x45) & 0x0f) as usize * 4
    }

    /// Grows the IPv4 header by `len` bytes of NOP options.
    pub fn with_ipv4_options(mut self, len: usize) -> Self {
        let at = ETH_HLEN + self.ipv4_hlen();
        self.data.splice(at..at, std::iter::repeat(1u8).take(len));
        self.data[ETH_HLEN] = 0x40 | ((self.ipv4_hlen() + len) / 4) as u8;
        let total = u16::from_be_bytes([self.data[ETH_HLEN + 2], self.data[ETH_HLEN + 3]]) + len as u16;
        self.data[ETH_HLEN + 2..ETH_HLEN + 4].copy_from_slice(&total.to_be_bytes());
        self
    }

    /// Grows the TCP header by `len` bytes of NOP options.
    pub fn with_tcp_options(mut self, len: usize) -> Self {
        let tcp = ETH_HLEN + self.ipv4_hlen();
        let doff = (self.data[tcp + 12] >> 4) as usize * 4;
        let at = tcp + doff;
        self.data.splice(at..at, std::iter::repeat(1u8).take(len));
        self.data[tcp + 12] = (((doff + len) / 4) as u8) << 4;
        let total = u16::from_be_bytes([self.data[ETH_HLEN + 2], self.data[ETH_HLEN + 3]]) + len as u16;
        self.data[ETH_HLEN + 2..ETH_HLEN + 4].copy_from_slice(&total.to_be_bytes());
        self
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl PacketReader for SimPacket {
    fn len(&self) -> u32 {
        self.data.len() as u32
    }

    fn load(&self, offset: u32, dst: &mut [u8]) -> bool {
        let start = offset as usize;
        match self.data.get(start..start + dst.len()) {
            Some(src) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    fn ifindex(&self) -> u32 {
        self.ifindex
    }

    fn socket_cookie(&self) -> u64 {
        self.cookie
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Kernel
// ─────────────────────────────────────────────────────────────────────────────

pub struct SimKernel {
    now: Cell<u64>,
    pid_tgid: Cell<u64>,
    rng: Cell<u64>,
    ringbuf_usage: Cell<u64>,
    fail_output: Cell<bool>,
    next_ino: Cell<u64>,
    next_cookie: Cell<u64>,
    default_sb: Cell<u64>,
    kmem: RefCell<Memory>,
    umem: RefCell<Memory>,
    tasks: RefCell<HashMap<u64, u64>>,
    comms: RefCell<HashMap<u64, [u8; TASK_COMM_LEN]>>,
    mounts: RefCell<HashMap<u32, u64>>,
    nets: RefCell<HashMap<u32, u64>>,
    cookies: RefCell<HashMap<u64, u64>>,
    captured: RefCell<Vec<CapturedEvent>>,
    signals: RefCell<Vec<(u32, u32)>>,

    constants: SimArray<u64>,
    enabled_events: SimArray<u64>,
    filter_policy: SimArray<FilterPolicy>,
    basename_approvers: SimMap<BasenameKey, u64>,
    flag_approvers: SimArray<u64>,
    dns_rcode_mute: SimArray<u32>,
    raw_packet_bucket: SimArray<TokenBucket>,
    raw_packet_drop: SimMap<PidRouteKey, u32>,
    security_profiles: SimMap<ContainerId, SecurityProfile>,
    dump_control: SimArray<DumpControl>,
    cgroup_mount_filter: SimMap<u32, u32>,

    event_stats: SimArray<EventStats>,
    filter_stats: SimArray<FilterStats>,
    resolver_stats: SimArray<ResolverStats>,
    syscall_stats: SimArray<SyscallStats>,
    net_stats: SimArray<NetStats>,
    telemetry: SimArray<Telemetry>,

    path_cache: SimMap<PathKey, PathLeaf>,
    path_ids: SimArray<u32>,
    erpc_state: SimArray<ErpcResolveState>,
    erpc_mmap: SimArray<ErpcBuffer>,

    inode_discarders: SimMap<InodeDiscarderKey, InodeDiscarder>,
    pid_discarders: SimMap<u32, PidDiscarder>,
    discarders_revision: SimArray<u32>,
    mount_revisions: SimArray<u32>,

    syscalls: SimMap<u64, SyscallCache>,
    exec_pid_transfer: SimMap<u32, u64>,
    syscall_ctx: SimMap<u32, SyscallArgs>,
    async_submitters: SimMap<u64, u64>,

    proc_cache: SimMap<u64, ProcCacheEntry>,
    pid_cache: SimMap<u32, PidCacheEntry>,
    pid_ignored: SimMap<u32, u32>,
    args_envs_parser: SimArray<ArgsEnvsParser>,
    args_envs_event: SimArray<ArgsEnvsEvent>,
    process_event: SimArray<ProcessEvent>,
    span_tls: SimMap<u32, SpanTls>,
    user_sessions: SimMap<u64, UserSession>,
    pid_sessions: SimMap<u32, u64>,

    mount_refs: SimMap<u32, MountRef>,

    conntrack: SimMap<NamespacedFlow, NamespacedFlow>,
    flow_pid: SimMap<PidRouteKey, PidRouteEntry>,
    sock_meta: SimMap<u64, SockMeta>,
    sock_cookie_pid: SimMap<u64, u32>,
    ifindex_netns: SimMap<u32, u32>,
    packets: SimArray<Packet>,
    dns_event: SimArray<DnsEvent>,
    dns_responses: SimMap<DnsResponseKey, DnsResponseEntry>,
    dns_response_event: SimArray<DnsResponseEvent>,
    imds_event: SimArray<ImdsEvent>,
    raw_packet_event: SimArray<RawPacketEvent>,
    veth_state: SimMap<u64, VethState>,
    procfs_pid: SimMap<u64, u32>,

    traced_cgroups: SimMap<ContainerId, u64>,
    traced_pids: SimMap<u32, u64>,
    activity_dumps_config: SimMap<u64, ActivityDumpConfig>,
    cgroup_wait_list: SimMap<ContainerId, u64>,
    rate_limiters: SimMap<u64, RateLimiterCtx>,
    syscall_drift: SimMap<u32, SyscallDriftState>,
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl SimKernel {
    /// Boot time of every simulation, far enough from zero that timestamps
    /// and timeouts never underflow.
    pub const EPOCH: u64 = 1_000_000_000_000;

    pub fn new() -> Self {
        let k = Self {
            now: Cell::new(Self::EPOCH),
            pid_tgid: Cell::new(0),
            rng: Cell::new(0x9e37_79b9_7f4a_7c15),
            ringbuf_usage: Cell::new(0),
            fail_output: Cell::new(false),
            next_ino: Cell::new(1 << 20),
            next_cookie: Cell::new(0x1000),
            default_sb: Cell::new(0),
            kmem: RefCell::new(Memory::new(0xffff_8880_0000_0000)),
            umem: RefCell::new(Memory::new(0x0000_5500_0000_0000)),
            tasks: RefCell::new(HashMap::new()),
            comms: RefCell::new(HashMap::new()),
            mounts: RefCell::new(HashMap::new()),
            nets: RefCell::new(HashMap::new()),
            cookies: RefCell::new(HashMap::new()),
            captured: RefCell::new(Vec::new()),
            signals: RefCell::new(Vec::new()),

            constants: SimArray::new(ARRAY_SLOTS),
            enabled_events: SimArray::new(1),
            filter_policy: SimArray::new(ARRAY_SLOTS),
            basename_approvers: hash(),
            flag_approvers: SimArray::new(ARRAY_SLOTS),
            dns_rcode_mute: SimArray::new(1),
            raw_packet_bucket: SimArray::new(1),
            raw_packet_drop: hash(),
            security_profiles: hash(),
            dump_control: SimArray::new(1),
            cgroup_mount_filter: hash(),

            event_stats: SimArray::new(ARRAY_SLOTS),
            filter_stats: SimArray::new(ARRAY_SLOTS),
            resolver_stats: SimArray::new(1),
            syscall_stats: SimArray::new(ARRAY_SLOTS),
            net_stats: SimArray::new(1),
            telemetry: SimArray::new(1),

            path_cache: SimMap::lru(PATH_CACHE_CAPACITY),
            path_ids: SimArray::new(ARRAY_SLOTS),
            erpc_state: SimArray::new(1),
            erpc_mmap: SimArray::new(1),

            inode_discarders: lru(),
            pid_discarders: lru(),
            discarders_revision: SimArray::new(1),
            mount_revisions: SimArray::new(ARRAY_SLOTS),

            syscalls: lru(),
            exec_pid_transfer: lru(),
            syscall_ctx: lru(),
            async_submitters: lru(),

            proc_cache: lru(),
            pid_cache: lru(),
            pid_ignored: lru(),
            args_envs_parser: SimArray::new(1),
            args_envs_event: SimArray::new(1),
            process_event: SimArray::new(1),
            span_tls: hash(),
            user_sessions: lru(),
            pid_sessions: lru(),

            mount_refs: hash(),

            conntrack: lru(),
            flow_pid: lru(),
            sock_meta: lru(),
            sock_cookie_pid: lru(),
            ifindex_netns: lru(),
            packets: SimArray::new(1),
            dns_event: SimArray::new(1),
            dns_responses: lru(),
            dns_response_event: SimArray::new(1),
            imds_event: SimArray::new(1),
            raw_packet_event: SimArray::new(1),
            veth_state: lru(),
            procfs_pid: lru(),

            traced_cgroups: lru(),
            traced_pids: lru(),
            activity_dumps_config: hash(),
            cgroup_wait_list: lru(),
            rate_limiters: lru(),
            syscall_drift: lru(),
        };
        for (c, v) in DEFAULT_CONSTANTS {
            k.set_constant(*c, *v);
        }
        let sb = k.alloc_super_block(0x0080_0001, EXT4_SUPER_MAGIC);
        k.default_sb.set(sb);
        k
    }

    // ── clock, identity, policy ─────────────────────────────────────────────

    pub fn set_time(&self, now: u64) {
        self.now.set(now);
    }

    pub fn advance(&self, delta: u64) {
        self.now.set(self.now.get() + delta);
    }

    pub fn set_current(&self, tgid: u32, pid: u32) {
        self.pid_tgid.set(((tgid as u64) << 32) | pid as u64);
    }

    pub fn set_comm(&self, comm: &str) {
        let mut buf = [0u8; TASK_COMM_LEN];
        let len = comm.len().min(TASK_COMM_LEN - 1);
        buf[..len].copy_from_slice(&comm.as_bytes()[..len]);
        self.comms.borrow_mut().insert(self.pid_tgid.get(), buf);
    }

    pub fn set_constant(&self, c: C, value: u64) {
        let _ = self.constants.store(&(c as u32), &value, UpdateFlag::Any);
    }

    pub fn enable_events(&self, types: &[EventType]) {
        let mask = types.iter().fold(0u64, |m, t| m | t.mask());
        let _ = self.enabled_events.with_mut(&0, |v| *v |= mask);
    }

    pub fn set_ringbuf_usage(&self, usage: u64) {
        self.ringbuf_usage.set(usage);
    }

    /// Makes every ring write fail, as a full ring does.
    pub fn fail_output(&self, fail: bool) {
        self.fail_output.set(fail);
    }

    pub fn signals_sent(&self) -> Vec<(u32, u32)> {
        self.signals.borrow().clone()
    }

    // ── captured events and counters ────────────────────────────────────────

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.captured.borrow().clone()
    }

    pub fn events_of(&self, t: EventType) -> Vec<CapturedEvent> {
        self.captured
            .borrow()
            .iter()
            .filter(|ev| ev.header().event_type == t as u32)
            .cloned()
            .collect()
    }

    pub fn clear_events(&self) {
        self.captured.borrow_mut().clear();
    }

    pub fn event_stats_of(&self, t: EventType) -> EventStats {
        self.event_stats.lookup(&(t as u32)).unwrap_or_default()
    }

    pub fn filter_stats_of(&self, t: EventType) -> FilterStats {
        self.filter_stats.lookup(&(t as u32)).unwrap_or_default()
    }

    pub fn syscall_stats_of(&self, t: EventType) -> SyscallStats {
        self.syscall_stats.lookup(&(t as u32)).unwrap_or_default()
    }

    pub fn resolver_stats_total(&self) -> ResolverStats {
        self.resolver_stats.lookup(&0).unwrap_or_default()
    }

    pub fn net_stats_total(&self) -> NetStats {
        self.net_stats.lookup(&0).unwrap_or_default()
    }

    // ── tail calls ──────────────────────────────────────────────────────────

    /// Follows a hook's tail calls to the end of the chain.
    pub fn run(&self, mut next: Next) -> Next {
        let mut calls = 0;
        while let Next::TailCall(prog) = next {
            if calls >= MAX_TAIL_CALLS || prog.is_classifier() {
                tail_call_failed(self, prog);
                return Next::Done;
            }
            calls += 1;
            next = run_prog(self, prog);
        }
        next
    }

    /// Runs a TC classifier on `skb` and returns its final verdict.
    pub fn run_classifier<P: PacketReader>(&self, skb: &P, direction: Direction) -> Next {
        let mut next = net::classify(self, skb, direction);
        let mut calls = 0;
        while let Next::TailCall(prog) = next {
            if calls >= MAX_TAIL_CALLS || !prog.is_classifier() {
                tail_call_failed(self, prog);
                return Next::Done;
            }
            calls += 1;
            next = run_classifier_prog(self, skb, prog);
        }
        next
    }

    // ── memory ──────────────────────────────────────────────────────────────

    fn kalloc(&self, size: u64) -> u64 {
        self.kmem.borrow_mut().alloc(size)
    }

    fn kwrite(&self, addr: u64, src: &[u8]) {
        let written = self.kmem.borrow_mut().write(addr, src);
        assert!(written, "kernel write out of bounds at {:#x}", addr);
    }

    fn put<T: Plain>(&self, addr: u64, value: T) {
        self.kwrite(addr, bytes_of(&value));
    }

    fn put_at<T: Plain>(&self, base: u64, c: C, value: T) {
        self.put(base.wrapping_add(self.constant(c)), value);
    }

    fn kstr(&self, s: &str) -> u64 {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.alloc_kernel_bytes(&bytes)
    }

    pub fn alloc_kernel_bytes(&self, bytes: &[u8]) -> u64 {
        let addr = self.kalloc(bytes.len() as u64);
        self.kwrite(addr, bytes);
        addr
    }

    pub fn alloc_user(&self, size: u64) -> u64 {
        self.umem.borrow_mut().alloc(size)
    }

    pub fn write_user_bytes(&self, addr: u64, bytes: &[u8]) {
        let written = self.umem.borrow_mut().write(addr, bytes);
        assert!(written, "user write out of bounds at {:#x}", addr);
    }

    pub fn read_user_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let read = self.umem.borrow().read(addr, &mut buf);
        assert!(read, "user read out of bounds at {:#x}", addr);
        buf
    }

    /// Copies NUL-terminated `strings` to user memory; returns `(start, end)`.
    pub fn alloc_user_strings(&self, strings: &[&str]) -> (u64, u64) {
        let mut bytes = Vec::new();
        for s in strings {
            bytes.extend_from_slice(s.as_bytes());
            bytes.push(0);
        }
        let start = self.alloc_user(bytes.len() as u64);
        if !bytes.is_empty() {
            self.write_user_bytes(start, &bytes);
        }
        (start, start + bytes.len() as u64)
    }

    // ── filesystem ──────────────────────────────────────────────────────────

    fn alloc_super_block(&self, dev: u32, magic: u64) -> u64 {
        let sb = self.kalloc(128);
        self.put_at(sb, C::SbDev, dev);
        self.put_at(sb, C::SbMagic, magic);
        sb
    }

    pub fn alloc_inode(&self, ino: u64, mode: u16) -> u64 {
        let inode = self.kalloc(640);
        self.put_at(inode, C::InodeMode, mode);
        self.put_at(inode, C::InodeSb, self.default_sb.get());
        self.put_at(inode, C::InodeIno, ino);
        self.put_at(inode, C::InodeNlink, 1u32);
        self.put_at(inode, C::InodeMtime, self.now.get());
        self.put_at(inode, C::InodeCtime, self.now.get());
        inode
    }

    /// Sets owner, mode and link count of the inode behind `dentry`.
    pub fn set_inode_metadata(&self, dentry: u64, uid: u32, gid: u32, mode: u16, nlink: u32) {
        let inode = kobj::dentry_inode(self, dentry);
        self.put_at(inode, C::InodeUid, uid);
        self.put_at(inode, C::InodeGid, gid);
        self.put_at(inode, C::InodeMode, mode);
        self.put_at(inode, C::InodeNlink, nlink);
    }

    /// A filesystem root: named `/` and its own parent.
    pub fn root_dentry(&self, ino: u64) -> u64 {
        let inode = self.alloc_inode(ino, S_IFDIR | 0o755);
        let dentry = self.kalloc(128);
        self.put_at(dentry, C::DentryParent, dentry);
        self.put_at(dentry, C::DentryNamePtr, self.kstr("/"));
        self.put_at(dentry, C::DentryInode, inode);
        self.put_at(dentry, C::DentrySb, self.default_sb.get());
        dentry
    }

    /// A child of `parent`; inode 0 makes a negative dentry.
    pub fn add_dentry(&self, parent: u64, name: &str, ino: u64) -> u64 {
        let inode = match ino {
            0 => 0,
            ino => self.alloc_inode(ino, S_IFREG | 0o644),
        };
        self.add_dentry_with_inode(parent, name, inode)
    }

    pub fn add_dentry_with_inode(&self, parent: u64, name: &str, inode: u64) -> u64 {
        let dentry = self.kalloc(128);
        self.put_at(dentry, C::DentryParent, parent);
        self.put_at(dentry, C::DentryNamePtr, self.kstr(name));
        self.put_at(dentry, C::DentryInode, inode);
        self.put_at(dentry, C::DentrySb, self.default_sb.get());
        dentry
    }

    /// Unbinds the inode, as `d_delete` does to an unlinked name.
    pub fn detach_dentry(&self, dentry: u64) {
        self.put_at(dentry, C::DentryInode, 0u64);
    }

    pub fn move_dentry(&self, dentry: u64, new_parent: u64, name: &str) {
        self.put_at(dentry, C::DentryParent, new_parent);
        self.put_at(dentry, C::DentryNamePtr, self.kstr(name));
    }

    /// Walks `dentry` into the path cache as the resolver would.
    pub fn resolve_dentry(&self, dentry: u64, mount_id: u32) -> PathKey {
        let key = kobj::dentry_key(self, dentry, mount_id);
        let mut input = ResolverInput::new(key, dentry, EventType::Any, DentryCallback::None);
        while let Step::Continue = resolve_chunk(self, &mut input) {
            if input.iteration >= DR_MAX_TAIL_CALL {
                break;
            }
        }
        key
    }

    /// Mounts `root` on `mountpoint` of mount `parent_id`; returns the
    /// embedded vfsmount.
    pub fn add_mount(&self, mount_id: u32, root: u64, parent_id: u32, mountpoint: u64) -> u64 {
        // struct mount keeps its parent and mountpoint before the vfsmount
        let mnt = self.kalloc(512) + 32;
        let sb = self.alloc_super_block((8 << 20) | mount_id, EXT4_SUPER_MAGIC);
        let parent = match parent_id {
            id if id == mount_id => mnt,
            id => self.mounts.borrow().get(&id).copied().unwrap_or(0),
        };
        self.put_at(mnt, C::VfsmountRoot, root);
        self.put_at(mnt, C::VfsmountSb, sb);
        self.put_at(mnt, C::MountId, mount_id);
        self.put_at(mnt, C::MountParent, parent);
        self.put_at(mnt, C::MountMountpoint, mountpoint);
        self.mounts.borrow_mut().insert(mount_id, mnt);
        mnt
    }

    /// A `struct path`.
    pub fn alloc_path(&self, mnt: u64, dentry: u64) -> u64 {
        let path = self.kalloc(16);
        self.put(path, mnt);
        self.put(path + 8, dentry);
        path
    }

    pub fn alloc_file(&self, mnt: u64, dentry: u64, flags: u32) -> u64 {
        let file = self.kalloc(128);
        self.put_at(file, C::FilePathMnt, mnt);
        self.put_at(file, C::FilePathDentry, dentry);
        self.put_at(file, C::FileInode, kobj::dentry_inode(self, dentry));
        self.put_at(file, C::FileFlags, flags);
        file
    }

    pub fn alloc_bprm(&self, file: u64) -> u64 {
        let bprm = self.kalloc(128);
        self.put_at(bprm, C::BprmFile, file);
        bprm
    }

    pub fn alloc_vma(&self, start: u64, end: u64, flags: u64) -> u64 {
        let vma = self.kalloc(128);
        self.put_at(vma, C::VmaStart, start);
        self.put_at(vma, C::VmaEnd, end);
        self.put_at(vma, C::VmaFlags, flags);
        vma
    }

    /// A pipe whose current buffer carries `buf_flags`.
    pub fn alloc_pipe(&self, buf_flags: u32) -> u64 {
        let bufs = self.kalloc(64);
        self.put_at(bufs, C::PipeBufFlags, buf_flags);
        let pipe = self.kalloc(256);
        self.put_at(pipe, C::PipeBufs, bufs);
        pipe
    }

    // ── tasks ───────────────────────────────────────────────────────────────

    pub fn alloc_cred(&self, creds: Credentials) -> u64 {
        let cred = self.kalloc(64);
        self.put_at(cred, C::CredUid, creds.uid);
        self.put_at(cred, C::CredGid, creds.gid);
        self.put_at(cred, C::CredEuid, creds.euid);
        self.put_at(cred, C::CredEgid, creds.egid);
        self.put_at(cred, C::CredFsuid, creds.fsuid);
        self.put_at(cred, C::CredFsgid, creds.fsgid);
        self.put_at(cred, C::CredCapPermitted, creds.cap_permitted);
        self.put_at(cred, C::CredCapEffective, creds.cap_effective);
        cred
    }

    /// The `struct net` of namespace `inum`, shared by everything in it.
    pub fn net(&self, inum: u32) -> u64 {
        if let Some(net) = self.nets.borrow().get(&inum) {
            return *net;
        }
        let net = self.kalloc(256);
        self.put_at(net, C::NetNsInum, inum);
        self.nets.borrow_mut().insert(inum, net);
        net
    }

    /// Creates a task. Group leaders get a pid cache entry, as a process
    /// that predates the probes would after its first event.
    pub fn spawn_task(&self, tgid: u32, pid: u32, parent_tgid: u32) -> u64 {
        let task = self.kalloc(3072);
        self.put_at(task, C::TaskPid, pid);
        self.put_at(task, C::TaskTgid, tgid);
        let kthread = tgid == KTHREADD || parent_tgid == KTHREADD;
        self.put_at(task, C::TaskFlags, if kthread { PF_KTHREAD } else { 0 });
        let parent_key = ((parent_tgid as u64) << 32) | parent_tgid as u64;
        let parent = self.tasks.borrow().get(&parent_key).copied().unwrap_or(0);
        self.put_at(task, C::TaskRealParent, parent);
        self.put_at(task, C::TaskCred, self.alloc_cred(Credentials::default()));
        self.put_at(task, C::TaskMm, self.kalloc(512));
        self.put_at(task, C::TaskSignal, self.kalloc(512));
        let nsproxy = self.kalloc(64);
        self.put_at(nsproxy, C::NsproxyNet, self.net(HOST_NETNS));
        self.put_at(task, C::TaskNsproxy, nsproxy);
        self.tasks
            .borrow_mut()
            .insert(((tgid as u64) << 32) | pid as u64, task);

        if tgid == pid {
            process::ensure_entry(self, tgid);
            let _ = self.pid_cache.with_mut(&tgid, |e| e.ppid = parent_tgid);
        }
        task
    }

    /// Lays out the argument and environment strings of `task`'s image.
    pub fn set_task_args(&self, task: u64, args: &[&str], envs: &[&str]) {
        let mm = self.read_at::<u64>(task, C::TaskMm).unwrap_or(0);
        let (arg_start, arg_end) = self.alloc_user_strings(args);
        let (env_start, env_end) = self.alloc_user_strings(envs);
        self.put_at(mm, C::MmArgStart, arg_start);
        self.put_at(mm, C::MmArgEnd, arg_end);
        self.put_at(mm, C::MmEnvStart, env_start);
        self.put_at(mm, C::MmEnvEnd, env_end);
    }

    // ── network ─────────────────────────────────────────────────────────────

    fn next_cookie(&self) -> u64 {
        let cookie = self.next_cookie.get();
        self.next_cookie.set(cookie + 1);
        cookie
    }

    pub fn alloc_sock(&self, info: SockInfo) -> u64 {
        let sk = self.kalloc(640);
        self.put_at(sk, C::SockFamily, info.family);
        self.put_at(sk, C::SockProtocol, info.protocol);
        self.put_at(sk, C::SockNum, info.sport);
        self.put_at(sk, C::SockDport, info.dport.to_be());
        self.put_at(sk, C::SockNet, self.net(info.netns));
        match info.family {
            AF_INET => {
                let mut saddr = [0u8; 4];
                let mut daddr = [0u8; 4];
                saddr.copy_from_slice(&info.saddr[..4]);
                daddr.copy_from_slice(&info.daddr[..4]);
                self.put_at(sk, C::SockRcvSaddr, saddr);
                self.put_at(sk, C::SockDaddr, daddr);
            }
            AF_INET6 => {
                self.put_at(sk, C::SockV6RcvSaddr, info.saddr);
                self.put_at(sk, C::SockV6Daddr, info.daddr);
            }
            _ => {}
        }
        let cookie = self.next_cookie();
        self.cookies.borrow_mut().insert(sk, cookie);
        sk
    }

    /// A TCP/IPv4 socket with a known cookie.
    pub fn alloc_sock_with_cookie(&self, cookie: u64) -> u64 {
        let sk = self.alloc_sock(SockInfo {
            family: AF_INET,
            protocol: IPPROTO_TCP,
            ..SockInfo::default()
        });
        self.cookies.borrow_mut().insert(sk, cookie);
        sk
    }

    /// A `struct socket_alloc` around `sk`; returns the socket and its inode.
    pub fn alloc_socket(&self, sk: u64) -> (u64, u64) {
        let inode_offset = self.constant(C::SocketAllocInode);
        let socket = self.kalloc(inode_offset + 640);
        self.put_at(socket, C::SocketSk, sk);
        let inode = socket + inode_offset;
        let ino = self.next_ino.get();
        self.next_ino.set(ino + 1);
        self.put_at(inode, C::InodeMode, S_IFSOCK | 0o777);
        self.put_at(inode, C::InodeSb, self.default_sb.get());
        self.put_at(inode, C::InodeIno, ino);
        self.put_at(inode, C::InodeNlink, 1u32);
        (socket, inode)
    }

    pub fn alloc_flowi4(&self, saddr: [u8; 4], sport: u16) -> u64 {
        let fl = self.kalloc(128);
        self.put_at(fl, C::FlowiSaddr4, saddr);
        self.put_at(fl, C::FlowiSport4, sport.to_be());
        fl
    }

    pub fn alloc_flowi6(&self, saddr: [u8; 16], sport: u16) -> u64 {
        let fl = self.kalloc(128);
        self.put_at(fl, C::FlowiSaddr6, saddr);
        self.put_at(fl, C::FlowiSport6, sport.to_be());
        fl
    }

    pub fn alloc_net_device(&self, name: &str, ifindex: u32, netns: u32) -> u64 {
        let dev = self.kalloc(320);
        let mut buf = [0u8; IFNAMSIZ];
        let len = name.len().min(IFNAMSIZ - 1);
        buf[..len].copy_from_slice(&name.as_bytes()[..len]);
        self.put_at(dev, C::NetDeviceName, buf);
        self.put_at(dev, C::NetDeviceIfindex, ifindex);
        self.put_at(dev, C::NetDeviceNet, self.net(netns));
        dev
    }

    /// An `nf_conn` with its original and reply tuples.
    pub fn alloc_conntrack(&self, orig: Flow, reply: Flow, netns: u32) -> u64 {
        const TUPLE_HASH_SIZE: u64 = 56;
        const TUPLE_OFFSET: u64 = 16;
        let ct = self.kalloc(192);
        let tuples = ct.wrapping_add(self.constant(C::NfConnTuples));
        for (dir, flow) in [(0u64, orig), (1, reply)] {
            let l3num = if flow.l3_protocol == ETH_P_IP { AF_INET } else { AF_INET6 };
            let mut tuple = [0u8; 40];
            tuple[..16].copy_from_slice(&flow.saddr);
            tuple[16..18].copy_from_slice(&flow.sport.to_be_bytes());
            tuple[18..20].copy_from_slice(&l3num.to_ne_bytes());
            tuple[20..36].copy_from_slice(&flow.daddr);
            tuple[36..38].copy_from_slice(&flow.dport.to_be_bytes());
            tuple[38] = flow.l4_protocol as u8;
            tuple[39] = dir as u8;
            self.kwrite(tuples + dir * TUPLE_HASH_SIZE + TUPLE_OFFSET, &tuple);
        }
        self.put_at(ct, C::NfConnNet, self.net(netns));
        ct
    }

    // ── cgroups ─────────────────────────────────────────────────────────────

    pub fn alloc_kernfs_node(&self, parent: u64, name: &str, id: u64) -> u64 {
        let kn = self.kalloc(128);
        self.put_at(kn, C::KernfsNodeParent, parent);
        self.put_at(kn, C::KernfsNodeName, self.kstr(name));
        self.put_at(kn, C::KernfsNodeId, id);
        kn
    }

    /// The `kernfs_open_file` of a write to `kn`.
    pub fn alloc_kernfs_open_file(&self, kn: u64) -> u64 {
        let of = self.kalloc(192);
        self.put_at(of, C::KernfsOfKn, kn);
        of
    }

    /// A legacy `struct cgroup` known by its directory dentry.
    pub fn alloc_cgroup(&self, dentry: u64) -> u64 {
        let cgroup = self.kalloc(320);
        self.put_at(cgroup, C::CgroupDentry, dentry);
        cgroup
    }
}

impl Kernel for SimKernel {
    type Hash<K: MapKey, V: Copy> = SimMap<K, V>;
    type Lru<K: MapKey, V: Copy> = SimMap<K, V>;
    type Array<V: Plain> = SimArray<V>;
    type PerCpu<V: Plain> = SimArray<V>;

    fn now_ns(&self) -> u64 {
        self.now.get()
    }

    fn pid_tgid(&self) -> u64 {
        self.pid_tgid.get()
    }

    fn cpu(&self) -> u32 {
        0
    }

    fn random_u32(&self) -> u32 {
        let mut x = self.rng.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng.set(x);
        (x >> 32) as u32
    }

    fn comm(&self) -> [u8; TASK_COMM_LEN] {
        self.comms
            .borrow()
            .get(&self.pid_tgid.get())
            .copied()
            .unwrap_or(*b"sim\0\0\0\0\0\0\0\0\0\0\0\0\0")
    }

    fn current_task(&self) -> u64 {
        self.tasks
            .borrow()
            .get(&self.pid_tgid.get())
            .copied()
            .unwrap_or(0)
    }

    fn send_signal(&self, sig: u32) -> bool {
        self.signals.borrow_mut().push((self.tgid(), sig));
        true
    }

    fn socket_cookie(&self, sk: u64) -> Option<u64> {
        self.cookies.borrow().get(&sk).copied()
    }

    fn read_kernel(&self, addr: u64, dst: &mut [u8]) -> bool {
        self.kmem.borrow().read(addr, dst)
    }

    fn read_kernel_str(&self, addr: u64, dst: &mut [u8]) -> Option<usize> {
        self.kmem.borrow().read_str(addr, dst)
    }

    fn read_user(&self, addr: u64, dst: &mut [u8]) -> bool {
        self.umem.borrow().read(addr, dst)
    }

    fn read_user_str(&self, addr: u64, dst: &mut [u8]) -> Option<usize> {
        self.umem.borrow().read_str(addr, dst)
    }

    fn write_user(&self, addr: u64, src: &[u8]) -> bool {
        self.umem.borrow_mut().write(addr, src)
    }

    fn output(&self, data: &[u8]) -> Result<(), i64> {
        if self.fail_output.get() {
            return Err(ENOSPC);
        }
        if data.len() < core::mem::size_of::<KEventHeader>() {
            return Err(EINVAL);
        }
        self.captured.borrow_mut().push(CapturedEvent { bytes: data.to_vec() });
        Ok(())
    }

    fn ringbuf_usage(&self) -> u64 {
        self.ringbuf_usage.get()
    }

    fn constants(&self) -> &Self::Array<u64> {
        &self.constants
    }
    fn enabled_events(&self) -> &Self::Array<u64> {
        &self.enabled_events
    }
    fn filter_policy(&self) -> &Self::Array<FilterPolicy> {
        &self.filter_policy
    }
    fn basename_approvers(&self) -> &Self::Hash<BasenameKey, u64> {
        &self.basename_approvers
    }
    fn flag_approvers(&self) -> &Self::Array<u64> {
        &self.flag_approvers
    }
    fn dns_rcode_mute(&self) -> &Self::Array<u32> {
        &self.dns_rcode_mute
    }
    fn raw_packet_bucket(&self) -> &Self::Array<TokenBucket> {
        &self.raw_packet_bucket
    }
    fn raw_packet_drop(&self) -> &Self::Hash<PidRouteKey, u32> {
        &self.raw_packet_drop
    }
    fn security_profiles(&self) -> &Self::Hash<ContainerId, SecurityProfile> {
        &self.security_profiles
    }
    fn dump_control(&self) -> &Self::Array<DumpControl> {
        &self.dump_control
    }
    fn cgroup_mount_filter(&self) -> &Self::Hash<u32, u32> {
        &self.cgroup_mount_filter
    }

    fn event_stats(&self) -> &Self::PerCpu<EventStats> {
        &self.event_stats
    }
    fn filter_stats(&self) -> &Self::PerCpu<FilterStats> {
        &self.filter_stats
    }
    fn resolver_stats(&self) -> &Self::PerCpu<ResolverStats> {
        &self.resolver_stats
    }
    fn syscall_stats(&self) -> &Self::PerCpu<SyscallStats> {
        &self.syscall_stats
    }
    fn net_stats(&self) -> &Self::PerCpu<NetStats> {
        &self.net_stats
    }
    fn telemetry(&self) -> &Self::Array<Telemetry> {
        &self.telemetry
    }

    fn path_cache(&self) -> &Self::Lru<PathKey, PathLeaf> {
        &self.path_cache
    }
    fn path_ids(&self) -> &Self::Array<u32> {
        &self.path_ids
    }
    fn erpc_state(&self) -> &Self::PerCpu<ErpcResolveState> {
        &self.erpc_state
    }
    fn erpc_mmap(&self) -> &Self::Array<ErpcBuffer> {
        &self.erpc_mmap
    }

    fn inode_discarders(&self) -> &Self::Lru<InodeDiscarderKey, InodeDiscarder> {
        &self.inode_discarders
    }
    fn pid_discarders(&self) -> &Self::Lru<u32, PidDiscarder> {
        &self.pid_discarders
    }
    fn discarders_revision(&self) -> &Self::Array<u32> {
        &self.discarders_revision
    }
    fn mount_revisions(&self) -> &Self::Array<u32> {
        &self.mount_revisions
    }

    fn syscalls(&self) -> &Self::Lru<u64, SyscallCache> {
        &self.syscalls
    }
    fn exec_pid_transfer(&self) -> &Self::Lru<u32, u64> {
        &self.exec_pid_transfer
    }
    fn syscall_ctx(&self) -> &Self::Lru<u32, SyscallArgs> {
        &self.syscall_ctx
    }
    fn async_submitters(&self) -> &Self::Lru<u64, u64> {
        &self.async_submitters
    }

    fn proc_cache(&self) -> &Self::Lru<u64, ProcCacheEntry> {
        &self.proc_cache
    }
    fn pid_cache(&self) -> &Self::Lru<u32, PidCacheEntry> {
        &self.pid_cache
    }
    fn pid_ignored(&self) -> &Self::Lru<u32, u32> {
        &self.pid_ignored
    }
    fn args_envs_parser(&self) -> &Self::PerCpu<ArgsEnvsParser> {
        &self.args_envs_parser
    }
    fn args_envs_event(&self) -> &Self::PerCpu<ArgsEnvsEvent> {
        &self.args_envs_event
    }
    fn process_event(&self) -> &Self::PerCpu<ProcessEvent> {
        &self.process_event
    }
    fn span_tls(&self) -> &Self::Hash<u32, SpanTls> {
        &self.span_tls
    }
    fn user_sessions(&self) -> &Self::Lru<u64, UserSession> {
        &self.user_sessions
    }
    fn pid_sessions(&self) -> &Self::Lru<u32, u64> {
        &self.pid_sessions
    }

    fn mount_refs(&self) -> &Self::Hash<u32, MountRef> {
        &self.mount_refs
    }

    fn conntrack(&self) -> &Self::Lru<NamespacedFlow, NamespacedFlow> {
        &self.conntrack
    }
    fn flow_pid(&self) -> &Self::Lru<PidRouteKey, PidRouteEntry> {
        &self.flow_pid
    }
    fn sock_meta(&self) -> &Self::Lru<u64, SockMeta> {
        &self.sock_meta
    }
    fn sock_cookie_pid(&self) -> &Self::Lru<u64, u32> {
        &self.sock_cookie_pid
    }
    fn ifindex_netns(&self) -> &Self::Lru<u32, u32> {
        &self.ifindex_netns
    }
    fn packets(&self) -> &Self::PerCpu<Packet> {
        &self.packets
    }
    fn dns_event(&self) -> &Self::PerCpu<DnsEvent> {
        &self.dns_event
    }
    fn dns_responses(&self) -> &Self::Lru<DnsResponseKey, DnsResponseEntry> {
        &self.dns_responses
    }
    fn dns_response_event(&self) -> &Self::PerCpu<DnsResponseEvent> {
        &self.dns_response_event
    }
    fn imds_event(&self) -> &Self::PerCpu<ImdsEvent> {
        &self.imds_event
    }
    fn raw_packet_event(&self) -> &Self::PerCpu<RawPacketEvent> {
        &self.raw_packet_event
    }
    fn veth_state(&self) -> &Self::Lru<u64, VethState> {
        &self.veth_state
    }
    fn procfs_pid(&self) -> &Self::Lru<u64, u32> {
        &self.procfs_pid
    }

    fn traced_cgroups(&self) -> &Self::Lru<ContainerId, u64> {
        &self.traced_cgroups
    }
    fn traced_pids(&self) -> &Self::Lru<u32, u64> {
        &self.traced_pids
    }
    fn activity_dumps_config(&self) -> &Self::Hash<u64, ActivityDumpConfig> {
        &self.activity_dumps_config
    }
    fn cgroup_wait_list(&self) -> &Self::Lru<ContainerId, u64> {
        &self.cgroup_wait_list
    }
    fn rate_limiters(&self) -> &Self::Lru<u64, RateLimiterCtx> {
        &self.rate_limiters
    }
    fn syscall_drift(&self) -> &Self::Lru<u32, SyscallDriftState> {
        &self.syscall_drift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_evicts_the_least_recently_used() {
        let map: SimMap<u32, u32> = SimMap::lru(2);
        map.store(&1, &10, UpdateFlag::Any).unwrap();
        map.store(&2, &20, UpdateFlag::Any).unwrap();
        assert_eq!(map.lookup(&1), Some(10));
        map.store(&3, &30, UpdateFlag::Any).unwrap();
        assert!(map.contains(&1));
        assert!(!map.contains(&2));
    }

    #[test]
    fn full_hash_refuses_and_flags_are_honoured() {
        let map: SimMap<u32, u32> = SimMap::hash(1);
        assert_eq!(map.store(&1, &1, UpdateFlag::Exist), Err(MapError::NotFound));
        map.store(&1, &1, UpdateFlag::NoExist).unwrap();
        assert_eq!(map.store(&1, &2, UpdateFlag::NoExist), Err(MapError::Exists));
        assert_eq!(map.store(&2, &2, UpdateFlag::Any), Err(MapError::Full));
    }

    #[test]
    fn every_map_of_a_new_kernel_takes_its_own_types() {
        let k = SimKernel::new();
        k.basename_approvers()
            .store(&BasenameKey::new(b"passwd"), &1, UpdateFlag::Any)
            .unwrap();
        k.pid_discarders()
            .store(&42, &PidDiscarder::default(), UpdateFlag::Any)
            .unwrap();
        k.security_profiles()
            .store(&ContainerId::from_bytes(b"c0ffee"), &zeroed::<SecurityProfile>(), UpdateFlag::Any)
            .unwrap();
        assert!(k.pid_discarders().contains(&42));
        assert!(k.raw_packet_drop().is_empty());
        assert_eq!(k.security_profiles().len(), 1);
    }

    #[test]
    fn strings_truncate_and_fault_like_the_helper() {
        let k = SimKernel::new();
        let addr = k.alloc_kernel_bytes(b"abcdef\0");
        let mut buf = [0u8; 4];
        assert_eq!(k.read_kernel_str(addr, &mut buf), Some(3));
        assert_eq!(&buf, b"abc\0");
        let unterminated = k.alloc_kernel_bytes(b"xyz");
        let mut big = [0u8; 16];
        assert_eq!(k.read_kernel_str(unterminated, &mut big), None);
    }

    #[test]
    fn objects_are_read_back_through_the_offsets() {
        let k = SimKernel::new();
        let root = k.root_dentry(2);
        let etc = k.add_dentry(root, "etc", 10);
        assert_eq!(kobj::dentry_parent(&k, etc), root);
        assert_eq!(kobj::inode_ino(&k, kobj::dentry_inode(&k, etc)), 10);
        let mnt = k.add_mount(5, root, 5, 0);
        assert_eq!(kobj::vfsmount_mount_id(&k, mnt), 5);
        assert_eq!(kobj::vfsmount_parent(&k, mnt), mnt);
        let task = k.spawn_task(10, 11, 1);
        assert_eq!(kobj::task_pid(&k, task), 11);
        assert_eq!(kobj::task_netns(&k, task), HOST_NETNS);
    }
}
