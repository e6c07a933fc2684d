//! Wire layout of the event stream.
//!
//! Every record starts with a 16-byte [`KEventHeader`] followed by the
//! [`EventBase`] contexts and a per-type payload. Layouts are `#[repr(C)]`
//! with explicit padding; they are shared verbatim with the agent.

use crate::consts::{
    CONTAINER_ID_LEN, DNS_MAX_NAME_LEN, DNS_RESPONSE_PAYLOAD_LEN, FSTYPE_LEN, IFNAMSIZ,
    IMDS_MAX_LENGTH, RAW_PACKET_MAX_LENGTH, SYSCALL_BITMAP_BYTES, TASK_COMM_LEN, TTY_NAME_LEN,
    ARGS_ENVS_BUFFER_LEN, XATTR_NAME_LEN,
};
use crate::kernel::plain;
use crate::path::PathKey;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Any = 0,
    Open = 1,
    Mkdir,
    Link,
    Rename,
    Unlink,
    Rmdir,
    Chmod,
    Chown,
    Utimes,
    SetXattr,
    RemoveXattr,
    Chdir,
    Mmap,
    Mprotect,
    Splice,
    Mount,
    Umount,
    MountReleased,
    Fork,
    Exec,
    Exit,
    SetUid,
    SetGid,
    Capset,
    ArgsEnvs,
    Bind,
    Dns,
    DnsResponse,
    Imds,
    RawPacket,
    NetDevice,
    VethPair,
    CgroupTracing,
    SyscallDrift,
}

pub const MAX_EVENT_TYPE: u32 = EventType::SyscallDrift as u32 + 1;
pub const FIRST_DISCARDER_EVENT: u32 = EventType::Open as u32;
pub const LAST_DISCARDER_EVENT: u32 = EventType::Splice as u32;
pub const DISCARDER_EVENT_COUNT: usize = (LAST_DISCARDER_EVENT - FIRST_DISCARDER_EVENT + 1) as usize;

const ALL_EVENT_TYPES: [EventType; MAX_EVENT_TYPE as usize] = [
    EventType::Any,
    EventType::Open,
    EventType::Mkdir,
    EventType::Link,
    EventType::Rename,
    EventType::Unlink,
    EventType::Rmdir,
    EventType::Chmod,
    EventType::Chown,
    EventType::Utimes,
    EventType::SetXattr,
    EventType::RemoveXattr,
    EventType::Chdir,
    EventType::Mmap,
    EventType::Mprotect,
    EventType::Splice,
    EventType::Mount,
    EventType::Umount,
    EventType::MountReleased,
    EventType::Fork,
    EventType::Exec,
    EventType::Exit,
    EventType::SetUid,
    EventType::SetGid,
    EventType::Capset,
    EventType::ArgsEnvs,
    EventType::Bind,
    EventType::Dns,
    EventType::DnsResponse,
    EventType::Imds,
    EventType::RawPacket,
    EventType::NetDevice,
    EventType::VethPair,
    EventType::CgroupTracing,
    EventType::SyscallDrift,
];

impl EventType {
    pub fn from_u32(v: u32) -> Option<Self> {
        ALL_EVENT_TYPES.get(v as usize).copied()
    }

    pub fn all() -> &'static [EventType] {
        &ALL_EVENT_TYPES[1..]
    }

    /// Bit of this type in event masks.
    pub fn mask(self) -> u64 {
        1u64 << (self as u32)
    }

    pub fn is_discardable(self) -> bool {
        let v = self as u32;
        (FIRST_DISCARDER_EVENT..=LAST_DISCARDER_EVENT).contains(&v)
    }

    /// Slot in per-event discarder timestamp arrays.
    pub fn discarder_index(self) -> Option<usize> {
        if self.is_discardable() {
            Some((self as u32 - FIRST_DISCARDER_EVENT) as usize)
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EventType::Any => "any",
            EventType::Open => "open",
            EventType::Mkdir => "mkdir",
            EventType::Link => "link",
            EventType::Rename => "rename",
            EventType::Unlink => "unlink",
            EventType::Rmdir => "rmdir",
            EventType::Chmod => "chmod",
            EventType::Chown => "chown",
            EventType::Utimes => "utimes",
            EventType::SetXattr => "setxattr",
            EventType::RemoveXattr => "removexattr",
            EventType::Chdir => "chdir",
            EventType::Mmap => "mmap",
            EventType::Mprotect => "mprotect",
            EventType::Splice => "splice",
            EventType::Mount => "mount",
            EventType::Umount => "umount",
            EventType::MountReleased => "mount_released",
            EventType::Fork => "fork",
            EventType::Exec => "exec",
            EventType::Exit => "exit",
            EventType::SetUid => "setuid",
            EventType::SetGid => "setgid",
            EventType::Capset => "capset",
            EventType::ArgsEnvs => "args_envs",
            EventType::Bind => "bind",
            EventType::Dns => "dns",
            EventType::DnsResponse => "dns_response",
            EventType::Imds => "imds",
            EventType::RawPacket => "raw_packet",
            EventType::NetDevice => "net_device",
            EventType::VethPair => "veth_pair",
            EventType::CgroupTracing => "cgroup_tracing",
            EventType::SyscallDrift => "syscall_drift",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ALL_EVENT_TYPES.iter().copied().find(|t| t.name() == name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Header and contexts
// ─────────────────────────────────────────────────────────────────────────────

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KEventHeader {
    pub timestamp_ns: u64,
    pub event_type: u32,
    pub cpu: u16,
    pub flags: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessContext {
    pub pid: u32,
    pub tid: u32,
    pub netns: u32,
    pub is_kworker: u32,
    pub cookie: u64,
    pub user_session_id: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpanContext {
    pub span_id: u64,
    pub trace_id: [u64; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerContext {
    pub container_id: [u8; CONTAINER_ID_LEN],
    pub cgroup_flags: u64,
    pub cgroup_file: PathKey,
}

impl Default for ContainerContext {
    fn default() -> Self {
        Self {
            container_id: [0; CONTAINER_ID_LEN],
            cgroup_flags: 0,
            cgroup_file: PathKey::default(),
        }
    }
}

impl ContainerContext {
    pub fn is_empty(&self) -> bool {
        self.container_id[0] == 0
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventBase {
    pub header: KEventHeader,
    pub process: ProcessContext,
    pub span: SpanContext,
    pub container: ContainerContext,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyscallContext {
    pub retval: i64,
    /// Id of the argument snapshot in the `syscall_ctx` map, 0 if none.
    pub ctx_id: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileMetadata {
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub mode: u16,
    pub _pad: u16,
    pub ctime: u64,
    pub mtime: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct File {
    pub path_key: PathKey,
    pub dev: u32,
    pub flags: u32,
    pub metadata: FileMetadata,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
    pub fsuid: u32,
    pub fsgid: u32,
    pub cap_effective: u64,
    pub cap_permitted: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Flow {
    pub saddr: [u8; 16],
    pub daddr: [u8; 16],
    pub sport: u16,
    pub dport: u16,
    pub l3_protocol: u16,
    pub l4_protocol: u16,
}

impl Flow {
    /// The same flow seen from the other end.
    pub fn flipped(&self) -> Self {
        Self {
            saddr: self.daddr,
            daddr: self.saddr,
            sport: self.dport,
            dport: self.sport,
            ..*self
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetworkContext {
    pub flow: Flow,
    pub netns: u32,
    pub ifindex: u32,
    pub size: u32,
    pub direction: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MountFields {
    pub mount_id: u32,
    pub parent_mount_id: u32,
    pub device: u32,
    pub _pad: u32,
    pub root_key: PathKey,
    pub mountpoint_key: PathKey,
    pub fstype: [u8; FSTYPE_LEN],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Device {
    pub name: [u8; IFNAMSIZ],
    pub netns: u32,
    pub ifindex: u32,
}

/// Per-cookie activity dump configuration; also the default template.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActivityDumpConfig {
    pub event_mask: u64,
    pub timeout: u64,
    pub wait_list_timestamp: u64,
    pub start_timestamp: u64,
    pub end_timestamp: u64,
    pub events_rate: u32,
    pub paused: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Implemented by every record the emitter can send.
pub trait Event: crate::kernel::Plain {
    fn base_mut(&mut self) -> &mut EventBase;
}

macro_rules! events {
    ($($t:ident),* $(,)?) => {
        $(
            unsafe impl crate::kernel::Plain for $t {}
            impl Event for $t {
                fn base_mut(&mut self) -> &mut EventBase {
                    &mut self.base
                }
            }
        )*
    };
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenEvent {
    pub base: EventBase,
    pub syscall: SyscallContext,
    pub file: File,
    pub flags: u32,
    pub mode: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct MkdirEvent {
    pub base: EventBase,
    pub syscall: SyscallContext,
    pub file: File,
    pub mode: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UnlinkEvent {
    pub base: EventBase,
    pub syscall: SyscallContext,
    pub file: File,
    pub flags: u32,
    pub _pad: u32,
}

/// RMDIR and CHDIR.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct FileEvent {
    pub base: EventBase,
    pub syscall: SyscallContext,
    pub file: File,
}

/// RENAME and LINK.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TwoFileEvent {
    pub base: EventBase,
    pub syscall: SyscallContext,
    pub source: File,
    pub target: File,
}

/// CHMOD, CHOWN and UTIMES.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SetattrEvent {
    pub base: EventBase,
    pub syscall: SyscallContext,
    pub file: File,
    pub mode: u32,
    pub uid: i32,
    pub gid: i32,
    pub _pad: u32,
    pub atime: u64,
    pub mtime: u64,
}

/// SETXATTR and REMOVEXATTR.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct XattrEvent {
    pub base: EventBase,
    pub syscall: SyscallContext,
    pub file: File,
    pub name: [u8; XATTR_NAME_LEN],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct MmapEvent {
    pub base: EventBase,
    pub syscall: SyscallContext,
    pub file: File,
    pub addr: u64,
    pub offset: u64,
    pub len: u64,
    pub protection: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct MprotectEvent {
    pub base: EventBase,
    pub syscall: SyscallContext,
    pub vm_start: u64,
    pub vm_end: u64,
    pub vm_protection: u64,
    pub req_protection: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SpliceEvent {
    pub base: EventBase,
    pub syscall: SyscallContext,
    pub file: File,
    pub pipe_entry_flag: u32,
    pub pipe_exit_flag: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct MountEvent {
    pub base: EventBase,
    pub syscall: SyscallContext,
    pub mount: MountFields,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UmountEvent {
    pub base: EventBase,
    pub syscall: SyscallContext,
    pub mount_id: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct MountReleasedEvent {
    pub base: EventBase,
    pub mount_id: u32,
    pub discarder_revision: u32,
}

/// FORK and EXEC.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ProcessEvent {
    pub base: EventBase,
    pub syscall: SyscallContext,
    pub executable: File,
    pub interpreter: File,
    pub exec_timestamp: u64,
    pub fork_timestamp: u64,
    pub exit_timestamp: u64,
    pub cookie: u64,
    pub ppid: u32,
    pub args_id: u32,
    pub envs_id: u32,
    pub args_truncated: u32,
    pub envs_truncated: u32,
    pub _pad: u32,
    pub credentials: Credentials,
    pub tty_name: [u8; TTY_NAME_LEN],
    pub comm: [u8; TASK_COMM_LEN],
}

pub const EXIT_COREDUMP: u32 = 1 << 31;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ExitEvent {
    pub base: EventBase,
    pub exit_code: u32,
    pub _pad: u32,
}

/// SETUID and SETGID: ids are uid/euid/fsuid or gid/egid/fsgid.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SetidEvent {
    pub base: EventBase,
    pub syscall: SyscallContext,
    pub id: u32,
    pub eid: u32,
    pub fsid: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CapsetEvent {
    pub base: EventBase,
    pub syscall: SyscallContext,
    pub cap_effective: u64,
    pub cap_permitted: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ArgsEnvsEvent {
    pub base: EventBase,
    pub id: u32,
    pub size: u32,
    pub truncated: u32,
    pub _pad: u32,
    pub value: [u8; ARGS_ENVS_BUFFER_LEN],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct BindEvent {
    pub base: EventBase,
    pub syscall: SyscallContext,
    pub addr: [u8; 16],
    pub family: u16,
    pub port: u16,
    pub protocol: u16,
    pub _pad: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DnsEvent {
    pub base: EventBase,
    pub network: NetworkContext,
    pub id: u16,
    pub qdcount: u16,
    pub qtype: u16,
    pub qclass: u16,
    pub name_len: u16,
    pub _pad: [u16; 3],
    /// Wire-format qname: length-prefixed labels ending with a zero label.
    pub name: [u8; DNS_MAX_NAME_LEN],
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DnsResponseEvent {
    pub base: EventBase,
    pub network: NetworkContext,
    pub id: u16,
    pub rcode: u16,
    pub answer_count: u16,
    /// Set when a muted rcode is reported with the header only.
    pub minimal: u16,
    pub suppressed: u32,
    pub payload_len: u32,
    pub payload: [u8; DNS_RESPONSE_PAYLOAD_LEN],
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ImdsEvent {
    pub base: EventBase,
    pub network: NetworkContext,
    pub body_len: u32,
    pub _pad: u32,
    pub body: [u8; IMDS_MAX_LENGTH],
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RawPacketEvent {
    pub base: EventBase,
    pub network: NetworkContext,
    pub len: u32,
    pub _pad: u32,
    pub data: [u8; RAW_PACKET_MAX_LENGTH],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct NetDeviceEvent {
    pub base: EventBase,
    pub syscall: SyscallContext,
    pub device: Device,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct VethPairEvent {
    pub base: EventBase,
    pub syscall: SyscallContext,
    pub host_device: Device,
    pub peer_device: Device,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CgroupTracingEvent {
    pub base: EventBase,
    pub config: ActivityDumpConfig,
    pub cookie: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SyscallDriftEvent {
    pub base: EventBase,
    pub syscalls: [u8; SYSCALL_BITMAP_BYTES],
    pub profile_cookie: u64,
    pub killed: u32,
    pub _pad: u32,
}

plain!(
    KEventHeader,
    ProcessContext,
    SpanContext,
    ContainerContext,
    EventBase,
    SyscallContext,
    FileMetadata,
    File,
    Credentials,
    Flow,
    NetworkContext,
    MountFields,
    Device,
    ActivityDumpConfig,
);

events!(
    OpenEvent,
    MkdirEvent,
    UnlinkEvent,
    FileEvent,
    TwoFileEvent,
    SetattrEvent,
    XattrEvent,
    MmapEvent,
    MprotectEvent,
    SpliceEvent,
    MountEvent,
    UmountEvent,
    MountReleasedEvent,
    ProcessEvent,
    ExitEvent,
    SetidEvent,
    CapsetEvent,
    ArgsEnvsEvent,
    BindEvent,
    DnsEvent,
    DnsResponseEvent,
    ImdsEvent,
    RawPacketEvent,
    NetDeviceEvent,
    VethPairEvent,
    CgroupTracingEvent,
    SyscallDriftEvent,
);

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn header_is_sixteen_bytes() {
        assert_eq!(size_of::<KEventHeader>(), 16);
        assert_eq!(size_of::<EventBase>(), 160);
    }

    #[test]
    fn discardable_types_are_dense() {
        assert_eq!(DISCARDER_EVENT_COUNT, 15);
        assert_eq!(EventType::Open.discarder_index(), Some(0));
        assert_eq!(EventType::Splice.discarder_index(), Some(14));
        assert_eq!(EventType::Exec.discarder_index(), None);
    }

    #[test]
    fn names_round_trip() {
        for t in EventType::all() {
            assert_eq!(EventType::from_name(t.name()), Some(*t));
            assert_eq!(EventType::from_u32(*t as u32), Some(*t));
        }
        assert_eq!(EventType::from_u32(MAX_EVENT_TYPE), None);
    }
}
