//! Decoding of ring buffer records into [`SecurityEvent`]s.

use std::collections::{HashMap, VecDeque};
use std::mem::size_of;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;

use secwatch_common::args::decode_records;
use secwatch_common::consts::{event_flags, file_flags, AF_INET6, ETH_P_IPV6, MAX_SYSCALL_NR};
use secwatch_common::anomaly::bit_is_set;
use secwatch_common::event::*;
use secwatch_common::kernel::{read_plain, Plain};
use secwatch_common::net::dns::qname_to_string;
use secwatch_common::net::packet::Direction;
use secwatch_common::path::PathKey;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record of {len} bytes is shorter than the event header")]
    Truncated { len: usize },

    #[error("unknown event type {0}")]
    UnknownType(u32),

    #[error("{event_type} record of {len} bytes, expected {expected}")]
    ShortRecord {
        event_type: &'static str,
        len: usize,
        expected: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityEvent {
    pub timestamp_ns: u64,
    pub cpu: u16,
    #[serde(rename = "event_flags", skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<&'static str>,
    pub process: ProcessInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<SpanInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retval: Option<i64>,
    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub tid: u32,
    pub netns: u32,
    pub is_kworker: bool,
    pub cookie: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub user_session_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpanInfo {
    pub span_id: u64,
    pub trace_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub cgroup_flags: u64,
    #[serde(serialize_with = "path_key")]
    pub cgroup_file: PathKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    #[serde(serialize_with = "path_key")]
    pub key: PathKey,
    /// Filled in by the path resolver.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub dev: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<&'static str>,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub mode: u16,
    pub ctime: u64,
    pub mtime: u64,
}

impl FileInfo {
    pub fn is_fileless(&self) -> bool {
        self.flags.contains(&"fileless")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialsInfo {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
    pub fsuid: u32,
    pub fsgid: u32,
    pub cap_effective: u64,
    pub cap_permitted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInfo {
    pub saddr: IpAddr,
    pub sport: u16,
    pub daddr: IpAddr,
    pub dport: u16,
    pub l3_protocol: u16,
    pub l4_protocol: u16,
    pub netns: u32,
    pub ifindex: u32,
    pub size: u32,
    pub direction: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub netns: u32,
    pub ifindex: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenInfo {
    pub file: FileInfo,
    pub flags: u32,
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeInfo {
    pub file: FileInfo,
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnlinkInfo {
    pub file: FileInfo,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOnly {
    pub file: FileInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TwoFiles {
    pub source: FileInfo,
    pub target: FileInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChownInfo {
    pub file: FileInfo,
    pub uid: i32,
    pub gid: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UtimesInfo {
    pub file: FileInfo,
    pub atime: u64,
    pub mtime: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct XattrInfo {
    pub file: FileInfo,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MmapInfo {
    pub file: FileInfo,
    pub addr: u64,
    pub offset: u64,
    pub len: u64,
    pub protection: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MprotectInfo {
    pub vm_start: u64,
    pub vm_end: u64,
    pub vm_protection: u64,
    pub req_protection: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpliceInfo {
    pub file: FileInfo,
    pub pipe_entry_flag: u32,
    pub pipe_exit_flag: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountInfo {
    pub mount_id: u32,
    pub parent_mount_id: u32,
    pub device: u32,
    #[serde(serialize_with = "path_key")]
    pub root: PathKey,
    #[serde(serialize_with = "path_key")]
    pub mountpoint: PathKey,
    pub fstype: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UmountInfo {
    pub mount_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountReleasedInfo {
    pub mount_id: u32,
    pub discarder_revision: u32,
}

/// FORK and EXEC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessEventInfo {
    pub executable: FileInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<FileInfo>,
    pub ppid: u32,
    pub cookie: u64,
    pub exec_timestamp: u64,
    pub fork_timestamp: u64,
    pub credentials: CredentialsInfo,
    pub comm: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tty_name: String,
    pub args_id: u32,
    pub envs_id: u32,
    /// Filled in from the ARGS_ENVS records of `args_id`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub envs: Vec<String>,
    pub args_truncated: bool,
    pub envs_truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub exit_code: u32,
    pub signal: u32,
    pub coredump: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetidInfo {
    pub id: u32,
    pub eid: u32,
    pub fsid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapsetInfo {
    pub cap_effective: u64,
    pub cap_permitted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArgsEnvsInfo {
    pub id: u32,
    pub truncated: bool,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindInfo {
    pub addr: IpAddr,
    pub family: u16,
    pub port: u16,
    pub protocol: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsInfo {
    pub network: NetworkInfo,
    pub id: u16,
    pub qdcount: u16,
    pub qtype: u16,
    pub qclass: u16,
    pub qname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsResponseInfo {
    pub network: NetworkInfo,
    pub id: u16,
    pub rcode: u16,
    pub answer_count: u16,
    pub minimal: bool,
    pub suppressed: u32,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImdsInfo {
    pub network: NetworkInfo,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawPacketInfo {
    pub network: NetworkInfo,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetDeviceInfo {
    pub device: DeviceInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VethPairInfo {
    pub host_device: DeviceInfo,
    pub peer_device: DeviceInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CgroupTracingInfo {
    pub cookie: u64,
    pub event_types: Vec<&'static str>,
    pub start_timestamp: u64,
    pub end_timestamp: u64,
    pub events_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyscallDriftInfo {
    pub syscalls: Vec<u32>,
    pub profile_cookie: u64,
    pub killed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Open(OpenInfo),
    Mkdir(ModeInfo),
    Link(TwoFiles),
    Rename(TwoFiles),
    Unlink(UnlinkInfo),
    Rmdir(FileOnly),
    Chmod(ModeInfo),
    Chown(ChownInfo),
    Utimes(UtimesInfo),
    #[serde(rename = "setxattr")]
    SetXattr(XattrInfo),
    #[serde(rename = "removexattr")]
    RemoveXattr(XattrInfo),
    Chdir(FileOnly),
    Mmap(MmapInfo),
    Mprotect(MprotectInfo),
    Splice(SpliceInfo),
    Mount(MountInfo),
    Umount(UmountInfo),
    MountReleased(MountReleasedInfo),
    Fork(ProcessEventInfo),
    Exec(ProcessEventInfo),
    Exit(ExitInfo),
    #[serde(rename = "setuid")]
    SetUid(SetidInfo),
    #[serde(rename = "setgid")]
    SetGid(SetidInfo),
    Capset(CapsetInfo),
    ArgsEnvs(ArgsEnvsInfo),
    Bind(BindInfo),
    Dns(DnsInfo),
    DnsResponse(DnsResponseInfo),
    Imds(ImdsInfo),
    RawPacket(RawPacketInfo),
    NetDevice(NetDeviceInfo),
    VethPair(VethPairInfo),
    CgroupTracing(CgroupTracingInfo),
    SyscallDrift(SyscallDriftInfo),
}

impl SecurityEvent {
    pub fn event_type(&self) -> EventType {
        match &self.payload {
            Payload::Open(_) => EventType::Open,
            Payload::Mkdir(_) => EventType::Mkdir,
            Payload::Link(_) => EventType::Link,
            Payload::Rename(_) => EventType::Rename,
            Payload::Unlink(_) => EventType::Unlink,
            Payload::Rmdir(_) => EventType::Rmdir,
            Payload::Chmod(_) => EventType::Chmod,
            Payload::Chown(_) => EventType::Chown,
            Payload::Utimes(_) => EventType::Utimes,
            Payload::SetXattr(_) => EventType::SetXattr,
            Payload::RemoveXattr(_) => EventType::RemoveXattr,
            Payload::Chdir(_) => EventType::Chdir,
            Payload::Mmap(_) => EventType::Mmap,
            Payload::Mprotect(_) => EventType::Mprotect,
            Payload::Splice(_) => EventType::Splice,
            Payload::Mount(_) => EventType::Mount,
            Payload::Umount(_) => EventType::Umount,
            Payload::MountReleased(_) => EventType::MountReleased,
            Payload::Fork(_) => EventType::Fork,
            Payload::Exec(_) => EventType::Exec,
            Payload::Exit(_) => EventType::Exit,
            Payload::SetUid(_) => EventType::SetUid,
            Payload::SetGid(_) => EventType::SetGid,
            Payload::Capset(_) => EventType::Capset,
            Payload::ArgsEnvs(_) => EventType::ArgsEnvs,
            Payload::Bind(_) => EventType::Bind,
            Payload::Dns(_) => EventType::Dns,
            Payload::DnsResponse(_) => EventType::DnsResponse,
            Payload::Imds(_) => EventType::Imds,
            Payload::RawPacket(_) => EventType::RawPacket,
            Payload::NetDevice(_) => EventType::NetDevice,
            Payload::VethPair(_) => EventType::VethPair,
            Payload::CgroupTracing(_) => EventType::CgroupTracing,
            Payload::SyscallDrift(_) => EventType::SyscallDrift,
        }
    }

    /// Every file the event carries.
    pub fn files_mut(&mut self) -> Vec<&mut FileInfo> {
        match &mut self.payload {
            Payload::Open(p) => vec![&mut p.file],
            Payload::Mkdir(p) | Payload::Chmod(p) => vec![&mut p.file],
            Payload::Unlink(p) => vec![&mut p.file],
            Payload::Rmdir(p) | Payload::Chdir(p) => vec![&mut p.file],
            Payload::Link(p) | Payload::Rename(p) => vec![&mut p.source, &mut p.target],
            Payload::Chown(p) => vec![&mut p.file],
            Payload::Utimes(p) => vec![&mut p.file],
            Payload::SetXattr(p) | Payload::RemoveXattr(p) => vec![&mut p.file],
            Payload::Mmap(p) => vec![&mut p.file],
            Payload::Splice(p) => vec![&mut p.file],
            Payload::Fork(p) | Payload::Exec(p) => {
                let mut files = vec![&mut p.executable];
                if let Some(interpreter) = p.interpreter.as_mut() {
                    files.push(interpreter);
                }
                files
            }
            _ => Vec::new(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn path_key<S: Serializer>(key: &PathKey, s: S) -> Result<S::Ok, S::Error> {
    let mut st = s.serialize_struct("PathKey", 3)?;
    st.serialize_field("ino", &key.ino)?;
    st.serialize_field("mount_id", &key.mount_id)?;
    st.serialize_field("path_id", &key.path_id)?;
    st.end()
}

fn record<T: Plain>(buf: &[u8], t: EventType) -> Result<T, DecodeError> {
    read_plain(buf).ok_or(DecodeError::ShortRecord {
        event_type: t.name(),
        len: buf.len(),
        expected: size_of::<T>(),
    })
}

fn cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn header_flags(flags: u16) -> Vec<&'static str> {
    [
        (event_flags::ASYNC, "async"),
        (event_flags::SAVED_BY_AD, "saved_by_activity_dump"),
        (event_flags::ACTIVITY_DUMP_SAMPLE, "activity_dump_sample"),
        (event_flags::ANOMALY_DETECTION_EVENT, "anomaly_detection"),
    ]
    .into_iter()
    .filter(|(bit, _)| flags & bit != 0)
    .map(|(_, name)| name)
    .collect()
}

fn file(f: &File) -> FileInfo {
    let flags = [
        (file_flags::UPPER_LAYER, "upper_layer"),
        (file_flags::LOWER_LAYER, "lower_layer"),
        (file_flags::PATH_ID_INVALIDATED, "path_id_invalidated"),
        (file_flags::FILELESS, "fileless"),
    ]
    .into_iter()
    .filter(|(bit, _)| f.flags & bit != 0)
    .map(|(_, name)| name)
    .collect();
    FileInfo {
        key: f.path_key,
        path: None,
        dev: f.dev,
        flags,
        uid: f.metadata.uid,
        gid: f.metadata.gid,
        nlink: f.metadata.nlink,
        mode: f.metadata.mode,
        ctime: f.metadata.ctime,
        mtime: f.metadata.mtime,
    }
}

fn ip(addr: &[u8; 16], v6: bool) -> IpAddr {
    if v6 {
        IpAddr::V6(Ipv6Addr::from(*addr))
    } else {
        IpAddr::V4(Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]))
    }
}

fn network(n: &NetworkContext) -> NetworkInfo {
    let v6 = n.flow.l3_protocol == ETH_P_IPV6;
    NetworkInfo {
        saddr: ip(&n.flow.saddr, v6),
        sport: n.flow.sport,
        daddr: ip(&n.flow.daddr, v6),
        dport: n.flow.dport,
        l3_protocol: n.flow.l3_protocol,
        l4_protocol: n.flow.l4_protocol,
        netns: n.netns,
        ifindex: n.ifindex,
        size: n.size,
        direction: match Direction::from_u32(n.direction) {
            Some(Direction::Ingress) => "ingress",
            Some(Direction::Egress) => "egress",
            None => "unknown",
        },
    }
}

fn device(d: &Device) -> DeviceInfo {
    DeviceInfo {
        name: cstr(&d.name),
        netns: d.netns,
        ifindex: d.ifindex,
    }
}

fn process_event(ev: &ProcessEvent) -> ProcessEventInfo {
    let c = &ev.credentials;
    ProcessEventInfo {
        executable: file(&ev.executable),
        interpreter: (ev.interpreter.path_key.ino != 0).then(|| file(&ev.interpreter)),
        ppid: ev.ppid,
        cookie: ev.cookie,
        exec_timestamp: ev.exec_timestamp,
        fork_timestamp: ev.fork_timestamp,
        credentials: CredentialsInfo {
            uid: c.uid,
            gid: c.gid,
            euid: c.euid,
            egid: c.egid,
            fsuid: c.fsuid,
            fsgid: c.fsgid,
            cap_effective: c.cap_effective,
            cap_permitted: c.cap_permitted,
        },
        comm: cstr(&ev.comm),
        tty_name: cstr(&ev.tty_name),
        args_id: ev.args_id,
        envs_id: ev.envs_id,
        args: Vec::new(),
        envs: Vec::new(),
        args_truncated: ev.args_truncated != 0,
        envs_truncated: ev.envs_truncated != 0,
    }
}

/// Decodes one record.
pub fn decode(buf: &[u8]) -> Result<SecurityEvent, DecodeError> {
    let header: KEventHeader = read_plain(buf).ok_or(DecodeError::Truncated { len: buf.len() })?;
    let t = EventType::from_u32(header.event_type)
        .filter(|t| *t != EventType::Any)
        .ok_or(DecodeError::UnknownType(header.event_type))?;
    let base: EventBase = record(buf, t)?;

    let mut retval = None;
    let mut syscall = |s: &SyscallContext| retval = Some(s.retval);

    let payload = match t {
        EventType::Open => {
            let ev: OpenEvent = record(buf, t)?;
            syscall(&ev.syscall);
            Payload::Open(OpenInfo {
                file: file(&ev.file),
                flags: ev.flags,
                mode: ev.mode,
            })
        }
        EventType::Mkdir => {
            let ev: MkdirEvent = record(buf, t)?;
            syscall(&ev.syscall);
            Payload::Mkdir(ModeInfo {
                file: file(&ev.file),
                mode: ev.mode,
            })
        }
        EventType::Unlink => {
            let ev: UnlinkEvent = record(buf, t)?;
            syscall(&ev.syscall);
            Payload::Unlink(UnlinkInfo {
                file: file(&ev.file),
                flags: ev.flags,
            })
        }
        EventType::Rmdir | EventType::Chdir => {
            let ev: FileEvent = record(buf, t)?;
            syscall(&ev.syscall);
            let p = FileOnly { file: file(&ev.file) };
            if t == EventType::Rmdir {
                Payload::Rmdir(p)
            } else {
                Payload::Chdir(p)
            }
        }
        EventType::Link | EventType::Rename => {
            let ev: TwoFileEvent = record(buf, t)?;
            syscall(&ev.syscall);
            let p = TwoFiles {
                source: file(&ev.source),
                target: file(&ev.target),
            };
            if t == EventType::Link {
                Payload::Link(p)
            } else {
                Payload::Rename(p)
            }
        }
        EventType::Chmod | EventType::Chown | EventType::Utimes => {
            let ev: SetattrEvent = record(buf, t)?;
            syscall(&ev.syscall);
            let f = file(&ev.file);
            match t {
                EventType::Chmod => Payload::Chmod(ModeInfo { file: f, mode: ev.mode }),
                EventType::Chown => Payload::Chown(ChownInfo {
                    file: f,
                    uid: ev.uid,
                    gid: ev.gid,
                }),
                _ => Payload::Utimes(UtimesInfo {
                    file: f,
                    atime: ev.atime,
                    mtime: ev.mtime,
                }),
            }
        }
        EventType::SetXattr | EventType::RemoveXattr => {
            let ev: XattrEvent = record(buf, t)?;
            syscall(&ev.syscall);
            let p = XattrInfo {
                file: file(&ev.file),
                name: cstr(&ev.name),
            };
            if t == EventType::SetXattr {
                Payload::SetXattr(p)
            } else {
                Payload::RemoveXattr(p)
            }
        }
        EventType::Mmap => {
            let ev: MmapEvent = record(buf, t)?;
            syscall(&ev.syscall);
            Payload::Mmap(MmapInfo {
                file: file(&ev.file),
                addr: ev.addr,
                offset: ev.offset,
                len: ev.len,
                protection: ev.protection,
                flags: ev.flags,
            })
        }
        EventType::Mprotect => {
            let ev: MprotectEvent = record(buf, t)?;
            syscall(&ev.syscall);
            Payload::Mprotect(MprotectInfo {
                vm_start: ev.vm_start,
                vm_end: ev.vm_end,
                vm_protection: ev.vm_protection,
                req_protection: ev.req_protection,
            })
        }
        EventType::Splice => {
            let ev: SpliceEvent = record(buf, t)?;
            syscall(&ev.syscall);
            Payload::Splice(SpliceInfo {
                file: file(&ev.file),
                pipe_entry_flag: ev.pipe_entry_flag,
                pipe_exit_flag: ev.pipe_exit_flag,
            })
        }
        EventType::Mount => {
            let ev: MountEvent = record(buf, t)?;
            syscall(&ev.syscall);
            let m = &ev.mount;
            Payload::Mount(MountInfo {
                mount_id: m.mount_id,
                parent_mount_id: m.parent_mount_id,
                device: m.device,
                root: m.root_key,
                mountpoint: m.mountpoint_key,
                fstype: cstr(&m.fstype),
            })
        }
        EventType::Umount => {
            let ev: UmountEvent = record(buf, t)?;
            syscall(&ev.syscall);
            Payload::Umount(UmountInfo { mount_id: ev.mount_id })
        }
        EventType::MountReleased => {
            let ev: MountReleasedEvent = record(buf, t)?;
            Payload::MountReleased(MountReleasedInfo {
                mount_id: ev.mount_id,
                discarder_revision: ev.discarder_revision,
            })
        }
        EventType::Fork | EventType::Exec => {
            let ev: ProcessEvent = record(buf, t)?;
            syscall(&ev.syscall);
            let p = process_event(&ev);
            if t == EventType::Fork {
                Payload::Fork(p)
            } else {
                Payload::Exec(p)
            }
        }
        EventType::Exit => {
            let ev: ExitEvent = record(buf, t)?;
            Payload::Exit(ExitInfo {
                exit_code: (ev.exit_code >> 8) & 0xff,
                signal: ev.exit_code & 0x7f,
                coredump: ev.exit_code & EXIT_COREDUMP != 0,
            })
        }
        EventType::SetUid | EventType::SetGid => {
            let ev: SetidEvent = record(buf, t)?;
            syscall(&ev.syscall);
            let p = SetidInfo {
                id: ev.id,
                eid: ev.eid,
                fsid: ev.fsid,
            };
            if t == EventType::SetUid {
                Payload::SetUid(p)
            } else {
                Payload::SetGid(p)
            }
        }
        EventType::Capset => {
            let ev: CapsetEvent = record(buf, t)?;
            syscall(&ev.syscall);
            Payload::Capset(CapsetInfo {
                cap_effective: ev.cap_effective,
                cap_permitted: ev.cap_permitted,
            })
        }
        EventType::ArgsEnvs => {
            let ev: ArgsEnvsEvent = record(buf, t)?;
            let len = (ev.size as usize).min(ev.value.len());
            Payload::ArgsEnvs(ArgsEnvsInfo {
                id: ev.id,
                truncated: ev.truncated != 0,
                values: decode_records(&ev.value[..len])
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .collect(),
            })
        }
        EventType::Bind => {
            let ev: BindEvent = record(buf, t)?;
            syscall(&ev.syscall);
            Payload::Bind(BindInfo {
                addr: ip(&ev.addr, ev.family == AF_INET6),
                family: ev.family,
                port: ev.port,
                protocol: ev.protocol,
            })
        }
        EventType::Dns => {
            let ev: DnsEvent = record(buf, t)?;
            let len = (ev.name_len as usize).min(ev.name.len());
            Payload::Dns(DnsInfo {
                network: network(&ev.network),
                id: ev.id,
                qdcount: ev.qdcount,
                qtype: ev.qtype,
                qclass: ev.qclass,
                qname: qname_to_string(&ev.name[..len]),
            })
        }
        EventType::DnsResponse => {
            let ev: DnsResponseEvent = record(buf, t)?;
            let len = (ev.payload_len as usize).min(ev.payload.len());
            Payload::DnsResponse(DnsResponseInfo {
                network: network(&ev.network),
                id: ev.id,
                rcode: ev.rcode,
                answer_count: ev.answer_count,
                minimal: ev.minimal != 0,
                suppressed: ev.suppressed,
                payload: hex::encode(&ev.payload[..len]),
            })
        }
        EventType::Imds => {
            let ev: ImdsEvent = record(buf, t)?;
            let len = (ev.body_len as usize).min(ev.body.len());
            Payload::Imds(ImdsInfo {
                network: network(&ev.network),
                body: String::from_utf8_lossy(&ev.body[..len]).into_owned(),
            })
        }
        EventType::RawPacket => {
            let ev: RawPacketEvent = record(buf, t)?;
            let len = (ev.len as usize).min(ev.data.len());
            Payload::RawPacket(RawPacketInfo {
                network: network(&ev.network),
                data: hex::encode(&ev.data[..len]),
            })
        }
        EventType::NetDevice => {
            let ev: NetDeviceEvent = record(buf, t)?;
            syscall(&ev.syscall);
            Payload::NetDevice(NetDeviceInfo {
                device: device(&ev.device),
            })
        }
        EventType::VethPair => {
            let ev: VethPairEvent = record(buf, t)?;
            syscall(&ev.syscall);
            Payload::VethPair(VethPairInfo {
                host_device: device(&ev.host_device),
                peer_device: device(&ev.peer_device),
            })
        }
        EventType::CgroupTracing => {
            let ev: CgroupTracingEvent = record(buf, t)?;
            Payload::CgroupTracing(CgroupTracingInfo {
                cookie: ev.cookie,
                event_types: EventType::all()
                    .iter()
                    .filter(|t| ev.config.event_mask & t.mask() != 0)
                    .map(|t| t.name())
                    .collect(),
                start_timestamp: ev.config.start_timestamp,
                end_timestamp: ev.config.end_timestamp,
                events_rate: ev.config.events_rate,
            })
        }
        EventType::SyscallDrift => {
            let ev: SyscallDriftEvent = record(buf, t)?;
            Payload::SyscallDrift(SyscallDriftInfo {
                syscalls: (0..MAX_SYSCALL_NR)
                    .filter(|nr| bit_is_set(&ev.syscalls, *nr))
                    .collect(),
                profile_cookie: ev.profile_cookie,
                killed: ev.killed != 0,
            })
        }
        EventType::Any => return Err(DecodeError::UnknownType(header.event_type)),
    };

    let p = &base.process;
    let span = &base.span;
    let c = &base.container;
    Ok(SecurityEvent {
        timestamp_ns: header.timestamp_ns,
        cpu: header.cpu,
        flags: header_flags(header.flags),
        process: ProcessInfo {
            pid: p.pid,
            tid: p.tid,
            netns: p.netns,
            is_kworker: p.is_kworker != 0,
            cookie: p.cookie,
            user_session_id: p.user_session_id,
        },
        span: (span.span_id != 0).then(|| {
            let mut trace_id = [0u8; 16];
            trace_id[..8].copy_from_slice(&span.trace_id[1].to_be_bytes());
            trace_id[8..].copy_from_slice(&span.trace_id[0].to_be_bytes());
            SpanInfo {
                span_id: span.span_id,
                trace_id: hex::encode(trace_id),
            }
        }),
        container: (!c.is_empty()).then(|| ContainerInfo {
            id: cstr(&c.container_id),
            cgroup_flags: c.cgroup_flags,
            cgroup_file: c.cgroup_file,
        }),
        retval,
        payload,
    })
}

/// Joins ARGS_ENVS records into the EXEC event that references them.
///
/// The records of an exec are sent before the exec itself; the joiner keeps
/// the last `capacity` streams it has not matched yet.
pub struct ArgsEnvsJoiner {
    pending: HashMap<u32, (Vec<String>, bool)>,
    order: VecDeque<u32>,
    capacity: usize,
}

impl ArgsEnvsJoiner {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Buffers an ARGS_ENVS event. Returns false for any other type.
    pub fn absorb(&mut self, event: &SecurityEvent) -> bool {
        let Payload::ArgsEnvs(chunk) = &event.payload else {
            return false;
        };
        if !self.pending.contains_key(&chunk.id) {
            if self.order.len() == self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.pending.remove(&oldest);
                }
            }
            self.order.push_back(chunk.id);
        }
        let entry = self.pending.entry(chunk.id).or_default();
        entry.0.extend(chunk.values.iter().cloned());
        entry.1 |= chunk.truncated;
        true
    }

    /// Moves the buffered strings of an EXEC into it.
    pub fn complete(&mut self, event: &mut SecurityEvent) {
        let Payload::Exec(exec) = &mut event.payload else {
            return;
        };
        if let Some((args, truncated)) = self.take(exec.args_id) {
            exec.args = args;
            exec.args_truncated |= truncated;
        }
        if let Some((envs, truncated)) = self.take(exec.envs_id) {
            exec.envs = envs;
            exec.envs_truncated |= truncated;
        }
    }

    fn take(&mut self, id: u32) -> Option<(Vec<String>, bool)> {
        let taken = self.pending.remove(&id)?;
        self.order.retain(|pending| *pending != id);
        Some(taken)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secwatch_common::consts::ETH_P_IP;
    use secwatch_common::kernel::{bytes_of, zeroed};
    use secwatch_common::net::dns::encode_qname;

    fn base(t: EventType, flags: u16) -> EventBase {
        let mut base = EventBase::default();
        base.header = KEventHeader {
            timestamp_ns: 42,
            event_type: t as u32,
            cpu: 3,
            flags,
        };
        base.process.pid = 100;
        base.process.tid = 101;
        base
    }

    #[test]
    fn open_decodes_file_and_retval() {
        let mut ev = OpenEvent::default();
        ev.base = base(EventType::Open, event_flags::ACTIVITY_DUMP_SAMPLE);
        ev.syscall.retval = 3;
        ev.file.path_key = PathKey::new(20, 7, 1);
        ev.file.flags = file_flags::UPPER_LAYER;
        ev.flags = 0o100;

        let decoded = decode(bytes_of(&ev)).unwrap();
        assert_eq!(decoded.event_type(), EventType::Open);
        assert_eq!(decoded.retval, Some(3));
        assert_eq!(decoded.flags, vec!["activity_dump_sample"]);
        assert_eq!(decoded.process.pid, 100);
        assert!(decoded.container.is_none());
        let Payload::Open(open) = &decoded.payload else {
            panic!("not an open");
        };
        assert_eq!(open.file.key, PathKey::new(20, 7, 1));
        assert_eq!(open.file.flags, vec!["upper_layer"]);
        assert_eq!(open.flags, 0o100);
    }

    #[test]
    fn json_is_flat_and_tagged() {
        let mut ev = ExitEvent::default();
        ev.base = base(EventType::Exit, 0);
        ev.exit_code = 2 << 8;
        let json: serde_json::Value = serde_json::from_str(&decode(bytes_of(&ev)).unwrap().to_json()).unwrap();
        assert_eq!(json["type"], "exit");
        assert_eq!(json["exit_code"], 2);
        assert_eq!(json["process"]["pid"], 100);
        assert!(json.get("retval").is_none());
    }

    #[test]
    fn short_and_unknown_records_are_errors() {
        let mut ev = OpenEvent::default();
        ev.base = base(EventType::Open, 0);
        let bytes = bytes_of(&ev);
        assert_eq!(decode(&bytes[..8]), Err(DecodeError::Truncated { len: 8 }));
        assert!(matches!(
            decode(&bytes[..200]),
            Err(DecodeError::ShortRecord { event_type: "open", len: 200, .. })
        ));

        let mut bogus = KEventHeader::default();
        bogus.event_type = 999;
        let mut buf = bytes_of(&ev).to_vec();
        buf[..16].copy_from_slice(bytes_of(&bogus));
        assert_eq!(decode(&buf), Err(DecodeError::UnknownType(999)));
    }

    #[test]
    fn dns_names_are_dotted() {
        let mut ev: DnsEvent = zeroed();
        ev.base = base(EventType::Dns, 0);
        ev.network.flow.l3_protocol = ETH_P_IP;
        ev.network.flow.saddr[..4].copy_from_slice(&[10, 0, 0, 2]);
        ev.network.direction = Direction::Egress as u32;
        let name = encode_qname("example.com");
        ev.name[..name.len()].copy_from_slice(&name);
        ev.name_len = name.len() as u16;
        ev.qtype = 1;
        ev.qclass = 1;

        let Payload::Dns(dns) = decode(bytes_of(&ev)).unwrap().payload else {
            panic!("not a dns event");
        };
        assert_eq!(dns.qname, "example.com");
        assert_eq!(dns.network.saddr, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(dns.network.direction, "egress");
    }

    #[test]
    fn drift_lists_syscall_numbers() {
        let mut ev: SyscallDriftEvent = zeroed();
        ev.base = base(EventType::SyscallDrift, event_flags::ANOMALY_DETECTION_EVENT);
        ev.syscalls[0] = 0b0000_0101;
        ev.syscalls[7] = 0b1000_0000;
        ev.killed = 1;
        let Payload::SyscallDrift(drift) = decode(bytes_of(&ev)).unwrap().payload else {
            panic!("not a drift event");
        };
        assert_eq!(drift.syscalls, vec![0, 2, 63]);
        assert!(drift.killed);
    }

    fn args_chunk(id: u32, values: &[&str]) -> SecurityEvent {
        let mut ev: ArgsEnvsEvent = zeroed();
        ev.base = base(EventType::ArgsEnvs, 0);
        ev.id = id;
        let mut at = 0;
        for v in values {
            ev.value[at..at + 4].copy_from_slice(&(v.len() as u32).to_ne_bytes());
            ev.value[at + 4..at + 4 + v.len()].copy_from_slice(v.as_bytes());
            at += 4 + v.len();
        }
        ev.size = at as u32;
        decode(bytes_of(&ev)).unwrap()
    }

    #[test]
    fn exec_picks_up_its_args() {
        let mut joiner = ArgsEnvsJoiner::new(8);
        assert!(joiner.absorb(&args_chunk(5, &["ls", "-l"])));
        assert!(joiner.absorb(&args_chunk(5, &["/tmp"])));
        assert!(joiner.absorb(&args_chunk(6, &["HOME=/root"])));

        let mut ev: ProcessEvent = zeroed();
        ev.base = base(EventType::Exec, 0);
        ev.args_id = 5;
        ev.envs_id = 6;
        let mut exec = decode(bytes_of(&ev)).unwrap();
        assert!(!joiner.absorb(&exec));
        joiner.complete(&mut exec);

        let Payload::Exec(p) = &exec.payload else {
            panic!("not an exec");
        };
        assert_eq!(p.args, vec!["ls", "-l", "/tmp"]);
        assert_eq!(p.envs, vec!["HOME=/root"]);
        assert!(joiner.is_empty());
    }

    #[test]
    fn joiner_forgets_the_oldest_stream() {
        let mut joiner = ArgsEnvsJoiner::new(2);
        joiner.absorb(&args_chunk(1, &["a"]));
        joiner.absorb(&args_chunk(2, &["b"]));
        joiner.absorb(&args_chunk(3, &["c"]));
        assert_eq!(joiner.len(), 2);
        assert!(joiner.take(1).is_none());
        assert!(joiner.take(3).is_some());
    }
}
