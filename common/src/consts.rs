//! Limits, magic values and the runtime-constant table.

/// ioctl cmd value that turns an ioctl into an eRPC request.
pub const RPC_CMD: u64 = 0xdead_c001;

pub const TASK_COMM_LEN: usize = 16;
pub const TTY_NAME_LEN: usize = 64;
pub const CONTAINER_ID_LEN: usize = 64;
pub const FSTYPE_LEN: usize = 16;
pub const IFNAMSIZ: usize = 16;
pub const XATTR_NAME_LEN: usize = 200;

/// Segment names are at most 255 bytes plus the terminator.
pub const MAX_SEGMENT_LENGTH: usize = 255;
pub const SEGMENT_BUFFER_LEN: usize = MAX_SEGMENT_LENGTH + 1;
pub const BASENAME_FILTER_SIZE: usize = 256;

/// Segments walked per resolver invocation.
pub const DR_MAX_ITERATION_DEPTH: u32 = 47;
/// Resolver invocations chained by tail call.
pub const DR_MAX_TAIL_CALL: u32 = 29;
/// Depths at which the resolver looks for inode discarders.
pub const DR_DISCARDER_DEPTH: u32 = 3;
pub const DR_MAX_SEGMENTS: u32 = DR_MAX_ITERATION_DEPTH * DR_MAX_TAIL_CALL;

/// Size of one key chunk in the eRPC read-out stream: path key plus challenge.
pub const DR_ERPC_KEY_CHUNK: usize = 20;
pub const ERPC_MMAP_BUFFER_LEN: usize = 8192;
pub const ERPC_REQUEST_LEN: usize = 128;

pub const MOUNT_REVISION_SLOTS: u32 = 4096;
pub const DEFAULT_DISCARDER_RETENTION_NS: u64 = 5_000_000_000;

pub const MAX_ARGS_ENVS_TAIL_CALLS: u32 = 16;
pub const ARGS_PER_TAIL_CALL: u32 = 28;
pub const MAX_ARGS_ELEMENTS: u32 = MAX_ARGS_ENVS_TAIL_CALLS * ARGS_PER_TAIL_CALL;
pub const ARGS_ENVS_BUFFER_LEN: usize = 256;
pub const MAX_ARG_SIZE: usize = 128;

pub const SPAN_TLS_FORMAT_DEFAULT: u64 = 0;

pub const MAX_NAT_HOPS: u32 = 10;
pub const DNS_PORT: u16 = 53;
pub const DNS_HEADER_LEN: u32 = 12;
pub const DNS_MAX_NAME_LEN: usize = 256;
pub const DNS_MAX_QUESTIONS: u16 = 8;
pub const DNS_RESPONSE_PAYLOAD_LEN: usize = 512;
pub const DNS_RESPONSE_DEDUP_WINDOW_NS: u64 = 1_000_000_000;
/// 169.254.169.254 as it appears on the wire.
pub const IMDS_IPV4: [u8; 4] = [169, 254, 169, 254];
pub const IMDS_MAX_LENGTH: usize = 4096;
pub const RAW_PACKET_MAX_LENGTH: usize = 256;

pub const SYSCALL_BITMAP_BYTES: usize = 64;
pub const MAX_SYSCALL_NR: u32 = (SYSCALL_BITMAP_BYTES * 8) as u32;

pub const RATE_LIMITER_PERIOD_NS: u64 = 1_000_000_000;
pub const RATE_LIMITER_HALF_PERIOD_NS: u64 = 500_000_000;

pub const PF_KTHREAD: u32 = 0x0020_0000;
pub const OVERLAYFS_SUPER_MAGIC: u64 = 0x794c_7630;
pub const TMPFS_MAGIC: u64 = 0x0102_1994;
pub const S_IFMT: u16 = 0o170000;
pub const S_IFSOCK: u16 = 0o140000;

pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;
pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86dd;
pub const IPPROTO_ICMP: u16 = 1;
pub const IPPROTO_TCP: u16 = 6;
pub const IPPROTO_UDP: u16 = 17;
pub const IPPROTO_ICMPV6: u16 = 58;

pub const O_ACCMODE: u64 = 0o3;
/// Approver bit standing in for O_RDONLY, whose value is zero.
pub const APPROVE_O_RDONLY: u64 = 1 << 31;

pub const SIGKILL: u32 = 9;
pub const EACCES: i64 = 13;
pub const EPERM: i64 = 1;

/// Index into the `constants` array map.
///
/// The loader writes every entry before attaching. Offsets are byte offsets
/// from the start of the named kernel structure; entries marked relative may
/// be negative and are stored two's-complement.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeConst {
    RuntimePid = 0,
    SystemProbePid,
    DiscarderRetention,
    SendSignalAvailable,
    ErpcUseMmap,
    OverlayVariant,
    SyscallDriftPeriod,
    RawPacketEnabled,
    CurrentPidInClassifier,

    DentryParent,
    DentryNamePtr,
    DentryInode,
    DentrySb,
    InodeMode,
    InodeUid,
    InodeGid,
    InodeSb,
    InodeIno,
    InodeNlink,
    InodeCtime,
    InodeMtime,
    SbDev,
    SbMagic,
    SbType,
    OvlUpperDentry,
    OvlLowerInode,
    OvlEntry,
    OvlEntryLowerDentry,
    FilePathMnt,
    FilePathDentry,
    FileInode,
    FileFlags,
    VfsmountRoot,
    VfsmountSb,
    /// Relative to the embedded vfsmount.
    MountId,
    /// Relative to the embedded vfsmount.
    MountParent,
    /// Relative to the embedded vfsmount.
    MountMountpoint,
    TaskPid,
    TaskTgid,
    TaskFlags,
    TaskRealParent,
    TaskCred,
    TaskMm,
    TaskSignal,
    TaskNsproxy,
    SignalTty,
    TtyName,
    MmArgStart,
    MmArgEnd,
    MmEnvStart,
    MmEnvEnd,
    NsproxyNet,
    NetNsInum,
    CredUid,
    CredGid,
    CredEuid,
    CredEgid,
    CredFsuid,
    CredFsgid,
    CredCapPermitted,
    CredCapEffective,
    VmaStart,
    VmaEnd,
    VmaFlags,
    BprmFile,
    PipeBufs,
    PipeBufFlags,
    SocketSk,
    SocketAllocInode,
    SockDaddr,
    SockRcvSaddr,
    SockDport,
    SockNum,
    SockFamily,
    SockNet,
    SockV6Daddr,
    SockV6RcvSaddr,
    SockProtocol,
    FlowiSaddr4,
    FlowiSport4,
    FlowiSaddr6,
    FlowiSport6,
    NetDeviceName,
    NetDeviceIfindex,
    NetDeviceNet,
    NfConnTuples,
    NfConnNet,
    KernfsOfKn,
    KernfsNodeParent,
    KernfsNodeName,
    KernfsNodeId,
    CgroupKn,
    CgroupDentry,
    IoKiocbTask,
    /// Argument index of the dentry in `security_inode_setattr` and the
    /// `vfs_*xattr` functions: 1 once they take an idmap first.
    IdmapDentryArg,
}

/// Number of slots in the `constants` array map.
pub const RUNTIME_CONST_COUNT: u32 = RuntimeConst::IdmapDentryArg as u32 + 1;

const ALL_RUNTIME_CONSTS: [RuntimeConst; RUNTIME_CONST_COUNT as usize] = [
    RuntimeConst::RuntimePid,
    RuntimeConst::SystemProbePid,
    RuntimeConst::DiscarderRetention,
    RuntimeConst::SendSignalAvailable,
    RuntimeConst::ErpcUseMmap,
    RuntimeConst::OverlayVariant,
    RuntimeConst::SyscallDriftPeriod,
    RuntimeConst::RawPacketEnabled,
    RuntimeConst::CurrentPidInClassifier,
    RuntimeConst::DentryParent,
    RuntimeConst::DentryNamePtr,
    RuntimeConst::DentryInode,
    RuntimeConst::DentrySb,
    RuntimeConst::InodeMode,
    RuntimeConst::InodeUid,
    RuntimeConst::InodeGid,
    RuntimeConst::InodeSb,
    RuntimeConst::InodeIno,
    RuntimeConst::InodeNlink,
    RuntimeConst::InodeCtime,
    RuntimeConst::InodeMtime,
    RuntimeConst::SbDev,
    RuntimeConst::SbMagic,
    RuntimeConst::SbType,
    RuntimeConst::OvlUpperDentry,
    RuntimeConst::OvlLowerInode,
    RuntimeConst::OvlEntry,
    RuntimeConst::OvlEntryLowerDentry,
    RuntimeConst::FilePathMnt,
    RuntimeConst::FilePathDentry,
    RuntimeConst::FileInode,
    RuntimeConst::FileFlags,
    RuntimeConst::VfsmountRoot,
    RuntimeConst::VfsmountSb,
    RuntimeConst::MountId,
    RuntimeConst::MountParent,
    RuntimeConst::MountMountpoint,
    RuntimeConst::TaskPid,
    RuntimeConst::TaskTgid,
    RuntimeConst::TaskFlags,
    RuntimeConst::TaskRealParent,
    RuntimeConst::TaskCred,
    RuntimeConst::TaskMm,
    RuntimeConst::TaskSignal,
    RuntimeConst::TaskNsproxy,
    RuntimeConst::SignalTty,
    RuntimeConst::TtyName,
    RuntimeConst::MmArgStart,
    RuntimeConst::MmArgEnd,
    RuntimeConst::MmEnvStart,
    RuntimeConst::MmEnvEnd,
    RuntimeConst::NsproxyNet,
    RuntimeConst::NetNsInum,
    RuntimeConst::CredUid,
    RuntimeConst::CredGid,
    RuntimeConst::CredEuid,
    RuntimeConst::CredEgid,
    RuntimeConst::CredFsuid,
    RuntimeConst::CredFsgid,
    RuntimeConst::CredCapPermitted,
    RuntimeConst::CredCapEffective,
    RuntimeConst::VmaStart,
    RuntimeConst::VmaEnd,
    RuntimeConst::VmaFlags,
    RuntimeConst::BprmFile,
    RuntimeConst::PipeBufs,
    RuntimeConst::PipeBufFlags,
    RuntimeConst::SocketSk,
    RuntimeConst::SocketAllocInode,
    RuntimeConst::SockDaddr,
    RuntimeConst::SockRcvSaddr,
    RuntimeConst::SockDport,
    RuntimeConst::SockNum,
    RuntimeConst::SockFamily,
    RuntimeConst::SockNet,
    RuntimeConst::SockV6Daddr,
    RuntimeConst::SockV6RcvSaddr,
    RuntimeConst::SockProtocol,
    RuntimeConst::FlowiSaddr4,
    RuntimeConst::FlowiSport4,
    RuntimeConst::FlowiSaddr6,
    RuntimeConst::FlowiSport6,
    RuntimeConst::NetDeviceName,
    RuntimeConst::NetDeviceIfindex,
    RuntimeConst::NetDeviceNet,
    RuntimeConst::NfConnTuples,
    RuntimeConst::NfConnNet,
    RuntimeConst::KernfsOfKn,
    RuntimeConst::KernfsNodeParent,
    RuntimeConst::KernfsNodeName,
    RuntimeConst::KernfsNodeId,
    RuntimeConst::CgroupKn,
    RuntimeConst::CgroupDentry,
    RuntimeConst::IoKiocbTask,
    RuntimeConst::IdmapDentryArg,
];

impl RuntimeConst {
    pub fn all() -> &'static [RuntimeConst] {
        &ALL_RUNTIME_CONSTS
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        ALL_RUNTIME_CONSTS.get(v as usize).copied()
    }
}

/// Offsets for a stock x86_64 5.15 kernel.
///
/// Used when no guessed or configured value overrides an entry, and by the
/// simulated kernel to lay out its objects.
pub const DEFAULT_CONSTANTS: &[(RuntimeConst, u64)] = &[
    (RuntimeConst::DiscarderRetention, DEFAULT_DISCARDER_RETENTION_NS),
    (RuntimeConst::SyscallDriftPeriod, 60_000_000_000),
    (RuntimeConst::DentryParent, 24),
    (RuntimeConst::DentryNamePtr, 40),
    (RuntimeConst::DentryInode, 48),
    (RuntimeConst::DentrySb, 104),
    (RuntimeConst::InodeMode, 0),
    (RuntimeConst::InodeUid, 4),
    (RuntimeConst::InodeGid, 8),
    (RuntimeConst::InodeSb, 40),
    (RuntimeConst::InodeIno, 64),
    (RuntimeConst::InodeNlink, 72),
    (RuntimeConst::InodeCtime, 120),
    (RuntimeConst::InodeMtime, 104),
    (RuntimeConst::SbDev, 16),
    (RuntimeConst::SbMagic, 96),
    (RuntimeConst::SbType, 40),
    (RuntimeConst::OvlUpperDentry, 600),
    (RuntimeConst::OvlLowerInode, 608),
    (RuntimeConst::OvlEntry, 616),
    (RuntimeConst::OvlEntryLowerDentry, 16),
    (RuntimeConst::FilePathMnt, 16),
    (RuntimeConst::FilePathDentry, 24),
    (RuntimeConst::FileInode, 32),
    (RuntimeConst::FileFlags, 64),
    (RuntimeConst::VfsmountRoot, 0),
    (RuntimeConst::VfsmountSb, 8),
    (RuntimeConst::MountId, 252),
    (RuntimeConst::MountParent, (-16i64) as u64),
    (RuntimeConst::MountMountpoint, (-8i64) as u64),
    (RuntimeConst::TaskPid, 2384),
    (RuntimeConst::TaskTgid, 2388),
    (RuntimeConst::TaskFlags, 44),
    (RuntimeConst::TaskRealParent, 2400),
    (RuntimeConst::TaskCred, 2840),
    (RuntimeConst::TaskMm, 2160),
    (RuntimeConst::TaskSignal, 2928),
    (RuntimeConst::TaskNsproxy, 2904),
    (RuntimeConst::SignalTty, 408),
    (RuntimeConst::TtyName, 368),
    (RuntimeConst::MmArgStart, 304),
    (RuntimeConst::MmArgEnd, 312),
    (RuntimeConst::MmEnvStart, 320),
    (RuntimeConst::MmEnvEnd, 328),
    (RuntimeConst::NsproxyNet, 48),
    (RuntimeConst::NetNsInum, 128),
    (RuntimeConst::CredUid, 4),
    (RuntimeConst::CredGid, 8),
    (RuntimeConst::CredEuid, 20),
    (RuntimeConst::CredEgid, 24),
    (RuntimeConst::CredFsuid, 28),
    (RuntimeConst::CredFsgid, 32),
    (RuntimeConst::CredCapPermitted, 48),
    (RuntimeConst::CredCapEffective, 56),
    (RuntimeConst::VmaStart, 0),
    (RuntimeConst::VmaEnd, 8),
    (RuntimeConst::VmaFlags, 80),
    (RuntimeConst::BprmFile, 64),
    (RuntimeConst::PipeBufs, 152),
    (RuntimeConst::PipeBufFlags, 24),
    (RuntimeConst::SocketSk, 24),
    (RuntimeConst::SocketAllocInode, 64),
    (RuntimeConst::SockDaddr, 0),
    (RuntimeConst::SockRcvSaddr, 4),
    (RuntimeConst::SockDport, 12),
    (RuntimeConst::SockNum, 14),
    (RuntimeConst::SockFamily, 16),
    (RuntimeConst::SockNet, 48),
    (RuntimeConst::SockV6Daddr, 56),
    (RuntimeConst::SockV6RcvSaddr, 72),
    (RuntimeConst::SockProtocol, 514),
    (RuntimeConst::FlowiSaddr4, 40),
    (RuntimeConst::FlowiSport4, 48),
    (RuntimeConst::FlowiSaddr6, 56),
    (RuntimeConst::FlowiSport6, 76),
    (RuntimeConst::NetDeviceName, 0),
    (RuntimeConst::NetDeviceIfindex, 256),
    (RuntimeConst::NetDeviceNet, 264),
    (RuntimeConst::NfConnTuples, 16),
    (RuntimeConst::NfConnNet, 144),
    (RuntimeConst::KernfsOfKn, 120),
    (RuntimeConst::KernfsNodeParent, 8),
    (RuntimeConst::KernfsNodeName, 16),
    (RuntimeConst::KernfsNodeId, 72),
    (RuntimeConst::CgroupKn, 256),
    (RuntimeConst::CgroupDentry, 72),
    (RuntimeConst::IoKiocbTask, 96),
    (RuntimeConst::IdmapDentryArg, 1),
];

/// Flags carried in the 16-bit `flags` field of every event header.
pub mod event_flags {
    pub const ASYNC: u16 = 1 << 0;
    pub const SAVED_BY_AD: u16 = 1 << 1;
    pub const ACTIVITY_DUMP_SAMPLE: u16 = 1 << 2;
    pub const ANOMALY_DETECTION_EVENT: u16 = 1 << 3;
}

/// Bits of `File::flags`.
pub mod file_flags {
    pub const UPPER_LAYER: u32 = 1 << 0;
    pub const LOWER_LAYER: u32 = 1 << 1;
    pub const PATH_ID_INVALIDATED: u32 = 1 << 2;
    pub const FILELESS: u32 = 1 << 3;
}
