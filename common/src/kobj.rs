//! Accessors for kernel structures.
//!
//! Pointers are plain `u64` addresses and every field is located through the
//! runtime-constant table, so one object serves every kernel the offset
//! guesser understands. A failed read yields zero, which callers treat as
//! "absent".

use crate::consts::{
    file_flags, RuntimeConst as C, AF_INET, AF_INET6, ETH_P_IP, ETH_P_IPV6, IFNAMSIZ,
    OVERLAYFS_SUPER_MAGIC, PF_KTHREAD, SEGMENT_BUFFER_LEN, S_IFMT, S_IFSOCK, TTY_NAME_LEN,
};
use crate::event::{Credentials, Device, File, FileMetadata, Flow};
use crate::kernel::Kernel;
use crate::path::{get_path_id, PathKey};

// ─────────────────────────────────────────────────────────────────────────────
// VFS
// ─────────────────────────────────────────────────────────────────────────────

pub fn dentry_parent<K: Kernel>(k: &K, dentry: u64) -> u64 {
    k.read_at::<u64>(dentry, C::DentryParent).unwrap_or(0)
}

pub fn dentry_inode<K: Kernel>(k: &K, dentry: u64) -> u64 {
    k.read_at::<u64>(dentry, C::DentryInode).unwrap_or(0)
}

/// Copies `d_name` into `buf`; returns the name length, 0 on fault.
pub fn dentry_name<K: Kernel>(k: &K, dentry: u64, buf: &mut [u8; SEGMENT_BUFFER_LEN]) -> usize {
    let ptr = k.read_at::<u64>(dentry, C::DentryNamePtr).unwrap_or(0);
    if ptr == 0 {
        buf[0] = 0;
        return 0;
    }
    match k.read_kernel_str(ptr, &mut buf[..]) {
        Some(len) => len,
        None => {
            buf[0] = 0;
            0
        }
    }
}

pub fn inode_ino<K: Kernel>(k: &K, inode: u64) -> u64 {
    k.read_at::<u64>(inode, C::InodeIno).unwrap_or(0)
}

pub fn inode_sb<K: Kernel>(k: &K, inode: u64) -> u64 {
    k.read_at::<u64>(inode, C::InodeSb).unwrap_or(0)
}

pub fn sb_magic<K: Kernel>(k: &K, sb: u64) -> u64 {
    k.read_at::<u64>(sb, C::SbMagic).unwrap_or(0)
}

pub fn sb_dev<K: Kernel>(k: &K, sb: u64) -> u32 {
    k.read_at::<u32>(sb, C::SbDev).unwrap_or(0)
}

pub fn inode_metadata<K: Kernel>(k: &K, inode: u64) -> FileMetadata {
    FileMetadata {
        uid: k.read_at(inode, C::InodeUid).unwrap_or(0),
        gid: k.read_at(inode, C::InodeGid).unwrap_or(0),
        nlink: k.read_at(inode, C::InodeNlink).unwrap_or(0),
        mode: k.read_at(inode, C::InodeMode).unwrap_or(0),
        _pad: 0,
        ctime: k.read_at(inode, C::InodeCtime).unwrap_or(0),
        mtime: k.read_at(inode, C::InodeMtime).unwrap_or(0),
    }
}

pub fn inode_is_socket<K: Kernel>(k: &K, inode: u64) -> bool {
    let mode: u16 = k.read_at(inode, C::InodeMode).unwrap_or(0);
    mode & S_IFMT == S_IFSOCK
}

/// Inode number to key a path with, translating overlayfs inodes.
///
/// Returns the layer flag to record on the file.
pub fn effective_ino<K: Kernel>(k: &K, inode: u64) -> (u64, u32) {
    let ino = inode_ino(k, inode);
    if sb_magic(k, inode_sb(k, inode)) != OVERLAYFS_SUPER_MAGIC {
        return (ino, 0);
    }

    let upper_dentry = k.read_at::<u64>(inode, C::OvlUpperDentry).unwrap_or(0);
    let upper_ino = inode_ino(k, dentry_inode(k, upper_dentry));
    if upper_ino != 0 {
        return (upper_ino, file_flags::UPPER_LAYER);
    }

    // The overlay inode either points at the lower inode or at an entry
    // holding the lower stack, depending on the kernel.
    let lower_inode = if k.constant(C::OverlayVariant) == 0 {
        k.read_at::<u64>(inode, C::OvlLowerInode).unwrap_or(0)
    } else {
        let entry = k.read_at::<u64>(inode, C::OvlEntry).unwrap_or(0);
        let lower_dentry = k.read_at::<u64>(entry, C::OvlEntryLowerDentry).unwrap_or(0);
        dentry_inode(k, lower_dentry)
    };
    match inode_ino(k, lower_inode) {
        0 => (ino, 0),
        lower => (lower, file_flags::LOWER_LAYER),
    }
}

/// Key of `dentry` on `mount_id`, with the current path generation.
pub fn dentry_key<K: Kernel>(k: &K, dentry: u64, mount_id: u32) -> PathKey {
    let (ino, _) = effective_ino(k, dentry_inode(k, dentry));
    PathKey::new(ino, mount_id, get_path_id(k, mount_id, false))
}

/// Fills `file` from a dentry on `mount_id`.
///
/// `invalidate` is set by hooks that may break the name to inode binding.
pub fn fill_file<K: Kernel>(k: &K, file: &mut File, dentry: u64, mount_id: u32, invalidate: bool) {
    let inode = dentry_inode(k, dentry);
    let (ino, layer) = effective_ino(k, inode);
    file.path_key = PathKey::new(ino, mount_id, get_path_id(k, mount_id, invalidate));
    file.dev = sb_dev(k, inode_sb(k, inode));
    file.flags = layer;
    if invalidate {
        file.flags |= file_flags::PATH_ID_INVALIDATED;
    }
    file.metadata = inode_metadata(k, inode);
}

pub fn vfsmount_mount_id<K: Kernel>(k: &K, vfsmount: u64) -> u32 {
    k.read_at::<u32>(vfsmount, C::MountId).unwrap_or(0)
}

pub fn vfsmount_root<K: Kernel>(k: &K, vfsmount: u64) -> u64 {
    k.read_at::<u64>(vfsmount, C::VfsmountRoot).unwrap_or(0)
}

pub fn vfsmount_sb<K: Kernel>(k: &K, vfsmount: u64) -> u64 {
    k.read_at::<u64>(vfsmount, C::VfsmountSb).unwrap_or(0)
}

/// The parent mount's embedded vfsmount.
pub fn vfsmount_parent<K: Kernel>(k: &K, vfsmount: u64) -> u64 {
    k.read_at::<u64>(vfsmount, C::MountParent).unwrap_or(0)
}

pub fn vfsmount_mountpoint<K: Kernel>(k: &K, vfsmount: u64) -> u64 {
    k.read_at::<u64>(vfsmount, C::MountMountpoint).unwrap_or(0)
}

/// `(dentry, vfsmount)` of a `struct path`.
pub fn path_parts<K: Kernel>(k: &K, path: u64) -> (u64, u64) {
    (
        k.read::<u64>(path.wrapping_add(8)).unwrap_or(0),
        k.read::<u64>(path).unwrap_or(0),
    )
}

/// `(dentry, vfsmount)` of `file->f_path`.
pub fn file_path<K: Kernel>(k: &K, file: u64) -> (u64, u64) {
    (
        k.read_at::<u64>(file, C::FilePathDentry).unwrap_or(0),
        k.read_at::<u64>(file, C::FilePathMnt).unwrap_or(0),
    )
}

pub fn file_flags_of<K: Kernel>(k: &K, file: u64) -> u32 {
    k.read_at::<u32>(file, C::FileFlags).unwrap_or(0)
}

/// Fills `out` from a `struct file`; returns the dentry.
pub fn fill_file_from_kfile<K: Kernel>(k: &K, out: &mut File, file: u64) -> u64 {
    let (dentry, mnt) = file_path(k, file);
    fill_file(k, out, dentry, vfsmount_mount_id(k, mnt), false);
    dentry
}

// ─────────────────────────────────────────────────────────────────────────────
// Tasks and credentials
// ─────────────────────────────────────────────────────────────────────────────

pub fn task_tgid<K: Kernel>(k: &K, task: u64) -> u32 {
    k.read_at::<u32>(task, C::TaskTgid).unwrap_or(0)
}

pub fn task_pid<K: Kernel>(k: &K, task: u64) -> u32 {
    k.read_at::<u32>(task, C::TaskPid).unwrap_or(0)
}

pub fn task_is_kthread<K: Kernel>(k: &K, task: u64) -> bool {
    k.read_at::<u32>(task, C::TaskFlags).unwrap_or(0) & PF_KTHREAD != 0
}

pub fn task_parent_tgid<K: Kernel>(k: &K, task: u64) -> u32 {
    let parent = k.read_at::<u64>(task, C::TaskRealParent).unwrap_or(0);
    task_tgid(k, parent)
}

pub fn task_netns<K: Kernel>(k: &K, task: u64) -> u32 {
    let nsproxy = k.read_at::<u64>(task, C::TaskNsproxy).unwrap_or(0);
    let net = k.read_at::<u64>(nsproxy, C::NsproxyNet).unwrap_or(0);
    net_inum(k, net)
}

pub fn net_inum<K: Kernel>(k: &K, net: u64) -> u32 {
    k.read_at::<u32>(net, C::NetNsInum).unwrap_or(0)
}

pub fn task_tty_name<K: Kernel>(k: &K, task: u64, out: &mut [u8; TTY_NAME_LEN]) {
    let signal = k.read_at::<u64>(task, C::TaskSignal).unwrap_or(0);
    let tty = k.read_at::<u64>(signal, C::SignalTty).unwrap_or(0);
    if tty == 0 || !k.read_kernel(tty.wrapping_add(k.constant(C::TtyName)), &mut out[..]) {
        out[0] = 0;
    }
}

/// `(arg_start, arg_end, env_start, env_end)` of the task's mm.
pub fn task_args_envs_bounds<K: Kernel>(k: &K, task: u64) -> (u64, u64, u64, u64) {
    let mm = k.read_at::<u64>(task, C::TaskMm).unwrap_or(0);
    (
        k.read_at(mm, C::MmArgStart).unwrap_or(0),
        k.read_at(mm, C::MmArgEnd).unwrap_or(0),
        k.read_at(mm, C::MmEnvStart).unwrap_or(0),
        k.read_at(mm, C::MmEnvEnd).unwrap_or(0),
    )
}

pub fn read_credentials<K: Kernel>(k: &K, cred: u64) -> Credentials {
    Credentials {
        uid: k.read_at(cred, C::CredUid).unwrap_or(0),
        gid: k.read_at(cred, C::CredGid).unwrap_or(0),
        euid: k.read_at(cred, C::CredEuid).unwrap_or(0),
        egid: k.read_at(cred, C::CredEgid).unwrap_or(0),
        fsuid: k.read_at(cred, C::CredFsuid).unwrap_or(0),
        fsgid: k.read_at(cred, C::CredFsgid).unwrap_or(0),
        cap_effective: k.read_at(cred, C::CredCapEffective).unwrap_or(0),
        cap_permitted: k.read_at(cred, C::CredCapPermitted).unwrap_or(0),
    }
}

pub fn task_credentials<K: Kernel>(k: &K, task: u64) -> Credentials {
    read_credentials(k, k.read_at::<u64>(task, C::TaskCred).unwrap_or(0))
}

// ─────────────────────────────────────────────────────────────────────────────
// Sockets, devices, conntrack
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SockInfo {
    pub family: u16,
    pub protocol: u16,
    pub netns: u32,
    pub saddr: [u8; 16],
    pub sport: u16,
    pub daddr: [u8; 16],
    pub dport: u16,
}

/// Local and remote endpoints of a `struct sock`. Ports are host order.
pub fn read_sock<K: Kernel>(k: &K, sk: u64) -> Option<SockInfo> {
    if sk == 0 {
        return None;
    }
    let family: u16 = k.read_at(sk, C::SockFamily)?;
    let mut info = SockInfo {
        family,
        protocol: k.read_at(sk, C::SockProtocol).unwrap_or(0),
        sport: k.read_at(sk, C::SockNum).unwrap_or(0),
        dport: u16::from_be(k.read_at(sk, C::SockDport).unwrap_or(0)),
        ..SockInfo::default()
    };
    let net = k.read_at::<u64>(sk, C::SockNet).unwrap_or(0);
    info.netns = net_inum(k, net);
    match family {
        AF_INET => {
            let saddr: [u8; 4] = k.read_at(sk, C::SockRcvSaddr).unwrap_or([0; 4]);
            let daddr: [u8; 4] = k.read_at(sk, C::SockDaddr).unwrap_or([0; 4]);
            info.saddr[..4].copy_from_slice(&saddr);
            info.daddr[..4].copy_from_slice(&daddr);
        }
        AF_INET6 => {
            info.saddr = k.read_at(sk, C::SockV6RcvSaddr).unwrap_or([0; 16]);
            info.daddr = k.read_at(sk, C::SockV6Daddr).unwrap_or([0; 16]);
        }
        _ => return None,
    }
    Some(info)
}

/// `struct sock` behind a socket inode, if the inode is a socket.
pub fn inode_sock<K: Kernel>(k: &K, inode: u64) -> u64 {
    if inode == 0 || !inode_is_socket(k, inode) {
        return 0;
    }
    let socket = inode.wrapping_sub(k.constant(C::SocketAllocInode));
    k.read_at::<u64>(socket, C::SocketSk).unwrap_or(0)
}

pub fn socket_sk<K: Kernel>(k: &K, socket: u64) -> u64 {
    k.read_at::<u64>(socket, C::SocketSk).unwrap_or(0)
}

/// Source address and port the kernel classified a flow with.
pub fn read_flowi_source<K: Kernel>(k: &K, fl: u64, family: u16) -> ([u8; 16], u16) {
    let mut addr = [0u8; 16];
    let port: u16 = match family {
        AF_INET => {
            let a: [u8; 4] = k.read_at(fl, C::FlowiSaddr4).unwrap_or([0; 4]);
            addr[..4].copy_from_slice(&a);
            k.read_at(fl, C::FlowiSport4).unwrap_or(0)
        }
        AF_INET6 => {
            addr = k.read_at(fl, C::FlowiSaddr6).unwrap_or([0; 16]);
            k.read_at(fl, C::FlowiSport6).unwrap_or(0)
        }
        _ => 0,
    };
    (addr, u16::from_be(port))
}

pub fn read_device<K: Kernel>(k: &K, dev: u64) -> Device {
    let mut device = Device::default();
    if dev == 0 {
        return device;
    }
    let _ = k.read_kernel(dev.wrapping_add(k.constant(C::NetDeviceName)), &mut device.name[..IFNAMSIZ]);
    device.ifindex = k.read_at(dev, C::NetDeviceIfindex).unwrap_or(0);
    let net = k.read_at::<u64>(dev, C::NetDeviceNet).unwrap_or(0);
    device.netns = net_inum(k, net);
    device
}

/// Size of `struct nf_conntrack_tuple_hash`.
const TUPLE_HASH_SIZE: u64 = 56;
/// Offset of the tuple inside the tuple hash.
const TUPLE_OFFSET: u64 = 16;

#[repr(C)]
#[derive(Clone, Copy)]
struct RawTuple {
    src: [u8; 16],
    src_port: u16,
    l3num: u16,
    dst: [u8; 16],
    dst_port: u16,
    protonum: u8,
    dir: u8,
}

crate::kernel::plain!(RawTuple);

/// One direction (`0` original, `1` reply) of a conntrack entry.
pub fn conntrack_tuple<K: Kernel>(k: &K, ct: u64, dir: u64) -> Option<Flow> {
    let base = ct.wrapping_add(k.constant(C::NfConnTuples));
    let raw: RawTuple = k.read(base + dir * TUPLE_HASH_SIZE + TUPLE_OFFSET)?;
    let mut flow = Flow {
        saddr: raw.src,
        daddr: raw.dst,
        sport: u16::from_be(raw.src_port),
        dport: u16::from_be(raw.dst_port),
        l3_protocol: 0,
        l4_protocol: raw.protonum as u16,
    };
    match raw.l3num {
        AF_INET => {
            flow.l3_protocol = ETH_P_IP;
            flow.saddr[4..].fill(0);
            flow.daddr[4..].fill(0);
        }
        AF_INET6 => flow.l3_protocol = ETH_P_IPV6,
        _ => return None,
    }
    Some(flow)
}

pub fn conntrack_netns<K: Kernel>(k: &K, ct: u64) -> u32 {
    let net = k.read_at::<u64>(ct, C::NfConnNet).unwrap_or(0);
    net_inum(k, net)
}

// ─────────────────────────────────────────────────────────────────────────────
// cgroups
// ─────────────────────────────────────────────────────────────────────────────

pub fn kernfs_of_node<K: Kernel>(k: &K, of: u64) -> u64 {
    k.read_at::<u64>(of, C::KernfsOfKn).unwrap_or(0)
}

pub fn kernfs_parent<K: Kernel>(k: &K, kn: u64) -> u64 {
    k.read_at::<u64>(kn, C::KernfsNodeParent).unwrap_or(0)
}

pub fn kernfs_id<K: Kernel>(k: &K, kn: u64) -> u64 {
    k.read_at::<u64>(kn, C::KernfsNodeId).unwrap_or(0)
}

pub fn kernfs_name<K: Kernel>(k: &K, kn: u64, buf: &mut [u8]) -> usize {
    let ptr = k.read_at::<u64>(kn, C::KernfsNodeName).unwrap_or(0);
    if ptr == 0 {
        return 0;
    }
    k.read_kernel_str(ptr, buf).unwrap_or(0)
}

/// Legacy cgroups keep a dentry rather than a kernfs node.
pub fn cgroup_dentry<K: Kernel>(k: &K, cgroup: u64) -> u64 {
    k.read_at::<u64>(cgroup, C::CgroupDentry).unwrap_or(0)
}
