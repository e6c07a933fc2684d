//! Kernel function and scheduler hooks.
//!
//! Each hook is a kprobe (or kretprobe) by default and an fentry (or fexit)
//! program with the `fentry` feature. The agent attaches the program to the
//! function it is named after.

use aya_ebpf::macros::{raw_tracepoint, tracepoint};
use aya_ebpf::programs::{RawTracePointContext, TracePointContext};
use aya_ebpf::EbpfContext;

#[cfg(not(feature = "fentry"))]
use aya_ebpf::{
    macros::{kprobe, kretprobe, map},
    maps::LruHashMap,
    programs::{ProbeContext, RetProbeContext},
};
#[cfg(feature = "fentry")]
use aya_ebpf::{
    macros::{fentry, fexit},
    programs::{FEntryContext, FExitContext},
};

use secwatch_common::consts::RuntimeConst;
use secwatch_common::container::{handle_cgroup_write, handle_cgroup_write_legacy};
use secwatch_common::kernel::Kernel;
use secwatch_common::kobj;
use secwatch_common::probes::{fs, mount, net, process, syscalls};

use crate::args::Args;
#[cfg(not(feature = "fentry"))]
use crate::args::Kprobe;
#[cfg(feature = "fentry")]
use crate::args::Fentry;
use crate::kernel::KERNEL;
use crate::tail::{follow, HOOK_PROGS, TP_PROGS};

macro_rules! hook {
    ($name:ident; |$a:ident| $body:expr) => {
        #[cfg(not(feature = "fentry"))]
        #[kprobe]
        pub fn $name(ctx: ProbeContext) -> u32 {
            let $a = Kprobe(&ctx);
            follow(&ctx, &HOOK_PROGS, $body);
            0
        }

        #[cfg(feature = "fentry")]
        #[fentry]
        pub fn $name(ctx: FEntryContext) -> i32 {
            let $a = Fentry(&ctx);
            follow(&ctx, &HOOK_PROGS, $body);
            0
        }
    };
}

/// `$nargs` is the arity of the hooked function: fexit sees the return
/// value right after the arguments.
macro_rules! ret_hook {
    ($name:ident, $nargs:literal; |$r:ident| $body:expr) => {
        #[cfg(not(feature = "fentry"))]
        #[kretprobe]
        pub fn $name(ctx: RetProbeContext) -> u32 {
            let $r: i64 = ctx.ret::<i64>().unwrap_or(0);
            follow(&ctx, &HOOK_PROGS, $body);
            0
        }

        #[cfg(feature = "fentry")]
        #[fexit]
        pub fn $name(ctx: FExitContext) -> i32 {
            let $r: i64 = unsafe { ctx.arg::<i64>($nargs) };
            follow(&ctx, &HOOK_PROGS, $body);
            0
        }
    };
}

#[inline(always)]
fn idmap_dentry<A: Args>(a: &A) -> u64 {
    match KERNEL.constant(RuntimeConst::IdmapDentryArg) {
        0 => a.arg(0),
        _ => a.arg(1),
    }
}

// ── files ───────────────────────────────────────────────────────────────────

hook!(vfs_open; |a| fs::handle_vfs_open(KERNEL, a.arg(0)));
hook!(security_path_mkdir; |a| fs::handle_security_path_mkdir(KERNEL, a.arg(0), a.arg(1)));
hook!(security_path_unlink; |a| fs::handle_security_path_unlink(KERNEL, a.arg(0), a.arg(1)));
hook!(security_path_rmdir; |a| fs::handle_security_path_rmdir(KERNEL, a.arg(0), a.arg(1)));
// (old_dir, old_dentry, new_dir, new_dentry, flags)
hook!(security_path_rename; |a| fs::handle_security_path_rename(KERNEL, a.arg(0), a.arg(1), a.arg(3)));
hook!(security_path_link; |a| fs::handle_security_path_link(KERNEL, a.arg(0), a.arg(1), a.arg(2)));
hook!(mnt_want_write; |a| fs::handle_mnt_want_write(KERNEL, a.arg(0)));
hook!(mnt_want_write_file; |a| {
    let (_, mnt) = kobj::file_path(KERNEL, a.arg(0));
    fs::handle_mnt_want_write(KERNEL, mnt)
});
hook!(security_inode_setattr; |a| fs::handle_security_inode_setattr(KERNEL, idmap_dentry(&a)));
hook!(vfs_setxattr; |a| fs::handle_vfs_xattr(KERNEL, idmap_dentry(&a)));
hook!(vfs_removexattr; |a| fs::handle_vfs_xattr(KERNEL, idmap_dentry(&a)));
// (fs, path)
hook!(set_fs_pwd; |a| fs::handle_set_fs_pwd(KERNEL, a.arg(1)));
hook!(security_mmap_file; |a| fs::handle_security_mmap_file(KERNEL, a.arg(0)));
hook!(security_file_mprotect; |a| fs::handle_security_file_mprotect(KERNEL, a.arg(0)));

/// `get_pipe_info(file, for_splice)` arguments, keyed by thread, for the
/// kretprobe that cannot see them.
#[cfg(not(feature = "fentry"))]
#[map]
static PIPE_INFO_FILES: LruHashMap<u64, u64> = LruHashMap::with_max_entries(1024, 0);

#[cfg(not(feature = "fentry"))]
#[kprobe]
pub fn get_pipe_info(ctx: ProbeContext) -> u32 {
    let file = Kprobe(&ctx).arg(0);
    let _ = PIPE_INFO_FILES.insert(&KERNEL.pid_tgid(), &file, 0);
    0
}

#[cfg(not(feature = "fentry"))]
#[kretprobe]
pub fn get_pipe_info_ret(ctx: RetProbeContext) -> u32 {
    let key = KERNEL.pid_tgid();
    let Some(file) = (unsafe { PIPE_INFO_FILES.get(&key) }).copied() else {
        return 0;
    };
    let _ = PIPE_INFO_FILES.remove(&key);
    let pipe = ctx.ret::<u64>().unwrap_or(0);
    follow(&ctx, &HOOK_PROGS, fs::handle_get_pipe_info_exit(KERNEL, file, pipe));
    0
}

#[cfg(feature = "fentry")]
#[fexit]
pub fn get_pipe_info_ret(ctx: FExitContext) -> i32 {
    let (file, pipe) = unsafe { (ctx.arg::<u64>(0), ctx.arg::<u64>(2)) };
    follow(&ctx, &HOOK_PROGS, fs::handle_get_pipe_info_exit(KERNEL, file, pipe));
    0
}

// ── mounts ──────────────────────────────────────────────────────────────────

// `struct mount` embeds its vfsmount after the hash link and the parent and
// mountpoint pointers; `struct mountpoint` holds its dentry after a hash link.
const MOUNT_VFSMOUNT_OFFSET: u64 = 32;
const MOUNTPOINT_DENTRY_OFFSET: u64 = 16;

// (source_mnt, dest_mnt, dest_mp, ...)
hook!(attach_recursive_mnt; |a| {
    let mountpoint = KERNEL
        .read::<u64>(a.arg(2).wrapping_add(MOUNTPOINT_DENTRY_OFFSET))
        .unwrap_or(0);
    mount::handle_mount_attach(
        KERNEL,
        a.arg(0).wrapping_add(MOUNT_VFSMOUNT_OFFSET),
        a.arg(1).wrapping_add(MOUNT_VFSMOUNT_OFFSET),
        mountpoint,
    )
});
hook!(security_sb_umount; |a| mount::handle_security_sb_umount(KERNEL, a.arg(0)));

// ── processes ───────────────────────────────────────────────────────────────

hook!(security_bprm_check; |a| process::security_bprm_check(KERNEL, a.arg(0)));
hook!(do_exit; |a| process::do_exit(KERNEL, a.arg(0) as i64));
hook!(commit_creds; |a| process::commit_creds(KERNEL, a.arg(0)));

#[raw_tracepoint(tracepoint = "sched_process_fork")]
pub fn sched_process_fork(ctx: RawTracePointContext) -> i32 {
    // bpf_raw_tracepoint_args: (parent, child)
    let args = ctx.as_ptr() as *const u64;
    let (parent, child) = unsafe { (*args, *args.add(1)) };
    let _ = process::sched_process_fork(KERNEL, parent, child);
    0
}

#[tracepoint]
pub fn sched_process_exec(ctx: TracePointContext) -> u32 {
    follow(&ctx, &TP_PROGS, process::sched_process_exec(KERNEL, KERNEL.current_task()));
    0
}

/// `raw_syscalls:sys_enter`; the syscall number follows the common header.
#[tracepoint]
pub fn raw_sys_enter(ctx: TracePointContext) -> u32 {
    let nr = unsafe { ctx.read_at::<u64>(8) }.unwrap_or(u64::MAX);
    let _ = syscalls::sys_enter(KERNEL, nr);
    0
}

// ── containers ──────────────────────────────────────────────────────────────

hook!(cgroup_procs_write; |a| handle_cgroup_write(KERNEL, a.arg(0), a.arg(1)));
hook!(cgroup1_procs_write; |a| handle_cgroup_write(KERNEL, a.arg(0), a.arg(1)));
// (cgrp, cft, pid)
hook!(cgroup_tasks_write; |a| handle_cgroup_write_legacy(KERNEL, a.arg(0), a.arg(2)));

// ── io_uring ────────────────────────────────────────────────────────────────

hook!(io_issue_sqe; |a| {
    let task = KERNEL.read_at::<u64>(a.arg(0), RuntimeConst::IoKiocbTask).unwrap_or(0);
    syscalls::io_issue_sqe_enter(KERNEL, task)
});
ret_hook!(io_issue_sqe_ret, 2; |_r| syscalls::io_issue_sqe_exit(KERNEL));

// ── sockets and netfilter ───────────────────────────────────────────────────

hook!(security_socket_bind; |a| net::handle_security_socket_bind(KERNEL, a.arg(0), a.arg(1)));
hook!(security_sk_classify_flow; |a| net::handle_sk_classify_flow(KERNEL, a.arg(0), a.arg(1)));
hook!(sk_destruct; |a| net::handle_sock_release(KERNEL, a.arg(0)));
hook!(inet_release; |a| net::handle_sock_release(KERNEL, kobj::socket_sk(KERNEL, a.arg(0))));
// (skb, ct, mtype, dir)
hook!(nf_nat_manip_pkt; |a| net::handle_nf_nat(KERNEL, a.arg(1)));
// (ct, ctinfo, hooknum, skb)
hook!(nf_nat_packet; |a| net::handle_nf_nat(KERNEL, a.arg(0)));
hook!(nf_ct_delete; |a| net::handle_nf_ct_delete(KERNEL, a.arg(0)));
hook!(proc_fd_link; |a| net::handle_proc_fd_link(KERNEL, a.arg(0)));
hook!(path_get; |a| net::handle_path_get(KERNEL, a.arg(0)));

// ── net devices ─────────────────────────────────────────────────────────────

hook!(veth_newlink; |_a| net::veth_newlink_enter(KERNEL));
ret_hook!(veth_newlink_ret, 5; |_r| net::veth_newlink_exit(KERNEL));
hook!(register_netdevice; |a| net::register_netdevice_enter(KERNEL, a.arg(0)));
ret_hook!(register_netdevice_ret, 1; |r| net::register_netdevice_exit(KERNEL, r));
