//! Syscall entry and exit dispatchers.
//!
//! Every syscall gets a kprobe on its `__x64_sys_*` wrapper, one on the
//! 32-bit compat wrapper, a kretprobe shared by both, and a pair of
//! `syscalls:sys_{enter,exit}_*` tracepoints the agent attaches when the
//! wrapper cannot be probed. With the `fentry` feature the native wrapper is
//! hooked with fentry/fexit instead and compat calls are left to the
//! tracepoints.

use aya_ebpf::macros::tracepoint;
use aya_ebpf::programs::TracePointContext;

#[cfg(not(feature = "fentry"))]
use aya_ebpf::{
    macros::{kprobe, kretprobe},
    programs::{ProbeContext, RetProbeContext},
};
#[cfg(feature = "fentry")]
use aya_ebpf::{
    macros::{fentry, fexit},
    programs::{FEntryContext, FExitContext},
};

use secwatch_common::erpc::handle_erpc_request;
use secwatch_common::event::EventType;
use secwatch_common::kernel::{Kernel, Next};
use secwatch_common::probes::fs::{self, TimeUnit};
use secwatch_common::probes::{mount, net, process};

use crate::args::{tracepoint_ret, Args, SyscallRegs, SyscallTracepoint};
use crate::kernel::KERNEL;
use crate::tail::{follow, HOOK_PROGS, TP_PROGS};

const AT_REMOVEDIR: u64 = 0x200;
// O_CREAT | O_WRONLY | O_TRUNC
const CREAT_FLAGS: u32 = 0o1101;

macro_rules! syscall_entry {
    ($native:ident, $compat:ident, $tp:ident; |$a:ident| $enter:expr) => {
        #[cfg(not(feature = "fentry"))]
        #[kprobe]
        pub fn $native(ctx: ProbeContext) -> u32 {
            let $a = SyscallRegs::native(ctx.arg::<u64>(0).unwrap_or(0));
            follow(&ctx, &HOOK_PROGS, $enter);
            0
        }

        #[cfg(not(feature = "fentry"))]
        #[kprobe]
        pub fn $compat(ctx: ProbeContext) -> u32 {
            let $a = SyscallRegs::compat(ctx.arg::<u64>(0).unwrap_or(0));
            follow(&ctx, &HOOK_PROGS, $enter);
            0
        }

        #[cfg(feature = "fentry")]
        #[fentry]
        pub fn $native(ctx: FEntryContext) -> i32 {
            let $a = SyscallRegs::native(unsafe { ctx.arg::<u64>(0) });
            follow(&ctx, &HOOK_PROGS, $enter);
            0
        }

        #[tracepoint]
        pub fn $tp(ctx: TracePointContext) -> u32 {
            let $a = SyscallTracepoint(&ctx);
            follow(&ctx, &TP_PROGS, $enter);
            0
        }
    };
}

macro_rules! syscall {
    (
        $native:ident, $compat:ident, $ret:ident, $tp_enter:ident, $tp_exit:ident;
        |$a:ident| $enter:expr;
        |$r:ident| $exit:expr $(;)?
    ) => {
        syscall_entry!($native, $compat, $tp_enter; |$a| $enter);

        #[cfg(not(feature = "fentry"))]
        #[kretprobe]
        pub fn $ret(ctx: RetProbeContext) -> u32 {
            let $r: i64 = ctx.ret::<i64>().unwrap_or(0);
            follow(&ctx, &HOOK_PROGS, $exit);
            0
        }

        // the wrapper takes a single `pt_regs *`; the return value follows it
        #[cfg(feature = "fentry")]
        #[fexit]
        pub fn $ret(ctx: FExitContext) -> i32 {
            let $r: i64 = unsafe { ctx.arg::<i64>(1) };
            follow(&ctx, &HOOK_PROGS, $exit);
            0
        }

        #[tracepoint]
        pub fn $tp_exit(ctx: TracePointContext) -> u32 {
            let $r = tracepoint_ret(&ctx);
            follow(&ctx, &TP_PROGS, $exit);
            0
        }
    };
}

/// `struct open_how { u64 flags; u64 mode; u64 resolve; }`
#[inline(always)]
fn openat2_enter(how: u64) -> Next {
    let how = KERNEL.read_user_value::<[u64; 3]>(how).unwrap_or([0; 3]);
    fs::sys_open_enter(KERNEL, how[0] as u32, how[1] as u32)
}

#[inline(always)]
fn unlinkat_enter(flags: u64) -> Next {
    if flags & AT_REMOVEDIR != 0 {
        fs::sys_rmdir_enter(KERNEL)
    } else {
        fs::sys_unlink_enter(KERNEL, flags as u32)
    }
}

#[inline(always)]
fn file_exit(t: EventType, retval: i64) -> Next {
    fs::sys_exit_common(KERNEL, t, retval)
}

// ── open ────────────────────────────────────────────────────────────────────

syscall!(sys_open, compat_sys_open, sys_open_ret, tp_enter_open, tp_exit_open;
    |a| fs::sys_open_enter(KERNEL, a.arg(1) as u32, a.arg(2) as u32);
    |r| file_exit(EventType::Open, r));
syscall!(sys_openat, compat_sys_openat, sys_openat_ret, tp_enter_openat, tp_exit_openat;
    |a| fs::sys_open_enter(KERNEL, a.arg(2) as u32, a.arg(3) as u32);
    |r| file_exit(EventType::Open, r));
syscall!(sys_openat2, compat_sys_openat2, sys_openat2_ret, tp_enter_openat2, tp_exit_openat2;
    |a| openat2_enter(a.arg(2));
    |r| file_exit(EventType::Open, r));
syscall!(sys_creat, compat_sys_creat, sys_creat_ret, tp_enter_creat, tp_exit_creat;
    |a| fs::sys_open_enter(KERNEL, CREAT_FLAGS, a.arg(1) as u32);
    |r| file_exit(EventType::Open, r));

// ── namespace changes ───────────────────────────────────────────────────────

syscall!(sys_mkdir, compat_sys_mkdir, sys_mkdir_ret, tp_enter_mkdir, tp_exit_mkdir;
    |a| fs::sys_mkdir_enter(KERNEL, a.arg(1) as u32);
    |r| file_exit(EventType::Mkdir, r));
syscall!(sys_mkdirat, compat_sys_mkdirat, sys_mkdirat_ret, tp_enter_mkdirat, tp_exit_mkdirat;
    |a| fs::sys_mkdir_enter(KERNEL, a.arg(2) as u32);
    |r| file_exit(EventType::Mkdir, r));
syscall!(sys_link, compat_sys_link, sys_link_ret, tp_enter_link, tp_exit_link;
    |_a| fs::sys_two_files_enter(KERNEL, EventType::Link);
    |r| file_exit(EventType::Link, r));
syscall!(sys_linkat, compat_sys_linkat, sys_linkat_ret, tp_enter_linkat, tp_exit_linkat;
    |_a| fs::sys_two_files_enter(KERNEL, EventType::Link);
    |r| file_exit(EventType::Link, r));
syscall!(sys_rename, compat_sys_rename, sys_rename_ret, tp_enter_rename, tp_exit_rename;
    |_a| fs::sys_two_files_enter(KERNEL, EventType::Rename);
    |r| file_exit(EventType::Rename, r));
syscall!(sys_renameat, compat_sys_renameat, sys_renameat_ret, tp_enter_renameat, tp_exit_renameat;
    |_a| fs::sys_two_files_enter(KERNEL, EventType::Rename);
    |r| file_exit(EventType::Rename, r));
syscall!(sys_renameat2, compat_sys_renameat2, sys_renameat2_ret, tp_enter_renameat2, tp_exit_renameat2;
    |_a| fs::sys_two_files_enter(KERNEL, EventType::Rename);
    |r| file_exit(EventType::Rename, r));
syscall!(sys_unlink, compat_sys_unlink, sys_unlink_ret, tp_enter_unlink, tp_exit_unlink;
    |_a| fs::sys_unlink_enter(KERNEL, 0);
    |r| file_exit(EventType::Unlink, r));
syscall!(sys_unlinkat, compat_sys_unlinkat, sys_unlinkat_ret, tp_enter_unlinkat, tp_exit_unlinkat;
    |a| unlinkat_enter(a.arg(2));
    |r| fs::sys_unlinkat_exit(KERNEL, r));
syscall!(sys_rmdir, compat_sys_rmdir, sys_rmdir_ret, tp_enter_rmdir, tp_exit_rmdir;
    |_a| fs::sys_rmdir_enter(KERNEL);
    |r| file_exit(EventType::Rmdir, r));

// ── attributes ──────────────────────────────────────────────────────────────

syscall!(sys_chmod, compat_sys_chmod, sys_chmod_ret, tp_enter_chmod, tp_exit_chmod;
    |a| fs::sys_setattr_enter(KERNEL, EventType::Chmod, a.arg(1) as u32, -1, -1, 0);
    |r| file_exit(EventType::Chmod, r));
syscall!(sys_fchmod, compat_sys_fchmod, sys_fchmod_ret, tp_enter_fchmod, tp_exit_fchmod;
    |a| fs::sys_setattr_enter(KERNEL, EventType::Chmod, a.arg(1) as u32, -1, -1, 0);
    |r| file_exit(EventType::Chmod, r));
syscall!(sys_fchmodat, compat_sys_fchmodat, sys_fchmodat_ret, tp_enter_fchmodat, tp_exit_fchmodat;
    |a| fs::sys_setattr_enter(KERNEL, EventType::Chmod, a.arg(2) as u32, -1, -1, 0);
    |r| file_exit(EventType::Chmod, r));
syscall!(sys_chown, compat_sys_chown, sys_chown_ret, tp_enter_chown, tp_exit_chown;
    |a| fs::sys_setattr_enter(KERNEL, EventType::Chown, 0, a.arg(1) as i32, a.arg(2) as i32, 0);
    |r| file_exit(EventType::Chown, r));
syscall!(sys_fchown, compat_sys_fchown, sys_fchown_ret, tp_enter_fchown, tp_exit_fchown;
    |a| fs::sys_setattr_enter(KERNEL, EventType::Chown, 0, a.arg(1) as i32, a.arg(2) as i32, 0);
    |r| file_exit(EventType::Chown, r));
syscall!(sys_lchown, compat_sys_lchown, sys_lchown_ret, tp_enter_lchown, tp_exit_lchown;
    |a| fs::sys_setattr_enter(KERNEL, EventType::Chown, 0, a.arg(1) as i32, a.arg(2) as i32, 0);
    |r| file_exit(EventType::Chown, r));
syscall!(sys_fchownat, compat_sys_fchownat, sys_fchownat_ret, tp_enter_fchownat, tp_exit_fchownat;
    |a| fs::sys_setattr_enter(KERNEL, EventType::Chown, 0, a.arg(2) as i32, a.arg(3) as i32, 0);
    |r| file_exit(EventType::Chown, r));
syscall!(sys_utimes, compat_sys_utimes, sys_utimes_ret, tp_enter_utimes, tp_exit_utimes;
    |a| fs::sys_utimes_enter(KERNEL, a.arg(1), TimeUnit::Micros);
    |r| file_exit(EventType::Utimes, r));
syscall!(sys_utimensat, compat_sys_utimensat, sys_utimensat_ret, tp_enter_utimensat, tp_exit_utimensat;
    |a| fs::sys_setattr_enter(KERNEL, EventType::Utimes, 0, -1, -1, a.arg(2));
    |r| file_exit(EventType::Utimes, r));

// ── extended attributes ─────────────────────────────────────────────────────

syscall!(sys_setxattr, compat_sys_setxattr, sys_setxattr_ret, tp_enter_setxattr, tp_exit_setxattr;
    |a| fs::sys_xattr_enter(KERNEL, EventType::SetXattr, a.arg(1));
    |r| file_exit(EventType::SetXattr, r));
syscall!(sys_lsetxattr, compat_sys_lsetxattr, sys_lsetxattr_ret, tp_enter_lsetxattr, tp_exit_lsetxattr;
    |a| fs::sys_xattr_enter(KERNEL, EventType::SetXattr, a.arg(1));
    |r| file_exit(EventType::SetXattr, r));
syscall!(sys_fsetxattr, compat_sys_fsetxattr, sys_fsetxattr_ret, tp_enter_fsetxattr, tp_exit_fsetxattr;
    |a| fs::sys_xattr_enter(KERNEL, EventType::SetXattr, a.arg(1));
    |r| file_exit(EventType::SetXattr, r));
syscall!(sys_removexattr, compat_sys_removexattr, sys_removexattr_ret, tp_enter_removexattr, tp_exit_removexattr;
    |a| fs::sys_xattr_enter(KERNEL, EventType::RemoveXattr, a.arg(1));
    |r| file_exit(EventType::RemoveXattr, r));
syscall!(sys_lremovexattr, compat_sys_lremovexattr, sys_lremovexattr_ret, tp_enter_lremovexattr, tp_exit_lremovexattr;
    |a| fs::sys_xattr_enter(KERNEL, EventType::RemoveXattr, a.arg(1));
    |r| file_exit(EventType::RemoveXattr, r));
syscall!(sys_fremovexattr, compat_sys_fremovexattr, sys_fremovexattr_ret, tp_enter_fremovexattr, tp_exit_fremovexattr;
    |a| fs::sys_xattr_enter(KERNEL, EventType::RemoveXattr, a.arg(1));
    |r| file_exit(EventType::RemoveXattr, r));

// ── working directory, memory and pipes ─────────────────────────────────────

syscall!(sys_chdir, compat_sys_chdir, sys_chdir_ret, tp_enter_chdir, tp_exit_chdir;
    |_a| fs::sys_chdir_enter(KERNEL);
    |r| file_exit(EventType::Chdir, r));
syscall!(sys_fchdir, compat_sys_fchdir, sys_fchdir_ret, tp_enter_fchdir, tp_exit_fchdir;
    |_a| fs::sys_chdir_enter(KERNEL);
    |r| file_exit(EventType::Chdir, r));
syscall!(sys_mmap, compat_sys_mmap, sys_mmap_ret, tp_enter_mmap, tp_exit_mmap;
    |a| fs::sys_mmap_enter(KERNEL, a.arg(0), a.arg(1), a.arg(2) as u32, a.arg(3) as u32, a.arg(5));
    |r| file_exit(EventType::Mmap, r));
syscall!(sys_mprotect, compat_sys_mprotect, sys_mprotect_ret, tp_enter_mprotect, tp_exit_mprotect;
    |a| fs::sys_mprotect_enter(KERNEL, a.arg(2));
    |r| file_exit(EventType::Mprotect, r));
syscall!(sys_splice, compat_sys_splice, sys_splice_ret, tp_enter_splice, tp_exit_splice;
    |_a| fs::sys_splice_enter(KERNEL);
    |r| file_exit(EventType::Splice, r));

// ── mounts ──────────────────────────────────────────────────────────────────

syscall!(sys_mount, compat_sys_mount, sys_mount_ret, tp_enter_mount, tp_exit_mount;
    |a| mount::sys_mount_enter(KERNEL, a.arg(2));
    |r| mount::sys_mount_exit(KERNEL, r));
syscall!(sys_umount, compat_sys_umount, sys_umount_ret, tp_enter_umount, tp_exit_umount;
    |_a| mount::sys_umount_enter(KERNEL);
    |r| mount::sys_umount_exit(KERNEL, r));

// ── exec and credentials ────────────────────────────────────────────────────

syscall!(sys_execve, compat_sys_execve, sys_execve_ret, tp_enter_execve, tp_exit_execve;
    |a| process::sys_exec_enter(KERNEL, a.arg(0), a.arg(1), a.arg(2));
    |r| process::sys_exec_exit(KERNEL, r));
syscall!(sys_execveat, compat_sys_execveat, sys_execveat_ret, tp_enter_execveat, tp_exit_execveat;
    |a| process::sys_exec_enter(KERNEL, a.arg(1), a.arg(2), a.arg(3));
    |r| process::sys_exec_exit(KERNEL, r));

macro_rules! setcred {
    ($t:expr; $($native:ident, $compat:ident, $ret:ident, $tp_enter:ident, $tp_exit:ident);+ $(;)?) => {
        $(
            syscall!($native, $compat, $ret, $tp_enter, $tp_exit;
                |_a| process::sys_setcred_enter(KERNEL, $t);
                |r| process::sys_setcred_exit(KERNEL, $t, r));
        )+
    };
}

setcred!(EventType::SetUid;
    sys_setuid, compat_sys_setuid, sys_setuid_ret, tp_enter_setuid, tp_exit_setuid;
    sys_setreuid, compat_sys_setreuid, sys_setreuid_ret, tp_enter_setreuid, tp_exit_setreuid;
    sys_setresuid, compat_sys_setresuid, sys_setresuid_ret, tp_enter_setresuid, tp_exit_setresuid;
    sys_setfsuid, compat_sys_setfsuid, sys_setfsuid_ret, tp_enter_setfsuid, tp_exit_setfsuid;
);
setcred!(EventType::SetGid;
    sys_setgid, compat_sys_setgid, sys_setgid_ret, tp_enter_setgid, tp_exit_setgid;
    sys_setregid, compat_sys_setregid, sys_setregid_ret, tp_enter_setregid, tp_exit_setregid;
    sys_setresgid, compat_sys_setresgid, sys_setresgid_ret, tp_enter_setresgid, tp_exit_setresgid;
    sys_setfsgid, compat_sys_setfsgid, sys_setfsgid_ret, tp_enter_setfsgid, tp_exit_setfsgid;
);
setcred!(EventType::Capset;
    sys_capset, compat_sys_capset, sys_capset_ret, tp_enter_capset, tp_exit_capset;
);

// ── network ─────────────────────────────────────────────────────────────────

syscall!(sys_bind, compat_sys_bind, sys_bind_ret, tp_enter_bind, tp_exit_bind;
    |_a| net::sys_bind_enter(KERNEL);
    |r| net::sys_bind_exit(KERNEL, r));

// ── agent requests ──────────────────────────────────────────────────────────

// any other command is returned untouched by the request handler
syscall_entry!(sys_ioctl, compat_sys_ioctl, tp_enter_ioctl;
    |a| handle_erpc_request(KERNEL, a.arg(1), a.arg(2)));
