//! File syscalls.
//!
//! Each syscall caches its arguments at entry, a VFS or LSM hook fills in
//! the file, and the exit hook filters, walks and emits:
//!
//! ```text
//!   open      entry ──► vfs_open ───────────────► exit: filter, walk, emit
//!   mkdir     entry ──► security_path_mkdir ────► exit: refill, filter, walk, emit
//!   unlink    entry ──► security_path_unlink ──► walk (inode still bound) ──► exit: emit
//!   rename    entry ──► security_path_rename ──► walk source ──► exit: walk target, emit
//!   chmod..   entry ──► mnt_want_write ──► security_inode_setattr ──► exit
//! ```
//!
//! Hooks that run before the name is unbound walk the path early and mark
//! the entry `resolved`; the exit hook then only finishes the job.

use crate::consts::{file_flags, RuntimeConst, XATTR_NAME_LEN};
use crate::dentry::{start_resolver, DentryCallback, ResolverError, ResolverInput};
use crate::event::{EventType, File};
use crate::filter::filter_syscall;
use crate::kernel::{Kernel, Next};
use crate::kobj;
use crate::probes::callbacks::emit_syscall;
use crate::syscall_cache::{
    cache_syscall, is_unhandled_error, peek_syscall, pop_syscall, update_syscall, SyscallCache,
    SyscallData,
};

fn cache<K: Kernel>(k: &K, t: EventType, data: SyscallData) -> Next {
    cache_syscall(k, SyscallCache::new(t, data));
    Next::Done
}

// ─────────────────────────────────────────────────────────────────────────────
// Entries
// ─────────────────────────────────────────────────────────────────────────────

/// `open`, `openat`, `openat2`, `creat` and io_uring opens.
pub fn sys_open_enter<K: Kernel>(k: &K, flags: u32, mode: u32) -> Next {
    cache(
        k,
        EventType::Open,
        SyscallData::Open {
            file: File::default(),
            dentry: 0,
            flags,
            mode,
        },
    )
}

pub fn sys_mkdir_enter<K: Kernel>(k: &K, mode: u32) -> Next {
    cache(
        k,
        EventType::Mkdir,
        SyscallData::Mkdir {
            file: File::default(),
            dentry: 0,
            mode,
        },
    )
}

pub fn sys_unlink_enter<K: Kernel>(k: &K, flags: u32) -> Next {
    cache(
        k,
        EventType::Unlink,
        SyscallData::Unlink {
            file: File::default(),
            dentry: 0,
            flags,
        },
    )
}

pub fn sys_rmdir_enter<K: Kernel>(k: &K) -> Next {
    cache(
        k,
        EventType::Rmdir,
        SyscallData::Rmdir {
            file: File::default(),
            dentry: 0,
        },
    )
}

/// `rename*` and `link*`.
pub fn sys_two_files_enter<K: Kernel>(k: &K, t: EventType) -> Next {
    cache(
        k,
        t,
        SyscallData::TwoFiles {
            source: File::default(),
            target: File::default(),
            source_dentry: 0,
            target_dentry: 0,
        },
    )
}

/// Granularity of the second field of a user `struct timespec` or
/// `struct timeval`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimeUnit {
    Nanos,
    Micros,
}

/// Reads a `[timespec; 2]` or `[timeval; 2]` from user memory as
/// nanoseconds. A null or unreadable pointer means "now".
fn read_utimes<K: Kernel>(k: &K, times: u64, unit: TimeUnit) -> (u64, u64) {
    let Some(raw) = k.read_user_value::<[u64; 4]>(times) else {
        let now = k.now_ns();
        return (now, now);
    };
    let scale = match unit {
        TimeUnit::Nanos => 1,
        TimeUnit::Micros => 1_000,
    };
    let ns = |sec: u64, frac: u64| sec.wrapping_mul(1_000_000_000).wrapping_add(frac.wrapping_mul(scale));
    (ns(raw[0], raw[1]), ns(raw[2], raw[3]))
}

/// `chmod`, `chown` and `utimensat` families. `times` is a user
/// `timespec` pointer, only read for UTIMES.
pub fn sys_setattr_enter<K: Kernel>(k: &K, t: EventType, mode: u32, uid: i32, gid: i32, times: u64) -> Next {
    setattr_enter(k, t, mode, uid, gid, times, TimeUnit::Nanos)
}

/// `utimes(2)` and `futimesat(2)` take `timeval`s.
pub fn sys_utimes_enter<K: Kernel>(k: &K, times: u64, unit: TimeUnit) -> Next {
    setattr_enter(k, EventType::Utimes, 0, -1, -1, times, unit)
}

fn setattr_enter<K: Kernel>(k: &K, t: EventType, mode: u32, uid: i32, gid: i32, times: u64, unit: TimeUnit) -> Next {
    let (atime, mtime) = if t == EventType::Utimes {
        read_utimes(k, times, unit)
    } else {
        (0, 0)
    };
    cache(
        k,
        t,
        SyscallData::Setattr {
            file: File::default(),
            dentry: 0,
            mode,
            uid,
            gid,
            atime,
            mtime,
        },
    )
}

/// `setxattr` and `removexattr` families; `name` is a user string.
pub fn sys_xattr_enter<K: Kernel>(k: &K, t: EventType, name: u64) -> Next {
    let mut buf = [0u8; XATTR_NAME_LEN];
    if k.read_user_str(name, &mut buf).is_none() {
        buf[0] = 0;
    }
    cache(
        k,
        t,
        SyscallData::Xattr {
            file: File::default(),
            dentry: 0,
            name: buf,
        },
    )
}

pub fn sys_chdir_enter<K: Kernel>(k: &K) -> Next {
    cache(
        k,
        EventType::Chdir,
        SyscallData::Chdir {
            file: File::default(),
            dentry: 0,
        },
    )
}

pub fn sys_mmap_enter<K: Kernel>(k: &K, addr: u64, len: u64, prot: u32, flags: u32, offset: u64) -> Next {
    cache(
        k,
        EventType::Mmap,
        SyscallData::Mmap {
            file: File::default(),
            dentry: 0,
            addr,
            offset,
            len,
            prot,
            flags,
        },
    )
}

pub fn sys_mprotect_enter<K: Kernel>(k: &K, req_prot: u64) -> Next {
    cache(
        k,
        EventType::Mprotect,
        SyscallData::Mprotect {
            vm_start: 0,
            vm_end: 0,
            vm_prot: 0,
            req_prot,
        },
    )
}

pub fn sys_splice_enter<K: Kernel>(k: &K) -> Next {
    cache(
        k,
        EventType::Splice,
        SyscallData::Splice {
            file: File::default(),
            dentry: 0,
            pipe: 0,
            entry_flag: 0,
            exit_flag: 0,
        },
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// VFS and LSM hooks
// ─────────────────────────────────────────────────────────────────────────────

fn fill_primary<K: Kernel>(k: &K, t: EventType, dentry: u64, mount_id: u32) {
    let _ = update_syscall(k, t, |entry| {
        if let Some((file, slot)) = entry.primary_file_mut() {
            kobj::fill_file(k, file, dentry, mount_id, false);
            *slot = dentry;
        }
    });
}

/// `vfs_open(path, file)`.
pub fn handle_vfs_open<K: Kernel>(k: &K, path: u64) -> Next {
    let (dentry, mnt) = kobj::path_parts(k, path);
    fill_primary(k, EventType::Open, dentry, kobj::vfsmount_mount_id(k, mnt));
    Next::Done
}

/// `security_path_mkdir(dir, dentry, mode)`: the dentry is still negative.
pub fn handle_security_path_mkdir<K: Kernel>(k: &K, dir: u64, dentry: u64) -> Next {
    let (_, mnt) = kobj::path_parts(k, dir);
    fill_primary(k, EventType::Mkdir, dentry, kobj::vfsmount_mount_id(k, mnt));
    Next::Done
}

/// Walks the primary file now, while its name is still bound to the inode.
fn pre_resolve<K: Kernel>(k: &K, t: EventType) -> Next {
    let Some(entry) = peek_syscall(k, t) else {
        return Next::Done;
    };
    let verdict = filter_syscall(k, &entry);
    if verdict.is_discard() {
        let _ = update_syscall(k, t, |e| e.discarded = true);
        return Next::Done;
    }
    let Some((file, dentry)) = entry.primary_file() else {
        return Next::Done;
    };
    let _ = update_syscall(k, t, |e| e.resolved = true);
    start_resolver(
        k,
        ResolverInput::new(file.path_key, dentry, verdict.discarder_event_type(), DentryCallback::None),
    )
}

/// `security_path_unlink(dir, dentry)`.
pub fn handle_security_path_unlink<K: Kernel>(k: &K, dir: u64, dentry: u64) -> Next {
    let (_, mnt) = kobj::path_parts(k, dir);
    let mount_id = kobj::vfsmount_mount_id(k, mnt);
    let _ = update_syscall(k, EventType::Unlink, |entry| {
        if let SyscallData::Unlink { file, dentry: slot, .. } = &mut entry.data {
            kobj::fill_file(k, file, dentry, mount_id, true);
            *slot = dentry;
        }
    });
    pre_resolve(k, EventType::Unlink)
}

/// `security_path_rmdir(dir, dentry)`.
pub fn handle_security_path_rmdir<K: Kernel>(k: &K, dir: u64, dentry: u64) -> Next {
    let (_, mnt) = kobj::path_parts(k, dir);
    let mount_id = kobj::vfsmount_mount_id(k, mnt);
    let _ = update_syscall(k, EventType::Rmdir, |entry| {
        if let SyscallData::Rmdir { file, dentry: slot } = &mut entry.data {
            kobj::fill_file(k, file, dentry, mount_id, true);
            *slot = dentry;
        }
    });
    pre_resolve(k, EventType::Rmdir)
}

/// Fills both files of a RENAME or LINK. The target is keyed with the
/// source inode under a fresh path id, so both walks can coexist in the
/// path cache.
fn fill_two_files<K: Kernel>(k: &K, t: EventType, source_dentry: u64, target_dentry: u64, mount_id: u32) {
    let _ = update_syscall(k, t, |entry| {
        if let SyscallData::TwoFiles {
            source,
            target,
            source_dentry: src_slot,
            target_dentry: dst_slot,
        } = &mut entry.data
        {
            kobj::fill_file(k, source, source_dentry, mount_id, true);
            *target = *source;
            target.flags &= !file_flags::PATH_ID_INVALIDATED;
            target.path_key.path_id = crate::path::get_path_id(k, mount_id, false);
            *src_slot = source_dentry;
            *dst_slot = target_dentry;
        }
    });
}

/// `security_path_rename(old_dir, old_dentry, new_dir, new_dentry)`.
pub fn handle_security_path_rename<K: Kernel>(k: &K, old_dir: u64, old_dentry: u64, new_dentry: u64) -> Next {
    let (_, mnt) = kobj::path_parts(k, old_dir);
    fill_two_files(k, EventType::Rename, old_dentry, new_dentry, kobj::vfsmount_mount_id(k, mnt));
    pre_resolve(k, EventType::Rename)
}

/// `security_path_link(old_dentry, new_dir, new_dentry)`.
pub fn handle_security_path_link<K: Kernel>(k: &K, old_dentry: u64, new_dir: u64, new_dentry: u64) -> Next {
    let (_, mnt) = kobj::path_parts(k, new_dir);
    fill_two_files(k, EventType::Link, old_dentry, new_dentry, kobj::vfsmount_mount_id(k, mnt));
    pre_resolve(k, EventType::Link)
}

fn is_mount_scoped(t: EventType) -> bool {
    matches!(
        t,
        EventType::Chmod
            | EventType::Chown
            | EventType::Utimes
            | EventType::SetXattr
            | EventType::RemoveXattr
    )
}

/// `mnt_want_write(vfsmount)`: the only place the mount of an attribute
/// change is visible.
pub fn handle_mnt_want_write<K: Kernel>(k: &K, vfsmount: u64) -> Next {
    let mount_id = kobj::vfsmount_mount_id(k, vfsmount);
    let _ = update_syscall(k, EventType::Any, |entry| {
        if !is_mount_scoped(entry.event_type) {
            return;
        }
        if let Some((file, _)) = entry.primary_file_mut() {
            file.path_key.mount_id = mount_id;
        }
    });
    Next::Done
}

fn fill_on_cached_mount<K: Kernel>(k: &K, dentry: u64) {
    let _ = update_syscall(k, EventType::Any, |entry| {
        if !is_mount_scoped(entry.event_type) {
            return;
        }
        if let Some((file, slot)) = entry.primary_file_mut() {
            let mount_id = file.path_key.mount_id;
            kobj::fill_file(k, file, dentry, mount_id, false);
            *slot = dentry;
        }
    });
}

/// `security_inode_setattr(dentry, iattr)`.
pub fn handle_security_inode_setattr<K: Kernel>(k: &K, dentry: u64) -> Next {
    fill_on_cached_mount(k, dentry);
    Next::Done
}

/// `vfs_setxattr` / `vfs_removexattr`.
pub fn handle_vfs_xattr<K: Kernel>(k: &K, dentry: u64) -> Next {
    fill_on_cached_mount(k, dentry);
    Next::Done
}

/// `set_fs_pwd(fs, path)`.
pub fn handle_set_fs_pwd<K: Kernel>(k: &K, path: u64) -> Next {
    let (dentry, mnt) = kobj::path_parts(k, path);
    fill_primary(k, EventType::Chdir, dentry, kobj::vfsmount_mount_id(k, mnt));
    Next::Done
}

/// `security_mmap_file(file, prot, flags)`.
pub fn handle_security_mmap_file<K: Kernel>(k: &K, kfile: u64) -> Next {
    if kfile == 0 {
        return Next::Done;
    }
    let _ = update_syscall(k, EventType::Mmap, |entry| {
        if let SyscallData::Mmap { file, dentry, .. } = &mut entry.data {
            *dentry = kobj::fill_file_from_kfile(k, file, kfile);
        }
    });
    Next::Done
}

/// `security_file_mprotect(vma, reqprot, prot)`.
pub fn handle_security_file_mprotect<K: Kernel>(k: &K, vma: u64) -> Next {
    let start = k.read_at::<u64>(vma, RuntimeConst::VmaStart).unwrap_or(0);
    let end = k.read_at::<u64>(vma, RuntimeConst::VmaEnd).unwrap_or(0);
    let flags = k.read_at::<u64>(vma, RuntimeConst::VmaFlags).unwrap_or(0);
    let _ = update_syscall(k, EventType::Mprotect, |entry| {
        if let SyscallData::Mprotect {
            vm_start,
            vm_end,
            vm_prot,
            ..
        } = &mut entry.data
        {
            *vm_start = start;
            *vm_end = end;
            *vm_prot = flags;
        }
    });
    Next::Done
}

fn pipe_buf_flags<K: Kernel>(k: &K, pipe: u64) -> u32 {
    let bufs = k.read_at::<u64>(pipe, RuntimeConst::PipeBufs).unwrap_or(0);
    k.read_at::<u32>(bufs, RuntimeConst::PipeBufFlags).unwrap_or(0)
}

/// `get_pipe_info(file, for_splice)` exit, with the pipe it returned.
pub fn handle_get_pipe_info_exit<K: Kernel>(k: &K, kfile: u64, pipe: u64) -> Next {
    if pipe == 0 {
        return Next::Done;
    }
    let flag = pipe_buf_flags(k, pipe);
    let _ = update_syscall(k, EventType::Splice, |entry| {
        if let SyscallData::Splice {
            file,
            dentry,
            pipe: slot,
            entry_flag,
            ..
        } = &mut entry.data
        {
            *dentry = kobj::fill_file_from_kfile(k, file, kfile);
            *slot = pipe;
            *entry_flag = flag;
        }
    });
    Next::Done
}

// ─────────────────────────────────────────────────────────────────────────────
// Exit
// ─────────────────────────────────────────────────────────────────────────────

/// Failures that leave nothing worth reporting.
pub fn resolution_failed(input: &ResolverInput) -> bool {
    matches!(
        input.failed(),
        Some(ResolverError::Invalid | ResolverError::Discarded | ResolverError::Error)
    )
}

fn refresh_before_exit<K: Kernel>(k: &K, entry: &mut SyscallCache, retval: i64) {
    entry.retval = retval;
    match &mut entry.data {
        // the new inode only exists once the syscall returns
        SyscallData::Mkdir { file, dentry, .. } if file.path_key.ino == 0 && *dentry != 0 => {
            let mount_id = file.path_key.mount_id;
            kobj::fill_file(k, file, *dentry, mount_id, false);
        }
        SyscallData::Mmap { file, dentry, addr, .. } => {
            if retval > 0 {
                *addr = retval as u64;
            }
            if *dentry == 0 {
                file.flags |= file_flags::FILELESS;
            }
        }
        SyscallData::Splice { pipe, exit_flag, .. } if *pipe != 0 => {
            *exit_flag = pipe_buf_flags(k, *pipe);
        }
        _ => {}
    }
}

/// Shared tail of every file syscall exit.
pub fn sys_exit_common<K: Kernel>(k: &K, t: EventType, retval: i64) -> Next {
    let Some(mut entry) = peek_syscall(k, t) else {
        return Next::Done;
    };
    if is_unhandled_error(retval) || entry.discarded || (entry.resolved && resolution_failed(&entry.resolver)) {
        let _ = pop_syscall(k, t);
        return Next::Done;
    }
    refresh_before_exit(k, &mut entry, retval);

    if entry.resolved {
        // the source was walked early; LINK and RENAME still need the target
        if let Some(next) = crate::probes::callbacks::next_walk(&entry) {
            let _ = update_syscall(k, t, |e| *e = entry);
            return start_resolver(k, next);
        }
        if let Some(entry) = pop_syscall(k, t) {
            emit_syscall(k, &SyscallCache { retval, ..entry });
        }
        return Next::Done;
    }

    let verdict = filter_syscall(k, &entry);
    if verdict.is_discard() {
        let _ = pop_syscall(k, t);
        return Next::Done;
    }
    match entry.primary_file() {
        Some((file, dentry)) if dentry != 0 => {
            let _ = update_syscall(k, t, |e| *e = entry);
            start_resolver(
                k,
                ResolverInput::new(file.path_key, dentry, verdict.discarder_event_type(), DentryCallback::EmitSyscall),
            )
        }
        _ => {
            let _ = pop_syscall(k, t);
            emit_syscall(k, &entry);
            Next::Done
        }
    }
}

/// `unlinkat(2)` exit: the entry hook cached UNLINK or RMDIR depending on
/// `AT_REMOVEDIR`.
pub fn sys_unlinkat_exit<K: Kernel>(k: &K, retval: i64) -> Next {
    match peek_syscall(k, EventType::Any).map(|entry| entry.event_type) {
        Some(t @ (EventType::Unlink | EventType::Rmdir)) => sys_exit_common(k, t, retval),
        _ => Next::Done,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvers::{BasenameKey, FilterPolicy, POLICY_FLAG_BASENAME, POLICY_MODE_DENY};
    use crate::consts::event_flags;
    use crate::erpc::read_path;
    use crate::event::{MmapEvent, OpenEvent, SetattrEvent, TwoFileEvent, UnlinkEvent};
    use crate::kernel::{Map, UpdateFlag};
    use crate::sim::SimKernel;

    struct Fs {
        k: SimKernel,
        mnt: u64,
        root: u64,
    }

    fn fs(events: &[EventType]) -> Fs {
        let k = SimKernel::new();
        k.enable_events(events);
        k.spawn_task(100, 100, 1);
        k.set_current(100, 100);
        let root = k.root_dentry(2);
        let mnt = k.add_mount(1, root, 0, 0);
        Fs { k, mnt, root }
    }

    impl Fs {
        fn open(&self, dentry: u64, flags: u32) -> Next {
            sys_open_enter(&self.k, flags, 0);
            let path = self.k.alloc_path(self.mnt, dentry);
            handle_vfs_open(&self.k, path);
            self.k.run(sys_exit_common(&self.k, EventType::Open, 3))
        }
    }

    #[test]
    fn open_emits_a_resolved_path() {
        let f = fs(&[EventType::Open]);
        let etc = f.k.add_dentry(f.root, "etc", 10);
        let passwd = f.k.add_dentry(etc, "passwd", 11);
        f.open(passwd, 0);

        let events = f.k.events_of(EventType::Open);
        assert_eq!(events.len(), 1);
        let ev: OpenEvent = events[0].decode();
        assert_eq!(ev.syscall.retval, 3);
        assert_eq!(ev.file.path_key.ino, 11);
        assert_eq!(ev.file.path_key.mount_id, 1);
        assert_eq!(ev.base.process.pid, 100);
        assert_eq!(read_path(&f.k, ev.file.path_key).as_deref(), Some("/etc/passwd"));
        assert!(peek_syscall(&f.k, EventType::Any).is_none());
    }

    #[test]
    fn failed_syscalls_emit_nothing_but_permission_errors_do() {
        let f = fs(&[EventType::Open]);
        let file = f.k.add_dentry(f.root, "shadow", 12);
        sys_open_enter(&f.k, 0, 0);
        handle_vfs_open(&f.k, f.k.alloc_path(f.mnt, file));
        f.k.run(sys_exit_common(&f.k, EventType::Open, -2));
        assert!(f.k.events_of(EventType::Open).is_empty());

        sys_open_enter(&f.k, 0, 0);
        handle_vfs_open(&f.k, f.k.alloc_path(f.mnt, file));
        f.k.run(sys_exit_common(&f.k, EventType::Open, -13));
        assert_eq!(f.k.events_of(EventType::Open).len(), 1);
    }

    #[test]
    fn deny_policy_drops_unapproved_opens() {
        let f = fs(&[EventType::Open]);
        f.k.filter_policy()
            .store(
                &(EventType::Open as u32),
                &FilterPolicy {
                    mode: POLICY_MODE_DENY,
                    flags: POLICY_FLAG_BASENAME,
                },
                UpdateFlag::Any,
            )
            .unwrap();
        f.k.basename_approvers()
            .store(&BasenameKey::new(b"secret.txt"), &EventType::Open.mask(), UpdateFlag::Any)
            .unwrap();
        let secret = f.k.add_dentry(f.root, "secret.txt", 20);
        let other = f.k.add_dentry(f.root, "other.txt", 21);
        f.open(other, 0);
        f.open(secret, 0);
        let events = f.k.events_of(EventType::Open);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].decode::<OpenEvent>().file.path_key.ino, 20);
    }

    #[test]
    fn unlink_walks_before_the_name_goes_away() {
        let f = fs(&[EventType::Unlink]);
        let tmp = f.k.add_dentry(f.root, "tmp", 10);
        let victim = f.k.add_dentry(tmp, "victim", 11);
        sys_unlink_enter(&f.k, 0);
        let dir = f.k.alloc_path(f.mnt, tmp);
        f.k.run(handle_security_path_unlink(&f.k, dir, victim));
        assert!(peek_syscall(&f.k, EventType::Unlink).unwrap().resolved);

        // the kernel unbinds the name before the syscall returns
        f.k.detach_dentry(victim);
        f.k.run(sys_exit_common(&f.k, EventType::Unlink, 0));

        let ev: UnlinkEvent = f.k.events_of(EventType::Unlink)[0].decode();
        assert_ne!(ev.file.flags & file_flags::PATH_ID_INVALIDATED, 0);
        assert_eq!(read_path(&f.k, ev.file.path_key).as_deref(), Some("/tmp/victim"));
    }

    #[test]
    fn rename_reports_both_paths() {
        let f = fs(&[EventType::Rename]);
        let a = f.k.add_dentry(f.root, "a", 10);
        let b = f.k.add_dentry(f.root, "b", 11);
        let file = f.k.add_dentry(a, "old.txt", 30);
        let target = f.k.add_dentry(b, "new.txt", 0);

        sys_two_files_enter(&f.k, EventType::Rename);
        let dir = f.k.alloc_path(f.mnt, a);
        f.k.run(handle_security_path_rename(&f.k, dir, file, target));
        f.k.move_dentry(file, b, "new.txt");
        f.k.run(sys_exit_common(&f.k, EventType::Rename, 0));

        let ev: TwoFileEvent = f.k.events_of(EventType::Rename)[0].decode();
        assert_eq!(ev.source.path_key.ino, 30);
        assert_eq!(ev.target.path_key.ino, 30);
        assert_ne!(ev.source.path_key.path_id, ev.target.path_key.path_id);
        assert_eq!(read_path(&f.k, ev.source.path_key).as_deref(), Some("/a/old.txt"));
        assert_eq!(read_path(&f.k, ev.target.path_key).as_deref(), Some("/b/new.txt"));
    }

    #[test]
    fn chmod_takes_its_mount_from_mnt_want_write() {
        let f = fs(&[EventType::Chmod]);
        let file = f.k.add_dentry(f.root, "script.sh", 40);
        sys_setattr_enter(&f.k, EventType::Chmod, 0o755, -1, -1, 0);
        handle_mnt_want_write(&f.k, f.mnt);
        handle_security_inode_setattr(&f.k, file);
        f.k.run(sys_exit_common(&f.k, EventType::Chmod, 0));

        let ev: SetattrEvent = f.k.events_of(EventType::Chmod)[0].decode();
        assert_eq!(ev.mode, 0o755);
        assert_eq!(ev.file.path_key.mount_id, 1);
        assert_eq!(read_path(&f.k, ev.file.path_key).as_deref(), Some("/script.sh"));
    }

    #[test]
    fn utimes_scales_timevals() {
        let f = fs(&[EventType::Utimes]);
        let file = f.k.add_dentry(f.root, "stamp", 41);
        let times = f.k.alloc_user(32);
        let raw: [u64; 4] = [10, 5, 20, 7];
        let bytes: Vec<u8> = raw.iter().flat_map(|v| v.to_ne_bytes()).collect();
        f.k.write_user_bytes(times, &bytes);
        sys_utimes_enter(&f.k, times, TimeUnit::Micros);
        handle_mnt_want_write(&f.k, f.mnt);
        handle_security_inode_setattr(&f.k, file);
        f.k.run(sys_exit_common(&f.k, EventType::Utimes, 0));

        let ev: SetattrEvent = f.k.events_of(EventType::Utimes)[0].decode();
        assert_eq!(ev.atime, 10_000_005_000);
        assert_eq!(ev.mtime, 20_000_007_000);
    }

    #[test]
    fn unlinkat_exit_follows_the_cached_type() {
        let f = fs(&[EventType::Rmdir]);
        let dir = f.k.add_dentry(f.root, "gone", 42);
        sys_rmdir_enter(&f.k);
        f.k.run(handle_security_path_rmdir(&f.k, f.k.alloc_path(f.mnt, f.root), dir));
        f.k.detach_dentry(dir);
        f.k.run(sys_unlinkat_exit(&f.k, 0));
        assert_eq!(f.k.events_of(EventType::Rmdir).len(), 1);
        assert!(peek_syscall(&f.k, EventType::Any).is_none());
    }

    #[test]
    fn anonymous_mmap_is_fileless() {
        let f = fs(&[EventType::Mmap]);
        sys_mmap_enter(&f.k, 0, 4096, 0x7, 0x22, 0);
        f.k.run(sys_exit_common(&f.k, EventType::Mmap, 0x7f00_0000_0000));
        let ev: MmapEvent = f.k.events_of(EventType::Mmap)[0].decode();
        assert_eq!(ev.addr, 0x7f00_0000_0000);
        assert_eq!(ev.protection, 0x7);
        assert_ne!(ev.file.flags & file_flags::FILELESS, 0);
    }

    #[test]
    fn async_opens_are_attributed_to_the_submitter() {
        let f = fs(&[EventType::Open]);
        let file = f.k.add_dentry(f.root, "data", 50);
        f.k.spawn_task(300, 301, 1);
        f.k.set_current(300, 301);
        crate::syscall_cache::begin_async(&f.k, (100u64 << 32) | 100);
        f.open(file, 0);
        crate::syscall_cache::end_async(&f.k);

        let ev: OpenEvent = f.k.events_of(EventType::Open)[0].decode();
        assert_eq!(ev.base.process.pid, 100);
        assert_ne!(ev.base.header.flags & event_flags::ASYNC, 0);
    }
}
