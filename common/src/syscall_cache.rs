//! Per-task syscall cache.
//!
//! One slot per `pid_tgid`. The entry hook caches, intermediate hooks peek
//! and fill in, the exit hook (or the last program of its tail-call chain)
//! pops:
//!
//! ```text
//!   sys_enter ──cache──► [ slot ] ◄──peek/update── security_*, vfs_*, mnt_want_write
//!                           │
//!   sys_exit ──────peek─────┤──► filter ──► dentry resolver ──► callback ──pop──► emit
//!   do_exit  ──pop(ANY)─────┘
//! ```

use crate::approvers::{self, FilterPolicy};
use crate::consts::MAX_ARG_SIZE;
use crate::dentry::ResolverInput;
use crate::event::{EventType, File, MountFields};
use crate::kernel::{plain, Kernel, Map, UpdateFlag};
use crate::stats;

/// Arguments collected for one syscall, by event family.
#[derive(Clone, Copy, Debug)]
pub enum SyscallData {
    Open {
        file: File,
        dentry: u64,
        flags: u32,
        mode: u32,
    },
    Mkdir {
        file: File,
        dentry: u64,
        mode: u32,
    },
    Unlink {
        file: File,
        dentry: u64,
        flags: u32,
    },
    Rmdir {
        file: File,
        dentry: u64,
    },
    /// RENAME and LINK.
    TwoFiles {
        source: File,
        target: File,
        source_dentry: u64,
        target_dentry: u64,
    },
    /// CHMOD, CHOWN and UTIMES.
    Setattr {
        file: File,
        dentry: u64,
        mode: u32,
        uid: i32,
        gid: i32,
        atime: u64,
        mtime: u64,
    },
    Xattr {
        file: File,
        dentry: u64,
        name: [u8; 200],
    },
    Chdir {
        file: File,
        dentry: u64,
    },
    Mmap {
        file: File,
        dentry: u64,
        addr: u64,
        offset: u64,
        len: u64,
        prot: u32,
        flags: u32,
    },
    Mprotect {
        vm_start: u64,
        vm_end: u64,
        vm_prot: u64,
        req_prot: u64,
    },
    Splice {
        file: File,
        dentry: u64,
        pipe: u64,
        entry_flag: u32,
        exit_flag: u32,
    },
    Mount {
        fields: MountFields,
        mountpoint_dentry: u64,
    },
    Umount {
        mount_id: u32,
    },
    Exec {
        executable: File,
        interpreter: File,
        executable_dentry: u64,
        interpreter_dentry: u64,
    },
    /// SETUID, SETGID and CAPSET read the pid cache at exit.
    SetCred,
    Bind {
        /// `struct socket` seen by `inet_bind`.
        socket: u64,
        addr: [u8; 16],
        family: u16,
        port: u16,
        protocol: u16,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct SyscallCache {
    pub event_type: EventType,
    pub is_async: bool,
    pub discarded: bool,
    /// Set once a hook walked the paths ahead of the exit hook.
    pub resolved: bool,
    pub policy: FilterPolicy,
    pub resolver: ResolverInput,
    pub ctx_id: u32,
    /// Task the event is attributed to; zero for the caching task.
    pub submitter: u64,
    pub retval: i64,
    pub data: SyscallData,
}

impl SyscallCache {
    pub fn new(event_type: EventType, data: SyscallData) -> Self {
        Self {
            event_type,
            is_async: false,
            discarded: false,
            resolved: false,
            policy: FilterPolicy::default(),
            resolver: ResolverInput::default(),
            ctx_id: 0,
            submitter: 0,
            retval: 0,
            data,
        }
    }

    /// The file and dentry the event is about, if any.
    pub fn primary_file(&self) -> Option<(File, u64)> {
        match self.data {
            SyscallData::Open { file, dentry, .. }
            | SyscallData::Mkdir { file, dentry, .. }
            | SyscallData::Unlink { file, dentry, .. }
            | SyscallData::Rmdir { file, dentry }
            | SyscallData::Setattr { file, dentry, .. }
            | SyscallData::Xattr { file, dentry, .. }
            | SyscallData::Chdir { file, dentry }
            | SyscallData::Mmap { file, dentry, .. }
            | SyscallData::Splice { file, dentry, .. } => Some((file, dentry)),
            SyscallData::TwoFiles {
                source,
                source_dentry,
                ..
            } => Some((source, source_dentry)),
            SyscallData::Exec {
                executable,
                executable_dentry,
                ..
            } => Some((executable, executable_dentry)),
            _ => None,
        }
    }

    /// Mutable access to the primary file, for hooks that fill it in.
    pub fn primary_file_mut(&mut self) -> Option<(&mut File, &mut u64)> {
        match &mut self.data {
            SyscallData::Open { file, dentry, .. }
            | SyscallData::Mkdir { file, dentry, .. }
            | SyscallData::Unlink { file, dentry, .. }
            | SyscallData::Rmdir { file, dentry }
            | SyscallData::Setattr { file, dentry, .. }
            | SyscallData::Xattr { file, dentry, .. }
            | SyscallData::Chdir { file, dentry }
            | SyscallData::Mmap { file, dentry, .. }
            | SyscallData::Splice { file, dentry, .. } => Some((file, dentry)),
            SyscallData::TwoFiles {
                source,
                source_dentry,
                ..
            } => Some((source, source_dentry)),
            SyscallData::Exec {
                executable,
                executable_dentry,
                ..
            } => Some((executable, executable_dentry)),
            _ => None,
        }
    }
}

/// Raw argument snapshot referenced by `SyscallContext::ctx_id`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SyscallArgs {
    pub args: [u64; 6],
    pub str_len: u32,
    pub _pad: u32,
    pub str_arg: [u8; MAX_ARG_SIZE],
}

plain!(SyscallArgs);

/// Caches `entry` for the current task.
///
/// Refused for the agent itself and for disabled event types. A live entry
/// of the same task is overwritten and counted as lost.
pub fn cache_syscall<K: Kernel>(k: &K, mut entry: SyscallCache) -> bool {
    let t = entry.event_type;
    if k.is_agent() {
        stats::syscall(k, t, |s| s.self_filtered += 1);
        return false;
    }
    if !approvers::is_event_enabled(k, t) {
        return false;
    }
    entry.policy = approvers::policy_of(k, t);

    let key = k.pid_tgid();
    if let Some(submitter) = k.async_submitters().lookup(&key) {
        entry.is_async = true;
        entry.submitter = submitter;
    }
    if let Some(previous) = k.syscalls().lookup(&key) {
        stats::syscall(k, previous.event_type, |s| s.overwritten += 1);
    }
    if k.syscalls().store(&key, &entry, UpdateFlag::Any).is_err() {
        return false;
    }
    stats::syscall(k, t, |s| s.cached += 1);
    true
}

/// Caches an entry whose side effects on the process cache are needed even
/// when its event type is disabled. Emission checks the enabled mask.
pub fn cache_tracked_syscall<K: Kernel>(k: &K, mut entry: SyscallCache) -> bool {
    if k.is_agent() {
        stats::syscall(k, entry.event_type, |s| s.self_filtered += 1);
        return false;
    }
    entry.policy = approvers::policy_of(k, entry.event_type);
    let key = k.pid_tgid();
    if let Some(previous) = k.syscalls().lookup(&key) {
        stats::syscall(k, previous.event_type, |s| s.overwritten += 1);
    }
    if k.syscalls().store(&key, &entry, UpdateFlag::Any).is_err() {
        return false;
    }
    stats::syscall(k, entry.event_type, |s| s.cached += 1);
    true
}

fn matches(entry: &SyscallCache, t: EventType) -> bool {
    t == EventType::Any || entry.event_type == t
}

pub fn peek_syscall<K: Kernel>(k: &K, t: EventType) -> Option<SyscallCache> {
    k.syscalls()
        .lookup(&k.pid_tgid())
        .filter(|entry| matches(entry, t))
}

pub fn peek_syscall_with<K: Kernel>(
    k: &K,
    predicate: impl FnOnce(&SyscallCache) -> bool,
) -> Option<SyscallCache> {
    k.syscalls().lookup(&k.pid_tgid()).filter(predicate)
}

/// Mutates the current entry in place if it has type `t`.
pub fn update_syscall<K: Kernel, R>(
    k: &K,
    t: EventType,
    f: impl FnOnce(&mut SyscallCache) -> R,
) -> Option<R> {
    k.syscalls().with_mut(&k.pid_tgid(), |entry| {
        if matches(entry, t) {
            Some(f(entry))
        } else {
            None
        }
    })?
}

fn pop_key<K: Kernel>(k: &K, key: u64, predicate: impl FnOnce(&SyscallCache) -> bool) -> Option<SyscallCache> {
    let entry = k.syscalls().lookup(&key).filter(predicate)?;
    let _ = k.syscalls().delete(&key);
    stats::syscall(k, entry.event_type, |s| s.popped += 1);
    Some(entry)
}

pub fn pop_syscall<K: Kernel>(k: &K, t: EventType) -> Option<SyscallCache> {
    pop_key(k, k.pid_tgid(), |entry| matches(entry, t))
}

pub fn pop_syscall_with<K: Kernel>(
    k: &K,
    predicate: impl FnOnce(&SyscallCache) -> bool,
) -> Option<SyscallCache> {
    pop_key(k, k.pid_tgid(), predicate)
}

/// Records that a non-leader thread of the current group entered exec.
///
/// The kernel may hand the leader's pid to the execing thread before the
/// exit hook runs; the transfer entry lets that hook find the cached exec.
pub fn mark_exec_pid_transfer<K: Kernel>(k: &K) {
    let pid_tgid = k.pid_tgid();
    if pid_tgid as u32 == (pid_tgid >> 32) as u32 {
        return;
    }
    let _ = k
        .exec_pid_transfer()
        .store(&k.tgid(), &pid_tgid, UpdateFlag::Any);
}

/// True while an exec by another thread of the group is in flight.
pub fn exec_transfer_pending<K: Kernel>(k: &K, tgid: u32) -> bool {
    k.exec_pid_transfer().contains(&tgid)
}

pub fn pop_current_or_impersonated_exec_syscall<K: Kernel>(k: &K) -> Option<SyscallCache> {
    let tgid = k.tgid();
    let transfer = k.exec_pid_transfer().lookup(&tgid);
    if transfer.is_some() {
        let _ = k.exec_pid_transfer().delete(&tgid);
    }
    if let Some(entry) = pop_syscall(k, EventType::Exec) {
        return Some(entry);
    }
    pop_key(k, transfer?, |entry| entry.event_type == EventType::Exec)
}

/// Stores `entry` back under the current task, after an impersonated pop.
pub fn restore_syscall<K: Kernel>(k: &K, entry: &SyscallCache) -> bool {
    k.syscalls()
        .store(&k.pid_tgid(), entry, UpdateFlag::Any)
        .is_ok()
}

/// Brackets an io_uring request handled by a worker on behalf of `submitter`.
pub fn begin_async<K: Kernel>(k: &K, submitter: u64) {
    let _ = k
        .async_submitters()
        .store(&k.pid_tgid(), &submitter, UpdateFlag::Any);
}

pub fn end_async<K: Kernel>(k: &K) {
    let _ = k.async_submitters().delete(&k.pid_tgid());
}

/// Snapshots raw arguments and an optional user string; returns the id.
pub fn snapshot_args<K: Kernel>(k: &K, args: [u64; 6], user_str: u64) -> u32 {
    let id = k.random_u32() | 1;
    let mut snapshot = SyscallArgs {
        args,
        str_len: 0,
        _pad: 0,
        str_arg: [0; MAX_ARG_SIZE],
    };
    if user_str != 0 {
        snapshot.str_len = k.read_user_str(user_str, &mut snapshot.str_arg).unwrap_or(0) as u32;
    }
    match k.syscall_ctx().store(&id, &snapshot, UpdateFlag::Any) {
        Ok(()) => id,
        Err(_) => 0,
    }
}

/// Unhandled syscall failures produce no event. Permission errors still do.
pub fn is_unhandled_error(retval: i64) -> bool {
    retval < 0 && retval != -crate::consts::EACCES && retval != -crate::consts::EPERM
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::RuntimeConst;
    use crate::sim::SimKernel;

    fn open_entry() -> SyscallCache {
        SyscallCache::new(
            EventType::Open,
            SyscallData::Open {
                file: File::default(),
                dentry: 0,
                flags: 0,
                mode: 0,
            },
        )
    }

    #[test]
    fn single_slot_per_task() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Open, EventType::Mkdir]);
        k.set_current(100, 100);
        assert!(cache_syscall(&k, open_entry()));
        assert!(peek_syscall(&k, EventType::Open).is_some());
        assert!(peek_syscall(&k, EventType::Mkdir).is_none());

        let mkdir = SyscallCache::new(
            EventType::Mkdir,
            SyscallData::Mkdir {
                file: File::default(),
                dentry: 0,
                mode: 0,
            },
        );
        assert!(cache_syscall(&k, mkdir));
        assert!(peek_syscall(&k, EventType::Open).is_none());
        assert_eq!(k.syscall_stats_of(EventType::Open).overwritten, 1);
        assert!(pop_syscall(&k, EventType::Mkdir).is_some());
        assert!(pop_syscall(&k, EventType::Any).is_none());
    }

    #[test]
    fn disabled_events_and_agent_are_not_cached() {
        let k = SimKernel::new();
        k.set_current(100, 100);
        assert!(!cache_syscall(&k, open_entry()));

        k.enable_events(&[EventType::Open]);
        k.set_constant(RuntimeConst::RuntimePid, 100);
        assert!(!cache_syscall(&k, open_entry()));
        assert_eq!(k.syscall_stats_of(EventType::Open).self_filtered, 1);
    }

    #[test]
    fn async_requests_are_attributed_to_the_submitter() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Open]);
        k.set_current(300, 301);
        let submitter = (42u64 << 32) | 42;
        begin_async(&k, submitter);
        assert!(cache_syscall(&k, open_entry()));
        let entry = pop_syscall(&k, EventType::Open).unwrap();
        assert!(entry.is_async);
        assert_eq!(entry.submitter, submitter);
        end_async(&k);
        assert!(cache_syscall(&k, open_entry()));
        assert!(!pop_syscall(&k, EventType::Open).unwrap().is_async);
    }

    #[test]
    fn exec_entry_survives_pid_transfer() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Exec]);
        // thread 501 of group 500 execs
        k.set_current(500, 501);
        mark_exec_pid_transfer(&k);
        let exec = SyscallCache::new(
            EventType::Exec,
            SyscallData::Exec {
                executable: File::default(),
                interpreter: File::default(),
                executable_dentry: 0,
                interpreter_dentry: 0,
            },
        );
        assert!(cache_syscall(&k, exec));

        // the kernel handed it the leader's pid
        k.set_current(500, 500);
        assert!(exec_transfer_pending(&k, 500));
        assert!(pop_current_or_impersonated_exec_syscall(&k).is_some());
        assert!(!exec_transfer_pending(&k, 500));
    }

    #[test]
    fn permission_errors_are_handled() {
        assert!(!is_unhandled_error(0));
        assert!(!is_unhandled_error(-13));
        assert!(!is_unhandled_error(-1));
        assert!(is_unhandled_error(-2));
    }
}
