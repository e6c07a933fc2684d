//! Process, credentials and user-session correlation.
//!
//! ```text
//!   pid_cache[tgid] ──cookie──► proc_cache[cookie]
//!   { ppid, fork/exit ts,        { executable, container,
//!     credentials }                exec ts, tty, comm, refs }
//! ```
//!
//! A cookie is shared by every thread group forked from the same exec and is
//! freed when the last of them exits. Exec allocates a fresh cookie.

use crate::args::{self, ArgsEnvsParser};
use crate::consts::{file_flags, RuntimeConst, ERPC_REQUEST_LEN, TASK_COMM_LEN, TTY_NAME_LEN};
use crate::dentry::{start_resolver, DentryCallback, ResolverInput};
use crate::emit::{send_event, send_event_with};
use crate::event::{
    ContainerContext, Credentials, EventBase, EventType, ExitEvent, File, ProcessEvent,
    SyscallContext, EXIT_COREDUMP,
};
use crate::kernel::{plain, zeroed, Kernel, Map, Next, UpdateFlag};
use crate::kobj;
use crate::mount::{dec_mount_ref, inc_mount_ref};
use crate::span;
use crate::syscall_cache::{
    self, exec_transfer_pending, pop_current_or_impersonated_exec_syscall, pop_syscall,
    restore_syscall, SyscallCache, SyscallData,
};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcCacheEntry {
    pub executable: File,
    pub container: ContainerContext,
    pub exec_timestamp: u64,
    pub refs: u32,
    pub _pad: u32,
    pub tty_name: [u8; TTY_NAME_LEN],
    pub comm: [u8; TASK_COMM_LEN],
}

impl Default for ProcCacheEntry {
    fn default() -> Self {
        zeroed()
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PidCacheEntry {
    pub cookie: u64,
    pub ppid: u32,
    pub _pad: u32,
    pub fork_timestamp: u64,
    pub exit_timestamp: u64,
    pub credentials: Credentials,
}

pub const USER_SESSION_BLOB_LEN: usize = ERPC_REQUEST_LEN - 16;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserSession {
    pub blob: [u8; USER_SESSION_BLOB_LEN],
}

plain!(ProcCacheEntry, PidCacheEntry, UserSession);

/// Pid of `kthreadd`; its children are kernel threads.
const KTHREADD_PID: u32 = 2;

pub fn new_cookie<K: Kernel>(k: &K) -> u64 {
    let cookie = ((k.random_u32() as u64) << 32) | k.random_u32() as u64;
    cookie.max(1)
}

pub fn pid_entry<K: Kernel>(k: &K, tgid: u32) -> Option<PidCacheEntry> {
    k.pid_cache().lookup(&tgid)
}

pub fn proc_entry_of<K: Kernel>(k: &K, tgid: u32) -> Option<(u64, ProcCacheEntry)> {
    let cookie = pid_entry(k, tgid)?.cookie;
    Some((cookie, k.proc_cache().lookup(&cookie)?))
}

fn retain_cookie<K: Kernel>(k: &K, cookie: u64) {
    let _ = k.proc_cache().with_mut(&cookie, |e| e.refs += 1);
}

fn release_cookie<K: Kernel>(k: &K, cookie: u64) {
    let unreferenced = k
        .proc_cache()
        .with_mut(&cookie, |e| {
            e.refs = e.refs.saturating_sub(1);
            e.refs == 0
        })
        .unwrap_or(false);
    if unreferenced {
        let _ = k.proc_cache().delete(&cookie);
    }
}

pub fn is_ignored<K: Kernel>(k: &K, tgid: u32) -> bool {
    k.pid_ignored().contains(&tgid)
}

/// Returns the cookie of `tgid`, creating empty entries for a process that
/// predates the probes.
pub fn ensure_entry<K: Kernel>(k: &K, tgid: u32) -> u64 {
    if let Some(entry) = pid_entry(k, tgid) {
        if k.proc_cache().contains(&entry.cookie) {
            return entry.cookie;
        }
    }
    let cookie = new_cookie(k);
    let mut proc_entry = ProcCacheEntry::default();
    proc_entry.refs = 1;
    if k.proc_cache().store(&cookie, &proc_entry, UpdateFlag::Any).is_err() {
        return 0;
    }
    let entry = PidCacheEntry {
        cookie,
        ..pid_entry(k, tgid).unwrap_or_default()
    };
    let _ = k.pid_cache().store(&tgid, &entry, UpdateFlag::Any);
    cookie
}

pub fn set_container<K: Kernel>(k: &K, tgid: u32, container: &ContainerContext) {
    let cookie = ensure_entry(k, tgid);
    let _ = k.proc_cache().with_mut(&cookie, |e| e.container = *container);
}

pub fn container_of<K: Kernel>(k: &K, tgid: u32) -> ContainerContext {
    proc_entry_of(k, tgid)
        .map(|(_, e)| e.container)
        .unwrap_or_default()
}

fn fill_process_event(ev: &mut ProcessEvent, pid: &PidCacheEntry, proc_entry: &ProcCacheEntry) {
    ev.executable = proc_entry.executable;
    ev.exec_timestamp = proc_entry.exec_timestamp;
    ev.fork_timestamp = pid.fork_timestamp;
    ev.exit_timestamp = pid.exit_timestamp;
    ev.cookie = pid.cookie;
    ev.ppid = pid.ppid;
    ev.credentials = pid.credentials;
    ev.tty_name = proc_entry.tty_name;
    ev.comm = proc_entry.comm;
}

/// `sched_process_fork`: the current task is the parent.
pub fn handle_fork<K: Kernel>(k: &K, parent: u64, child: u64) -> Next {
    let child_pid = kobj::task_pid(k, child);
    let child_tgid = kobj::task_tgid(k, child);
    if child_pid != child_tgid {
        // a new thread of an existing process
        return Next::Done;
    }
    let parent_tgid = kobj::task_tgid(k, parent);
    if kobj::task_is_kthread(k, parent) || parent_tgid == KTHREADD_PID || is_ignored(k, parent_tgid) {
        let _ = k.pid_ignored().store(&child_tgid, &1, UpdateFlag::Any);
        return Next::Done;
    }

    let parent_entry = pid_entry(k, parent_tgid);
    let mut entry = PidCacheEntry {
        cookie: parent_entry.map(|p| p.cookie).unwrap_or(0),
        ppid: parent_tgid,
        _pad: 0,
        fork_timestamp: k.now_ns(),
        exit_timestamp: 0,
        credentials: parent_entry
            .map(|p| p.credentials)
            .unwrap_or_else(|| kobj::task_credentials(k, child)),
    };
    let proc_entry = k.proc_cache().lookup(&entry.cookie);
    if proc_entry.is_none() {
        entry.cookie = 0;
    }
    if k.pid_cache().store(&child_tgid, &entry, UpdateFlag::Any).is_err() {
        return Next::Done;
    }
    retain_cookie(k, entry.cookie);
    let proc_entry = proc_entry.unwrap_or_default();
    inc_mount_ref(k, proc_entry.executable.path_key.mount_id);

    if let Some(cookie) = k.traced_pids().lookup(&parent_tgid) {
        let _ = k.traced_pids().store(&child_tgid, &cookie, UpdateFlag::Any);
    }

    let child_pid_tgid = ((child_tgid as u64) << 32) | child_pid as u64;
    let _ = k.process_event().with_mut(&0, |ev| {
        *ev = zeroed();
        fill_process_event(ev, &entry, &proc_entry);
        send_event_with(k, EventType::Fork, ev, child_pid_tgid, 0);
    });
    Next::Done
}

/// `execve`/`execveat` entry.
pub fn handle_exec_enter<K: Kernel>(k: &K, filename: u64, argv: u64, envp: u64) -> Next {
    syscall_cache::mark_exec_pid_transfer(k);
    let mut entry = SyscallCache::new(
        EventType::Exec,
        SyscallData::Exec {
            executable: File::default(),
            interpreter: File::default(),
            executable_dentry: 0,
            interpreter_dentry: 0,
        },
    );
    entry.ctx_id = syscall_cache::snapshot_args(k, [filename, argv, envp, 0, 0, 0], filename);
    syscall_cache::cache_tracked_syscall(k, entry);
    Next::Done
}

/// `security_bprm_check`: the first call sees the executable, a second one
/// (script) the interpreter.
pub fn handle_bprm_check<K: Kernel>(k: &K, bprm: u64) -> Next {
    let file = k.read_at::<u64>(bprm, RuntimeConst::BprmFile).unwrap_or(0);
    if file == 0 {
        return Next::Done;
    }
    let mut resolved = File::default();
    let dentry = kobj::fill_file_from_kfile(k, &mut resolved, file);
    if resolved.metadata.nlink == 0 {
        resolved.flags |= file_flags::FILELESS;
    }
    let _ = syscall_cache::update_syscall(k, EventType::Exec, |entry| {
        if let SyscallData::Exec {
            executable,
            interpreter,
            executable_dentry,
            interpreter_dentry,
        } = &mut entry.data
        {
            if *executable_dentry == 0 {
                *executable = resolved;
                *executable_dentry = dentry;
            } else {
                *interpreter = resolved;
                *interpreter_dentry = dentry;
            }
        }
    });
    Next::Done
}

/// `sched_process_exec`: commits the new image and starts the exec event
/// chain (path walk, then args/envs parser, then EXEC).
pub fn handle_exec<K: Kernel>(k: &K, task: u64) -> Next {
    let Some(mut entry) = pop_current_or_impersonated_exec_syscall(k) else {
        return Next::Done;
    };
    let SyscallData::Exec {
        executable,
        executable_dentry,
        ..
    } = entry.data
    else {
        return Next::Done;
    };
    let tgid = k.tgid();
    let now = k.now_ns();

    let old = proc_entry_of(k, tgid);
    let mut proc_entry = ProcCacheEntry {
        executable,
        container: old.map(|(_, e)| e.container).unwrap_or_default(),
        exec_timestamp: now,
        refs: 0,
        ..ProcCacheEntry::default()
    };
    kobj::task_tty_name(k, task, &mut proc_entry.tty_name);
    proc_entry.comm = k.comm();

    let cookie = new_cookie(k);
    if k.proc_cache().store(&cookie, &proc_entry, UpdateFlag::Any).is_err() {
        return Next::Done;
    }
    let mut pid = pid_entry(k, tgid).unwrap_or_else(|| PidCacheEntry {
        ppid: kobj::task_parent_tgid(k, task),
        credentials: kobj::task_credentials(k, task),
        ..PidCacheEntry::default()
    });
    let old_cookie = pid.cookie;
    pid.cookie = cookie;
    let _ = k.pid_cache().store(&tgid, &pid, UpdateFlag::Any);
    let _ = k.pid_ignored().delete(&tgid);
    retain_cookie(k, cookie);
    release_cookie(k, old_cookie);

    inc_mount_ref(k, executable.path_key.mount_id);
    if let Some((_, old_entry)) = old {
        dec_mount_ref(k, old_entry.executable.path_key.mount_id);
    }
    crate::activity_dump::admit(k, tgid, &proc_entry.container);

    if !crate::approvers::is_event_enabled(k, EventType::Exec) {
        return Next::Done;
    }

    let staged = k.process_event().with_mut(&0, |ev| {
        *ev = zeroed();
        fill_process_event(ev, &pid, &proc_entry);
        ev.syscall = SyscallContext {
            retval: 0,
            ctx_id: entry.ctx_id,
            _pad: 0,
        };
    });
    if staged.is_none() || !args::start_parser(k, task) {
        return Next::Done;
    }

    entry.resolver = ResolverInput::new(
        executable.path_key,
        executable_dentry,
        EventType::Any,
        DentryCallback::ParseArgsEnvs,
    );
    if !restore_syscall(k, &entry) {
        return Next::Done;
    }
    if executable_dentry == 0 || executable.path_key.ino == 0 {
        return Next::TailCall(crate::kernel::Prog::ArgsEnvsParser);
    }
    start_resolver(k, entry.resolver)
}

/// Second walk of an exec chain: the interpreter, when there is one.
pub fn next_exec_walk(entry: &SyscallCache) -> Option<ResolverInput> {
    let SyscallData::Exec {
        interpreter,
        interpreter_dentry,
        ..
    } = entry.data
    else {
        return None;
    };
    if entry.resolver.pass != 0 || interpreter_dentry == 0 {
        return None;
    }
    let mut input = ResolverInput::new(
        interpreter.path_key,
        interpreter_dentry,
        EventType::Any,
        DentryCallback::ParseArgsEnvs,
    );
    input.pass = 1;
    Some(input)
}

/// Emits the staged EXEC once args and envs are out.
pub fn finish_exec<K: Kernel>(k: &K, parser: &ArgsEnvsParser) {
    let Some(entry) = pop_syscall(k, EventType::Exec) else {
        return;
    };
    let SyscallData::Exec { interpreter, .. } = entry.data else {
        return;
    };
    let _ = k.process_event().with_mut(&0, |ev| {
        ev.interpreter = interpreter;
        ev.args_id = parser.args_id;
        ev.envs_id = parser.envs_id;
        ev.args_truncated = parser.args_truncated;
        ev.envs_truncated = parser.envs_truncated;
        send_event_with(k, EventType::Exec, ev, 0, entry.resolver.flags as u16);
    });
}

/// `do_exit`.
pub fn handle_exit<K: Kernel>(k: &K, exit_code: i64) -> Next {
    let _ = pop_syscall(k, EventType::Any);
    let pid_tgid = k.pid_tgid();
    let tgid = (pid_tgid >> 32) as u32;
    if pid_tgid as u32 != tgid {
        return Next::Done;
    }
    if exec_transfer_pending(k, tgid) {
        // the leader is dying to hand its pid to an execing thread
        return Next::Done;
    }

    let mut code = (exit_code as u32) & !0x80;
    if exit_code & 0x80 != 0 {
        code |= EXIT_COREDUMP;
    }
    let _ = k.pid_cache().with_mut(&tgid, |p| p.exit_timestamp = k.now_ns());
    let mut event = ExitEvent {
        base: EventBase::default(),
        exit_code: code,
        _pad: 0,
    };
    send_event(k, EventType::Exit, &mut event);

    if let Some((cookie, proc_entry)) = proc_entry_of(k, tgid) {
        dec_mount_ref(k, proc_entry.executable.path_key.mount_id);
        release_cookie(k, cookie);
    }
    span::unregister_span_tls(k, tgid);
    let _ = k.traced_pids().delete(&tgid);
    let _ = k.pid_sessions().delete(&tgid);
    let _ = k.syscall_drift().delete(&tgid);
    let _ = k.pid_ignored().delete(&tgid);
    let _ = k.pid_cache().delete(&tgid);
    Next::Done
}

/// `commit_creds`: snapshot the new credentials.
pub fn handle_commit_creds<K: Kernel>(k: &K, cred: u64) -> Next {
    let credentials = kobj::read_credentials(k, cred);
    let _ = k
        .pid_cache()
        .with_mut(&k.tgid(), |p| p.credentials = credentials);
    Next::Done
}

/// Binds `session_id` to `tgid`. A tgid keeps the first id it commits.
pub fn commit_user_session<K: Kernel>(k: &K, tgid: u32, session_id: u64, session: &UserSession) -> bool {
    if session_id == 0 {
        return false;
    }
    if let Some(existing) = k.pid_sessions().lookup(&tgid) {
        if existing != session_id {
            return false;
        }
    }
    if k.user_sessions().store(&session_id, session, UpdateFlag::Any).is_err() {
        return false;
    }
    k.pid_sessions()
        .store(&tgid, &session_id, UpdateFlag::Any)
        .is_ok()
}

pub fn user_session_of<K: Kernel>(k: &K, tgid: u32) -> u64 {
    k.pid_sessions().lookup(&tgid).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimKernel;

    #[test]
    fn fork_inherits_cookie_and_credentials() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Fork]);
        let parent = k.spawn_task(100, 100, 1);
        let cookie = ensure_entry(&k, 100);
        let child = k.spawn_task(200, 200, 100);
        k.set_current(100, 100);
        handle_fork(&k, parent, child);

        let child_entry = pid_entry(&k, 200).unwrap();
        assert_eq!(child_entry.cookie, cookie);
        assert_eq!(child_entry.ppid, 100);
        assert_eq!(k.proc_cache().lookup(&cookie).unwrap().refs, 2);

        let forks = k.events_of(EventType::Fork);
        assert_eq!(forks.len(), 1);
        let ev: ProcessEvent = forks[0].decode();
        assert_eq!(ev.base.process.pid, 200);
        assert_eq!(ev.ppid, 100);
    }

    #[test]
    fn threads_and_kthread_children_produce_no_fork() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Fork]);
        let parent = k.spawn_task(100, 100, 1);
        let thread = k.spawn_task(100, 101, 1);
        k.set_current(100, 100);
        handle_fork(&k, parent, thread);

        let kthreadd = k.spawn_task(2, 2, 0);
        let worker = k.spawn_task(300, 300, 2);
        handle_fork(&k, kthreadd, worker);
        assert!(is_ignored(&k, 300));
        assert!(k.events_of(EventType::Fork).is_empty());
    }

    #[test]
    fn cookie_is_freed_when_the_last_holder_exits() {
        let k = SimKernel::new();
        let parent = k.spawn_task(100, 100, 1);
        let cookie = ensure_entry(&k, 100);
        let child = k.spawn_task(200, 200, 100);
        k.set_current(100, 100);
        handle_fork(&k, parent, child);

        k.set_current(100, 100);
        handle_exit(&k, 0);
        assert!(k.proc_cache().contains(&cookie));
        k.set_current(200, 200);
        handle_exit(&k, 0);
        assert!(!k.proc_cache().contains(&cookie));
        assert!(pid_entry(&k, 200).is_none());
    }

    #[test]
    fn exit_code_carries_the_coredump_bit() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Exit]);
        k.set_current(100, 100);
        handle_exit(&k, 0x80 | 11);
        let ev: ExitEvent = k.events_of(EventType::Exit)[0].decode();
        assert_eq!(ev.exit_code, EXIT_COREDUMP | 11);
    }

    #[test]
    fn user_session_cannot_be_taken_over() {
        let k = SimKernel::new();
        let session = UserSession {
            blob: [1; USER_SESSION_BLOB_LEN],
        };
        assert!(commit_user_session(&k, 10, 77, &session));
        assert!(commit_user_session(&k, 10, 77, &session));
        assert!(!commit_user_session(&k, 10, 78, &session));
        assert_eq!(user_session_of(&k, 10), 77);
    }

    #[test]
    fn commit_creds_refreshes_the_snapshot() {
        let k = SimKernel::new();
        k.set_current(100, 100);
        ensure_entry(&k, 100);
        let cred = k.alloc_cred(Credentials {
            uid: 1000,
            euid: 0,
            ..Credentials::default()
        });
        handle_commit_creds(&k, cred);
        assert_eq!(pid_entry(&k, 100).unwrap().credentials.uid, 1000);
    }
}
