//! Process lifecycle and credential syscalls.
//!
//! Fork, exec and exit live in [`crate::process`]; this module adds the
//! credential changes, whose new values are read from the pid cache once
//! `commit_creds` has refreshed it.

use crate::event::EventType;
use crate::kernel::{Kernel, Next};
use crate::probes::callbacks::emit_syscall;
use crate::process;
use crate::syscall_cache::{cache_syscall, is_unhandled_error, pop_syscall, SyscallCache, SyscallData};

/// `setuid` family, `setgid` family and `capset` entry.
pub fn sys_setcred_enter<K: Kernel>(k: &K, t: EventType) -> Next {
    if matches!(t, EventType::SetUid | EventType::SetGid | EventType::Capset) {
        cache_syscall(k, SyscallCache::new(t, SyscallData::SetCred));
    }
    Next::Done
}

pub fn sys_setcred_exit<K: Kernel>(k: &K, t: EventType, retval: i64) -> Next {
    let Some(mut entry) = pop_syscall(k, t) else {
        return Next::Done;
    };
    if is_unhandled_error(retval) {
        return Next::Done;
    }
    entry.retval = retval;
    emit_syscall(k, &entry);
    Next::Done
}

pub fn sched_process_fork<K: Kernel>(k: &K, parent: u64, child: u64) -> Next {
    process::handle_fork(k, parent, child)
}

pub fn sys_exec_enter<K: Kernel>(k: &K, filename: u64, argv: u64, envp: u64) -> Next {
    process::handle_exec_enter(k, filename, argv, envp)
}

/// `execve`/`execveat` exit. A successful exec is finished by
/// `sched_process_exec`; a failed one leaves its entry behind.
pub fn sys_exec_exit<K: Kernel>(k: &K, retval: i64) -> Next {
    if retval < 0 {
        let _ = pop_syscall(k, EventType::Exec);
    }
    Next::Done
}

pub fn security_bprm_check<K: Kernel>(k: &K, bprm: u64) -> Next {
    process::handle_bprm_check(k, bprm)
}

pub fn sched_process_exec<K: Kernel>(k: &K, task: u64) -> Next {
    process::handle_exec(k, task)
}

pub fn do_exit<K: Kernel>(k: &K, code: i64) -> Next {
    process::handle_exit(k, code)
}

pub fn commit_creds<K: Kernel>(k: &K, cred: u64) -> Next {
    process::handle_commit_creds(k, cred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CapsetEvent, Credentials, SetidEvent};
    use crate::sim::SimKernel;

    fn task(k: &SimKernel) {
        k.spawn_task(60, 60, 1);
        k.set_current(60, 60);
    }

    #[test]
    fn setuid_reports_committed_ids() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::SetUid]);
        task(&k);
        sys_setcred_enter(&k, EventType::SetUid);
        let cred = k.alloc_cred(Credentials {
            uid: 1000,
            euid: 0,
            fsuid: 0,
            ..Credentials::default()
        });
        commit_creds(&k, cred);
        sys_setcred_exit(&k, EventType::SetUid, 0);

        let ev: SetidEvent = k.events_of(EventType::SetUid)[0].decode();
        assert_eq!((ev.id, ev.eid, ev.fsid), (1000, 0, 0));
        assert_eq!(ev.base.process.pid, 60);
    }

    #[test]
    fn capset_reports_capability_sets() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Capset]);
        task(&k);
        sys_setcred_enter(&k, EventType::Capset);
        let cred = k.alloc_cred(Credentials {
            cap_effective: 0x3,
            cap_permitted: 0x7,
            ..Credentials::default()
        });
        commit_creds(&k, cred);
        sys_setcred_exit(&k, EventType::Capset, 0);

        let ev: CapsetEvent = k.events_of(EventType::Capset)[0].decode();
        assert_eq!(ev.cap_effective, 0x3);
        assert_eq!(ev.cap_permitted, 0x7);
    }

    #[test]
    fn failed_exec_clears_its_entry() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Exec]);
        task(&k);
        let (filename, _) = k.alloc_user_strings(&["/bin/missing"]);
        sys_exec_enter(&k, filename, 0, 0);
        assert!(crate::syscall_cache::peek_syscall(&k, EventType::Exec).is_some());
        sys_exec_exit(&k, -2);
        assert!(crate::syscall_cache::peek_syscall(&k, EventType::Exec).is_none());
        assert!(k.events().is_empty());
    }

    #[test]
    fn failed_setgid_is_silent() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::SetGid]);
        task(&k);
        sys_setcred_enter(&k, EventType::SetGid);
        sys_setcred_exit(&k, EventType::SetGid, -22);
        assert!(k.events().is_empty());
    }
}
