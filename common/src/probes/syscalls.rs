//! Raw syscall tracepoint and io_uring request bracketing.

use crate::anomaly;
use crate::kernel::{Kernel, Next};
use crate::kobj;
use crate::syscall_cache::{begin_async, end_async};

/// `raw_syscalls/sys_enter`.
pub fn sys_enter<K: Kernel>(k: &K, nr: u64) -> Next {
    if nr > u32::MAX as u64 {
        return Next::Done;
    }
    anomaly::hook_sys_enter(k, nr as u32)
}

/// `io_issue_sqe` entry, on an io_uring worker. `task` is the submitting task
/// recorded in the request.
pub fn io_issue_sqe_enter<K: Kernel>(k: &K, task: u64) -> Next {
    let tgid = kobj::task_tgid(k, task);
    if tgid == 0 || tgid == k.tgid() {
        return Next::Done;
    }
    let pid = kobj::task_pid(k, task);
    begin_async(k, ((tgid as u64) << 32) | pid as u64);
    Next::Done
}

pub fn io_issue_sqe_exit<K: Kernel>(k: &K) -> Next {
    end_async(k);
    Next::Done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Map;
    use crate::sim::SimKernel;

    #[test]
    fn worker_requests_are_bracketed() {
        let k = SimKernel::new();
        let submitter = k.spawn_task(100, 102, 1);
        k.set_current(400, 401);
        io_issue_sqe_enter(&k, submitter);
        assert_eq!(k.async_submitters().lookup(&k.pid_tgid()), Some((100u64 << 32) | 102));
        io_issue_sqe_exit(&k);
        assert!(k.async_submitters().lookup(&k.pid_tgid()).is_none());
    }

    #[test]
    fn inline_completion_is_not_async() {
        let k = SimKernel::new();
        let submitter = k.spawn_task(100, 100, 1);
        k.set_current(100, 100);
        io_issue_sqe_enter(&k, submitter);
        assert!(k.async_submitters().lookup(&k.pid_tgid()).is_none());
    }
}
