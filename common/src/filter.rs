//! Pre-emission filtering of a cached syscall.
//!
//! The decision runs once, at syscall exit, before any path is walked:
//!
//! ```text
//!   approved (basename ∪ flags) ───────────────► pass
//!   DENY ──────────────────────────────────────► discard
//!   pid discarded ─────────────────────────────► discard
//!   otherwise ─► walk with inode discarders on ─► pass unless an inode hits
//!
//! NO_FILTER and ACCEPT only differ in the policy flags userspace pairs them
//! with: discarders apply to both.
//! ```

use crate::approvers::{
    basename_approver, flags_approver, FlagApprover, POLICY_MODE_DENY,
};
use crate::discarders::is_discarded_by_pid;
use crate::event::EventType;
use crate::kernel::Kernel;
use crate::stats;
use crate::syscall_cache::{SyscallCache, SyscallData};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Discard,
    Pass,
    /// Pass unless the walk meets an inode discarder for this type.
    CheckInodes(EventType),
}

impl Verdict {
    /// Event type to hand to the dentry resolver.
    pub fn discarder_event_type(self) -> EventType {
        match self {
            Verdict::CheckInodes(t) => t,
            _ => EventType::Any,
        }
    }

    pub fn is_discard(self) -> bool {
        self == Verdict::Discard
    }
}

fn basename_approved<K: Kernel>(k: &K, entry: &SyscallCache) -> bool {
    let t = entry.event_type;
    if let SyscallData::TwoFiles {
        source_dentry,
        target_dentry,
        ..
    } = entry.data
    {
        return basename_approver(k, t, source_dentry) || basename_approver(k, t, target_dentry);
    }
    match entry.primary_file() {
        Some((_, dentry)) => basename_approver(k, t, dentry),
        None => false,
    }
}

fn flags_approved<K: Kernel>(k: &K, entry: &SyscallCache) -> bool {
    let t = entry.event_type;
    match entry.data {
        SyscallData::Open { flags, .. } => flags_approver(k, t, FlagApprover::OpenFlags, flags as u64),
        SyscallData::Mmap { flags, prot, .. } => {
            flags_approver(k, t, FlagApprover::MmapFlags, flags as u64)
                || flags_approver(k, t, FlagApprover::MmapProt, prot as u64)
        }
        SyscallData::Mprotect {
            vm_prot, req_prot, ..
        } => {
            flags_approver(k, t, FlagApprover::MprotectVmProt, vm_prot)
                || flags_approver(k, t, FlagApprover::MprotectReqProt, req_prot)
        }
        SyscallData::Splice {
            entry_flag,
            exit_flag,
            ..
        } => {
            flags_approver(k, t, FlagApprover::SpliceEntryFlags, entry_flag as u64)
                || flags_approver(k, t, FlagApprover::SpliceExitFlags, exit_flag as u64)
        }
        _ => false,
    }
}

/// Any enabled approver matching is enough.
pub fn is_approved<K: Kernel>(k: &K, entry: &SyscallCache) -> bool {
    (entry.policy.uses_basenames() && basename_approved(k, entry))
        || (entry.policy.uses_flags() && flags_approved(k, entry))
}

pub fn filter_syscall<K: Kernel>(k: &K, entry: &SyscallCache) -> Verdict {
    let t = entry.event_type;
    if is_approved(k, entry) {
        return Verdict::Pass;
    }
    if entry.policy.mode == POLICY_MODE_DENY {
        return Verdict::Discard;
    }
    let tgid = if entry.submitter != 0 {
        (entry.submitter >> 32) as u32
    } else {
        k.tgid()
    };
    if is_discarded_by_pid(k, t, tgid) {
        stats::filter(k, t, |s| s.pid_discarded += 1);
        return Verdict::Discard;
    }
    if t.is_discardable() {
        Verdict::CheckInodes(t)
    } else {
        Verdict::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvers::{BasenameKey, FilterPolicy, POLICY_FLAG_BASENAME, POLICY_FLAG_FLAGS, POLICY_MODE_ACCEPT};
    use crate::discarders::discard_pid;
    use crate::event::File;
    use crate::kernel::{Map, UpdateFlag};
    use crate::sim::SimKernel;

    fn open_entry(dentry: u64, flags: u32, policy: FilterPolicy) -> SyscallCache {
        let mut entry = SyscallCache::new(
            EventType::Open,
            SyscallData::Open {
                file: File::default(),
                dentry,
                flags,
                mode: 0,
            },
        );
        entry.policy = policy;
        entry
    }

    #[test]
    fn no_filter_still_honours_pid_discarders() {
        let k = SimKernel::new();
        k.set_current(100, 100);
        discard_pid(&k, EventType::Open, 100, 0);
        let entry = open_entry(0, 0, FilterPolicy::default());
        assert_eq!(filter_syscall(&k, &entry), Verdict::Discard);
        assert_eq!(k.filter_stats_of(EventType::Open).pid_discarded, 1);

        k.set_current(200, 200);
        assert_eq!(filter_syscall(&k, &entry), Verdict::CheckInodes(EventType::Open));
    }

    #[test]
    fn deny_passes_only_approved() {
        let k = SimKernel::new();
        let root = k.root_dentry(2);
        let secret = k.add_dentry(root, "secret.txt", 10);
        let other = k.add_dentry(root, "other.txt", 11);
        k.basename_approvers()
            .store(&BasenameKey::new(b"secret.txt"), &EventType::Open.mask(), UpdateFlag::Any)
            .unwrap();
        let policy = FilterPolicy {
            mode: POLICY_MODE_DENY,
            flags: POLICY_FLAG_BASENAME,
        };
        assert_eq!(filter_syscall(&k, &open_entry(secret, 0, policy)), Verdict::Pass);
        assert_eq!(filter_syscall(&k, &open_entry(other, 0, policy)), Verdict::Discard);
    }

    #[test]
    fn approval_overrides_pid_discarder() {
        let k = SimKernel::new();
        k.set_current(100, 100);
        discard_pid(&k, EventType::Open, 100, 0);
        k.flag_approvers()
            .store(&(FlagApprover::OpenFlags as u32), &0o1, UpdateFlag::Any)
            .unwrap();
        let policy = FilterPolicy {
            mode: POLICY_MODE_ACCEPT,
            flags: POLICY_FLAG_FLAGS,
        };
        assert_eq!(filter_syscall(&k, &open_entry(0, 0o1, policy)), Verdict::Pass);
        assert_eq!(filter_syscall(&k, &open_entry(0, 0o2, policy)), Verdict::Discard);
        assert_eq!(k.filter_stats_of(EventType::Open).pid_discarded, 1);
    }

    #[test]
    fn accept_defers_to_inode_discarders() {
        let k = SimKernel::new();
        k.set_current(100, 100);
        let policy = FilterPolicy {
            mode: POLICY_MODE_ACCEPT,
            flags: 0,
        };
        let verdict = filter_syscall(&k, &open_entry(0, 0, policy));
        assert_eq!(verdict, Verdict::CheckInodes(EventType::Open));
        assert_eq!(verdict.discarder_event_type(), EventType::Open);
    }
}
