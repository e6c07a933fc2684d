//! Approvers: allow predicates that override discard decisions.
//!
//! Two kinds exist. A basename approver maps a 256-byte segment name to the
//! mask of event types it approves. A flag approver is one `u64` mask per
//! [`FlagApprover`] slot; an event is approved when its flags overlap it.

use crate::consts::{APPROVE_O_RDONLY, BASENAME_FILTER_SIZE, O_ACCMODE, SEGMENT_BUFFER_LEN};
use crate::event::EventType;
use crate::kernel::{plain, Kernel, Map};
use crate::kobj;
use crate::stats;

pub const POLICY_MODE_NO_FILTER: u32 = 0;
pub const POLICY_MODE_ACCEPT: u32 = 1;
pub const POLICY_MODE_DENY: u32 = 2;

pub const POLICY_FLAG_BASENAME: u32 = 1 << 0;
pub const POLICY_FLAG_FLAGS: u32 = 1 << 1;

/// Per-event-type filtering policy, written by the agent.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterPolicy {
    pub mode: u32,
    pub flags: u32,
}

impl FilterPolicy {
    pub fn uses_basenames(&self) -> bool {
        self.flags & POLICY_FLAG_BASENAME != 0
    }

    pub fn uses_flags(&self) -> bool {
        self.flags & POLICY_FLAG_FLAGS != 0
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BasenameKey(pub [u8; BASENAME_FILTER_SIZE]);

impl BasenameKey {
    pub fn new(name: &[u8]) -> Self {
        let mut key = [0u8; BASENAME_FILTER_SIZE];
        let len = name.len().min(BASENAME_FILTER_SIZE - 1);
        key[..len].copy_from_slice(&name[..len]);
        BasenameKey(key)
    }
}

plain!(FilterPolicy, BasenameKey);

/// Slots of the `flag_approvers` array map.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagApprover {
    OpenFlags = 0,
    MmapFlags,
    MmapProt,
    MprotectVmProt,
    MprotectReqProt,
    SpliceEntryFlags,
    SpliceExitFlags,
}

pub const FLAG_APPROVER_SLOTS: u32 = FlagApprover::SpliceExitFlags as u32 + 1;

pub fn policy_of<K: Kernel>(k: &K, t: EventType) -> FilterPolicy {
    k.filter_policy().lookup(&(t as u32)).unwrap_or_default()
}

pub fn is_event_enabled<K: Kernel>(k: &K, t: EventType) -> bool {
    k.enabled_events().lookup(&0).unwrap_or(0) & t.mask() != 0
}

/// True when the segment name of `dentry` approves `t`.
pub fn basename_approver<K: Kernel>(k: &K, t: EventType, dentry: u64) -> bool {
    if dentry == 0 {
        return false;
    }
    let mut name = [0u8; SEGMENT_BUFFER_LEN];
    let len = kobj::dentry_name(k, dentry, &mut name);
    if len == 0 {
        return false;
    }
    let key = BasenameKey::new(&name[..len]);
    let approved = k
        .basename_approvers()
        .lookup(&key)
        .map(|mask| mask & t.mask() != 0)
        .unwrap_or(false);
    if approved {
        stats::filter(k, t, |s| s.basename_approved += 1);
    }
    approved
}

/// Open flags use a dedicated bit for `O_RDONLY`, whose value is zero.
pub fn normalize_open_flags(flags: u64) -> u64 {
    if flags & O_ACCMODE == 0 {
        flags | APPROVE_O_RDONLY
    } else {
        flags
    }
}

pub fn flags_approver<K: Kernel>(k: &K, t: EventType, slot: FlagApprover, flags: u64) -> bool {
    let value = match slot {
        FlagApprover::OpenFlags => normalize_open_flags(flags),
        _ => flags,
    };
    let mask = k.flag_approvers().lookup(&(slot as u32)).unwrap_or(0);
    let approved = mask & value != 0;
    if approved {
        stats::filter(k, t, |s| s.flags_approved += 1);
    }
    approved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::UpdateFlag;
    use crate::sim::SimKernel;

    #[test]
    fn basename_mask_is_per_event_type() {
        let k = SimKernel::new();
        let root = k.root_dentry(1);
        let file = k.add_dentry(root, "secret.txt", 20);
        k.basename_approvers()
            .store(&BasenameKey::new(b"secret.txt"), &EventType::Open.mask(), UpdateFlag::Any)
            .unwrap();

        assert!(basename_approver(&k, EventType::Open, file));
        assert!(!basename_approver(&k, EventType::Unlink, file));
        assert!(!basename_approver(&k, EventType::Open, root));
    }

    #[test]
    fn read_only_opens_use_the_dedicated_bit() {
        let k = SimKernel::new();
        k.flag_approvers()
            .store(&(FlagApprover::OpenFlags as u32), &APPROVE_O_RDONLY, UpdateFlag::Any)
            .unwrap();
        assert!(flags_approver(&k, EventType::Open, FlagApprover::OpenFlags, 0));
        // O_WRONLY
        assert!(!flags_approver(&k, EventType::Open, FlagApprover::OpenFlags, 1));
    }

    #[test]
    fn flag_approvers_match_any_overlapping_bit() {
        let k = SimKernel::new();
        k.flag_approvers()
            .store(&(FlagApprover::MmapProt as u32), &0b100, UpdateFlag::Any)
            .unwrap();
        assert!(flags_approver(&k, EventType::Mmap, FlagApprover::MmapProt, 0b101));
        assert!(!flags_approver(&k, EventType::Mmap, FlagApprover::MmapProt, 0b011));
        assert!(!flags_approver(&k, EventType::Mmap, FlagApprover::MmapFlags, 0b100));
    }
}
