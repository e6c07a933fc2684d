//! Inode, pid and mount discarders.
//!
//! A discarder entry moves through three states:
//!
//! ```text
//!   free ──add──► active ──expire / timeout──► expiring ──retention elapsed──► free
//!                   ▲                              │
//!                   └──────── add (ignored) ◄──────┘
//! ```
//!
//! Inode discarders additionally die with the global revision and with the
//! revision of their mount slot. Mount discarders have no entries of their
//! own: bumping a mount revision is the discarder.

use crate::consts::{RuntimeConst, DEFAULT_DISCARDER_RETENTION_NS, MOUNT_REVISION_SLOTS};
use crate::event::{EventType, DISCARDER_EVENT_COUNT, FIRST_DISCARDER_EVENT};
use crate::kernel::{plain, Kernel, Map, UpdateFlag};
use crate::path::PathKey;
use crate::stats;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct InodeDiscarderKey {
    pub path_key: PathKey,
    pub is_leaf: u32,
    pub _pad: u32,
}

impl InodeDiscarderKey {
    /// Discarders ignore the path generation.
    pub fn new(mount_id: u32, ino: u64, is_leaf: bool) -> Self {
        Self {
            path_key: PathKey::new(ino, mount_id, 0),
            is_leaf: is_leaf as u32,
            _pad: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiscarderParams {
    pub event_mask: u64,
    pub timestamps: [u64; DISCARDER_EVENT_COUNT],
    pub expire_at: u64,
    pub is_retained: u32,
    pub revision: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InodeDiscarder {
    pub params: DiscarderParams,
    pub mount_revision: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PidDiscarder {
    pub params: DiscarderParams,
}

plain!(InodeDiscarderKey, DiscarderParams, InodeDiscarder, PidDiscarder);

impl DiscarderParams {
    fn is_active(&self, idx: usize, now: u64, inclusive: bool) -> bool {
        let bit = 1u64 << (idx as u32 + FIRST_DISCARDER_EVENT);
        if self.event_mask & bit == 0 {
            return false;
        }
        let expiry = self.timestamps[idx];
        if inclusive {
            now <= expiry
        } else {
            now < expiry
        }
    }

    fn any_active(&self, now: u64) -> bool {
        (0..DISCARDER_EVENT_COUNT).any(|idx| self.is_active(idx, now, false))
    }

    /// Expired but still inside its retention window.
    pub fn is_expiring(&self, now: u64) -> bool {
        (self.is_retained != 0 || !self.any_active(now)) && now < self.expire_at
    }

    fn arm(&mut self, idx: usize, now: u64, timeout: u64, retention: u64) {
        let expiry = if timeout == 0 {
            u64::MAX
        } else {
            now.saturating_add(timeout)
        };
        self.event_mask |= 1u64 << (idx as u32 + FIRST_DISCARDER_EVENT);
        self.timestamps[idx] = expiry;
        self.expire_at = self.expire_at.max(expiry.saturating_add(retention));
        self.is_retained = 0;
    }

    fn expire(&mut self, now: u64, retention: u64) {
        for idx in 0..DISCARDER_EVENT_COUNT {
            if self.timestamps[idx] > now {
                self.timestamps[idx] = now;
            }
        }
        self.is_retained = 1;
        self.expire_at = now.saturating_add(retention);
    }
}

fn retention<K: Kernel>(k: &K) -> u64 {
    match k.constant(RuntimeConst::DiscarderRetention) {
        0 => DEFAULT_DISCARDER_RETENTION_NS,
        r => r,
    }
}

pub fn discarders_revision<K: Kernel>(k: &K) -> u32 {
    k.discarders_revision().lookup(&0).unwrap_or(0)
}

pub fn mount_revision<K: Kernel>(k: &K, mount_id: u32) -> u32 {
    k.mount_revisions()
        .lookup(&(mount_id % MOUNT_REVISION_SLOTS))
        .unwrap_or(0)
}

/// Invalidates every inode discarder at once.
pub fn bump_discarders_revision<K: Kernel>(k: &K) -> u32 {
    k.discarders_revision()
        .with_mut(&0, |rev| {
            *rev = rev.wrapping_add(1);
            *rev
        })
        .unwrap_or(0)
}

/// Invalidates the inode discarders of one mount slot.
pub fn bump_mount_discarder_revision<K: Kernel>(k: &K, mount_id: u32) -> u32 {
    k.mount_revisions()
        .with_mut(&(mount_id % MOUNT_REVISION_SLOTS), |rev| {
            *rev = rev.wrapping_add(1);
            *rev
        })
        .unwrap_or(0)
}

fn inode_entry_is_current<K: Kernel>(k: &K, entry: &InodeDiscarder, mount_id: u32) -> bool {
    entry.params.revision == discarders_revision(k)
        && entry.mount_revision == mount_revision(k, mount_id)
}

/// Adds an inode discarder for `event_type`. Returns false when the add was
/// ignored because the entry is in its retention window.
pub fn discard_inode<K: Kernel>(
    k: &K,
    event_type: EventType,
    mount_id: u32,
    ino: u64,
    is_leaf: bool,
    timeout: u64,
) -> bool {
    let Some(idx) = event_type.discarder_index() else {
        return false;
    };
    if ino == 0 {
        return false;
    }
    let now = k.now_ns();
    let key = InodeDiscarderKey::new(mount_id, ino, is_leaf);
    let map = k.inode_discarders();

    let mut entry = match map.lookup(&key) {
        Some(entry) if inode_entry_is_current(k, &entry, mount_id) => {
            if entry.params.is_expiring(now) {
                return false;
            }
            if entry.params.any_active(now) {
                entry
            } else {
                InodeDiscarder::default()
            }
        }
        _ => InodeDiscarder::default(),
    };
    entry.params.revision = discarders_revision(k);
    entry.mount_revision = mount_revision(k, mount_id);
    entry.params.arm(idx, now, timeout, retention(k));

    if map.store(&key, &entry, UpdateFlag::Any).is_err() {
        return false;
    }
    stats::filter(k, event_type, |s| s.discarders_added += 1);
    true
}

pub fn is_discarded_by_inode<K: Kernel>(
    k: &K,
    event_type: EventType,
    mount_id: u32,
    ino: u64,
    is_leaf: bool,
) -> bool {
    let Some(idx) = event_type.discarder_index() else {
        return false;
    };
    let key = InodeDiscarderKey::new(mount_id, ino, is_leaf);
    match k.inode_discarders().lookup(&key) {
        Some(entry) => {
            inode_entry_is_current(k, &entry, mount_id)
                && entry.params.is_active(idx, k.now_ns(), false)
        }
        None => false,
    }
}

/// Expires both the leaf and the parent discarders of an inode.
pub fn expire_inode_discarders<K: Kernel>(k: &K, mount_id: u32, ino: u64) {
    let now = k.now_ns();
    let retention = retention(k);
    for is_leaf in [true, false] {
        let key = InodeDiscarderKey::new(mount_id, ino, is_leaf);
        let _ = k
            .inode_discarders()
            .with_mut(&key, |entry| entry.params.expire(now, retention));
    }
}

pub fn discard_pid<K: Kernel>(k: &K, event_type: EventType, tgid: u32, timeout: u64) -> bool {
    let Some(idx) = event_type.discarder_index() else {
        return false;
    };
    if tgid == 0 {
        return false;
    }
    let now = k.now_ns();
    let map = k.pid_discarders();

    let mut entry = match map.lookup(&tgid) {
        Some(entry) => {
            if entry.params.is_expiring(now) {
                return false;
            }
            if entry.params.any_active(now) {
                entry
            } else {
                PidDiscarder::default()
            }
        }
        None => PidDiscarder::default(),
    };
    entry.params.revision = discarders_revision(k);
    entry.params.arm(idx, now, timeout, retention(k));

    if map.store(&tgid, &entry, UpdateFlag::Any).is_err() {
        return false;
    }
    stats::filter(k, event_type, |s| s.discarders_added += 1);
    true
}

/// Pid discarders hold up to and including their expiry instant.
pub fn is_discarded_by_pid<K: Kernel>(k: &K, event_type: EventType, tgid: u32) -> bool {
    let Some(idx) = event_type.discarder_index() else {
        return false;
    };
    match k.pid_discarders().lookup(&tgid) {
        Some(entry) => entry.params.is_active(idx, k.now_ns(), true),
        None => false,
    }
}

pub fn expire_pid_discarder<K: Kernel>(k: &K, tgid: u32) {
    let now = k.now_ns();
    let retention = retention(k);
    let _ = k
        .pid_discarders()
        .with_mut(&tgid, |entry| entry.params.expire(now, retention));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimKernel;

    const SEC: u64 = 1_000_000_000;

    #[test]
    fn inode_discarder_lives_until_timeout() {
        let k = SimKernel::new();
        assert!(discard_inode(&k, EventType::Open, 5, 100, true, 2 * SEC));
        assert!(is_discarded_by_inode(&k, EventType::Open, 5, 100, true));
        assert!(!is_discarded_by_inode(&k, EventType::Open, 5, 100, false));
        assert!(!is_discarded_by_inode(&k, EventType::Mkdir, 5, 100, true));

        k.advance(2 * SEC);
        assert!(!is_discarded_by_inode(&k, EventType::Open, 5, 100, true));
    }

    #[test]
    fn global_revision_bump_invalidates_inode_discarders() {
        let k = SimKernel::new();
        discard_inode(&k, EventType::Open, 5, 100, true, 0);
        bump_discarders_revision(&k);
        assert!(!is_discarded_by_inode(&k, EventType::Open, 5, 100, true));
        // a stale entry is treated as free
        assert!(discard_inode(&k, EventType::Open, 5, 100, true, 0));
        assert!(is_discarded_by_inode(&k, EventType::Open, 5, 100, true));
    }

    #[test]
    fn mount_bump_only_touches_its_slot() {
        let k = SimKernel::new();
        discard_inode(&k, EventType::Open, 5, 100, true, 0);
        discard_inode(&k, EventType::Open, 6, 100, true, 0);
        bump_mount_discarder_revision(&k, 5);
        assert!(!is_discarded_by_inode(&k, EventType::Open, 5, 100, true));
        assert!(is_discarded_by_inode(&k, EventType::Open, 6, 100, true));
    }

    #[test]
    fn expired_inode_discarder_is_retained() {
        let k = SimKernel::new();
        discard_inode(&k, EventType::Open, 5, 100, true, 0);
        expire_inode_discarders(&k, 5, 100);
        assert!(!is_discarded_by_inode(&k, EventType::Open, 5, 100, true));

        k.advance(SEC);
        assert!(!discard_inode(&k, EventType::Open, 5, 100, true, 0));
        assert!(!is_discarded_by_inode(&k, EventType::Open, 5, 100, true));

        k.advance(5 * SEC);
        assert!(discard_inode(&k, EventType::Open, 5, 100, true, 0));
        assert!(is_discarded_by_inode(&k, EventType::Open, 5, 100, true));
    }

    #[test]
    fn pid_discarder_timeout_and_retention() {
        let k = SimKernel::new();
        let delta = 2 * SEC;
        assert!(discard_pid(&k, EventType::Open, 42, delta));
        for step in [0, SEC, delta] {
            k.set_time(SimKernel::EPOCH + step);
            assert!(is_discarded_by_pid(&k, EventType::Open, 42));
        }
        k.set_time(SimKernel::EPOCH + delta + 1);
        assert!(!is_discarded_by_pid(&k, EventType::Open, 42));
        // inside retention the add is ignored
        assert!(!discard_pid(&k, EventType::Open, 42, delta));

        k.set_time(SimKernel::EPOCH + delta + DEFAULT_DISCARDER_RETENTION_NS + 1);
        assert!(discard_pid(&k, EventType::Open, 42, delta));
        assert!(is_discarded_by_pid(&k, EventType::Open, 42));
    }

    #[test]
    fn active_entry_accepts_more_event_types() {
        let k = SimKernel::new();
        assert!(discard_pid(&k, EventType::Open, 42, 10 * SEC));
        assert!(discard_pid(&k, EventType::Chmod, 42, 10 * SEC));
        assert!(is_discarded_by_pid(&k, EventType::Open, 42));
        assert!(is_discarded_by_pid(&k, EventType::Chmod, 42));
        expire_pid_discarder(&k, 42);
        k.advance(1);
        assert!(!is_discarded_by_pid(&k, EventType::Open, 42));
    }

    #[test]
    fn non_discardable_types_are_refused() {
        let k = SimKernel::new();
        assert!(!discard_pid(&k, EventType::Exec, 42, SEC));
        assert!(!is_discarded_by_pid(&k, EventType::Exec, 42));
    }
}
