//! Path-segment store.
//!
//! An LRU map from a child [`PathKey`] to its [`PathLeaf`]: the parent key and
//! the segment name. Only the dentry resolver inserts; the resolver and the
//! eRPC read-out look segments up. A leaf whose parent has inode 0 is a root.

use crate::consts::{MOUNT_REVISION_SLOTS, SEGMENT_BUFFER_LEN};
use crate::kernel::{plain, Kernel, Map, MapError, UpdateFlag};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathKey {
    pub ino: u64,
    pub mount_id: u32,
    pub path_id: u32,
}

impl PathKey {
    pub const ZERO: PathKey = PathKey {
        ino: 0,
        mount_id: 0,
        path_id: 0,
    };

    pub fn new(ino: u64, mount_id: u32, path_id: u32) -> Self {
        Self {
            ino,
            mount_id,
            path_id,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.ino == 0
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathLeaf {
    pub parent: PathKey,
    pub name: [u8; SEGMENT_BUFFER_LEN],
    pub len: u16,
    pub _pad: [u8; 6],
}

plain!(PathKey, PathLeaf);

impl PathLeaf {
    pub fn new(parent: PathKey, name: &[u8]) -> Self {
        let mut leaf = Self::sentinel();
        leaf.parent = parent;
        let len = name.len().min(SEGMENT_BUFFER_LEN - 1);
        leaf.name[..len].copy_from_slice(&name[..len]);
        leaf.len = len as u16;
        leaf
    }

    /// Empty name, zero parent. Marks where a truncated walk stopped.
    pub fn sentinel() -> Self {
        Self {
            parent: PathKey::ZERO,
            name: [0; SEGMENT_BUFFER_LEN],
            len: 0,
            _pad: [0; 6],
        }
    }

    pub fn name_bytes(&self) -> &[u8] {
        &self.name[..(self.len as usize).min(SEGMENT_BUFFER_LEN - 1)]
    }

    pub fn is_root(&self) -> bool {
        self.parent.ino == 0
    }
}

pub fn insert_segment<K: Kernel>(k: &K, key: &PathKey, leaf: &PathLeaf) -> Result<(), MapError> {
    k.path_cache().store(key, leaf, UpdateFlag::Any)
}

pub fn lookup_segment<K: Kernel>(k: &K, key: &PathKey) -> Option<PathLeaf> {
    k.path_cache().lookup(key)
}

fn path_id_slot(mount_id: u32) -> u32 {
    mount_id % MOUNT_REVISION_SLOTS
}

/// Current path generation for `mount_id`.
///
/// With `invalidate`, the generation is bumped after being read: the caller
/// keeps resolving under the old id while later lookups miss the stale entries.
pub fn get_path_id<K: Kernel>(k: &K, mount_id: u32, invalidate: bool) -> u32 {
    let slot = path_id_slot(mount_id);
    let current = k.path_ids().lookup(&slot).unwrap_or(0);
    if invalidate {
        let _ = k.path_ids().with_mut(&slot, |id| *id = id.wrapping_add(1));
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimKernel;

    #[test]
    fn leaf_truncates_long_names() {
        let name = [b'a'; 400];
        let leaf = PathLeaf::new(PathKey::new(2, 1, 0), &name);
        assert_eq!(leaf.name_bytes().len(), 255);
        assert_eq!(leaf.name[255], 0);
    }

    #[test]
    fn path_id_bumps_after_read() {
        let k = SimKernel::new();
        assert_eq!(get_path_id(&k, 7, false), 0);
        assert_eq!(get_path_id(&k, 7, true), 0);
        assert_eq!(get_path_id(&k, 7, false), 1);
        assert_eq!(get_path_id(&k, 7 + MOUNT_REVISION_SLOTS, false), 1);
        assert_eq!(get_path_id(&k, 8, false), 0);
    }

    #[test]
    fn segments_round_trip_through_the_cache() {
        let k = SimKernel::new();
        let key = PathKey::new(42, 3, 0);
        insert_segment(&k, &key, &PathLeaf::new(PathKey::new(2, 3, 0), b"passwd")).unwrap();
        let leaf = lookup_segment(&k, &key).unwrap();
        assert_eq!(leaf.name_bytes(), b"passwd");
        assert!(!leaf.is_root());
        assert!(lookup_segment(&k, &PathKey::new(43, 3, 0)).is_none());
    }
}
