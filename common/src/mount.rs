//! Mount reference counts.
//!
//! Every tracked thread group holds one reference on the mount of its
//! executable. An unmounted mount is released when its last reference drops,
//! or immediately when nothing references it.

use crate::discarders::bump_mount_discarder_revision;
use crate::emit::send_event;
use crate::event::{EventBase, EventType, MountReleasedEvent};
use crate::kernel::{plain, Kernel, Map, UpdateFlag};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MountRef {
    pub counter: u32,
    pub umounted: u32,
}

plain!(MountRef);

pub fn inc_mount_ref<K: Kernel>(k: &K, mount_id: u32) {
    if mount_id == 0 {
        return;
    }
    let _ = k
        .mount_refs()
        .store(&mount_id, &MountRef::default(), UpdateFlag::NoExist);
    let _ = k.mount_refs().with_mut(&mount_id, |r| r.counter += 1);
}

pub fn dec_mount_ref<K: Kernel>(k: &K, mount_id: u32) {
    if mount_id == 0 {
        return;
    }
    let release = k
        .mount_refs()
        .with_mut(&mount_id, |r| {
            r.counter = r.counter.saturating_sub(1);
            r.counter == 0 && r.umounted != 0
        })
        .unwrap_or(false);
    if release {
        release_mount(k, mount_id);
    }
}

/// Marks `mount_id` as unmounted, releasing it now if unreferenced.
pub fn umounted<K: Kernel>(k: &K, mount_id: u32) {
    let release = k
        .mount_refs()
        .with_mut(&mount_id, |r| {
            r.umounted = 1;
            r.counter == 0
        })
        .unwrap_or(true);
    if release {
        release_mount(k, mount_id);
    }
}

pub fn mount_refs_of<K: Kernel>(k: &K, mount_id: u32) -> u32 {
    k.mount_refs().lookup(&mount_id).map(|r| r.counter).unwrap_or(0)
}

fn release_mount<K: Kernel>(k: &K, mount_id: u32) {
    let _ = k.mount_refs().delete(&mount_id);
    let revision = bump_mount_discarder_revision(k, mount_id);
    let mut event = MountReleasedEvent {
        base: EventBase::default(),
        mount_id,
        discarder_revision: revision,
    };
    send_event(k, EventType::MountReleased, &mut event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discarders::mount_revision;
    use crate::sim::SimKernel;

    #[test]
    fn release_waits_for_the_last_reference() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::MountReleased]);
        inc_mount_ref(&k, 7);
        inc_mount_ref(&k, 7);
        umounted(&k, 7);
        dec_mount_ref(&k, 7);
        assert!(k.events_of(EventType::MountReleased).is_empty());
        assert_eq!(mount_revision(&k, 7), 0);

        dec_mount_ref(&k, 7);
        let released = k.events_of(EventType::MountReleased);
        assert_eq!(released.len(), 1);
        let ev: MountReleasedEvent = released[0].decode();
        assert_eq!(ev.mount_id, 7);
        assert_eq!(ev.discarder_revision, 1);
        assert_eq!(mount_revision(&k, 7), 1);
        assert_eq!(mount_refs_of(&k, 7), 0);
    }

    #[test]
    fn unreferenced_mount_is_released_on_umount() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::MountReleased]);
        umounted(&k, 9);
        assert_eq!(k.events_of(EventType::MountReleased).len(), 1);
    }
}
