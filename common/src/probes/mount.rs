//! `mount` and `umount` syscalls.

use crate::consts::FSTYPE_LEN;
use crate::dentry::{start_resolver, DentryCallback, ResolverInput};
use crate::event::{EventType, MountFields};
use crate::kernel::{Kernel, Next};
use crate::kobj;
use crate::mount;
use crate::probes::callbacks::emit_syscall;
use crate::syscall_cache::{cache_syscall, is_unhandled_error, pop_syscall, update_syscall, SyscallCache, SyscallData};

/// `mount(2)` entry; `fstype` is the user string naming the filesystem.
pub fn sys_mount_enter<K: Kernel>(k: &K, fstype: u64) -> Next {
    let mut fields = MountFields::default();
    let mut name = [0u8; FSTYPE_LEN];
    if k.read_user_str(fstype, &mut name).is_some() {
        fields.fstype = name;
    }
    cache_syscall(
        k,
        SyscallCache::new(
            EventType::Mount,
            SyscallData::Mount {
                fields,
                mountpoint_dentry: 0,
            },
        ),
    );
    Next::Done
}

/// `attach_recursive_mnt`: the new mount is wired under its parent.
pub fn handle_mount_attach<K: Kernel>(k: &K, new_mnt: u64, parent_mnt: u64, mountpoint: u64) -> Next {
    let mount_id = kobj::vfsmount_mount_id(k, new_mnt);
    let parent_mount_id = kobj::vfsmount_mount_id(k, parent_mnt);
    let device = kobj::sb_dev(k, kobj::vfsmount_sb(k, new_mnt));
    let root_key = kobj::dentry_key(k, kobj::vfsmount_root(k, new_mnt), mount_id);
    let mountpoint_key = kobj::dentry_key(k, mountpoint, parent_mount_id);
    let _ = update_syscall(k, EventType::Mount, |entry| {
        if let SyscallData::Mount {
            fields,
            mountpoint_dentry,
        } = &mut entry.data
        {
            fields.mount_id = mount_id;
            fields.parent_mount_id = parent_mount_id;
            fields.device = device;
            fields.root_key = root_key;
            fields.mountpoint_key = mountpoint_key;
            *mountpoint_dentry = mountpoint;
        }
    });
    Next::Done
}

/// `mount(2)` exit: walks the mountpoint, then emits.
pub fn sys_mount_exit<K: Kernel>(k: &K, retval: i64) -> Next {
    if retval != 0 {
        let _ = pop_syscall(k, EventType::Mount);
        return Next::Done;
    }
    let walk = update_syscall(k, EventType::Mount, |entry| {
        entry.retval = retval;
        match entry.data {
            SyscallData::Mount {
                fields,
                mountpoint_dentry,
            } if mountpoint_dentry != 0 && fields.mount_id != 0 => Some(ResolverInput::new(
                fields.mountpoint_key,
                mountpoint_dentry,
                EventType::Any,
                DentryCallback::EmitSyscall,
            )),
            _ => None,
        }
    });
    match walk {
        Some(Some(input)) => start_resolver(k, input),
        Some(None) => {
            // no attach seen: nothing was mounted
            let _ = pop_syscall(k, EventType::Mount);
            Next::Done
        }
        None => Next::Done,
    }
}

pub fn sys_umount_enter<K: Kernel>(k: &K) -> Next {
    cache_syscall(k, SyscallCache::new(EventType::Umount, SyscallData::Umount { mount_id: 0 }));
    Next::Done
}

/// `security_sb_umount(vfsmount, flags)`.
pub fn handle_security_sb_umount<K: Kernel>(k: &K, vfsmount: u64) -> Next {
    let id = kobj::vfsmount_mount_id(k, vfsmount);
    let _ = update_syscall(k, EventType::Umount, |entry| {
        if let SyscallData::Umount { mount_id } = &mut entry.data {
            *mount_id = id;
        }
    });
    Next::Done
}

pub fn sys_umount_exit<K: Kernel>(k: &K, retval: i64) -> Next {
    let Some(mut entry) = pop_syscall(k, EventType::Umount) else {
        return Next::Done;
    };
    let SyscallData::Umount { mount_id } = entry.data else {
        return Next::Done;
    };
    if retval == 0 && mount_id != 0 {
        mount::umounted(k, mount_id);
    }
    if !is_unhandled_error(retval) {
        entry.retval = retval;
        emit_syscall(k, &entry);
    }
    Next::Done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erpc::read_path;
    use crate::event::{MountEvent, MountReleasedEvent, UmountEvent};
    use crate::sim::SimKernel;

    #[test]
    fn mount_reports_ids_and_mountpoint_path() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Mount]);
        k.spawn_task(50, 50, 1);
        k.set_current(50, 50);
        let root = k.root_dentry(2);
        let parent = k.add_mount(1, root, 0, 0);
        let mnt_dir = k.add_dentry(root, "mnt", 10);
        let data = k.add_dentry(mnt_dir, "data", 11);
        let fs_root = k.root_dentry(2);
        let new = k.add_mount(7, fs_root, 1, data);
        let fstype = k.alloc_user(16);
        k.write_user_bytes(fstype, b"ext4\0");

        sys_mount_enter(&k, fstype);
        handle_mount_attach(&k, new, parent, data);
        k.run(sys_mount_exit(&k, 0));

        let ev: MountEvent = k.events_of(EventType::Mount)[0].decode();
        assert_eq!(ev.mount.mount_id, 7);
        assert_eq!(ev.mount.parent_mount_id, 1);
        assert_eq!(&ev.mount.fstype[..5], b"ext4\0");
        assert_eq!(read_path(&k, ev.mount.mountpoint_key).as_deref(), Some("/mnt/data"));
    }

    #[test]
    fn failed_mount_is_dropped() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Mount]);
        k.set_current(50, 50);
        sys_mount_enter(&k, 0);
        k.run(sys_mount_exit(&k, -16));
        assert!(k.events().is_empty());
        assert!(crate::syscall_cache::peek_syscall(&k, EventType::Any).is_none());
    }

    #[test]
    fn umount_releases_unreferenced_mounts() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Umount, EventType::MountReleased]);
        k.set_current(50, 50);
        let root = k.root_dentry(2);
        let mnt = k.add_mount(9, root, 1, 0);

        sys_umount_enter(&k);
        handle_security_sb_umount(&k, mnt);
        sys_umount_exit(&k, 0);

        let ev: UmountEvent = k.events_of(EventType::Umount)[0].decode();
        assert_eq!(ev.mount_id, 9);
        let released: MountReleasedEvent = k.events_of(EventType::MountReleased)[0].decode();
        assert_eq!(released.mount_id, 9);
    }
}
