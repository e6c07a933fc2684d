//! `DentryCallback` tail-call target and syscall event assembly.

use crate::consts::event_flags;
use crate::dentry::{start_resolver, DentryCallback, ResolverInput};
use crate::emit::send_event_with;
use crate::event::*;
use crate::kernel::{zeroed, Kernel, Next, Prog};
use crate::probes::fs::resolution_failed;
use crate::process::{self, next_exec_walk};
use crate::syscall_cache::{peek_syscall, pop_syscall, SyscallCache, SyscallData};

/// The walk that follows the one just finished, for multi-file events.
///
/// RENAME walks the moved dentry a second time under the target key; LINK
/// walks the new dentry.
pub fn next_walk(entry: &SyscallCache) -> Option<ResolverInput> {
    let SyscallData::TwoFiles {
        target,
        source_dentry,
        target_dentry,
        ..
    } = entry.data
    else {
        return None;
    };
    if entry.resolver.pass != 0 {
        return None;
    }
    let dentry = match entry.event_type {
        EventType::Rename => source_dentry,
        _ => target_dentry,
    };
    if dentry == 0 {
        return None;
    }
    let mut input = ResolverInput::new(target.path_key, dentry, EventType::Any, DentryCallback::EmitSyscall);
    input.pass = 1;
    input.flags = entry.resolver.flags;
    Some(input)
}

/// Body of the `DentryCallback` tail-call target.
pub fn dentry_callback_program<K: Kernel>(k: &K) -> Next {
    let Some(entry) = peek_syscall(k, EventType::Any) else {
        return Next::Done;
    };
    match DentryCallback::from_u32(entry.resolver.callback) {
        DentryCallback::None => Next::Done,
        DentryCallback::ParseArgsEnvs => match next_exec_walk(&entry) {
            Some(input) => start_resolver(k, input),
            None => Next::TailCall(Prog::ArgsEnvsParser),
        },
        DentryCallback::EmitSyscall => {
            if resolution_failed(&entry.resolver) {
                let _ = pop_syscall(k, entry.event_type);
                return Next::Done;
            }
            if let Some(input) = next_walk(&entry) {
                return start_resolver(k, input);
            }
            if let Some(entry) = pop_syscall(k, entry.event_type) {
                emit_syscall(k, &entry);
            }
            Next::Done
        }
    }
}

fn syscall_context(entry: &SyscallCache) -> SyscallContext {
    SyscallContext {
        retval: entry.retval,
        ctx_id: entry.ctx_id,
        _pad: 0,
    }
}

fn send<K: Kernel, E: Event>(k: &K, entry: &SyscallCache, ev: &mut E) -> bool {
    let mut flags = entry.resolver.flags as u16;
    if entry.is_async {
        flags |= event_flags::ASYNC;
    }
    send_event_with(k, entry.event_type, ev, entry.submitter, flags)
}

/// Builds and sends the event of a completed syscall.
pub fn emit_syscall<K: Kernel>(k: &K, entry: &SyscallCache) -> bool {
    let syscall = syscall_context(entry);
    match entry.data {
        SyscallData::Open { file, flags, mode, .. } => send(
            k,
            entry,
            &mut OpenEvent {
                syscall,
                file,
                flags,
                mode,
                ..Default::default()
            },
        ),
        SyscallData::Mkdir { file, mode, .. } => send(
            k,
            entry,
            &mut MkdirEvent {
                syscall,
                file,
                mode,
                ..Default::default()
            },
        ),
        SyscallData::Unlink { file, flags, .. } => send(
            k,
            entry,
            &mut UnlinkEvent {
                syscall,
                file,
                flags,
                ..Default::default()
            },
        ),
        SyscallData::Rmdir { file, .. } | SyscallData::Chdir { file, .. } => send(
            k,
            entry,
            &mut FileEvent {
                syscall,
                file,
                ..Default::default()
            },
        ),
        SyscallData::TwoFiles { source, target, .. } => send(
            k,
            entry,
            &mut TwoFileEvent {
                syscall,
                source,
                target,
                ..Default::default()
            },
        ),
        SyscallData::Setattr {
            file,
            mode,
            uid,
            gid,
            atime,
            mtime,
            ..
        } => send(
            k,
            entry,
            &mut SetattrEvent {
                syscall,
                file,
                mode,
                uid,
                gid,
                atime,
                mtime,
                ..Default::default()
            },
        ),
        SyscallData::Xattr { file, name, .. } => {
            let mut ev: XattrEvent = zeroed();
            ev.syscall = syscall;
            ev.file = file;
            ev.name = name;
            send(k, entry, &mut ev)
        }
        SyscallData::Mmap {
            file,
            addr,
            offset,
            len,
            prot,
            flags,
            ..
        } => send(
            k,
            entry,
            &mut MmapEvent {
                syscall,
                file,
                addr,
                offset,
                len,
                protection: prot,
                flags,
                ..Default::default()
            },
        ),
        SyscallData::Mprotect {
            vm_start,
            vm_end,
            vm_prot,
            req_prot,
        } => send(
            k,
            entry,
            &mut MprotectEvent {
                syscall,
                vm_start,
                vm_end,
                vm_protection: vm_prot,
                req_protection: req_prot,
                ..Default::default()
            },
        ),
        SyscallData::Splice {
            file,
            entry_flag,
            exit_flag,
            ..
        } => send(
            k,
            entry,
            &mut SpliceEvent {
                syscall,
                file,
                pipe_entry_flag: entry_flag,
                pipe_exit_flag: exit_flag,
                ..Default::default()
            },
        ),
        SyscallData::Mount { fields, .. } => send(
            k,
            entry,
            &mut MountEvent {
                syscall,
                mount: fields,
                ..Default::default()
            },
        ),
        SyscallData::Umount { mount_id } => send(
            k,
            entry,
            &mut UmountEvent {
                syscall,
                mount_id,
                ..Default::default()
            },
        ),
        SyscallData::SetCred => emit_credentials(k, entry, syscall),
        SyscallData::Bind {
            addr,
            family,
            port,
            protocol,
            ..
        } => send(
            k,
            entry,
            &mut BindEvent {
                syscall,
                addr,
                family,
                port,
                protocol,
                ..Default::default()
            },
        ),
        // EXEC goes out through the args/envs parser
        SyscallData::Exec { .. } => false,
    }
}

fn emit_credentials<K: Kernel>(k: &K, entry: &SyscallCache, syscall: SyscallContext) -> bool {
    let tgid = match entry.submitter {
        0 => k.tgid(),
        submitter => (submitter >> 32) as u32,
    };
    let creds = process::pid_entry(k, tgid)
        .map(|p| p.credentials)
        .unwrap_or_default();
    match entry.event_type {
        EventType::SetUid => send(
            k,
            entry,
            &mut SetidEvent {
                syscall,
                id: creds.uid,
                eid: creds.euid,
                fsid: creds.fsuid,
                ..Default::default()
            },
        ),
        EventType::SetGid => send(
            k,
            entry,
            &mut SetidEvent {
                syscall,
                id: creds.gid,
                eid: creds.egid,
                fsid: creds.fsgid,
                ..Default::default()
            },
        ),
        EventType::Capset => send(
            k,
            entry,
            &mut CapsetEvent {
                syscall,
                cap_effective: creds.cap_effective,
                cap_permitted: creds.cap_permitted,
                ..Default::default()
            },
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathKey;
    use crate::sim::SimKernel;

    fn rename_entry(pass: u32) -> SyscallCache {
        let mut entry = SyscallCache::new(
            EventType::Rename,
            SyscallData::TwoFiles {
                source: File::default(),
                target: File {
                    path_key: PathKey::new(30, 1, 1),
                    ..File::default()
                },
                source_dentry: 0x10,
                target_dentry: 0x20,
            },
        );
        entry.resolver.pass = pass;
        entry.resolver.flags = event_flags::SAVED_BY_AD as u32;
        entry
    }

    #[test]
    fn rename_walks_the_moved_dentry_once_more() {
        let input = next_walk(&rename_entry(0)).unwrap();
        assert_eq!(input.dentry, 0x10);
        assert_eq!(input.key, PathKey::new(30, 1, 1));
        assert_eq!(input.pass, 1);
        assert_eq!(input.flags, event_flags::SAVED_BY_AD as u32);
        assert!(next_walk(&rename_entry(1)).is_none());
    }

    #[test]
    fn link_walks_the_new_dentry() {
        let mut entry = rename_entry(0);
        entry.event_type = EventType::Link;
        assert_eq!(next_walk(&entry).unwrap().dentry, 0x20);
    }

    #[test]
    fn failed_walk_drops_the_entry() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Rename]);
        k.set_current(10, 10);
        let mut entry = rename_entry(1);
        entry.resolver.callback = DentryCallback::EmitSyscall as u32;
        entry.resolver.ret = crate::dentry::ResolverError::Invalid as i32;
        crate::syscall_cache::restore_syscall(&k, &entry);

        assert_eq!(dentry_callback_program(&k), Next::Done);
        assert!(peek_syscall(&k, EventType::Any).is_none());
        assert!(k.events().is_empty());
    }

    #[test]
    fn truncated_walk_still_emits() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Rename]);
        k.set_current(10, 10);
        let mut entry = rename_entry(1);
        entry.resolver.callback = DentryCallback::EmitSyscall as u32;
        entry.resolver.ret = crate::dentry::ResolverError::TailCallExhausted as i32;
        crate::syscall_cache::restore_syscall(&k, &entry);

        dentry_callback_program(&k);
        let ev: TwoFileEvent = k.events_of(EventType::Rename)[0].decode();
        assert_ne!(ev.base.header.flags & event_flags::SAVED_BY_AD, 0);
    }
}
