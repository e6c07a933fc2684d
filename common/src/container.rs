//! Container ids from cgroup directory names.
//!
//! Runtimes name the cgroup of a container `<prefix><id>[.scope]`. Only the
//! known prefixes are peeled; anything else is not a container.

use crate::consts::{CONTAINER_ID_LEN, SEGMENT_BUFFER_LEN};
use crate::event::ContainerContext;
use crate::kernel::{plain, Kernel, Next};
use crate::kobj;
use crate::path::PathKey;
use crate::process;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContainerId(pub [u8; CONTAINER_ID_LEN]);

impl Default for ContainerId {
    fn default() -> Self {
        ContainerId([0; CONTAINER_ID_LEN])
    }
}

impl ContainerId {
    pub fn from_bytes(id: &[u8]) -> Self {
        let mut out = [0u8; CONTAINER_ID_LEN];
        let len = id.len().min(CONTAINER_ID_LEN);
        out[..len].copy_from_slice(&id[..len]);
        ContainerId(out)
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(CONTAINER_ID_LEN);
        &self.0[..len]
    }
}

plain!(ContainerId);

/// Runtime that created a container, stored in `cgroup_flags`.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CgroupManager {
    Docker = 1,
    Crio = 2,
    Podman = 3,
    Containerd = 4,
}

const RUNTIME_PREFIXES: [(&[u8], CgroupManager); 4] = [
    (b"docker-", CgroupManager::Docker),
    (b"crio-", CgroupManager::Crio),
    (b"libpod-", CgroupManager::Podman),
    (b"cri-containerd-", CgroupManager::Containerd),
];

/// Extracts the container id from a cgroup directory name.
pub fn parse_container_id(name: &[u8]) -> Option<(ContainerId, CgroupManager)> {
    let (prefix, manager) = RUNTIME_PREFIXES
        .iter()
        .find(|(prefix, _)| name.starts_with(prefix))?;
    let rest = &name[prefix.len()..];
    let end = rest.iter().position(|&b| b == b'.').unwrap_or(rest.len());
    let id = &rest[..end];
    if id.is_empty() || id.len() > CONTAINER_ID_LEN || !id.iter().all(u8::is_ascii_alphanumeric) {
        return None;
    }
    Some((ContainerId::from_bytes(id), *manager))
}

/// Parses the decimal pid written to `cgroup.procs`. Zero means the writer.
pub fn parse_pid(buf: &[u8]) -> Option<u32> {
    let mut pid: u32 = 0;
    let mut digits = 0;
    for &b in buf.iter().take(16) {
        match b {
            b'0'..=b'9' => {
                pid = pid.checked_mul(10)?.checked_add((b - b'0') as u32)?;
                digits += 1;
            }
            b'\n' | b' ' | 0 => break,
            _ => return None,
        }
    }
    if digits == 0 {
        return None;
    }
    Some(pid)
}

fn attach<K: Kernel>(k: &K, pid_buf: &[u8], name: &[u8], cgroup_id: u64) -> Next {
    let Some((id, manager)) = parse_container_id(name) else {
        return Next::Done;
    };
    let pid = match parse_pid(pid_buf) {
        Some(0) | None => k.tgid(),
        Some(pid) => pid,
    };
    let context = ContainerContext {
        container_id: id.0,
        cgroup_flags: manager as u64,
        cgroup_file: PathKey::new(cgroup_id, 0, 0),
    };
    process::set_container(k, pid, &context);
    crate::activity_dump::admit(k, pid, &context);
    Next::Done
}

/// `cgroup_procs_write(of, buf, ...)` and `cgroup1_procs_write`.
pub fn handle_cgroup_write<K: Kernel>(k: &K, of: u64, buf: u64) -> Next {
    let mut pid_buf = [0u8; 16];
    if k.read_kernel_str(buf, &mut pid_buf).is_none() {
        return Next::Done;
    }
    let kn = kobj::kernfs_of_node(k, of);
    let dir = kobj::kernfs_parent(k, kn);
    let mut name = [0u8; SEGMENT_BUFFER_LEN];
    let len = kobj::kernfs_name(k, dir, &mut name);
    attach(k, &pid_buf, &name[..len], kobj::kernfs_id(k, dir))
}

/// Legacy kernels pass the cgroup and the pid instead of the written buffer.
pub fn handle_cgroup_write_legacy<K: Kernel>(k: &K, cgroup: u64, pid: u64) -> Next {
    let dentry = kobj::cgroup_dentry(k, cgroup);
    let mut name = [0u8; SEGMENT_BUFFER_LEN];
    let len = kobj::dentry_name(k, dentry, &mut name);
    let mut pid_buf = [0u8; 16];
    write_decimal(pid as u32, &mut pid_buf);
    let (ino, _) = kobj::effective_ino(k, kobj::dentry_inode(k, dentry));
    attach(k, &pid_buf, &name[..len], ino)
}

fn write_decimal(mut v: u32, out: &mut [u8; 16]) {
    let mut tmp = [0u8; 10];
    let mut n = 0;
    loop {
        tmp[n] = b'0' + (v % 10) as u8;
        n += 1;
        v /= 10;
        if v == 0 || n == tmp.len() {
            break;
        }
    }
    for i in 0..n {
        out[i] = tmp[n - 1 - i];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_prefixes_are_peeled() {
        let id = "a".repeat(64);
        let (parsed, manager) = parse_container_id(format!("docker-{}.scope", id).as_bytes()).unwrap();
        assert_eq!(parsed.as_bytes(), id.as_bytes());
        assert_eq!(manager, CgroupManager::Docker);

        let (parsed, manager) = parse_container_id(b"cri-containerd-0123abc.scope").unwrap();
        assert_eq!(parsed.as_bytes(), b"0123abc");
        assert_eq!(manager, CgroupManager::Containerd);

        assert!(parse_container_id(b"libpod-abc").is_some());
        assert!(parse_container_id(b"crio-abc").is_some());
    }

    #[test]
    fn unknown_or_invalid_names_are_ignored() {
        assert!(parse_container_id(b"user.slice").is_none());
        assert!(parse_container_id(b"docker-").is_none());
        assert!(parse_container_id(b"docker-ab$cd.scope").is_none());
        assert!(parse_container_id(format!("docker-{}", "b".repeat(65)).as_bytes()).is_none());
    }

    #[test]
    fn pids_parse_from_the_written_buffer() {
        assert_eq!(parse_pid(b"1234\n"), Some(1234));
        assert_eq!(parse_pid(b"0"), Some(0));
        assert_eq!(parse_pid(b""), None);
        assert_eq!(parse_pid(b"12a"), None);
        let mut buf = [0u8; 16];
        write_decimal(40213, &mut buf);
        assert_eq!(parse_pid(&buf), Some(40213));
    }
}
