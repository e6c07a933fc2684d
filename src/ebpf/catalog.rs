//! What the agent attaches, and where.
//!
//! Pure data: the manager walks these tables against the loaded object.
//! Each [`ProbeGroup`] is attached as a unit; when one of its probes finds
//! no target in the running kernel the group's fallback is attached instead.

use secwatch_common::kernel::Prog;

/// Which hook flavour the object was built with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flavour {
    Kprobe,
    Fentry,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Hook {
    /// Kernel function entry: kprobe, or fentry in the fentry flavour.
    Entry,
    /// Kernel function return: kretprobe, or fexit.
    Return,
    Tracepoint { category: &'static str },
    RawTracepoint,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeSpec {
    pub program: String,
    pub hook: Hook,
    /// Candidate attach points; the first one the kernel has wins.
    pub targets: Vec<String>,
    /// A missing target skips the probe instead of failing its group.
    pub optional: bool,
}

impl ProbeSpec {
    fn new(program: impl Into<String>, hook: Hook, targets: &[String]) -> Self {
        Self {
            program: program.into(),
            hook,
            targets: targets.to_vec(),
            optional: false,
        }
    }

    fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    fn entry(function: &str) -> Self {
        Self::new(function, Hook::Entry, &[function.to_string()])
    }

    fn ret(program: &str, function: &str) -> Self {
        Self::new(program, Hook::Return, &[function.to_string()])
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeGroup {
    pub name: String,
    pub probes: Vec<ProbeSpec>,
    pub fallback: Vec<ProbeSpec>,
}

impl ProbeGroup {
    fn single(probe: ProbeSpec) -> Self {
        Self {
            name: probe.program.clone(),
            probes: vec![probe],
            fallback: Vec::new(),
        }
    }
}

/// Syscalls hooked through their wrappers, by the name the object uses.
/// `true` when the syscall has an exit probe.
pub const SYSCALLS: &[(&str, bool)] = &[
    ("open", true),
    ("openat", true),
    ("openat2", true),
    ("creat", true),
    ("mkdir", true),
    ("mkdirat", true),
    ("link", true),
    ("linkat", true),
    ("rename", true),
    ("renameat", true),
    ("renameat2", true),
    ("unlink", true),
    ("unlinkat", true),
    ("rmdir", true),
    ("chmod", true),
    ("fchmod", true),
    ("fchmodat", true),
    ("chown", true),
    ("fchown", true),
    ("lchown", true),
    ("fchownat", true),
    ("utimes", true),
    ("utimensat", true),
    ("setxattr", true),
    ("lsetxattr", true),
    ("fsetxattr", true),
    ("removexattr", true),
    ("lremovexattr", true),
    ("fremovexattr", true),
    ("chdir", true),
    ("fchdir", true),
    ("mmap", true),
    ("mprotect", true),
    ("splice", true),
    ("mount", true),
    // umount2(2) enters the kernel as sys_umount
    ("umount", true),
    ("execve", true),
    ("execveat", true),
    ("setuid", true),
    ("setreuid", true),
    ("setresuid", true),
    ("setfsuid", true),
    ("setgid", true),
    ("setregid", true),
    ("setresgid", true),
    ("setfsgid", true),
    ("capset", true),
    ("bind", true),
    ("ioctl", false),
];

/// Kernel functions hooked on entry.
const ENTRY_HOOKS: &[&str] = &[
    "vfs_open",
    "security_path_mkdir",
    "security_path_unlink",
    "security_path_rmdir",
    "security_path_rename",
    "security_path_link",
    "mnt_want_write",
    "mnt_want_write_file",
    "security_inode_setattr",
    "vfs_setxattr",
    "vfs_removexattr",
    "set_fs_pwd",
    "security_mmap_file",
    "security_file_mprotect",
    "attach_recursive_mnt",
    "security_sb_umount",
    "security_bprm_check",
    "do_exit",
    "commit_creds",
    "cgroup_procs_write",
    "cgroup1_procs_write",
    "cgroup_tasks_write",
    "security_socket_bind",
    "security_sk_classify_flow",
    "sk_destruct",
    "inet_release",
    "nf_nat_manip_pkt",
    "nf_nat_packet",
    "nf_ct_delete",
    "proc_fd_link",
    "path_get",
];

/// Kernel functions hooked on entry and return, as one group.
const ENTRY_RETURN_HOOKS: &[&str] = &["io_issue_sqe", "veth_newlink", "register_netdevice"];

fn syscall_group(name: &str, has_exit: bool, flavour: Flavour) -> ProbeGroup {
    let native = format!("__x64_sys_{name}");
    let mut probes = vec![ProbeSpec::new(format!("sys_{name}"), Hook::Entry, &[native.clone()])];
    if flavour == Flavour::Kprobe {
        probes.push(ProbeSpec::new(
            format!("compat_sys_{name}"),
            Hook::Entry,
            &[format!("__ia32_compat_sys_{name}"), format!("__ia32_sys_{name}")],
        )
        .optional());
    }
    if has_exit {
        probes.push(ProbeSpec::new(format!("sys_{name}_ret"), Hook::Return, &[native]));
    }

    let syscalls = Hook::Tracepoint { category: "syscalls" };
    let mut fallback = vec![ProbeSpec::new(
        format!("tp_enter_{name}"),
        syscalls.clone(),
        &[format!("sys_enter_{name}")],
    )];
    if has_exit {
        fallback.push(ProbeSpec::new(format!("tp_exit_{name}"), syscalls, &[format!("sys_exit_{name}")]));
    }

    ProbeGroup {
        name: format!("sys_{name}"),
        probes,
        fallback,
    }
}

/// Every probe group of the object, in attach order.
pub fn catalog(flavour: Flavour) -> Vec<ProbeGroup> {
    let mut groups: Vec<ProbeGroup> = SYSCALLS
        .iter()
        .map(|(name, has_exit)| syscall_group(name, *has_exit, flavour))
        .collect();

    groups.extend(ENTRY_HOOKS.iter().map(|f| ProbeGroup::single(ProbeSpec::entry(f))));

    for f in ENTRY_RETURN_HOOKS {
        groups.push(ProbeGroup {
            name: f.to_string(),
            probes: vec![ProbeSpec::entry(f), ProbeSpec::ret(&format!("{f}_ret"), f)],
            fallback: Vec::new(),
        });
    }

    // fexit sees the arguments, so the fentry flavour needs no entry half
    let mut pipe = vec![ProbeSpec::ret("get_pipe_info_ret", "get_pipe_info")];
    if flavour == Flavour::Kprobe {
        pipe.insert(0, ProbeSpec::entry("get_pipe_info"));
    }
    groups.push(ProbeGroup {
        name: "get_pipe_info".into(),
        probes: pipe,
        fallback: Vec::new(),
    });

    groups.push(ProbeGroup::single(ProbeSpec::new(
        "sched_process_fork",
        Hook::RawTracepoint,
        &["sched_process_fork".to_string()],
    )));
    groups.push(ProbeGroup::single(ProbeSpec::new(
        "sched_process_exec",
        Hook::Tracepoint { category: "sched" },
        &["sched_process_exec".to_string()],
    )));
    groups.push(ProbeGroup::single(ProbeSpec::new(
        "raw_sys_enter",
        Hook::Tracepoint { category: "raw_syscalls" },
        &["sys_enter".to_string()],
    )));

    groups
}

/// Program arrays and the program families that fill them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgArray {
    /// Kprobe (or fentry) callers.
    Hook,
    /// Syscall tracepoint callers.
    Tracepoint,
    Classifier,
}

impl ProgArray {
    pub fn map_name(self) -> &'static str {
        match self {
            ProgArray::Hook => "HOOK_PROGS",
            ProgArray::Tracepoint => "TP_PROGS",
            ProgArray::Classifier => "TC_PROGS",
        }
    }

    pub const ALL: [ProgArray; 3] = [ProgArray::Hook, ProgArray::Tracepoint, ProgArray::Classifier];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TailCall {
    pub array: ProgArray,
    pub slot: Prog,
    pub program: &'static str,
}

pub const TAIL_CALLS: &[TailCall] = &[
    TailCall { array: ProgArray::Hook, slot: Prog::DentryResolver, program: "hook_dentry_resolver" },
    TailCall { array: ProgArray::Hook, slot: Prog::DentryCallback, program: "hook_dentry_callback" },
    TailCall { array: ProgArray::Hook, slot: Prog::ErpcResolvePath, program: "hook_erpc_resolve_path" },
    TailCall { array: ProgArray::Hook, slot: Prog::ArgsEnvsParser, program: "hook_args_envs_parser" },
    TailCall { array: ProgArray::Tracepoint, slot: Prog::DentryResolver, program: "tp_dentry_resolver" },
    TailCall { array: ProgArray::Tracepoint, slot: Prog::DentryCallback, program: "tp_dentry_callback" },
    TailCall { array: ProgArray::Tracepoint, slot: Prog::ErpcResolvePath, program: "tp_erpc_resolve_path" },
    TailCall { array: ProgArray::Tracepoint, slot: Prog::ArgsEnvsParser, program: "tp_args_envs_parser" },
    TailCall { array: ProgArray::Classifier, slot: Prog::DnsRequest, program: "tc_dns_request" },
    TailCall { array: ProgArray::Classifier, slot: Prog::DnsResponse, program: "tc_dns_response" },
    TailCall { array: ProgArray::Classifier, slot: Prog::Imds, program: "tc_imds" },
    TailCall { array: ProgArray::Classifier, slot: Prog::RawPacket, program: "tc_raw_packet" },
    TailCall { array: ProgArray::Classifier, slot: Prog::RawPacketDrop, program: "tc_raw_packet_drop" },
];

/// Function the fentry-flavoured hook targets are loaded against. They are
/// only ever tail-called, never attached.
pub const FENTRY_TAIL_TARGET: &str = "vfs_open";

pub const CLASSIFIER_INGRESS: &str = "classifier_ingress";
pub const CLASSIFIER_EGRESS: &str = "classifier_egress";

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn program_names_are_unique() {
        for flavour in [Flavour::Kprobe, Flavour::Fentry] {
            let mut seen = HashSet::new();
            for group in catalog(flavour) {
                for probe in group.probes.iter().chain(&group.fallback) {
                    assert!(seen.insert(probe.program.clone()), "duplicate {}", probe.program);
                }
            }
        }
    }

    #[test]
    fn syscalls_fall_back_to_tracepoints() {
        let groups = catalog(Flavour::Kprobe);
        let open = groups.iter().find(|g| g.name == "sys_openat").unwrap();
        let programs: Vec<&str> = open.probes.iter().map(|p| p.program.as_str()).collect();
        assert_eq!(programs, ["sys_openat", "compat_sys_openat", "sys_openat_ret"]);
        assert_eq!(open.probes[1].targets, ["__ia32_compat_sys_openat", "__ia32_sys_openat"]);
        assert!(open.probes[1].optional && !open.probes[0].optional);
        assert_eq!(open.fallback[0].targets, ["sys_enter_openat"]);
        assert_eq!(open.fallback[1].hook, Hook::Tracepoint { category: "syscalls" });

        let ioctl = groups.iter().find(|g| g.name == "sys_ioctl").unwrap();
        assert_eq!(ioctl.probes.len(), 2);
        assert_eq!(ioctl.fallback.len(), 1);
    }

    #[test]
    fn fentry_flavour_skips_compat_wrappers() {
        let groups = catalog(Flavour::Fentry);
        assert!(groups
            .iter()
            .flat_map(|g| &g.probes)
            .all(|p| !p.program.starts_with("compat_") && p.program != "get_pipe_info"));
    }

    #[test]
    fn every_tail_call_slot_fits_its_array() {
        for call in TAIL_CALLS {
            assert!((call.slot as u32) < 16);
            assert_eq!(call.slot.is_classifier(), call.array == ProgArray::Classifier);
        }
    }
}
