//! Compiles the agent config into the values of the policy maps.
//!
//! [`Policy`] is substrate-agnostic; [`PolicyMaps`] is implemented once
//! for the loaded BPF object and once for any [`Kernel`], which is how the
//! dry run and the tests see exactly what the loader would write.

use std::collections::BTreeMap;

use secwatch_common::activity_dump::{DumpControl, DEFAULT_CONFIG_KEY};
use secwatch_common::anomaly::{set_bit, ProfileState, SecurityProfile};
use secwatch_common::approvers::{
    BasenameKey, FilterPolicy, FlagApprover, FLAG_APPROVER_SLOTS, POLICY_FLAG_BASENAME,
    POLICY_FLAG_FLAGS, POLICY_MODE_ACCEPT, POLICY_MODE_DENY, POLICY_MODE_NO_FILTER,
};
use secwatch_common::consts::{RuntimeConst, APPROVE_O_RDONLY, MAX_SYSCALL_NR, SYSCALL_BITMAP_BYTES};
use secwatch_common::container::ContainerId;
use secwatch_common::event::{ActivityDumpConfig, EventType};
use secwatch_common::kernel::{Kernel, Map, MapError, UpdateFlag};
use secwatch_common::net::raw::TokenBucket;

use crate::config::{event_type, AgentConfig, ConfigError, PolicyMode, ProfileStateConfig};

const NS_PER_SEC: u64 = 1_000_000_000;

/// Highest rcode the 32-bit mute mask can hold.
const MAX_RCODE: u8 = 31;

const OPEN_FLAGS: &[(&str, u64)] = &[
    ("O_RDONLY", APPROVE_O_RDONLY),
    ("O_WRONLY", libc::O_WRONLY as u64),
    ("O_RDWR", libc::O_RDWR as u64),
    ("O_CREAT", libc::O_CREAT as u64),
    ("O_EXCL", libc::O_EXCL as u64),
    ("O_NOCTTY", libc::O_NOCTTY as u64),
    ("O_TRUNC", libc::O_TRUNC as u64),
    ("O_APPEND", libc::O_APPEND as u64),
    ("O_NONBLOCK", libc::O_NONBLOCK as u64),
    ("O_DSYNC", libc::O_DSYNC as u64),
    ("O_SYNC", libc::O_SYNC as u64),
    ("O_DIRECT", libc::O_DIRECT as u64),
    ("O_DIRECTORY", libc::O_DIRECTORY as u64),
    ("O_NOFOLLOW", libc::O_NOFOLLOW as u64),
    ("O_NOATIME", libc::O_NOATIME as u64),
    ("O_CLOEXEC", libc::O_CLOEXEC as u64),
    ("O_PATH", libc::O_PATH as u64),
    ("O_TMPFILE", libc::O_TMPFILE as u64),
];

pub fn open_flag(name: &str) -> Result<u64, ConfigError> {
    OPEN_FLAGS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| *v)
        .ok_or_else(|| ConfigError::UnknownOpenFlag(name.to_string()))
}

/// Everything the agent writes to the policy maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub enabled_events: u64,
    pub filter_policies: Vec<(EventType, FilterPolicy)>,
    /// Basename to the mask of event types it approves.
    pub basename_approvers: BTreeMap<String, u64>,
    pub flag_approvers: [u64; FLAG_APPROVER_SLOTS as usize],
    pub dns_rcode_mask: u32,
    pub raw_packet_bucket: TokenBucket,
    pub dump_control: DumpControl,
    pub dump_template: ActivityDumpConfig,
    pub cgroup_mount_filter: Vec<u32>,
    pub security_profiles: Vec<(ContainerId, SecurityProfile)>,
}

impl Policy {
    pub fn from_config(config: &AgentConfig) -> Result<Self, ConfigError> {
        let enabled_events = if config.enabled_events.is_empty() {
            EventType::all().iter().fold(0, |mask, t| mask | t.mask())
        } else {
            config
                .enabled_events
                .iter()
                .map(|name| event_type(name).map(EventType::mask))
                .try_fold(0u64, |mask, bit| bit.map(|b| mask | b))?
        };

        let mut filter_policies = Vec::with_capacity(config.policies.len());
        for (name, p) in &config.policies {
            let mode = match p.mode {
                PolicyMode::NoFilter => POLICY_MODE_NO_FILTER,
                PolicyMode::Accept => POLICY_MODE_ACCEPT,
                PolicyMode::Deny => POLICY_MODE_DENY,
            };
            let mut flags = 0;
            if p.basename {
                flags |= POLICY_FLAG_BASENAME;
            }
            if p.flags {
                flags |= POLICY_FLAG_FLAGS;
            }
            filter_policies.push((event_type(name)?, FilterPolicy { mode, flags }));
        }

        // a basename listed under several types approves all of them
        let mut basename_approvers = BTreeMap::new();
        for (basename, types) in &config.approvers.basenames {
            let mut mask = 0u64;
            for name in types {
                mask |= event_type(name)?.mask();
            }
            *basename_approvers.entry(basename.clone()).or_insert(0) |= mask;
        }

        let a = &config.approvers;
        let mut flag_approvers = [0u64; FLAG_APPROVER_SLOTS as usize];
        for name in &a.open_flags {
            flag_approvers[FlagApprover::OpenFlags as usize] |= open_flag(name)?;
        }
        flag_approvers[FlagApprover::MmapFlags as usize] = a.mmap_flags;
        flag_approvers[FlagApprover::MmapProt as usize] = a.mmap_protection;
        flag_approvers[FlagApprover::MprotectVmProt as usize] = a.mprotect_vm_protection;
        flag_approvers[FlagApprover::MprotectReqProt as usize] = a.mprotect_req_protection;
        flag_approvers[FlagApprover::SpliceEntryFlags as usize] = a.splice_entry_flags;
        flag_approvers[FlagApprover::SpliceExitFlags as usize] = a.splice_exit_flags;

        let mut dns_rcode_mask = 0u32;
        for &rcode in &config.dns.muted_rcodes {
            if rcode > MAX_RCODE {
                return Err(ConfigError::InvalidRcode(rcode));
            }
            dns_rcode_mask |= 1 << rcode;
        }

        let raw = &config.raw_packet;
        if raw.enabled && (raw.rate == 0 || raw.burst == 0) {
            return Err(ConfigError::NotPositive("raw_packet.rate and raw_packet.burst"));
        }
        let raw_packet_bucket = TokenBucket::new(raw.rate, raw.burst);

        let ad = &config.activity_dump;
        let mut event_mask = 0u64;
        for name in &ad.event_types {
            event_mask |= event_type(name)?.mask();
        }
        let dump_control = DumpControl {
            enabled: ad.enabled as u32,
            filter_by_mount: !ad.cgroup_mount_ids.is_empty() as u32,
        };
        let dump_template = ActivityDumpConfig {
            event_mask,
            timeout: ad.timeout_secs.saturating_mul(NS_PER_SEC),
            wait_list_timestamp: ad.wait_list_secs.saturating_mul(NS_PER_SEC),
            events_rate: ad.events_rate,
            ..ActivityDumpConfig::default()
        };

        let mut security_profiles = Vec::with_capacity(config.security_profiles.len());
        for p in &config.security_profiles {
            let mut syscalls = [0u8; SYSCALL_BITMAP_BYTES];
            for &nr in &p.syscalls {
                if nr >= MAX_SYSCALL_NR {
                    return Err(ConfigError::InvalidSyscall(nr));
                }
                set_bit(&mut syscalls, nr);
            }
            let state = match p.state {
                ProfileStateConfig::Learning => ProfileState::Learning,
                ProfileStateConfig::Stable => ProfileState::Stable,
                ProfileStateConfig::Kill => ProfileState::Kill,
            };
            security_profiles.push((
                ContainerId::from_bytes(p.container_id.as_bytes()),
                SecurityProfile {
                    cookie: p.cookie,
                    state: state as u32,
                    _pad: 0,
                    syscalls,
                },
            ));
        }

        Ok(Self {
            enabled_events,
            filter_policies,
            basename_approvers,
            flag_approvers,
            dns_rcode_mask,
            raw_packet_bucket,
            dump_control,
            dump_template,
            cgroup_mount_filter: ad.cgroup_mount_ids.clone(),
            security_profiles,
        })
    }

    /// Writes every policy map through `maps`.
    pub fn apply<M: PolicyMaps>(&self, maps: &mut M) -> Result<(), M::Error> {
        maps.set_enabled_events(self.enabled_events)?;
        for (t, p) in &self.filter_policies {
            maps.set_filter_policy(*t, *p)?;
        }
        for (basename, mask) in &self.basename_approvers {
            maps.insert_basename_approver(BasenameKey::new(basename.as_bytes()), *mask)?;
        }
        for (slot, mask) in self.flag_approvers.iter().enumerate() {
            maps.set_flag_approver(slot as u32, *mask)?;
        }
        maps.set_dns_rcode_mask(self.dns_rcode_mask)?;
        maps.set_raw_packet_bucket(self.raw_packet_bucket)?;
        for (id, profile) in &self.security_profiles {
            maps.insert_security_profile(*id, *profile)?;
        }
        for mount_id in &self.cgroup_mount_filter {
            maps.insert_cgroup_mount(*mount_id)?;
        }
        maps.set_dump_template(self.dump_template)?;
        // last, so no cgroup is admitted before its template exists
        maps.set_dump_control(self.dump_control)
    }
}

/// Writes the runtime constants, then the agent pid: the data plane starts
/// filtering the agent's own activity only once every offset is in place.
pub fn write_constants<M: PolicyMaps>(
    maps: &mut M,
    constants: &[(RuntimeConst, u64)],
    agent_pid: u32,
) -> Result<(), M::Error> {
    for (c, value) in constants {
        maps.set_constant(*c, *value)?;
    }
    maps.set_constant(RuntimeConst::RuntimePid, agent_pid as u64)
}

/// Writers for the agent-owned maps.
pub trait PolicyMaps {
    type Error;

    fn set_constant(&mut self, c: RuntimeConst, value: u64) -> Result<(), Self::Error>;
    fn set_enabled_events(&mut self, mask: u64) -> Result<(), Self::Error>;
    fn set_filter_policy(&mut self, t: EventType, policy: FilterPolicy) -> Result<(), Self::Error>;
    fn insert_basename_approver(&mut self, key: BasenameKey, mask: u64) -> Result<(), Self::Error>;
    fn set_flag_approver(&mut self, slot: u32, mask: u64) -> Result<(), Self::Error>;
    fn set_dns_rcode_mask(&mut self, mask: u32) -> Result<(), Self::Error>;
    fn set_raw_packet_bucket(&mut self, bucket: TokenBucket) -> Result<(), Self::Error>;
    fn insert_security_profile(&mut self, id: ContainerId, profile: SecurityProfile) -> Result<(), Self::Error>;
    fn insert_cgroup_mount(&mut self, mount_id: u32) -> Result<(), Self::Error>;
    fn set_dump_template(&mut self, config: ActivityDumpConfig) -> Result<(), Self::Error>;
    fn set_dump_control(&mut self, control: DumpControl) -> Result<(), Self::Error>;
}

/// [`PolicyMaps`] over a [`Kernel`] substrate.
pub struct KernelMaps<'a, K: Kernel>(pub &'a K);

impl<K: Kernel> PolicyMaps for KernelMaps<'_, K> {
    type Error = MapError;

    fn set_constant(&mut self, c: RuntimeConst, value: u64) -> Result<(), MapError> {
        self.0.constants().store(&(c as u32), &value, UpdateFlag::Any)
    }

    fn set_enabled_events(&mut self, mask: u64) -> Result<(), MapError> {
        self.0.enabled_events().store(&0, &mask, UpdateFlag::Any)
    }

    fn set_filter_policy(&mut self, t: EventType, policy: FilterPolicy) -> Result<(), MapError> {
        self.0.filter_policy().store(&(t as u32), &policy, UpdateFlag::Any)
    }

    fn insert_basename_approver(&mut self, key: BasenameKey, mask: u64) -> Result<(), MapError> {
        self.0.basename_approvers().store(&key, &mask, UpdateFlag::Any)
    }

    fn set_flag_approver(&mut self, slot: u32, mask: u64) -> Result<(), MapError> {
        self.0.flag_approvers().store(&slot, &mask, UpdateFlag::Any)
    }

    fn set_dns_rcode_mask(&mut self, mask: u32) -> Result<(), MapError> {
        self.0.dns_rcode_mute().store(&0, &mask, UpdateFlag::Any)
    }

    fn set_raw_packet_bucket(&mut self, bucket: TokenBucket) -> Result<(), MapError> {
        self.0.raw_packet_bucket().store(&0, &bucket, UpdateFlag::Any)
    }

    fn insert_security_profile(&mut self, id: ContainerId, profile: SecurityProfile) -> Result<(), MapError> {
        self.0.security_profiles().store(&id, &profile, UpdateFlag::Any)
    }

    fn insert_cgroup_mount(&mut self, mount_id: u32) -> Result<(), MapError> {
        self.0.cgroup_mount_filter().store(&mount_id, &1, UpdateFlag::Any)
    }

    fn set_dump_template(&mut self, config: ActivityDumpConfig) -> Result<(), MapError> {
        self.0
            .activity_dumps_config()
            .store(&DEFAULT_CONFIG_KEY, &config, UpdateFlag::Any)
    }

    fn set_dump_control(&mut self, control: DumpControl) -> Result<(), MapError> {
        self.0.dump_control().store(&0, &control, UpdateFlag::Any)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secwatch_common::approvers::{is_event_enabled, policy_of};
    use secwatch_common::sim::SimKernel;

    fn compile(json: &str) -> Policy {
        Policy::from_config(&AgentConfig::from_json(json).unwrap()).unwrap()
    }

    #[test]
    fn no_list_enables_everything() {
        let policy = compile("{}");
        for t in EventType::all() {
            assert_ne!(policy.enabled_events & t.mask(), 0, "{}", t.name());
        }
        assert_eq!(policy.enabled_events & EventType::Any.mask(), 0);
    }

    #[test]
    fn basenames_union_their_types() {
        let policy = compile(
            r#"{ "approvers": { "basenames": { "secret.txt": ["open", "unlink", "open"] } } }"#,
        );
        assert_eq!(
            policy.basename_approvers["secret.txt"],
            EventType::Open.mask() | EventType::Unlink.mask()
        );
    }

    #[test]
    fn read_only_gets_its_own_bit() {
        let policy = compile(r#"{ "approvers": { "open_flags": ["O_RDONLY", "o_creat"] } }"#);
        assert_eq!(
            policy.flag_approvers[FlagApprover::OpenFlags as usize],
            APPROVE_O_RDONLY | libc::O_CREAT as u64
        );
    }

    #[test]
    fn unknown_names_are_config_errors() {
        let bad = [
            r#"{ "enabled_events": ["opne"] }"#,
            r#"{ "policies": { "nope": {} } }"#,
            r#"{ "approvers": { "open_flags": ["O_SOMETHING"] } }"#,
            r#"{ "dns": { "muted_rcodes": [40] } }"#,
            r#"{ "security_profiles": [{ "container_id": "abc", "syscalls": [4096] }] }"#,
            r#"{ "raw_packet": { "enabled": true, "rate": 0 } }"#,
        ];
        for json in bad {
            let config = AgentConfig::from_json(json).unwrap();
            assert!(Policy::from_config(&config).is_err(), "{json}");
        }
    }

    #[test]
    fn dump_defaults_are_scaled_to_nanoseconds() {
        let policy = compile(
            r#"{ "activity_dump": { "enabled": true, "event_types": ["open"], "timeout_secs": 2,
                 "cgroup_mount_ids": [7] } }"#,
        );
        assert_eq!(policy.dump_template.timeout, 2 * NS_PER_SEC);
        assert_eq!(policy.dump_template.event_mask, EventType::Open.mask());
        assert_eq!(policy.dump_control.enabled, 1);
        assert_eq!(policy.dump_control.filter_by_mount, 1);
    }

    #[test]
    fn applied_policy_reaches_the_maps() {
        let k = SimKernel::new();
        let policy = compile(
            r#"{
                "enabled_events": ["open", "dns_response"],
                "policies": { "open": { "mode": "deny", "basename": true } },
                "approvers": { "basenames": { "secret.txt": ["open"] } },
                "dns": { "muted_rcodes": [0, 3] },
                "security_profiles": [{ "container_id": "c1", "cookie": 9, "state": "kill",
                                        "syscalls": [0, 1, 60] }]
            }"#,
        );
        policy.apply(&mut KernelMaps(&k)).unwrap();

        assert!(is_event_enabled(&k, EventType::Open));
        assert!(!is_event_enabled(&k, EventType::Exec));
        let open = policy_of(&k, EventType::Open);
        assert_eq!(open.mode, POLICY_MODE_DENY);
        assert!(open.uses_basenames() && !open.uses_flags());
        assert_eq!(
            k.basename_approvers().lookup(&BasenameKey::new(b"secret.txt")),
            Some(EventType::Open.mask())
        );
        assert_eq!(k.dns_rcode_mute().lookup(&0), Some(0b1001));

        let profile = k
            .security_profiles()
            .lookup(&ContainerId::from_bytes(b"c1"))
            .unwrap();
        assert_eq!(profile.state, ProfileState::Kill as u32);
        assert!(profile.allows(60) && !profile.allows(59));
    }

    #[test]
    fn agent_pid_follows_the_offsets() {
        let k = SimKernel::new();
        let config = AgentConfig::from_json(r#"{ "runtime_constants": { "dentry_parent": 40 } }"#).unwrap();
        write_constants(&mut KernelMaps(&k), &config.runtime_constants().unwrap(), 321).unwrap();
        assert_eq!(k.constant(RuntimeConst::DentryParent), 40);
        assert_eq!(k.constant(RuntimeConst::RuntimePid), 321);
    }
}
