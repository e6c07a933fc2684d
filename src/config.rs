//! Agent configuration.
//!
//! One JSON document, every field optional:
//!
//! ```json
//! {
//!   "object_path": "/usr/lib/secwatch/secwatch.o",
//!   "enabled_events": ["open", "exec", "exit", "dns"],
//!   "policies": { "open": { "mode": "deny", "basename": true } },
//!   "approvers": { "basenames": { "secret.txt": ["open"] }, "open_flags": ["O_RDONLY"] },
//!   "runtime_constants": { "dentry_parent": 24 },
//!   "metrics": { "listen": "127.0.0.1:9464" }
//! }
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use secwatch_common::consts::{RuntimeConst, DEFAULT_CONSTANTS};
use secwatch_common::event::EventType;

/// Default location of the BPF object built from `ebpf-programs/`.
pub const DEFAULT_OBJECT_PATH: &str = "target/bpfel-unknown-none/release/secwatch";

/// Default metrics listen address.
pub const DEFAULT_METRICS_ADDR: &str = "127.0.0.1:9464";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown event type `{0}`")]
    UnknownEvent(String),

    #[error("unknown runtime constant `{0}`")]
    UnknownConstant(String),

    #[error("runtime constant `{0}` is set by the agent")]
    ReservedConstant(String),

    #[error("unknown open flag `{0}`")]
    UnknownOpenFlag(String),

    #[error("syscall number {0} is out of range")]
    InvalidSyscall(u32),

    #[error("dns rcode {0} is out of range")]
    InvalidRcode(u8),

    #[error("{0} must be positive")]
    NotPositive(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingMode {
    /// Wake on ring buffer notifications.
    #[default]
    Notify,
    /// Drain the ring on a timer.
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    #[default]
    NoFilter,
    Accept,
    Deny,
}

/// Filtering policy of one event type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventPolicyConfig {
    pub mode: PolicyMode,
    /// Consult basename approvers.
    pub basename: bool,
    /// Consult flag approvers.
    pub flags: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApproverConfig {
    /// Basename to the event types it approves.
    pub basenames: BTreeMap<String, Vec<String>>,
    /// Symbolic open flags, `O_RDONLY` included.
    pub open_flags: Vec<String>,
    pub mmap_flags: u64,
    pub mmap_protection: u64,
    pub mprotect_vm_protection: u64,
    pub mprotect_req_protection: u64,
    pub splice_entry_flags: u64,
    pub splice_exit_flags: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Response codes reported header-only.
    pub muted_rcodes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawPacketConfig {
    pub enabled: bool,
    /// Packets per second.
    pub rate: u64,
    pub burst: u64,
}

impl Default for RawPacketConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate: 10,
            burst: 40,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityDumpDefaults {
    pub enabled: bool,
    pub event_types: Vec<String>,
    /// Dump duration; 0 runs until cancelled.
    pub timeout_secs: u64,
    /// How long a finished cgroup waits before it can be dumped again.
    pub wait_list_secs: u64,
    /// Sampled events per second.
    pub events_rate: u32,
    /// When non-empty, only cgroups on these mounts are admitted.
    pub cgroup_mount_ids: Vec<u32>,
}

impl Default for ActivityDumpDefaults {
    fn default() -> Self {
        Self {
            enabled: false,
            event_types: vec!["open".into(), "exec".into(), "dns".into(), "bind".into()],
            timeout_secs: 900,
            wait_list_secs: 60,
            events_rate: 500,
            cgroup_mount_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStateConfig {
    #[default]
    Learning,
    Stable,
    Kill,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityProfileConfig {
    pub container_id: String,
    pub cookie: u64,
    pub state: ProfileStateConfig,
    /// Syscall numbers the workload is expected to make.
    pub syscalls: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus text endpoint; `null` disables it.
    pub listen: Option<SocketAddr>,
    pub sample_interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_METRICS_ADDR.parse().ok(),
            sample_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub object_path: PathBuf,
    pub ring_mode: RingMode,
    pub poll_interval_ms: u64,
    /// Event type names; empty enables every type.
    pub enabled_events: Vec<String>,
    pub policies: BTreeMap<String, EventPolicyConfig>,
    pub approvers: ApproverConfig,
    pub dns: DnsConfig,
    pub raw_packet: RawPacketConfig,
    pub activity_dump: ActivityDumpDefaults,
    pub security_profiles: Vec<SecurityProfileConfig>,
    /// Overrides of the built-in offset table, by constant name.
    pub runtime_constants: BTreeMap<String, u64>,
    /// Interfaces the packet classifiers attach to.
    pub interfaces: Vec<String>,
    pub metrics: MetricsConfig,
    pub otlp_endpoint: Option<String>,
    pub path_cache_size: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            object_path: PathBuf::from(DEFAULT_OBJECT_PATH),
            ring_mode: RingMode::default(),
            poll_interval_ms: 100,
            enabled_events: Vec::new(),
            policies: BTreeMap::new(),
            approvers: ApproverConfig::default(),
            dns: DnsConfig::default(),
            raw_packet: RawPacketConfig::default(),
            activity_dump: ActivityDumpDefaults::default(),
            security_profiles: Vec::new(),
            runtime_constants: BTreeMap::new(),
            interfaces: Vec::new(),
            metrics: MetricsConfig::default(),
            otlp_endpoint: None,
            path_cache_size: 4096,
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.path_cache_size == 0 {
            return Err(ConfigError::NotPositive("path_cache_size"));
        }
        if self.ring_mode == RingMode::Poll && self.poll_interval_ms == 0 {
            return Err(ConfigError::NotPositive("poll_interval_ms"));
        }
        if self.metrics.sample_interval_ms == 0 {
            return Err(ConfigError::NotPositive("metrics.sample_interval_ms"));
        }
        Ok(())
    }

    /// The OTLP endpoint, with `OTEL_EXPORTER_OTLP_ENDPOINT` taking precedence.
    pub fn otlp_endpoint(&self) -> Option<String> {
        std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .ok()
            .filter(|e| !e.is_empty())
            .or_else(|| self.otlp_endpoint.clone())
    }

    /// Built-in offsets with the configured overrides applied. The agent pid
    /// is left out; the loader writes it.
    pub fn runtime_constants(&self) -> Result<Vec<(RuntimeConst, u64)>, ConfigError> {
        let mut values: BTreeMap<u32, u64> = DEFAULT_CONSTANTS
            .iter()
            .map(|(c, v)| (*c as u32, *v))
            .collect();
        values.insert(
            RuntimeConst::RawPacketEnabled as u32,
            self.raw_packet.enabled as u64,
        );
        for (name, value) in &self.runtime_constants {
            let c = runtime_const_by_name(name)
                .ok_or_else(|| ConfigError::UnknownConstant(name.clone()))?;
            if c == RuntimeConst::RuntimePid {
                return Err(ConfigError::ReservedConstant(name.clone()));
            }
            values.insert(c as u32, *value);
        }
        Ok(values
            .into_iter()
            .filter_map(|(c, v)| RuntimeConst::from_u32(c).map(|c| (c, v)))
            .collect())
    }
}

/// Looks an event type up by its stream name.
pub fn event_type(name: &str) -> Result<EventType, ConfigError> {
    EventType::from_name(name)
        .filter(|t| *t != EventType::Any)
        .ok_or_else(|| ConfigError::UnknownEvent(name.to_string()))
}

/// Accepts `dentry_parent` as well as `DentryParent`.
pub fn runtime_const_by_name(name: &str) -> Option<RuntimeConst> {
    let wanted: String = name
        .chars()
        .filter(|c| *c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    RuntimeConst::all()
        .iter()
        .copied()
        .find(|c| format!("{c:?}").to_ascii_lowercase() == wanted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_the_default() {
        let config = AgentConfig::from_json("{}").unwrap();
        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.metrics.listen, DEFAULT_METRICS_ADDR.parse().ok());
    }

    #[test]
    fn load_reports_the_file_it_failed_on() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secwatch.json");
        std::fs::write(&path, r#"{ "path_cache_size": 8 }"#).unwrap();
        assert_eq!(AgentConfig::load(&path).unwrap().path_cache_size, 8);

        let missing = dir.path().join("missing.json");
        let err = AgentConfig::load(&missing).unwrap_err();
        assert!(matches!(err, ConfigError::Io { ref path, .. } if *path == missing));
    }

    #[test]
    fn nested_sections_fill_in_defaults() {
        let config = AgentConfig::from_json(
            r#"{
                "ring_mode": "poll",
                "policies": { "open": { "mode": "deny", "basename": true } },
                "raw_packet": { "enabled": true },
                "metrics": { "listen": null }
            }"#,
        )
        .unwrap();
        assert_eq!(config.ring_mode, RingMode::Poll);
        let open = &config.policies["open"];
        assert_eq!(open.mode, PolicyMode::Deny);
        assert!(open.basename && !open.flags);
        assert!(config.raw_packet.enabled);
        assert_eq!(config.raw_packet.rate, 10);
        assert_eq!(config.metrics.listen, None);
        assert_eq!(config.metrics.sample_interval_ms, 10_000);
    }

    #[test]
    fn rejects_zero_cache() {
        let err = AgentConfig::from_json(r#"{ "path_cache_size": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::NotPositive("path_cache_size")));
    }

    #[test]
    fn constant_names_are_case_and_underscore_insensitive() {
        assert_eq!(runtime_const_by_name("dentry_parent"), Some(RuntimeConst::DentryParent));
        assert_eq!(runtime_const_by_name("DentryParent"), Some(RuntimeConst::DentryParent));
        assert_eq!(runtime_const_by_name("idmap_dentry_arg"), Some(RuntimeConst::IdmapDentryArg));
        assert_eq!(runtime_const_by_name("no_such_field"), None);
    }

    #[test]
    fn overrides_replace_defaults() {
        let mut config = AgentConfig::default();
        config.runtime_constants.insert("dentry_parent".into(), 32);
        let values = config.runtime_constants().unwrap();
        let parent = values
            .iter()
            .find(|(c, _)| *c == RuntimeConst::DentryParent)
            .map(|(_, v)| *v);
        assert_eq!(parent, Some(32));
        assert!(values.iter().all(|(c, _)| *c != RuntimeConst::RuntimePid));
    }

    #[test]
    fn agent_pid_cannot_be_overridden() {
        let mut config = AgentConfig::default();
        config.runtime_constants.insert("runtime_pid".into(), 1);
        assert!(matches!(
            config.runtime_constants(),
            Err(ConfigError::ReservedConstant(_))
        ));
    }

    #[test]
    fn any_is_not_a_configurable_event() {
        assert!(event_type("open").is_ok());
        assert!(matches!(event_type("any"), Err(ConfigError::UnknownEvent(_))));
        assert!(matches!(event_type("opne"), Err(ConfigError::UnknownEvent(_))));
    }
}
