//! Loading and driving the secwatch BPF object.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  ProbeManager                                                │
//! │    load ─► constants ─► policy ─► program arrays ─► attach   │
//! └──────────────────────────────────────────────────────────────┘
//!          │ EVENTS ring buffer                │ per-CPU stats maps
//!          ▼                                   ▼
//!   EventCollector ─► EventPipeline      KernelStats ─► StatsSampler
//! ```
//!
//! ## Requirements
//!
//! - Linux kernel 5.8+ with CONFIG_BPF_SYSCALL=y (ring buffer)
//! - CAP_BPF and CAP_PERFMON capabilities (or CAP_SYS_ADMIN)
//! - The object built from `ebpf-programs/`
//! - Compiled with `--features ebpf`

pub mod catalog;

#[cfg(feature = "ebpf")]
mod collector;
#[cfg(feature = "ebpf")]
mod manager;

#[cfg(feature = "ebpf")]
pub use collector::EventCollector;
#[cfg(feature = "ebpf")]
pub use manager::{KernelStats, ProbeManager};

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to read BPF object {}: {source}", path.display())]
    Object {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("missing capabilities: {0}")]
    Capabilities(String),

    #[cfg(feature = "ebpf")]
    #[error("failed to load BPF object: {0}")]
    Load(#[from] aya::BpfError),

    #[cfg(feature = "ebpf")]
    #[error("kernel BTF unavailable: {0}")]
    Btf(#[from] aya::BtfError),

    #[cfg(feature = "ebpf")]
    #[error("program `{name}`: {source}")]
    Program {
        name: String,
        #[source]
        source: aya::programs::ProgramError,
    },

    #[cfg(feature = "ebpf")]
    #[error("map `{name}`: {source}")]
    Map {
        name: &'static str,
        #[source]
        source: aya::maps::MapError,
    },

    #[error("program `{0}` not found in the object")]
    MissingProgram(String),

    #[error("map `{0}` not found in the object")]
    MissingMap(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("BPF support not compiled in (rebuild with --features ebpf)")]
    NotSupported,
}

/// Stand-in when the `ebpf` feature is off; every constructor fails.
#[cfg(not(feature = "ebpf"))]
pub struct ProbeManager;

#[cfg(not(feature = "ebpf"))]
impl ProbeManager {
    pub fn new(_config: &crate::config::AgentConfig) -> Result<Self, ProbeError> {
        Err(ProbeError::NotSupported)
    }
}
