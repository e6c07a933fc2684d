//! secwatch - runtime security agent
//!
//! Loads the secwatch eBPF object, configures its policy maps, reads the
//! event stream and exports kernel-side statistics.
//!
//! # Modules
//!
//! - `config` - JSON agent configuration
//! - `policy` - Config compiled into policy map values
//! - `ebpf` - Object loading, probe attachment and the ring buffer reader (requires `--features ebpf`)
//! - `events` - Ring buffer record decoding
//! - `pipeline` - Decode, join, resolve and log
//! - `erpc` - The ioctl command channel into the data plane
//! - `resolver` - Userspace path cache in front of eRPC
//! - `stats` - Per-CPU statistics sampling
//! - `metrics` - Prometheus metrics for observability
//! - `telemetry` - Logging and OpenTelemetry export
//!
//! # Quick Start
//!
//! ```ignore
//! use secwatch::{AgentConfig, ProbeManager};
//!
//! let config = AgentConfig::load(Path::new("/etc/secwatch.json"))?;
//! let mut probes = ProbeManager::new(&config)?;
//! ```

pub mod config;
pub mod ebpf;
pub mod erpc;
pub mod events;
pub mod metrics;
pub mod pipeline;
pub mod policy;
pub mod resolver;
pub mod stats;
pub mod telemetry;

// Re-export commonly used types at crate root for convenience
pub use config::AgentConfig;
pub use ebpf::{ProbeError, ProbeManager};
pub use erpc::{ErpcClient, ErpcError, IoctlTransport};
pub use events::{decode, SecurityEvent};
pub use policy::Policy;
