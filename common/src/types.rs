//! Every value type stored in a map, in one place for the substrates.

pub use crate::activity_dump::DumpControl;
pub use crate::anomaly::{SecurityProfile, SyscallDriftState};
pub use crate::approvers::{BasenameKey, FilterPolicy};
pub use crate::args::ArgsEnvsParser;
pub use crate::container::ContainerId;
pub use crate::discarders::{InodeDiscarder, InodeDiscarderKey, PidDiscarder};
pub use crate::erpc::{ErpcBuffer, ErpcResolveState};
pub use crate::event::{
    ActivityDumpConfig, ArgsEnvsEvent, DnsEvent, DnsResponseEvent, ImdsEvent, ProcessEvent,
    RawPacketEvent,
};
pub use crate::mount::MountRef;
pub use crate::net::device::VethState;
pub use crate::net::dns::{DnsResponseEntry, DnsResponseKey};
pub use crate::net::flow::{PidRouteEntry, PidRouteKey, SockMeta};
pub use crate::net::packet::{NamespacedFlow, Packet};
pub use crate::net::raw::TokenBucket;
pub use crate::path::{PathKey, PathLeaf};
pub use crate::process::{PidCacheEntry, ProcCacheEntry, UserSession};
pub use crate::rate_limiter::RateLimiterCtx;
pub use crate::span::SpanTls;
pub use crate::stats::{EventStats, FilterStats, NetStats, ResolverStats, SyscallStats, Telemetry};
pub use crate::syscall_cache::{SyscallArgs, SyscallCache};
