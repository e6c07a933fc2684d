//! `aya::Pod` for every value the agent reads from or writes to a map.

use crate::types::*;

macro_rules! pod {
    ($($t:ty),* $(,)?) => {
        // SAFETY: each type is `Plain`: `repr(C)`, explicitly padded and
        // valid for any bit pattern.
        $(unsafe impl aya::Pod for $t {})*
    };
}

pod!(
    FilterPolicy,
    BasenameKey,
    TokenBucket,
    PidRouteKey,
    SecurityProfile,
    ContainerId,
    DumpControl,
    ActivityDumpConfig,
    EventStats,
    FilterStats,
    ResolverStats,
    SyscallStats,
    NetStats,
    Telemetry,
    PathKey,
    PathLeaf,
    ErpcBuffer,
    InodeDiscarderKey,
    InodeDiscarder,
    PidDiscarder,
    ProcCacheEntry,
    PidCacheEntry,
    MountRef,
    SpanTls,
);
