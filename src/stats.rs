//! Kernel statistics sampling.
//!
//! The data plane keeps its counters in per-CPU array maps indexed by event
//! type. A [`StatsSource`] reads them already summed across CPUs; the
//! [`StatsSampler`] publishes the totals to prometheus.

use secwatch_common::event::EventType;
use secwatch_common::kernel::{Kernel, Map};
use secwatch_common::sim::SimKernel;
use secwatch_common::stats::{EventStats, FilterStats, NetStats, ResolverStats, SyscallStats, Telemetry};

use crate::metrics;

/// Field-wise sum of per-CPU values.
pub trait Accumulate: Default {
    fn accumulate(&mut self, other: &Self);

    fn sum<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'a Self>,
        Self: 'a,
    {
        let mut total = Self::default();
        for v in values {
            total.accumulate(v);
        }
        total
    }
}

macro_rules! accumulate {
    ($t:ty { $($field:ident),+ $(,)? }) => {
        impl Accumulate for $t {
            fn accumulate(&mut self, other: &Self) {
                $(self.$field = self.$field.wrapping_add(other.$field);)+
            }
        }
    };
}

accumulate!(EventStats { bytes, count, lost });
accumulate!(FilterStats {
    basename_approved,
    flags_approved,
    pid_discarded,
    inode_discarded,
    discarders_added,
    saved_by_activity_dump,
});
accumulate!(ResolverStats {
    invalid,
    discarded,
    error,
    tail_call_exhausted,
    erpc_cache_miss,
    erpc_write_fault,
    erpc_size_exceeded,
    erpc_tail_call_exhausted,
    erpc_read_fault,
    erpc_denied,
});
accumulate!(SyscallStats {
    cached,
    popped,
    overwritten,
    self_filtered,
    tail_call_failed,
});
accumulate!(NetStats {
    packets,
    parse_errors,
    nat_hop_limit,
    pid_unresolved,
    dns_suppressed,
    dns_muted,
    raw_packet_throttled,
    raw_packet_dropped,
});

/// CPU-summed reads of the stats maps.
pub trait StatsSource {
    type Error: std::fmt::Display;

    fn event_totals(&self, t: EventType) -> Result<EventStats, Self::Error>;
    fn filter_totals(&self, t: EventType) -> Result<FilterStats, Self::Error>;
    fn syscall_totals(&self, t: EventType) -> Result<SyscallStats, Self::Error>;
    fn resolver_totals(&self) -> Result<ResolverStats, Self::Error>;
    fn net_totals(&self) -> Result<NetStats, Self::Error>;
    fn telemetry_sample(&self) -> Result<Telemetry, Self::Error>;
}

impl StatsSource for SimKernel {
    type Error = std::convert::Infallible;

    fn event_totals(&self, t: EventType) -> Result<EventStats, Self::Error> {
        Ok(self.event_stats_of(t))
    }

    fn filter_totals(&self, t: EventType) -> Result<FilterStats, Self::Error> {
        Ok(self.filter_stats_of(t))
    }

    fn syscall_totals(&self, t: EventType) -> Result<SyscallStats, Self::Error> {
        Ok(self.syscall_stats_of(t))
    }

    fn resolver_totals(&self) -> Result<ResolverStats, Self::Error> {
        Ok(self.resolver_stats_total())
    }

    fn net_totals(&self) -> Result<NetStats, Self::Error> {
        Ok(self.net_stats_total())
    }

    fn telemetry_sample(&self) -> Result<Telemetry, Self::Error> {
        Ok(Kernel::telemetry(self).lookup(&0).unwrap_or_default())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub events: Vec<(EventType, EventStats)>,
    pub filters: Vec<(EventType, FilterStats)>,
    pub syscalls: Vec<(EventType, SyscallStats)>,
    pub resolver: ResolverStats,
    pub net: NetStats,
    pub telemetry: Telemetry,
}

impl StatsSnapshot {
    pub fn total_lost(&self) -> u64 {
        self.events.iter().map(|(_, s)| s.lost).sum()
    }
}

/// Periodic reader of the kernel counters.
///
/// # Example
///
/// ```ignore
/// let sampler = StatsSampler::new(probes.take_stats()?);
/// let snapshot = sampler.sample()?;
/// if snapshot.total_lost() > 0 {
///     warn!(lost = snapshot.total_lost(), "ring buffer overflowed");
/// }
/// ```
pub struct StatsSampler<S> {
    source: S,
}

impl<S: StatsSource> StatsSampler<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Reads every stats map and publishes the totals.
    ///
    /// # Returns
    /// Per-CPU counters summed into one [`StatsSnapshot`], with one entry
    /// per event type in [`EventType::all`] order. The same totals are
    /// written to the prometheus gauges before returning. The first map that
    /// cannot be read aborts the sample.
    pub fn sample(&self) -> Result<StatsSnapshot, S::Error> {
        let s = &self.source;
        let mut snapshot = StatsSnapshot {
            resolver: s.resolver_totals()?,
            net: s.net_totals()?,
            telemetry: s.telemetry_sample()?,
            ..Default::default()
        };
        for &t in EventType::all() {
            snapshot.events.push((t, s.event_totals(t)?));
            snapshot.filters.push((t, s.filter_totals(t)?));
            snapshot.syscalls.push((t, s.syscall_totals(t)?));
        }
        publish(&snapshot);
        Ok(snapshot)
    }
}

fn set(gauge: &prometheus::IntGaugeVec, labels: &[&str], value: u64) {
    gauge.with_label_values(labels).set(value.min(i64::MAX as u64) as i64);
}

/// Writes a snapshot into the prometheus gauges.
pub fn publish(snapshot: &StatsSnapshot) {
    for (t, s) in &snapshot.events {
        let name = t.name();
        set(&metrics::EVENT_BYTES, &[name], s.bytes);
        set(&metrics::EVENT_COUNT, &[name], s.count);
        set(&metrics::EVENT_LOST, &[name], s.lost);
    }

    for (t, s) in &snapshot.filters {
        let name = t.name();
        for (counter, value) in [
            ("basename_approved", s.basename_approved),
            ("flags_approved", s.flags_approved),
            ("pid_discarded", s.pid_discarded),
            ("inode_discarded", s.inode_discarded),
            ("discarders_added", s.discarders_added),
            ("saved_by_activity_dump", s.saved_by_activity_dump),
        ] {
            set(&metrics::FILTER_STATS, &[name, counter], value);
        }
    }

    for (t, s) in &snapshot.syscalls {
        let name = t.name();
        for (counter, value) in [
            ("cached", s.cached),
            ("popped", s.popped),
            ("overwritten", s.overwritten),
            ("self_filtered", s.self_filtered),
            ("tail_call_failed", s.tail_call_failed),
        ] {
            set(&metrics::SYSCALL_CACHE_STATS, &[name, counter], value);
        }
    }

    let r = &snapshot.resolver;
    for (reason, value) in [
        ("invalid", r.invalid),
        ("discarded", r.discarded),
        ("error", r.error),
        ("tail_call_exhausted", r.tail_call_exhausted),
    ] {
        set(&metrics::RESOLVER_ERRORS, &[reason], value);
    }
    for (reason, value) in [
        ("cache_miss", r.erpc_cache_miss),
        ("write_fault", r.erpc_write_fault),
        ("size_exceeded", r.erpc_size_exceeded),
        ("tail_call_exhausted", r.erpc_tail_call_exhausted),
        ("read_fault", r.erpc_read_fault),
        ("denied", r.erpc_denied),
    ] {
        set(&metrics::ERPC_KERNEL_ERRORS, &[reason], value);
    }

    let n = &snapshot.net;
    for (counter, value) in [
        ("packets", n.packets),
        ("parse_errors", n.parse_errors),
        ("nat_hop_limit", n.nat_hop_limit),
        ("pid_unresolved", n.pid_unresolved),
        ("dns_suppressed", n.dns_suppressed),
        ("dns_muted", n.dns_muted),
        ("raw_packet_throttled", n.raw_packet_throttled),
        ("raw_packet_dropped", n.raw_packet_dropped),
    ] {
        set(&metrics::NET_STATS, &[counter], value);
    }

    metrics::RINGBUF_USAGE.set(snapshot.telemetry.ringbuf_usage.min(i64::MAX as u64) as i64);
}
