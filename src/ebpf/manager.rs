//! Owns the loaded object for the agent's lifetime.

use aya::maps::{Array, HashMap, Map, MapData, MapError, PerCpuArray, ProgramArray, RingBuf};
use aya::programs::fentry::FEntryLinkId;
use aya::programs::fexit::FExitLinkId;
use aya::programs::kprobe::KProbeLinkId;
use aya::programs::raw_trace_point::RawTracePointLinkId;
use aya::programs::trace_point::TracePointLinkId;
use aya::programs::{tc, Program, ProgramError, SchedClassifier, TcAttachType};
use aya::{Bpf, Btf, Pod};
use aya_log::BpfLogger;
use caps::{CapSet, Capability};
use tracing::{debug, info, warn};

use secwatch_common::activity_dump::{DumpControl, DEFAULT_CONFIG_KEY};
use secwatch_common::anomaly::SecurityProfile;
use secwatch_common::approvers::{BasenameKey, FilterPolicy};
use secwatch_common::consts::RuntimeConst;
use secwatch_common::container::ContainerId;
use secwatch_common::event::{ActivityDumpConfig, EventType};
use secwatch_common::net::raw::TokenBucket;
use secwatch_common::stats::{EventStats, FilterStats, NetStats, ResolverStats, SyscallStats, Telemetry};

use super::catalog::{
    catalog, Flavour, Hook, ProbeGroup, ProbeSpec, ProgArray, CLASSIFIER_EGRESS, CLASSIFIER_INGRESS,
    FENTRY_TAIL_TARGET, TAIL_CALLS,
};
use super::ProbeError;
use crate::config::AgentConfig;
use crate::metrics;
use crate::policy::{write_constants, Policy, PolicyMaps};
use crate::stats::{Accumulate, StatsSource};

const EVENTS_MAP: &str = "EVENTS";

const REQUIRED_CAPS: [Capability; 2] = [Capability::CAP_BPF, Capability::CAP_PERFMON];

fn map_error(name: &'static str) -> impl Fn(MapError) -> ProbeError {
    move |source| ProbeError::Map { name, source }
}

fn program_error(name: &str) -> impl Fn(ProgramError) -> ProbeError + '_ {
    move |source| ProbeError::Program {
        name: name.to_string(),
        source,
    }
}

fn check_capabilities() -> Result<(), ProbeError> {
    let has = |cap| caps::has_cap(None, CapSet::Effective, cap).unwrap_or(false);
    if has(Capability::CAP_SYS_ADMIN) {
        return Ok(());
    }
    let missing: Vec<String> = REQUIRED_CAPS
        .iter()
        .filter(|cap| !has(**cap))
        .map(|cap| cap.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ProbeError::Capabilities(missing.join(", ")))
    }
}

/// Kernels before 5.11 charge BPF maps against RLIMIT_MEMLOCK.
fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    // SAFETY: rlim is a valid rlimit for the duration of the call.
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) } != 0 {
        debug!("failed to remove the memlock limit");
    }
}

/// Link of one attached probe, kept so a half-attached group can be undone.
enum Link {
    KProbe(KProbeLinkId),
    FEntry(FEntryLinkId),
    FExit(FExitLinkId),
    TracePoint(TracePointLinkId),
    RawTracePoint(RawTracePointLinkId),
}

struct Attached {
    program: String,
    link: Link,
}

/// First target the kernel accepts, or the error of the last one tried.
fn first_target<L>(
    targets: &[String],
    mut attach: impl FnMut(&str) -> Result<L, ProgramError>,
) -> Result<L, ProgramError> {
    let mut last = ProgramError::UnexpectedProgramType;
    for target in targets {
        match attach(target) {
            Ok(link) => return Ok(link),
            Err(e) => last = e,
        }
    }
    Err(last)
}

/// Loads a program that is only ever reached through a program array.
fn load_tail_target(program: &mut Program, btf: Option<&Btf>) -> Result<(), ProgramError> {
    match program {
        Program::KProbe(p) => p.load(),
        Program::TracePoint(p) => p.load(),
        Program::SchedClassifier(p) => p.load(),
        Program::FEntry(p) => p.load(FENTRY_TAIL_TARGET, btf.ok_or(ProgramError::UnexpectedProgramType)?),
        _ => Err(ProgramError::UnexpectedProgramType),
    }
}

pub struct ProbeManager {
    bpf: Bpf,
    flavour: Flavour,
    btf: Option<Btf>,
    prog_arrays: Vec<ProgramArray<MapData>>,
    attached: usize,
    skipped: usize,
    _logger: Option<BpfLogger>,
}

impl ProbeManager {
    /// Loads the object at `config.object_path` and brings it fully up:
    /// constants, policy, tail calls, then every probe the kernel can take.
    pub fn new(config: &AgentConfig) -> Result<Self, ProbeError> {
        check_capabilities()?;
        bump_memlock_rlimit();

        let path = &config.object_path;
        info!(path = %path.display(), "loading BPF object");
        let object = std::fs::read(path).map_err(|source| ProbeError::Object {
            path: path.clone(),
            source,
        })?;
        let mut bpf = Bpf::load(&object)?;

        let logger = match BpfLogger::init(&mut bpf) {
            Ok(logger) => Some(logger),
            Err(e) => {
                warn!(error = %e, "BPF logging unavailable");
                None
            }
        };

        let flavour = if bpf
            .programs()
            .any(|(_, p)| matches!(p, Program::FEntry(_) | Program::FExit(_)))
        {
            Flavour::Fentry
        } else {
            Flavour::Kprobe
        };
        let btf = match flavour {
            Flavour::Fentry => Some(Btf::from_sys_fs()?),
            Flavour::Kprobe => None,
        };

        let mut manager = Self {
            bpf,
            flavour,
            btf,
            prog_arrays: Vec::new(),
            attached: 0,
            skipped: 0,
            _logger: logger,
        };

        let agent_pid = std::process::id();
        write_constants(&mut AyaMaps(&mut manager.bpf), &config.runtime_constants()?, agent_pid)?;
        debug!(agent_pid, "runtime constants written");
        manager.apply_policy(&Policy::from_config(config)?)?;
        manager.register_tail_calls()?;

        for group in catalog(flavour) {
            manager.attach_group(&group);
        }
        manager.attach_classifiers(&config.interfaces)?;

        metrics::PROBES_ATTACHED.set(manager.attached as i64);
        metrics::PROBES_SKIPPED.set(manager.skipped as i64);
        info!(
            ?flavour,
            attached = manager.attached,
            skipped = manager.skipped,
            "probes attached"
        );
        Ok(manager)
    }

    pub fn flavour(&self) -> Flavour {
        self.flavour
    }

    pub fn attached(&self) -> usize {
        self.attached
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Rewrites the policy maps. Safe to call while probes are attached.
    pub fn apply_policy(&mut self, policy: &Policy) -> Result<(), ProbeError> {
        policy.apply(&mut AyaMaps(&mut self.bpf))
    }

    fn take<M>(&mut self, name: &'static str) -> Result<M, ProbeError>
    where
        M: TryFrom<Map, Error = MapError>,
    {
        let map = self.bpf.take_map(name).ok_or(ProbeError::MissingMap(name))?;
        M::try_from(map).map_err(map_error(name))
    }

    fn register_tail_calls(&mut self) -> Result<(), ProbeError> {
        for array in ProgArray::ALL {
            let name = array.map_name();
            let mut progs: ProgramArray<MapData> = self.take(name)?;
            for call in TAIL_CALLS.iter().filter(|c| c.array == array) {
                let program = self
                    .bpf
                    .program_mut(call.program)
                    .ok_or_else(|| ProbeError::MissingProgram(call.program.to_string()))?;
                load_tail_target(program, self.btf.as_ref()).map_err(program_error(call.program))?;
                let fd = program.fd().map_err(program_error(call.program))?;
                progs.set(call.slot as u32, fd, 0).map_err(map_error(name))?;
                debug!(array = name, slot = call.slot as u32, program = call.program, "tail call registered");
            }
            self.prog_arrays.push(progs);
        }
        Ok(())
    }

    fn attach_probe(&mut self, probe: &ProbeSpec) -> Result<Link, ProbeError> {
        let name = probe.program.as_str();
        let err = program_error(name);
        let btf = self.btf.as_ref();
        let program = self
            .bpf
            .program_mut(name)
            .ok_or_else(|| ProbeError::MissingProgram(name.to_string()))?;

        let link = match (&probe.hook, program) {
            (Hook::Entry | Hook::Return, Program::KProbe(p)) => {
                p.load().map_err(&err)?;
                first_target(&probe.targets, |t| p.attach(t, 0)).map(Link::KProbe)
            }
            (Hook::Entry, Program::FEntry(p)) => {
                let btf = btf.ok_or(ProgramError::UnexpectedProgramType).map_err(&err)?;
                first_target(&probe.targets, |t| {
                    p.load(t, btf)?;
                    p.attach()
                })
                .map(Link::FEntry)
            }
            (Hook::Return, Program::FExit(p)) => {
                let btf = btf.ok_or(ProgramError::UnexpectedProgramType).map_err(&err)?;
                first_target(&probe.targets, |t| {
                    p.load(t, btf)?;
                    p.attach()
                })
                .map(Link::FExit)
            }
            (Hook::Tracepoint { category }, Program::TracePoint(p)) => {
                p.load().map_err(&err)?;
                first_target(&probe.targets, |t| p.attach(category, t)).map(Link::TracePoint)
            }
            (Hook::RawTracepoint, Program::RawTracePoint(p)) => {
                p.load().map_err(&err)?;
                first_target(&probe.targets, |t| p.attach(t)).map(Link::RawTracePoint)
            }
            _ => Err(ProgramError::UnexpectedProgramType),
        };
        link.map_err(err)
    }

    fn attach_all(&mut self, probes: &[ProbeSpec]) -> Result<usize, ProbeError> {
        let mut links = Vec::new();
        for probe in probes {
            match self.attach_probe(probe) {
                Ok(link) => links.push(Attached {
                    program: probe.program.clone(),
                    link,
                }),
                Err(e) if probe.optional => {
                    debug!(program = %probe.program, error = %e, "optional probe skipped");
                }
                Err(e) => {
                    self.detach(links);
                    return Err(e);
                }
            }
        }
        Ok(links.len())
    }

    fn detach(&mut self, links: Vec<Attached>) {
        for Attached { program, link } in links {
            let Some(p) = self.bpf.program_mut(&program) else {
                continue;
            };
            let result = match (p, link) {
                (Program::KProbe(p), Link::KProbe(id)) => p.detach(id),
                (Program::FEntry(p), Link::FEntry(id)) => p.detach(id),
                (Program::FExit(p), Link::FExit(id)) => p.detach(id),
                (Program::TracePoint(p), Link::TracePoint(id)) => p.detach(id),
                (Program::RawTracePoint(p), Link::RawTracePoint(id)) => p.detach(id),
                _ => Ok(()),
            };
            if let Err(e) = result {
                debug!(%program, error = %e, "detach failed");
            }
        }
    }

    fn attach_group(&mut self, group: &ProbeGroup) {
        let err = match self.attach_all(&group.probes) {
            Ok(n) => {
                self.attached += n;
                return;
            }
            Err(e) => e,
        };

        if group.fallback.is_empty() {
            warn!(group = %group.name, error = %err, "no attach point, skipping");
            self.skipped += 1;
            return;
        }

        debug!(group = %group.name, error = %err, "falling back to tracepoints");
        match self.attach_all(&group.fallback) {
            Ok(n) => self.attached += n,
            Err(e) => {
                warn!(group = %group.name, error = %e, "fallback failed, skipping");
                self.skipped += 1;
            }
        }
    }

    fn attach_classifiers(&mut self, interfaces: &[String]) -> Result<(), ProbeError> {
        if interfaces.is_empty() {
            return Ok(());
        }
        for name in [CLASSIFIER_INGRESS, CLASSIFIER_EGRESS] {
            let program: &mut SchedClassifier = self
                .bpf
                .program_mut(name)
                .ok_or_else(|| ProbeError::MissingProgram(name.to_string()))?
                .try_into()
                .map_err(program_error(name))?;
            program.load().map_err(program_error(name))?;
        }

        for iface in interfaces {
            // fails with EEXIST when the qdisc is already there
            if let Err(e) = tc::qdisc_add_clsact(iface) {
                debug!(interface = %iface, error = %e, "clsact qdisc not added");
            }
            for (name, kind) in [
                (CLASSIFIER_INGRESS, TcAttachType::Ingress),
                (CLASSIFIER_EGRESS, TcAttachType::Egress),
            ] {
                let program: &mut SchedClassifier = self
                    .bpf
                    .program_mut(name)
                    .ok_or_else(|| ProbeError::MissingProgram(name.to_string()))?
                    .try_into()
                    .map_err(program_error(name))?;
                match program.attach(iface, kind) {
                    Ok(_) => {
                        self.attached += 1;
                        info!(interface = %iface, program = name, "classifier attached");
                    }
                    Err(e) => {
                        warn!(interface = %iface, program = name, error = %e, "failed to attach classifier");
                        self.skipped += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Hands the event ring buffer to its reader. Succeeds once.
    pub fn take_events(&mut self) -> Result<RingBuf<MapData>, ProbeError> {
        self.take(EVENTS_MAP)
    }

    /// Hands the stats maps to the sampler. Succeeds once.
    pub fn take_stats(&mut self) -> Result<KernelStats, ProbeError> {
        Ok(KernelStats {
            events: self.take("EVENT_STATS")?,
            filters: self.take("FILTER_STATS")?,
            syscalls: self.take("SYSCALL_STATS")?,
            resolver: self.take("RESOLVER_STATS")?,
            net: self.take("NET_STATS")?,
            telemetry: self.take("TELEMETRY")?,
        })
    }
}

/// [`PolicyMaps`] over the maps of the loaded object.
struct AyaMaps<'a>(&'a mut Bpf);

impl AyaMaps<'_> {
    fn set<V: Pod>(&mut self, name: &'static str, index: u32, value: V) -> Result<(), ProbeError> {
        let map = self.0.map_mut(name).ok_or(ProbeError::MissingMap(name))?;
        let mut array: Array<_, V> = Array::try_from(map).map_err(map_error(name))?;
        array.set(index, value, 0).map_err(map_error(name))
    }

    fn insert<K: Pod, V: Pod>(&mut self, name: &'static str, key: K, value: V) -> Result<(), ProbeError> {
        let map = self.0.map_mut(name).ok_or(ProbeError::MissingMap(name))?;
        let mut hash: HashMap<_, K, V> = HashMap::try_from(map).map_err(map_error(name))?;
        hash.insert(key, value, 0).map_err(map_error(name))
    }
}

impl PolicyMaps for AyaMaps<'_> {
    type Error = ProbeError;

    fn set_constant(&mut self, c: RuntimeConst, value: u64) -> Result<(), ProbeError> {
        self.set("CONSTANTS", c as u32, value)
    }

    fn set_enabled_events(&mut self, mask: u64) -> Result<(), ProbeError> {
        self.set("ENABLED_EVENTS", 0, mask)
    }

    fn set_filter_policy(&mut self, t: EventType, policy: FilterPolicy) -> Result<(), ProbeError> {
        self.set("FILTER_POLICY", t as u32, policy)
    }

    fn insert_basename_approver(&mut self, key: BasenameKey, mask: u64) -> Result<(), ProbeError> {
        self.insert("BASENAME_APPROVERS", key, mask)
    }

    fn set_flag_approver(&mut self, slot: u32, mask: u64) -> Result<(), ProbeError> {
        self.set("FLAG_APPROVERS", slot, mask)
    }

    fn set_dns_rcode_mask(&mut self, mask: u32) -> Result<(), ProbeError> {
        self.set("DNS_RCODE_MUTE", 0, mask)
    }

    fn set_raw_packet_bucket(&mut self, bucket: TokenBucket) -> Result<(), ProbeError> {
        self.set("RAW_PACKET_BUCKET", 0, bucket)
    }

    fn insert_security_profile(&mut self, id: ContainerId, profile: SecurityProfile) -> Result<(), ProbeError> {
        self.insert("SECURITY_PROFILES", id, profile)
    }

    fn insert_cgroup_mount(&mut self, mount_id: u32) -> Result<(), ProbeError> {
        self.insert("CGROUP_MOUNT_FILTER", mount_id, 1u32)
    }

    fn set_dump_template(&mut self, config: ActivityDumpConfig) -> Result<(), ProbeError> {
        self.insert("AD_CONFIG", DEFAULT_CONFIG_KEY, config)
    }

    fn set_dump_control(&mut self, control: DumpControl) -> Result<(), ProbeError> {
        self.set("DUMP_CONTROL", 0, control)
    }
}

/// The stats maps, taken out of the object.
pub struct KernelStats {
    events: PerCpuArray<MapData, EventStats>,
    filters: PerCpuArray<MapData, FilterStats>,
    syscalls: PerCpuArray<MapData, SyscallStats>,
    resolver: PerCpuArray<MapData, ResolverStats>,
    net: PerCpuArray<MapData, NetStats>,
    telemetry: Array<MapData, Telemetry>,
}

fn cpu_total<V: Pod + Accumulate>(map: &PerCpuArray<MapData, V>, index: u32) -> Result<V, MapError> {
    let values = map.get(&index, 0)?;
    Ok(V::sum(values.iter()))
}

impl StatsSource for KernelStats {
    type Error = MapError;

    fn event_totals(&self, t: EventType) -> Result<EventStats, MapError> {
        cpu_total(&self.events, t as u32)
    }

    fn filter_totals(&self, t: EventType) -> Result<FilterStats, MapError> {
        cpu_total(&self.filters, t as u32)
    }

    fn syscall_totals(&self, t: EventType) -> Result<SyscallStats, MapError> {
        cpu_total(&self.syscalls, t as u32)
    }

    fn resolver_totals(&self) -> Result<ResolverStats, MapError> {
        cpu_total(&self.resolver, 0)
    }

    fn net_totals(&self) -> Result<NetStats, MapError> {
        cpu_total(&self.net, 0)
    }

    fn telemetry_sample(&self) -> Result<Telemetry, MapError> {
        self.telemetry.get(&0, 0)
    }
}
