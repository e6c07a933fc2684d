use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use secwatch::config::{event_type, AgentConfig};
use secwatch::erpc::{ErpcClient, ErpcTransport, IoctlTransport, SimTransport};
use secwatch::metrics;
use secwatch::policy::{write_constants, KernelMaps, Policy};
use secwatch::stats::StatsSampler;
use secwatch::telemetry::{self, TelemetryConfig};
use secwatch_common::discarders::{discarders_revision, is_discarded_by_pid};
use secwatch_common::path::PathKey;
use secwatch_common::sim::SimKernel;

const NS_PER_SEC: u64 = 1_000_000_000;

#[derive(Parser, Debug)]
#[command(name = "secwatch", version, about = "Runtime security agent")]
struct Cli {
    /// Agent config (JSON); built-in defaults when absent.
    #[arg(short, long, env = "SECWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// BPF object to load, overriding `object_path`.
    #[arg(long)]
    object: Option<PathBuf>,

    /// Log as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Work against an in-process simulated kernel instead of the real one.
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the object and stream events (default).
    Run,
    /// Resolve a path through eRPC.
    Resolve {
        mount_id: u32,
        ino: u64,
        #[arg(long, default_value_t = 0)]
        path_id: u32,
    },
    /// Stop reporting one event type for a process.
    DiscardPid {
        pid: u32,
        #[arg(long, default_value = "open")]
        event_type: String,
        /// Seconds until the discarder expires; 0 keeps it.
        #[arg(long, default_value_t = 0)]
        timeout: u64,
    },
    /// Invalidate every inode discarder at once.
    BumpRevision,
    /// Print the effective config.
    PrintConfig,
}

fn load_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };
    if let Some(object) = &cli.object {
        config.object_path = object.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let otlp_endpoint = config.otlp_endpoint();
    telemetry::init(&TelemetryConfig {
        service_name: "secwatch",
        json: cli.log_json,
        otlp_endpoint: otlp_endpoint.as_deref(),
    })?;
    metrics::init();

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::PrintConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Run if cli.dry_run => dry_run(&config),
        Command::Run => run(config).await,
        Command::Resolve { mount_id, ino, path_id } => {
            let key = PathKey::new(ino, mount_id, path_id);
            if cli.dry_run {
                let k = prepared_sim(&config)?;
                resolve(&ErpcClient::new(SimTransport::new(&k)), key)
            } else {
                resolve(&ErpcClient::new(IoctlTransport::open()?), key)
            }
        }
        Command::DiscardPid { pid, event_type: name, timeout } => {
            let t = event_type(&name)?;
            let timeout = timeout.saturating_mul(NS_PER_SEC);
            if cli.dry_run {
                let k = prepared_sim(&config)?;
                ErpcClient::new(SimTransport::new(&k)).discard_pid(t, pid, timeout)?;
                info!(pid, event_type = t.name(), discarded = is_discarded_by_pid(&k, t, pid), "dry run");
            } else {
                ErpcClient::new(IoctlTransport::open()?).discard_pid(t, pid, timeout)?;
                warn!("discarders are only honoured when requested by the running agent");
            }
            Ok(())
        }
        Command::BumpRevision => {
            if cli.dry_run {
                let k = prepared_sim(&config)?;
                ErpcClient::new(SimTransport::new(&k)).bump_discarders_revision()?;
                info!(revision = discarders_revision(&k), "dry run");
            } else {
                ErpcClient::new(IoctlTransport::open()?).bump_discarders_revision()?;
                warn!("discarders are only honoured when requested by the running agent");
            }
            Ok(())
        }
    };

    telemetry::shutdown();
    result
}

fn resolve<T: ErpcTransport>(client: &ErpcClient<T>, key: PathKey) -> anyhow::Result<()> {
    let path = client
        .resolve_path(key)
        .with_context(|| format!("resolving inode {} on mount {}", key.ino, key.mount_id))?;
    println!("{path}");
    Ok(())
}

/// A simulated kernel holding exactly what the loader would write, with
/// this process as the agent.
fn prepared_sim(config: &AgentConfig) -> anyhow::Result<SimKernel> {
    let k = SimKernel::new();
    let pid = std::process::id();
    k.set_current(pid, pid);
    let mut maps = KernelMaps(&k);
    write_constants(&mut maps, &config.runtime_constants()?, pid)?;
    Policy::from_config(config)?.apply(&mut maps)?;
    Ok(k)
}

fn dry_run(config: &AgentConfig) -> anyhow::Result<()> {
    let policy = Policy::from_config(config)?;
    let k = prepared_sim(config)?;
    info!(
        object = %config.object_path.display(),
        enabled_events = format_args!("{:#018x}", policy.enabled_events),
        "dry run: policy compiled"
    );
    let snapshot = StatsSampler::new(k).sample()?;
    debug!(lost = snapshot.total_lost(), "dry run: stats sampled");
    print!("{}", metrics::encode());
    Ok(())
}

#[cfg(feature = "ebpf")]
fn spawn_metrics(config: &AgentConfig) {
    if let Some(addr) = config.metrics.listen {
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr).await {
                tracing::error!(error = %e, "metrics endpoint stopped");
            }
        });
    }
}

/// Samples the stats maps until the task is dropped, warning whenever the
/// kernel reports new ring buffer drops.
#[cfg(feature = "ebpf")]
async fn sample_stats<S, T>(sampler: StatsSampler<S>, client: ErpcClient<T>, every: std::time::Duration)
where
    S: secwatch::stats::StatsSource,
    T: ErpcTransport,
{
    let mut ticker = tokio::time::interval(every);
    let mut lost = 0;
    loop {
        ticker.tick().await;
        if let Err(e) = client.request_ringbuf_usage() {
            debug!(error = %e, "ring buffer usage request failed");
        }
        match sampler.sample() {
            Ok(snapshot) => {
                let total = snapshot.total_lost();
                if total > lost {
                    warn!(lost = total - lost, "ring buffer dropped events");
                }
                lost = total;
            }
            Err(e) => warn!(error = %e, "stats sample failed"),
        }
    }
}

#[cfg(feature = "ebpf")]
async fn run(config: AgentConfig) -> anyhow::Result<()> {
    use secwatch::ebpf::{EventCollector, ProbeManager};
    use secwatch::pipeline::EventPipeline;
    use secwatch::resolver::PathResolver;

    let mut probes = ProbeManager::new(&config)?;
    let ring = probes.take_events()?;
    let sampler = StatsSampler::new(probes.take_stats()?);

    spawn_metrics(&config);
    let every = std::time::Duration::from_millis(config.metrics.sample_interval_ms);
    tokio::spawn(sample_stats(sampler, ErpcClient::new(IoctlTransport::open()?), every));

    let resolver = PathResolver::new(ErpcClient::new(IoctlTransport::open()?), config.path_cache_size);
    let collector = EventCollector::new(ring, &config);
    info!(attached = probes.attached(), "secwatch running");

    tokio::select! {
        result = collector.run(EventPipeline::new(Some(resolver))) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    drop(probes);
    Ok(())
}

#[cfg(not(feature = "ebpf"))]
async fn run(config: AgentConfig) -> anyhow::Result<()> {
    use secwatch::ebpf::ProbeManager;

    let _probes = ProbeManager::new(&config)?;
    Ok(())
}
