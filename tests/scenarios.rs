//! End-to-end flows: probes fire against the simulated kernel, and the
//! captured records go through the same decode, join and resolve pipeline
//! the agent runs.

use secwatch::config::AgentConfig;
use secwatch::erpc::{ErpcClient, SimTransport};
use secwatch::events::{Payload, SecurityEvent};
use secwatch::pipeline::EventPipeline;
use secwatch::policy::{write_constants, KernelMaps, Policy};
use secwatch::resolver::PathResolver;
use secwatch_common::consts::{AF_INET, IPPROTO_TCP, IPPROTO_UDP};
use secwatch_common::container::handle_cgroup_write;
use secwatch_common::event::EventType;
use secwatch_common::kobj::SockInfo;
use secwatch_common::net::dns::encode_qname;
use secwatch_common::net::packet::Direction;
use secwatch_common::probes::fs::{handle_vfs_open, sys_exit_common, sys_open_enter};
use secwatch_common::probes::net::{handle_security_socket_bind, sys_bind_enter, sys_bind_exit};
use secwatch_common::probes::process::{
    do_exit, sched_process_exec, sched_process_fork, security_bprm_check, sys_exec_enter,
};
use secwatch_common::sim::{SimKernel, SimPacket};

const AGENT: u32 = 900;
const SEC: u64 = 1_000_000_000;

/// A kernel configured the way the loader configures the real one.
fn agent(config: &str) -> SimKernel {
    let config = AgentConfig::from_json(config).unwrap();
    let k = SimKernel::new();
    let mut maps = KernelMaps(&k);
    write_constants(&mut maps, &config.runtime_constants().unwrap(), AGENT).unwrap();
    Policy::from_config(&config).unwrap().apply(&mut maps).unwrap();
    k
}

fn collect(k: &SimKernel) -> Vec<SecurityEvent> {
    let resolver = PathResolver::new(ErpcClient::new(SimTransport::new(k)), 64);
    let mut pipeline = EventPipeline::new(Some(resolver));
    k.events()
        .iter()
        .filter_map(|captured| pipeline.process(&captured.bytes))
        .collect()
}

struct Fs {
    k: SimKernel,
    mnt: u64,
    root: u64,
}

fn fs(config: &str) -> Fs {
    let k = agent(config);
    k.spawn_task(100, 100, 1);
    k.set_current(100, 100);
    let root = k.root_dentry(2);
    let mnt = k.add_mount(1, root, 0, 0);
    Fs { k, mnt, root }
}

impl Fs {
    fn open(&self, dentry: u64, flags: u32) {
        sys_open_enter(&self.k, flags, 0);
        handle_vfs_open(&self.k, self.k.alloc_path(self.mnt, dentry));
        self.k.run(sys_exit_common(&self.k, EventType::Open, 3));
    }
}

#[test]
fn deny_policy_reports_only_approved_basenames() {
    let f = fs(r#"{
        "enabled_events": ["open"],
        "policies": { "open": { "mode": "deny", "basename": true } },
        "approvers": { "basenames": { "secret.txt": ["open"] } }
    }"#);
    let etc = f.k.add_dentry(f.root, "etc", 10);
    let secret = f.k.add_dentry(etc, "secret.txt", 20);
    let other = f.k.add_dentry(etc, "other.txt", 21);

    f.open(other, 0);
    f.open(secret, 0);

    let events = collect(&f.k);
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.process.pid, 100);
    assert!(event.container.is_none());
    let Payload::Open(open) = &event.payload else {
        panic!("expected an open, got {:?}", event.event_type());
    };
    assert_eq!(open.flags, 0);
    assert_eq!(open.file.key.ino, 20);
    assert_eq!(open.file.path.as_deref(), Some("/etc/secret.txt"));
}

#[test]
fn process_lifecycle_is_reported_in_order() {
    let k = agent(r#"{ "enabled_events": ["fork", "exec", "exit", "args_envs"] }"#);
    let root = k.root_dentry(2);
    let mnt = k.add_mount(1, root, 0, 0);
    let usr = k.add_dentry(root, "usr", 10);
    let bin = k.add_dentry(usr, "bin", 11);
    let binary = k.add_dentry(bin, "true", 12);

    let parent = k.spawn_task(100, 100, 1);
    let child = k.spawn_task(101, 101, 100);
    k.set_current(100, 100);
    sched_process_fork(&k, parent, child);

    k.set_current(101, 101);
    let (filename, _) = k.alloc_user_strings(&["/usr/bin/true"]);
    sys_exec_enter(&k, filename, 0, 0);
    security_bprm_check(&k, k.alloc_bprm(k.alloc_file(mnt, binary, 0)));
    k.set_task_args(child, &["true"], &[]);
    k.run(sched_process_exec(&k, child));
    do_exit(&k, 0);

    let events = collect(&k);
    let types: Vec<_> = events.iter().map(SecurityEvent::event_type).collect();
    assert_eq!(types, [EventType::Fork, EventType::Exec, EventType::Exit]);

    let Payload::Fork(fork) = &events[0].payload else {
        unreachable!()
    };
    assert_eq!(fork.ppid, 100);
    assert_eq!(events[0].process.pid, 101);

    let Payload::Exec(exec) = &events[1].payload else {
        unreachable!()
    };
    assert_eq!(exec.executable.key.ino, 12);
    assert_eq!(exec.executable.path.as_deref(), Some("/usr/bin/true"));
    assert_eq!(exec.args, ["true"]);
    assert!(exec.envs.is_empty());

    let Payload::Exit(exit) = &events[2].payload else {
        unreachable!()
    };
    assert_eq!(exit.exit_code, 0);
    assert_eq!(events[2].process.pid, 101);
}

#[test]
fn pid_discarder_suppresses_until_it_expires() {
    let f = fs(r#"{ "enabled_events": ["open"] }"#);
    let file = f.k.add_dentry(f.root, "log", 30);

    f.k.set_current(AGENT, AGENT);
    ErpcClient::new(SimTransport::new(&f.k))
        .discard_pid(EventType::Open, 100, 2 * SEC)
        .unwrap();

    f.k.set_current(100, 100);
    f.open(file, 0);
    assert!(collect(&f.k).is_empty());

    f.k.advance(3 * SEC);
    f.open(file, 0);
    let events = collect(&f.k);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type(), EventType::Open);
}

#[test]
fn discarders_requested_by_others_are_ignored() {
    let f = fs(r#"{ "enabled_events": ["open"] }"#);
    let file = f.k.add_dentry(f.root, "log", 30);

    ErpcClient::new(SimTransport::new(&f.k))
        .discard_pid(EventType::Open, 100, 0)
        .unwrap();
    f.open(file, 0);
    assert_eq!(collect(&f.k).len(), 1);
}

#[test]
fn activity_dump_samples_within_its_rate() {
    let f = fs(r#"{
        "enabled_events": ["open"],
        "activity_dump": { "enabled": true, "event_types": ["open"], "events_rate": 4 }
    }"#);
    let file = f.k.add_dentry(f.root, "data", 40);

    // the runtime moves task 100 into a fresh container cgroup
    let cgroup = f.k.alloc_kernfs_node(0, "cri-containerd-0123abc.scope", 77);
    let procs = f.k.alloc_kernfs_node(cgroup, "cgroup.procs", 78);
    handle_cgroup_write(
        &f.k,
        f.k.alloc_kernfs_open_file(procs),
        f.k.alloc_kernel_bytes(b"100\n\0"),
    );
    assert_eq!(f.k.events_of(EventType::CgroupTracing).len(), 1);

    for _ in 0..8 {
        f.open(file, 0);
    }
    let opens: Vec<_> = collect(&f.k)
        .into_iter()
        .filter(|ev| ev.event_type() == EventType::Open)
        .collect();
    assert_eq!(opens.len(), 8);
    let sampled = opens
        .iter()
        .filter(|ev| ev.flags.contains(&"activity_dump_sample"))
        .count();
    assert_eq!(sampled, 4);
    assert!(opens[..4].iter().all(|ev| ev.flags.contains(&"activity_dump_sample")));
}

#[test]
fn bind_reports_address_and_port() {
    let k = agent(r#"{ "enabled_events": ["bind"] }"#);
    k.spawn_task(70, 70, 1);
    k.set_current(70, 70);
    let sk = k.alloc_sock(SockInfo {
        family: AF_INET,
        protocol: IPPROTO_TCP,
        sport: 8080,
        ..SockInfo::default()
    });
    let (socket, _) = k.alloc_socket(sk);
    let mut sockaddr = vec![0u8; 16];
    sockaddr[..2].copy_from_slice(&AF_INET.to_ne_bytes());
    sockaddr[2..4].copy_from_slice(&8080u16.to_be_bytes());
    let address = k.alloc_kernel_bytes(&sockaddr);

    sys_bind_enter(&k);
    handle_security_socket_bind(&k, socket, address);
    sys_bind_exit(&k, 0);

    let events = collect(&k);
    assert_eq!(events.len(), 1);
    let Payload::Bind(bind) = &events[0].payload else {
        panic!("expected a bind");
    };
    assert_eq!(bind.port, 8080);
    assert_eq!(bind.family, AF_INET);
    assert_eq!(bind.protocol, IPPROTO_TCP);
    assert_eq!(bind.addr.to_string(), "0.0.0.0");
    assert_eq!(events[0].process.pid, 70);
}

/// Binds a UDP socket of the current task to `0.0.0.0:port`.
fn bind_udp(k: &SimKernel, port: u16) {
    let sk = k.alloc_sock(SockInfo {
        family: AF_INET,
        protocol: IPPROTO_UDP,
        ..SockInfo::default()
    });
    let (socket, _) = k.alloc_socket(sk);
    let mut sockaddr = vec![0u8; 16];
    sockaddr[..2].copy_from_slice(&AF_INET.to_ne_bytes());
    sockaddr[2..4].copy_from_slice(&port.to_be_bytes());
    let address = k.alloc_kernel_bytes(&sockaddr);

    sys_bind_enter(k);
    handle_security_socket_bind(k, socket, address);
    sys_bind_exit(k, 0);
}

#[test]
fn outgoing_dns_query_is_decoded() {
    let k = agent(r#"{ "enabled_events": ["bind", "dns"] }"#);
    k.spawn_task(80, 80, 1);
    k.set_current(80, 80);
    bind_udp(&k, 40000);
    k.spawn_task(81, 81, 1);
    k.set_current(81, 81);

    let mut query = Vec::new();
    query.extend_from_slice(&0x4242u16.to_be_bytes());
    query.extend_from_slice(&0x0100u16.to_be_bytes());
    query.extend_from_slice(&1u16.to_be_bytes());
    query.extend_from_slice(&[0; 6]);
    query.extend_from_slice(&encode_qname("example.com"));
    query.extend_from_slice(&1u16.to_be_bytes());
    query.extend_from_slice(&1u16.to_be_bytes());
    let skb = SimPacket::udp4([10, 0, 0, 2], 40000, [10, 0, 0, 1], 53, &query);

    k.run_classifier(&skb, Direction::Egress);

    let events = collect(&k);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type(), EventType::Bind);
    let Payload::Dns(dns) = &events[1].payload else {
        panic!("expected a dns query");
    };
    assert_eq!(dns.id, 0x4242);
    assert_eq!(dns.qname, "example.com");
    assert_eq!((dns.qtype, dns.qclass), (1, 1));
    assert_eq!(dns.network.dport, 53);
    assert_eq!(dns.network.direction, "egress");
    // the bound port wins over whatever task the classifier runs under
    assert_eq!(events[1].process.pid, 80);
}

#[test]
fn resolved_paths_match_the_kernel_walk() {
    let k = agent("{}");
    let root = k.root_dentry(2);
    let var = k.add_dentry(root, "var", 10);
    let log = k.add_dentry(var, "log", 11);
    let file = k.add_dentry(log, "syslog", 12);
    let key = k.resolve_dentry(file, 1);

    let client = ErpcClient::new(SimTransport::new(&k));
    assert_eq!(client.resolve_path(key).unwrap(), "/var/log/syslog");
    let parent = client.resolve_parent(key).unwrap();
    assert_eq!(parent.ino, 11);
    assert_eq!(client.resolve_path(parent).unwrap(), "/var/log");
}
