//! Activity dumps: rate-limited capture of what a workload does.
//!
//! ```text
//!   untraced tgid in a container ──admit──► traced_cgroups[id] = cookie
//!                                           traced_pids[tgid]  = cookie
//!                                           config[cookie]     = config[0]
//!                                           CGROUP_TRACING ──► agent
//! ```
//!
//! The agent takes over by rewriting `config[cookie]`. Events of traced
//! pids whose type is in the mask and which pass the rate limiter carry the
//! `ACTIVITY_DUMP_SAMPLE` flag. Once a dump ends, its cgroup waits on the
//! wait list before it can be admitted again.

use crate::container::ContainerId;
use crate::emit::send_event;
use crate::event::{ActivityDumpConfig, CgroupTracingEvent, ContainerContext, EventBase, EventType};
use crate::kernel::{plain, Kernel, Map, UpdateFlag};
use crate::process::new_cookie;
use crate::rate_limiter;

/// Key of the template cloned into every new dump.
pub const DEFAULT_CONFIG_KEY: u64 = 0;

/// Global switches, single slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DumpControl {
    pub enabled: u32,
    /// When set, only cgroups whose mount id is in `cgroup_mount_filter` are admitted.
    pub filter_by_mount: u32,
}

plain!(DumpControl);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DumpState {
    Unclaimed,
    /// Cookie reserved, configuration not written yet.
    Reserving,
    Running,
    Paused,
    Expired,
}

pub fn dump_state<K: Kernel>(k: &K, cookie: u64) -> DumpState {
    if cookie == DEFAULT_CONFIG_KEY {
        return DumpState::Unclaimed;
    }
    match k.activity_dumps_config().lookup(&cookie) {
        Some(config) => state_of(&config, k.now_ns()),
        None => DumpState::Unclaimed,
    }
}

/// State of the dump of a container, `Reserving` while its cookie has no
/// configuration yet.
pub fn cgroup_state<K: Kernel>(k: &K, id: &ContainerId) -> DumpState {
    match k.traced_cgroups().lookup(id) {
        Some(cookie) if !k.activity_dumps_config().contains(&cookie) => DumpState::Reserving,
        Some(cookie) => dump_state(k, cookie),
        None => DumpState::Unclaimed,
    }
}

fn state_of(config: &ActivityDumpConfig, now: u64) -> DumpState {
    if config.end_timestamp != 0 && now > config.end_timestamp {
        DumpState::Expired
    } else if config.paused != 0 {
        DumpState::Paused
    } else {
        DumpState::Running
    }
}

fn is_enabled<K: Kernel>(k: &K) -> Option<DumpControl> {
    k.dump_control().lookup(&0).filter(|c| c.enabled != 0)
}

/// True when the current thread group belongs to a running dump.
pub fn is_current_traced<K: Kernel>(k: &K) -> bool {
    let Some(cookie) = k.traced_pids().lookup(&k.tgid()) else {
        return false;
    };
    matches!(dump_state(k, cookie), DumpState::Running | DumpState::Paused)
}

/// Ends the dump of `id` and puts the cgroup on the wait list.
fn retire<K: Kernel>(k: &K, id: &ContainerId, cookie: u64, config: &ActivityDumpConfig) {
    let _ = k.traced_cgroups().delete(id);
    let _ = k.activity_dumps_config().delete(&cookie);
    rate_limiter::reset(k, cookie);
    let until = k.now_ns().saturating_add(config.wait_list_timestamp);
    let _ = k.cgroup_wait_list().store(id, &until, UpdateFlag::Any);
}

/// Considers `tgid`, running in `container`, for tracing.
pub fn admit<K: Kernel>(k: &K, tgid: u32, container: &ContainerContext) {
    let Some(control) = is_enabled(k) else {
        return;
    };
    if container.is_empty() || k.traced_pids().contains(&tgid) {
        return;
    }
    if control.filter_by_mount != 0
        && !k
            .cgroup_mount_filter()
            .contains(&container.cgroup_file.mount_id)
    {
        return;
    }
    let id = ContainerId(container.container_id);
    let now = k.now_ns();

    if let Some(cookie) = k.traced_cgroups().lookup(&id) {
        match k.activity_dumps_config().lookup(&cookie) {
            Some(config) if state_of(&config, now) == DumpState::Expired => {
                retire(k, &id, cookie, &config);
            }
            _ => {
                let _ = k.traced_pids().store(&tgid, &cookie, UpdateFlag::Any);
            }
        }
        return;
    }

    if let Some(until) = k.cgroup_wait_list().lookup(&id) {
        if now < until {
            return;
        }
        let _ = k.cgroup_wait_list().delete(&id);
    }

    let Some(template) = k.activity_dumps_config().lookup(&DEFAULT_CONFIG_KEY) else {
        return;
    };
    let cookie = new_cookie(k);
    // the map size bounds the number of concurrent dumps
    if k.traced_cgroups().store(&id, &cookie, UpdateFlag::NoExist).is_err() {
        return;
    }
    let config = ActivityDumpConfig {
        start_timestamp: now,
        end_timestamp: if template.timeout == 0 {
            0
        } else {
            now.saturating_add(template.timeout)
        },
        ..template
    };
    if k
        .activity_dumps_config()
        .store(&cookie, &config, UpdateFlag::Any)
        .is_err()
    {
        let _ = k.traced_cgroups().delete(&id);
        return;
    }
    let _ = k.traced_pids().store(&tgid, &cookie, UpdateFlag::Any);

    let mut event = CgroupTracingEvent {
        base: EventBase::default(),
        config,
        cookie,
    };
    event.base.container = *container;
    send_event(k, EventType::CgroupTracing, &mut event);
}

/// Pauses or resumes the dump of `cookie`.
pub fn set_paused<K: Kernel>(k: &K, cookie: u64, paused: bool) -> bool {
    k.activity_dumps_config()
        .with_mut(&cookie, |c| c.paused = paused as u32)
        .is_some()
}

/// Decides whether an event of `t` from `tgid` is tagged as a dump sample.
pub fn should_sample<K: Kernel>(k: &K, tgid: u32, t: EventType) -> bool {
    if t == EventType::CgroupTracing {
        return false;
    }
    let Some(cookie) = k.traced_pids().lookup(&tgid) else {
        return false;
    };
    let Some(config) = k.activity_dumps_config().lookup(&cookie) else {
        return false;
    };
    if config.event_mask & t.mask() == 0 || state_of(&config, k.now_ns()) != DumpState::Running {
        return false;
    }
    rate_limiter::allow(k, cookie, config.events_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathKey;
    use crate::sim::SimKernel;

    fn container(id: &[u8]) -> ContainerContext {
        ContainerContext {
            container_id: ContainerId::from_bytes(id).0,
            cgroup_flags: 1,
            cgroup_file: PathKey::new(77, 3, 0),
        }
    }

    fn enable(k: &SimKernel, event_mask: u64, timeout: u64) {
        let control = DumpControl {
            enabled: 1,
            filter_by_mount: 0,
        };
        k.dump_control().store(&0, &control, UpdateFlag::Any).unwrap();
        let template = ActivityDumpConfig {
            event_mask,
            timeout,
            wait_list_timestamp: 10_000_000_000,
            events_rate: 100,
            ..ActivityDumpConfig::default()
        };
        k.activity_dumps_config()
            .store(&DEFAULT_CONFIG_KEY, &template, UpdateFlag::Any)
            .unwrap();
    }

    #[test]
    fn first_process_of_a_container_starts_a_dump() {
        let k = SimKernel::new();
        enable(&k, EventType::Open.mask(), 60_000_000_000);
        let ctx = container(b"abc123");
        admit(&k, 100, &ctx);

        let cookie = k.traced_pids().lookup(&100).unwrap();
        let id = ContainerId::from_bytes(b"abc123");
        assert_eq!(k.traced_cgroups().lookup(&id), Some(cookie));
        assert_eq!(cgroup_state(&k, &id), DumpState::Running);
        let events = k.events_of(EventType::CgroupTracing);
        assert_eq!(events.len(), 1);
        let ev: CgroupTracingEvent = events[0].decode();
        assert_eq!(ev.cookie, cookie);
        assert_eq!(ev.config.end_timestamp, k.now_ns() + 60_000_000_000);

        // a sibling joins the same dump without a new event
        admit(&k, 101, &ctx);
        assert_eq!(k.traced_pids().lookup(&101), Some(cookie));
        assert_eq!(k.events_of(EventType::CgroupTracing).len(), 1);
    }

    #[test]
    fn disabled_dumps_and_hosts_are_not_admitted() {
        let k = SimKernel::new();
        admit(&k, 100, &container(b"abc"));
        assert!(!k.traced_pids().contains(&100));

        enable(&k, EventType::Open.mask(), 0);
        admit(&k, 100, &ContainerContext::default());
        assert!(!k.traced_pids().contains(&100));
    }

    #[test]
    fn sampling_follows_mask_and_pause() {
        let k = SimKernel::new();
        enable(&k, EventType::Open.mask(), 0);
        admit(&k, 100, &container(b"abc"));
        let cookie = k.traced_pids().lookup(&100).unwrap();

        assert!(should_sample(&k, 100, EventType::Open));
        assert!(!should_sample(&k, 100, EventType::Exec));
        assert!(!should_sample(&k, 200, EventType::Open));

        assert!(set_paused(&k, cookie, true));
        assert_eq!(dump_state(&k, cookie), DumpState::Paused);
        assert!(!should_sample(&k, 100, EventType::Open));
    }

    #[test]
    fn expired_dump_sends_the_cgroup_to_the_wait_list() {
        let k = SimKernel::new();
        enable(&k, EventType::Open.mask(), 1_000_000_000);
        let ctx = container(b"abc");
        admit(&k, 100, &ctx);
        let cookie = k.traced_pids().lookup(&100).unwrap();

        k.advance(2_000_000_000);
        assert_eq!(dump_state(&k, cookie), DumpState::Expired);
        assert!(!should_sample(&k, 100, EventType::Open));

        admit(&k, 101, &ctx);
        assert!(!k.traced_cgroups().contains(&ContainerId::from_bytes(b"abc")));
        admit(&k, 102, &ctx);
        assert!(!k.traced_pids().contains(&102));

        k.advance(10_000_000_000);
        admit(&k, 103, &ctx);
        assert!(k.traced_pids().contains(&103));
        assert_eq!(k.events_of(EventType::CgroupTracing).len(), 2);
    }
}
