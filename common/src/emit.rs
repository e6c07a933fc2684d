//! Event egress.
//!
//! Every record goes through [`send_event_with`]: it stamps the header,
//! fills the process, span and container contexts, asks the activity dump
//! sampler whether to tag the record, then writes it to the ring and updates
//! the per-type counters.

use crate::activity_dump;
use crate::approvers::is_event_enabled;
use crate::consts::event_flags;
use crate::event::{Event, EventType, KEventHeader};
use crate::kernel::{bytes_of, Kernel, Map};
use crate::kobj;
use crate::process;
use crate::span::span_context;
use crate::stats;

/// Types that are sent whether or not they were enabled.
fn always_sent(t: EventType) -> bool {
    matches!(t, EventType::CgroupTracing | EventType::MountReleased)
}

fn emission_enabled<K: Kernel>(k: &K, t: EventType) -> bool {
    match t {
        _ if always_sent(t) => true,
        EventType::ArgsEnvs => is_event_enabled(k, EventType::Exec) || is_event_enabled(k, t),
        _ => is_event_enabled(k, t),
    }
}

pub fn send_event<K: Kernel, E: Event>(k: &K, t: EventType, ev: &mut E) -> bool {
    send_event_with(k, t, ev, 0, 0)
}

/// Sends `ev` on behalf of `pid_tgid`, or of the current task when zero.
///
/// Returns false when the record was filtered or lost.
pub fn send_event_with<K: Kernel, E: Event>(
    k: &K,
    t: EventType,
    ev: &mut E,
    pid_tgid: u64,
    extra_flags: u16,
) -> bool {
    if !emission_enabled(k, t) {
        return false;
    }
    let on_behalf = pid_tgid != 0;
    let pid_tgid = if on_behalf { pid_tgid } else { k.pid_tgid() };
    let tgid = (pid_tgid >> 32) as u32;
    let tid = pid_tgid as u32;
    if !on_behalf && k.is_agent() {
        return false;
    }

    let mut flags = extra_flags;
    if activity_dump::should_sample(k, tgid, t) {
        flags |= event_flags::ACTIVITY_DUMP_SAMPLE;
    }

    let base = ev.base_mut();
    base.header = KEventHeader {
        timestamp_ns: k.now_ns(),
        event_type: t as u32,
        cpu: k.cpu() as u16,
        flags,
    };
    base.process.pid = tgid;
    base.process.tid = tid;
    if !on_behalf {
        let task = k.current_task();
        base.process.netns = kobj::task_netns(k, task);
        base.process.is_kworker = kobj::task_is_kthread(k, task) as u32;
    }
    base.process.user_session_id = process::user_session_of(k, tgid);
    if let Some(entry) = process::pid_entry(k, tgid) {
        base.process.cookie = entry.cookie;
        if base.container.is_empty() {
            if let Some(proc_entry) = k.proc_cache().lookup(&entry.cookie) {
                base.container = proc_entry.container;
            }
        }
    }
    base.span = span_context(k, tgid, tid);

    let data = bytes_of(ev);
    match k.output(data) {
        Ok(()) => {
            let len = data.len() as u64;
            stats::event(k, t, |s| {
                s.bytes += len;
                s.count += 1;
            });
            true
        }
        Err(_) => {
            stats::event(k, t, |s| s.lost += 1);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::RuntimeConst;
    use crate::event::{EventBase, ExitEvent};
    use crate::sim::SimKernel;

    fn exit_event() -> ExitEvent {
        ExitEvent {
            base: EventBase::default(),
            exit_code: 0,
            _pad: 0,
        }
    }

    #[test]
    fn disabled_types_are_not_sent() {
        let k = SimKernel::new();
        k.set_current(100, 100);
        assert!(!send_event(&k, EventType::Exit, &mut exit_event()));
        assert!(k.events().is_empty());
    }

    #[test]
    fn header_and_process_context_are_filled() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Exit]);
        k.set_current(100, 101);
        let cookie = process::ensure_entry(&k, 100);
        assert!(send_event(&k, EventType::Exit, &mut exit_event()));

        let ev: ExitEvent = k.events_of(EventType::Exit)[0].decode();
        assert_eq!(ev.base.header.event_type, EventType::Exit as u32);
        assert_eq!(ev.base.header.timestamp_ns, k.now_ns());
        assert_eq!(ev.base.process.pid, 100);
        assert_eq!(ev.base.process.tid, 101);
        assert_eq!(ev.base.process.cookie, cookie);

        let stats = k.event_stats_of(EventType::Exit);
        assert_eq!(stats.count, 1);
        assert_eq!(stats.bytes, core::mem::size_of::<ExitEvent>() as u64);
    }

    #[test]
    fn agent_events_are_dropped() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Exit]);
        k.set_constant(RuntimeConst::RuntimePid, 100);
        k.set_current(100, 100);
        assert!(!send_event(&k, EventType::Exit, &mut exit_event()));
    }

    #[test]
    fn full_ring_counts_lost_records() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::Exit]);
        k.set_current(100, 100);
        k.fail_output(true);
        assert!(!send_event(&k, EventType::Exit, &mut exit_event()));
        let stats = k.event_stats_of(EventType::Exit);
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.count, 0);
    }
}
